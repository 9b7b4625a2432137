use egobox_glm::{GlmParams, Matern52Corr, Matern52Model, TrendBasis};
use linfa::prelude::*;
use ndarray::{arr2, array, concatenate, Array, Array2, Axis};

fn xsinx(x: &Array2<f64>) -> Array2<f64> {
    (x - 3.5) * ((x - 3.5) / std::f64::consts::PI).mapv(|v| v.sin())
}

fn main() {
    env_logger::init();

    let xt = arr2(&[[0.0], [5.0], [10.0], [15.0], [18.0], [20.0], [25.0]]);
    let yt = xsinx(&xt);

    println!("Fit GLM surrogate of 'xsinx' at {}", xt.column(0));
    let model = Matern52Model::new(Matern52Corr(), array![1.0], array![1.0])
        .expect("covariance model");
    let glm = GlmParams::new(model)
        .basis(vec![TrendBasis::Linear])
        .optimization_bounds(1e-1, 1e2)
        .check()
        .expect("GLM parameters")
        .fit(&Dataset::new(xt, yt))
        .expect("GLM fitting");
    println!("{glm}");
    println!(
        "Residuals = {}, relative errors = {}",
        glm.residuals(),
        glm.relative_errors()
    );

    let xtest = Array::linspace(0., 25., 26).insert_axis(Axis(1));
    let ytest = xsinx(&xtest);
    let trend = glm.metamodel().predict(&xtest).expect("Trend prediction");
    let ypred = glm.kriging().predict(&xtest).expect("Kriging prediction");

    println!("Compute prediction errors (x, trend(x), err(x))");
    println!("{}", concatenate![Axis(1), xtest, trend, ypred - ytest]);
}
