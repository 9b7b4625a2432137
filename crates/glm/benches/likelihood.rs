use criterion::{criterion_group, criterion_main, Criterion};
use egobox_glm::{
    GlmAlgorithm, GlmParams, HMatrixParameters, LinearAlgebra, Matern32Corr, Matern32Model,
    TrendBasis,
};
use linfa::ParamGuard;
use ndarray::{array, Array, Array2, Zip};
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand_xoshiro::Xoshiro256Plus;

fn griewank(x: &Array2<f64>) -> Array2<f64> {
    let mut y = Array2::zeros((x.nrows(), 1));
    Zip::from(y.rows_mut()).and(x.rows()).for_each(|mut yi, xi| {
        let d = Array::linspace(1., xi.len() as f64, xi.len()).mapv(|v| v.sqrt());
        yi[0] = xi.mapv(|v| v * v).sum() / 4000.
            - (&xi / &d).mapv(|v| v.cos()).fold(1., |acc, v| acc * v)
            + 1.0;
    });
    y
}

fn criterion_likelihood(c: &mut Criterion) {
    let dim = 2;
    let nts = [100, 400];

    let mut group = c.benchmark_group("likelihood");
    group.sample_size(20);
    for nt in nts {
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let xt: Array2<f64> = Array::random_using((nt, dim), Uniform::new(-600., 600.), &mut rng);
        let yt = griewank(&xt);
        let model = Matern32Model::new(Matern32Corr(), array![1.0], array![1.0]).unwrap();

        for linear_algebra in [LinearAlgebra::Dense, LinearAlgebra::Hierarchical] {
            let params = GlmParams::new(model.clone())
                .basis(vec![TrendBasis::Constant])
                .normalize(true)
                .linear_algebra(linear_algebra)
                .hmat(HMatrixParameters {
                    max_leaf_size: 50,
                    ..HMatrixParameters::default()
                })
                .check()
                .unwrap();
            let mut glm = GlmAlgorithm::new(&params, &xt, &yt).unwrap();
            let scale = array![0.3, 0.3];
            group.bench_function(format!("{linear_algebra:?} {nt}"), |b| {
                b.iter(|| {
                    std::hint::black_box(glm.compute_reduced_log_likelihood(&scale).unwrap());
                })
            });
        }
    }
    group.finish();
}

criterion_group!(benches, criterion_likelihood);
criterion_main!(benches);
