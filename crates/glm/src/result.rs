use crate::covariance_models::CovarianceModel;
use crate::errors::{GlmError, Result};
use crate::factorization::CovarianceFactor;
use crate::reduction::ReducedCovariance;
use crate::trend::TrendFunction;
use crate::utils::InputTransformation;

use linfa::prelude::{Float, PredictInplace};
use log::warn;
use ndarray::{s, Array1, Array2, ArrayBase, Axis, Data, Ix2, Zip};
use std::fmt;

/// The conditional mean of the fitted Gaussian process
///
/// `y(x) = m(x) + k(x)^T.C^-1.(y - F.beta)`
///
/// where `m` is the fitted trend, `k(x)` the covariances between `x` and the training points
/// and `C` the covariance matrix of the training sample.
#[derive(Clone, Debug)]
pub struct KrigingPredictor<F: Float, M: CovarianceModel<F>> {
    model: ReducedCovariance<F, M>,
    /// Training points in the transformed input space
    points: Array2<F>,
    /// `C^-1.(y - F.beta)` flattened as the outputs
    gamma: Array1<F>,
    trend: TrendFunction<F>,
    transformation: Option<InputTransformation<F>>,
}

impl<F: Float, M: CovarianceModel<F>> KrigingPredictor<F, M> {
    pub(crate) fn new(
        model: ReducedCovariance<F, M>,
        points: Array2<F>,
        gamma: Array1<F>,
        trend: TrendFunction<F>,
        transformation: Option<InputTransformation<F>>,
    ) -> Self {
        KrigingPredictor {
            model,
            points,
            gamma,
            trend,
            transformation,
        }
    }

    /// Weights of the covariance terms, one per training observation
    pub fn gamma(&self) -> &Array1<F> {
        &self.gamma
    }

    /// Predict (n, d) output values at (n, nx) points
    pub fn predict(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array2<F>> {
        let mut y = self.trend.predict(x)?;
        let xt = match &self.transformation {
            Some(t) => t.apply(x)?,
            None => x.to_owned(),
        };
        let d = self.model.dim();
        Zip::from(y.rows_mut())
            .and(xt.rows())
            .par_for_each(|mut y_row, x_row| {
                for (j, point) in self.points.rows().into_iter().enumerate() {
                    let k = self.model.compute(&x_row, &point);
                    let g = self.gamma.slice(s![j * d..(j + 1) * d]);
                    y_row += &k.dot(&g);
                }
            });
        Ok(y)
    }
}

impl<F, M, D> PredictInplace<ArrayBase<D, Ix2>, Array2<F>> for KrigingPredictor<F, M>
where
    F: Float,
    M: CovarianceModel<F>,
    D: Data<Elem = F>,
{
    fn predict_inplace(&self, x: &ArrayBase<D, Ix2>, y: &mut Array2<F>) {
        assert_eq!(
            x.nrows(),
            y.nrows(),
            "The number of data points must match the number of output targets."
        );
        match self.predict(x) {
            Ok(values) => y.assign(&values),
            Err(err) => {
                warn!("Kriging prediction failed: {err}");
                y.fill(F::nan());
            }
        }
    }

    fn default_target(&self, x: &ArrayBase<D, Ix2>) -> Array2<F> {
        Array2::zeros((x.nrows(), self.model.dim()))
    }
}

/// Residual `sqrt(mean(e^2))` and relative error `mean(e^2) / var(y)` of each output
/// where `e` is the prediction error on the sample.
pub(crate) fn residual_diagnostics<F: Float>(
    predicted: &Array2<F>,
    output_sample: &Array2<F>,
) -> Result<(Array1<F>, Array1<F>)> {
    if predicted.dim() != output_sample.dim() {
        return Err(GlmError::dimension_mismatch(
            "predicted sample",
            format!("{:?}", output_sample.dim()),
            format!("{:?}", predicted.dim()),
        ));
    }
    let n = output_sample.nrows();
    let squared = (predicted - output_sample).mapv(|v| v * v);
    let mean_squared = squared
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(output_sample.ncols()));
    let variance = if n > 1 {
        output_sample.var_axis(Axis(0), F::one())
    } else {
        Array1::zeros(output_sample.ncols())
    };
    let residuals = mean_squared.mapv(|v| v.sqrt());
    let relative_errors = Zip::from(&mean_squared)
        .and(&variance)
        .map_collect(|&e, &v| if v > F::zero() { e / v } else { e });
    Ok((residuals, relative_errors))
}

/// The outcome of a [GLM fit](crate::GlmAlgorithm::run)
#[derive(Clone, Debug)]
pub struct GlmResult<F: Float, M: CovarianceModel<F>> {
    pub(crate) input_sample: Array2<F>,
    pub(crate) output_sample: Array2<F>,
    pub(crate) metamodel: TrendFunction<F>,
    pub(crate) kriging: KrigingPredictor<F, M>,
    pub(crate) residuals: Array1<F>,
    pub(crate) relative_errors: Array1<F>,
    pub(crate) covariance_model: ReducedCovariance<F, M>,
    pub(crate) optimal_log_likelihood: F,
    pub(crate) cholesky_factor: Option<CovarianceFactor<F>>,
    pub(crate) cumulated_scaling: F,
}

impl<F: Float, M: CovarianceModel<F>> GlmResult<F, M> {
    /// Training inputs
    pub fn input_sample(&self) -> &Array2<F> {
        &self.input_sample
    }

    /// Training outputs
    pub fn output_sample(&self) -> &Array2<F> {
        &self.output_sample
    }

    /// The fitted trend, zero everywhere without basis
    pub fn metamodel(&self) -> &TrendFunction<F> {
        &self.metamodel
    }

    /// The conditional mean of the process, interpolating noiseless data
    pub fn kriging(&self) -> &KrigingPredictor<F, M> {
        &self.kriging
    }

    /// Root mean squared error of the conditional mean on the sample, per output
    pub fn residuals(&self) -> &Array1<F> {
        &self.residuals
    }

    /// Mean squared error over output variance, per output
    pub fn relative_errors(&self) -> &Array1<F> {
        &self.relative_errors
    }

    /// Trend coefficients per output marginal
    pub fn trend_coefficients(&self) -> &[Array1<F>] {
        self.metamodel.coefficients()
    }

    /// Covariance model with its fitted parameters
    pub fn covariance_model(&self) -> &ReducedCovariance<F, M> {
        &self.covariance_model
    }

    /// Maximized reduced log-likelihood
    pub fn optimal_log_likelihood(&self) -> F {
        self.optimal_log_likelihood
    }

    /// Factor of the fitted covariance matrix, if retained
    pub fn cholesky_factor(&self) -> Option<&CovarianceFactor<F>> {
        self.cholesky_factor.as_ref()
    }

    /// Diagonal boost the final factorization needed
    pub fn cumulated_scaling(&self) -> F {
        self.cumulated_scaling
    }
}

impl<F: Float, M: CovarianceModel<F>> fmt::Display for GlmResult<F, M> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let coefficients: Vec<String> = self
            .trend_coefficients()
            .iter()
            .map(|c| c.to_string())
            .collect();
        write!(
            f,
            "GLM(covariance={}, trend=[{}], log_likelihood={}, residuals={})",
            self.covariance_model,
            coefficients.join(", "),
            self.optimal_log_likelihood,
            self.residuals
        )
    }
}
