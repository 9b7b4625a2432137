use crate::covariance_models::CovarianceModel;
use crate::errors::{GlmError, Result};
use crate::factorization::{CholeskyFactor, FactorizationInput, Regularization};
use crate::likelihood::{LikelihoodInput, ReducedLikelihood};
use crate::optimization::{Cobyla, OptimizationBounds, Optimizer};
use crate::parameters::{GlmParams, GlmValidParams};
use crate::reduction::ReducedCovariance;
use crate::result::{residual_diagnostics, GlmResult, KrigingPredictor};
use crate::trend::{check_basis, design_matrix, TrendFunction};
use crate::utils::{check_centered, InputTransformation};

use linfa::prelude::{DatasetBase, Fit, Float};
use log::{debug, info};
use ndarray::{Array1, Array2, ArrayBase, Axis, Data, Ix2};
use std::time::Instant;

/// Default first diagonal boost when a factorization fails
pub const GLM_STARTING_SCALING: f64 = 1e-13;
/// Default cumulated diagonal boost beyond which a factorization is given up
pub const GLM_MAXIMAL_SCALING: f64 = 1e5;
/// Default threshold on the output mean to consider it centered
pub const GLM_MEAN_EPSILON: f64 = 1e-12;
/// Default lower bound of the optimized covariance parameters
pub const GLM_OPTIMIZATION_LOWER_BOUND: f64 = 1e-2;
/// Default upper bound of the optimized covariance parameters
pub const GLM_OPTIMIZATION_UPPER_BOUND: f64 = 1e2;

/// A generalized linear model of a vector output `Y(x)` of dimension `d`
/// over inputs of dimension `nx`:
///
/// `Y(x) = F(x).beta + Z(x)`
///
/// where:
/// * `F(x)` stacks the values at `x` of the trend basis of each output marginal
/// * `beta` is the vector of trend coefficients
/// * `Z(x)` is a centered Gaussian process governed by a covariance model
///   whose parameters are to be determined
///
/// # Implementation
///
/// The covariance model is first adapted to the problem dimensions (used as is, or as a
/// product and/or a tensorization of copies of it) then its active parameters are estimated
/// by maximizing the reduced log-likelihood
///
/// `l(p) = -1/2 (log(det(C(p))) + |L(p)^-1.(y - F.beta(p))|^2)`
///
/// where `C(p) = L(p).L(p)^T` is the covariance matrix of the sample and `beta(p)` the
/// generalized least squares estimate of the trend coefficients. For a scalar output model
/// the amplitude is eliminated from the optimization and estimated analytically.
///
/// `C(p)` is factorized either densely or as a hierarchical matrix with low-rank off-diagonal
/// blocks, see [LinearAlgebra](crate::LinearAlgebra).
///
/// # Example
///
/// ```no_run
/// use egobox_glm::{GlmAlgorithm, GlmParams, Matern52Corr, Matern52Model, TrendBasis};
/// use linfa::ParamGuard;
/// use ndarray::array;
///
/// let x = array![[0.], [1.], [2.], [3.], [4.]];
/// let y = array![[0.], [1.], [1.5], [0.9], [1.0]];
/// let model = Matern52Model::new(Matern52Corr(), array![1.0], array![1.0]).unwrap();
/// let params = GlmParams::new(model)
///     .basis(vec![TrendBasis::Constant])
///     .check()
///     .unwrap();
/// let mut glm = GlmAlgorithm::new(&params, &x, &y).unwrap();
/// glm.run().unwrap();
/// let result = glm.result().unwrap();
/// println!("{result}");
/// let predicted = result.kriging().predict(&array![[2.5]]).unwrap();
/// ```
pub struct GlmAlgorithm<F: Float, M: CovarianceModel<F>> {
    params: GlmValidParams<F, M>,
    input_sample: Array2<F>,
    output_sample: Array2<F>,
    transformation: Option<InputTransformation<F>>,
    normalized_input_sample: Array2<F>,
    design: Array2<F>,
    /// Outputs flattened point by point, `y[i * d + k]`
    y: Array1<F>,
    /// Covariance model adapted to the problem dimensions
    covariance_model: ReducedCovariance<F, M>,
    likelihood: ReducedLikelihood<F, M>,
    optimization_bounds: OptimizationBounds<F>,
    noise: Option<Array1<F>>,
    optimizer: Box<dyn Optimizer>,
    result: Option<GlmResult<F, M>>,
}

impl<F: Float, M: CovarianceModel<F>> GlmAlgorithm<F, M> {
    /// GLM fitting algorithm constructor from (n, nx) inputs and (n, d) outputs
    ///
    /// # Errors
    ///
    /// [GlmError::DimensionMismatch] when sample sizes differ, when the covariance model
    /// cannot be adapted to the sample dimensions or when the basis collection does not match
    /// the output dimension.
    pub fn new(
        params: &GlmValidParams<F, M>,
        input_sample: &ArrayBase<impl Data<Elem = F>, Ix2>,
        output_sample: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<Self> {
        let n = input_sample.nrows();
        if output_sample.nrows() != n {
            return Err(GlmError::dimension_mismatch(
                "output sample size",
                n,
                output_sample.nrows(),
            ));
        }
        if n == 0 {
            return Err(GlmError::InvalidValueError(
                "Cannot fit a GLM on an empty sample".to_string(),
            ));
        }
        let input_dim = input_sample.ncols();
        let output_dim = output_sample.ncols();

        let covariance_model =
            ReducedCovariance::adapt(params.covariance_model(), input_dim, output_dim)?;

        check_basis(params.basis(), n, input_dim, output_dim)?;
        let basis_size: usize = params.basis().iter().map(|b| b.size(input_dim)).sum();
        if basis_size == 0 {
            check_centered(output_sample, params.mean_epsilon);
        }

        let transformation = match params.input_transformation() {
            Some(t) if t.dim() != input_dim => {
                return Err(GlmError::dimension_mismatch(
                    "input transformation",
                    input_dim,
                    t.dim(),
                ))
            }
            Some(t) => Some(t.clone()),
            None if params.normalize() => Some(InputTransformation::from_sample(
                input_sample,
                params.mean_epsilon,
            )),
            None => None,
        };
        let normalized_input_sample = match &transformation {
            Some(t) => {
                info!("Normalize input sample");
                t.apply(input_sample)?
            }
            None => input_sample.to_owned(),
        };

        info!("Build design matrix of {basis_size} columns");
        let design = if basis_size == 0 {
            Array2::zeros((n * output_dim, 0))
        } else {
            design_matrix(params.basis(), &normalized_input_sample, output_dim)
        };
        let y = output_sample.iter().copied().collect::<Array1<F>>();

        let (reduced, analytical) = covariance_model
            .reduce(params.optimize_parameters(), params.analytical_amplitude())?;
        let optimization_bounds = Self::default_bounds(params, &reduced);

        Ok(GlmAlgorithm {
            params: params.clone(),
            input_sample: input_sample.to_owned(),
            output_sample: output_sample.to_owned(),
            transformation,
            normalized_input_sample,
            design,
            y,
            covariance_model,
            likelihood: ReducedLikelihood::new(reduced, analytical),
            optimization_bounds,
            noise: None,
            optimizer: Box::new(Cobyla::new(params.cobyla, params.n_start, params.seed)),
            result: None,
        })
    }

    fn default_bounds(
        params: &GlmValidParams<F, M>,
        reduced: &ReducedCovariance<F, M>,
    ) -> OptimizationBounds<F> {
        let (lower, upper) = params.optimization_bounds();
        OptimizationBounds::uniform(reduced.active_parameter().len(), lower, upper)
    }

    /// Set the noise variance of each point of the sample
    ///
    /// # Errors
    ///
    /// [GlmError::DimensionMismatch] when the size differs from the sample size,
    /// [GlmError::InvalidValueError] on negative or non finite variances.
    pub fn set_noise(&mut self, noise: Array1<F>) -> Result<()> {
        if noise.len() != self.input_sample.nrows() {
            return Err(GlmError::dimension_mismatch(
                "noise",
                self.input_sample.nrows(),
                noise.len(),
            ));
        }
        if noise.iter().any(|v| !(*v >= F::zero()) || !v.is_finite()) {
            return Err(GlmError::InvalidValueError(format!(
                "Noise variances should be non negative, got {noise}"
            )));
        }
        self.noise = Some(noise);
        self.likelihood.reset();
        self.result = None;
        Ok(())
    }

    /// Override the bounds of the reduced covariance parameters
    pub fn set_optimization_bounds(&mut self, bounds: OptimizationBounds<F>) -> Result<()> {
        if bounds.dim() != self.likelihood.dim() {
            return Err(GlmError::dimension_mismatch(
                "optimization bounds",
                self.likelihood.dim(),
                bounds.dim(),
            ));
        }
        self.optimization_bounds = bounds;
        self.result = None;
        Ok(())
    }

    /// Enable or disable the optimization of covariance parameters, resets the bounds
    pub fn set_optimize_parameters(&mut self, optimize: bool) -> Result<()> {
        self.params.optimize_parameters = optimize;
        let (reduced, analytical) = self
            .covariance_model
            .reduce(optimize, self.params.analytical_amplitude())?;
        self.optimization_bounds = Self::default_bounds(&self.params, &reduced);
        self.likelihood = ReducedLikelihood::new(reduced, analytical);
        self.result = None;
        Ok(())
    }

    /// Replace the optimizer of the reduced log-likelihood
    pub fn set_optimizer(&mut self, optimizer: impl Optimizer + 'static) {
        self.optimizer = Box::new(optimizer);
        self.result = None;
    }

    /// Fit the model, does nothing when already fitted
    pub fn run(&mut self) -> Result<()> {
        if self.result.is_some() {
            return Ok(());
        }
        let optimal_log_likelihood = self.maximize_reduced_log_likelihood()?;
        let state = &self.likelihood.state;
        let mut factor = state.factor.clone().ok_or_else(|| {
            GlmError::OptimizationError("No factorization at the optimum".to_string())
        })?;

        let mut covariance_model = self.likelihood.model.clone();
        covariance_model.set_active_parameter(self.covariance_model.active_parameter().to_vec())?;
        info!("Fitted covariance model {covariance_model}");

        let metamodel = TrendFunction::new(
            self.params.basis().to_vec(),
            &state.beta,
            self.transformation.clone(),
            self.input_sample.ncols(),
            self.output_sample.ncols(),
        );

        if self.likelihood.analytical_amplitude {
            let sigma = covariance_model.amplitude()[0];
            debug!("Scale factor by analytical amplitude {sigma}");
            factor.scale(sigma);
        }
        let gamma = factor
            .solve_upper(&state.rho.to_owned().insert_axis(Axis(1)))?
            .column(0)
            .to_owned();
        let kriging = KrigingPredictor::new(
            covariance_model.clone(),
            self.normalized_input_sample.to_owned(),
            gamma,
            metamodel.clone(),
            self.transformation.clone(),
        );
        let (residuals, relative_errors) =
            residual_diagnostics(&kriging.predict(&self.input_sample)?, &self.output_sample)?;
        debug!("Residuals = {residuals}, relative errors = {relative_errors}");

        self.result = Some(GlmResult {
            input_sample: self.input_sample.to_owned(),
            output_sample: self.output_sample.to_owned(),
            metamodel,
            kriging,
            residuals,
            relative_errors,
            covariance_model,
            optimal_log_likelihood,
            cholesky_factor: self.params.keep_cholesky_factor().then_some(factor),
            cumulated_scaling: state.cumulated_scaling,
        });
        Ok(())
    }

    /// The fit outcome, `None` until [GlmAlgorithm::run] succeeded
    pub fn result(&self) -> Option<&GlmResult<F, M>> {
        self.result.as_ref()
    }

    /// Fit if needed and return the outcome
    pub fn into_result(mut self) -> Result<GlmResult<F, M>> {
        self.run()?;
        self.result.ok_or_else(|| {
            GlmError::OptimizationError("GLM fit did not produce a result".to_string())
        })
    }

    /// Reduced log-likelihood at the given reduced covariance parameters, computed from scratch.
    /// Leaves the covariance model with these parameters.
    pub fn compute_reduced_log_likelihood(&mut self, parameter: &Array1<F>) -> Result<F> {
        let input = likelihood_input(
            &self.params,
            &self.normalized_input_sample,
            self.noise.as_ref(),
            &self.y,
            &self.design,
        );
        self.likelihood.compute(&parameter.to_vec(), &input)
    }

    /// Reduced log-likelihood at the given reduced covariance parameters, memoized
    pub fn reduced_log_likelihood(&mut self, parameter: &Array1<F>) -> Result<F> {
        let input = likelihood_input(
            &self.params,
            &self.normalized_input_sample,
            self.noise.as_ref(),
            &self.y,
            &self.design,
        );
        self.likelihood.evaluate(&parameter.to_vec(), &input)
    }

    /// Maximize the reduced log-likelihood starting from the current parameters.
    /// On return the likelihood state matches the optimum.
    fn maximize_reduced_log_likelihood(&mut self) -> Result<F> {
        let input = likelihood_input(
            &self.params,
            &self.normalized_input_sample,
            self.noise.as_ref(),
            &self.y,
            &self.design,
        );
        if self.likelihood.dim() == 0 {
            info!("No covariance parameter to optimize");
            return self.likelihood.compute(&[], &input);
        }

        let bounds = self.optimization_bounds.to_pairs();
        let start: Vec<f64> = self
            .likelihood
            .model
            .parameter()
            .iter()
            .zip(bounds.iter())
            .map(|(v, (lo, up))| v.to_f64().unwrap_or(*lo).max(*lo).min(*up))
            .collect();
        info!(
            "Optimize {:?} from {start:?} within {bounds:?}",
            self.likelihood.model.parameter_description()
        );

        let mut failure: Option<GlmError> = None;
        let likelihood = &mut self.likelihood;
        let mut objective = |x: &[f64]| -> f64 {
            if failure.is_some() {
                return f64::NEG_INFINITY;
            }
            let parameter: Vec<F> = x.iter().map(|v| F::cast(*v)).collect();
            match likelihood.evaluate(&parameter, &input) {
                Ok(value) => value.to_f64().unwrap_or(f64::NEG_INFINITY),
                Err(err) => {
                    failure = Some(err);
                    f64::NEG_INFINITY
                }
            }
        };
        let now = Instant::now();
        let outcome = self
            .optimizer
            .optimize(&mut objective, &start, &bounds, true);
        debug!("elapsed optim = {:?}", now.elapsed().as_millis());
        if let Some(err) = failure {
            return Err(err);
        }
        let outcome = outcome?;

        let x_opt: Vec<F> = outcome.x_opt.iter().map(|v| F::cast(*v)).collect();
        let f_opt = F::cast(outcome.f_opt);
        info!("Optimal parameters {x_opt:?} with log-likelihood {f_opt}");
        let state = &self.likelihood.state;
        if state.factor.is_none() || state.last_log_likelihood != f_opt {
            debug!("Re-evaluate the log-likelihood at the optimum");
            return self.likelihood.compute(&x_opt, &input);
        }
        Ok(f_opt)
    }

    /// Raw input sample
    pub fn input_sample(&self) -> &Array2<F> {
        &self.input_sample
    }

    /// Output sample
    pub fn output_sample(&self) -> &Array2<F> {
        &self.output_sample
    }

    /// Input sample after the input transformation if any
    pub fn normalized_input_sample(&self) -> &Array2<F> {
        &self.normalized_input_sample
    }

    /// Input transformation in use
    pub fn input_transformation(&self) -> Option<&InputTransformation<F>> {
        self.transformation.as_ref()
    }

    /// Design matrix, one row per output observation
    pub fn design_matrix(&self) -> &Array2<F> {
        &self.design
    }

    /// Covariance model adapted to the problem dimensions
    pub fn covariance_model(&self) -> &ReducedCovariance<F, M> {
        &self.covariance_model
    }

    /// Working copy of the covariance model, with the last evaluated parameters
    pub fn reduced_covariance_model(&self) -> &ReducedCovariance<F, M> {
        &self.likelihood.model
    }

    /// Whether the amplitude is estimated analytically
    pub fn analytical_amplitude(&self) -> bool {
        self.likelihood.analytical_amplitude
    }

    /// Bounds of the reduced covariance parameters
    pub fn optimization_bounds(&self) -> &OptimizationBounds<F> {
        &self.optimization_bounds
    }

    /// Noise variances if any
    pub fn noise(&self) -> Option<&Array1<F>> {
        self.noise.as_ref()
    }

    /// Fitting parameters
    pub fn params(&self) -> GlmParams<F, M> {
        GlmParams::new_from_valid(&self.params)
    }
}

fn likelihood_input<'a, F: Float, M: CovarianceModel<F>>(
    params: &'a GlmValidParams<F, M>,
    points: &'a Array2<F>,
    noise: Option<&'a Array1<F>>,
    y: &'a Array1<F>,
    design: &'a Array2<F>,
) -> LikelihoodInput<'a, F> {
    LikelihoodInput {
        factorization: FactorizationInput {
            points,
            noise,
            linear_algebra: params.linear_algebra(),
            hmat: &params.hmat,
            regularization: Regularization {
                starting_scaling: params.starting_scaling,
                maximal_scaling: params.maximal_scaling,
            },
        },
        y,
        design,
        unbiased_variance: params.unbiased_variance(),
    }
}

impl<F: Float, M: CovarianceModel<F>, D: Data<Elem = F>>
    Fit<ArrayBase<D, Ix2>, ArrayBase<D, Ix2>, GlmError> for GlmValidParams<F, M>
{
    type Object = GlmResult<F, M>;

    /// Fit GLM parameters using maximum likelihood
    fn fit(
        &self,
        dataset: &DatasetBase<ArrayBase<D, Ix2>, ArrayBase<D, Ix2>>,
    ) -> Result<Self::Object> {
        GlmAlgorithm::new(self, dataset.records(), dataset.targets())?.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariance_models::*;
    use crate::factorization::{log_min, LinearAlgebra};
    use crate::hmat::HMatrixParameters;
    use crate::optimization::OptimizationOutcome;
    use crate::trend::{replicated_basis, TrendBasis};
    use approx::assert_abs_diff_eq;
    use linfa::{Dataset, ParamGuard};
    use ndarray::{array, concatenate, Array, Zip};
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand_xoshiro::Xoshiro256Plus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn xsinx(x: &Array2<f64>) -> Array2<f64> {
        x.mapv(|v| v * v.sin())
    }

    fn three_points() -> (Array2<f64>, Array2<f64>) {
        (array![[0.], [1.], [2.]], array![[0.], [1.], [0.]])
    }

    fn matern52() -> Matern52Model<f64> {
        Matern52Model::new(Matern52Corr(), array![1.0], array![1.0]).unwrap()
    }

    #[test]
    fn test_three_points_interpolation() {
        let (x, y) = three_points();
        let params = GlmParams::new(matern52()).check().unwrap();
        let mut glm = GlmAlgorithm::new(&params, &x, &y).unwrap();
        glm.run().unwrap();
        let result = glm.result().unwrap();
        assert!(result.optimal_log_likelihood().is_finite());
        assert!(result.optimal_log_likelihood() > log_min::<f64>());
        let predicted = result.kriging().predict(&x).unwrap();
        assert_abs_diff_eq!(predicted, y, epsilon = 1e-6);
        assert!(result.residuals()[0] < 1e-6);
        // no basis: empty coefficients and a zero trend
        assert!(result.trend_coefficients()[..].is_empty());
        assert_eq!(
            result.metamodel().predict(&array![[0.5], [3.]]).unwrap(),
            Array2::zeros((2, 1))
        );
        let scale = result.covariance_model().scale()[0];
        assert!((1e-2..=1e2).contains(&scale));
    }

    #[test]
    fn test_empty_basis_means_no_trend() {
        let (x, y) = three_points();
        let params = GlmParams::new(matern52())
            .basis(vec![TrendBasis::Functions(vec![])])
            .check()
            .unwrap();
        let mut glm = GlmAlgorithm::new(&params, &x, &y).unwrap();
        assert_eq!(glm.design_matrix().dim(), (3, 0));
        glm.run().unwrap();
        let result = glm.result().unwrap();
        assert!(result.trend_coefficients().iter().all(|c| c.is_empty()));
        assert_eq!(
            result.metamodel().predict(&array![[0.5]]).unwrap(),
            Array2::zeros((1, 1))
        );
        assert_abs_diff_eq!(result.kriging().predict(&x).unwrap(), y, epsilon = 1e-6);
    }

    #[test]
    fn test_collinear_basis() {
        // the second input is constant, the linear basis is rank deficient
        let x = array![[0., 5.], [1., 5.], [2., 5.], [3., 5.], [4., 5.]];
        let y = x
            .column(0)
            .mapv(|v: f64| 2. * v + 1. + v.sin())
            .insert_axis(Axis(1));
        let params = GlmParams::new(matern52())
            .basis(vec![TrendBasis::Linear])
            .check()
            .unwrap();
        let mut glm = GlmAlgorithm::new(&params, &x, &y).unwrap();
        glm.run().unwrap();
        let result = glm.result().unwrap();
        let beta = &result.trend_coefficients()[0];
        assert_eq!(beta.len(), 3);
        assert!(beta.iter().all(|b| b.is_finite() && b.abs() < 1e2));
        assert_abs_diff_eq!(result.kriging().predict(&x).unwrap(), y, epsilon = 1e-6);
    }

    #[test]
    fn test_noise_relaxes_interpolation() {
        let (x, y) = three_points();
        let params = GlmParams::new(matern52()).check().unwrap();
        let mut exact = GlmAlgorithm::new(&params, &x, &y).unwrap();
        exact.run().unwrap();
        let mut noisy = GlmAlgorithm::new(&params, &x, &y).unwrap();
        noisy.set_noise(array![1e-3, 1e-3, 1e-3]).unwrap();
        noisy.run().unwrap();
        let exact_residual = exact.result().unwrap().residuals()[0];
        let noisy_residual = noisy.result().unwrap().residuals()[0];
        assert!(noisy_residual > exact_residual);
        let predicted = noisy.result().unwrap().kriging().predict(&x).unwrap();
        assert_abs_diff_eq!(predicted, y, epsilon = 1e-1);
    }

    #[test]
    fn test_invalid_noise() {
        let (x, y) = three_points();
        let params = GlmParams::new(matern52()).check().unwrap();
        let mut glm = GlmAlgorithm::new(&params, &x, &y).unwrap();
        assert!(matches!(
            glm.set_noise(array![1e-3, 1e-3]),
            Err(GlmError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            glm.set_noise(array![1e-3, -1e-3, 0.]),
            Err(GlmError::InvalidValueError(_))
        ));
    }

    #[test]
    fn test_run_idempotent() {
        let (x, y) = three_points();
        let params = GlmParams::new(matern52())
            .basis(vec![TrendBasis::Constant])
            .check()
            .unwrap();
        let mut glm = GlmAlgorithm::new(&params, &x, &y).unwrap();
        glm.run().unwrap();
        let first = glm.result().unwrap().optimal_log_likelihood();
        let model = glm.result().unwrap().covariance_model().full_parameter();
        glm.run().unwrap();
        assert_eq!(glm.result().unwrap().optimal_log_likelihood(), first);
        assert_eq!(glm.result().unwrap().covariance_model().full_parameter(), model);
        assert_eq!(glm.result().unwrap().trend_coefficients().len(), 1);
    }

    #[test]
    fn test_sample_size_mismatch() {
        let params = GlmParams::new(matern52()).check().unwrap();
        let res = GlmAlgorithm::new(&params, &array![[0.], [1.]], &array![[0.]]);
        assert!(matches!(res, Err(GlmError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_basis_collection_mismatch() {
        let x = array![[0.], [1.], [2.]];
        let y = array![[0., 1.], [1., 2.], [0., 1.]];
        let params = GlmParams::new(matern52())
            .basis(vec![TrendBasis::Constant])
            .check()
            .unwrap();
        let res = GlmAlgorithm::new(&params, &x, &y);
        assert!(matches!(res, Err(GlmError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_covariance_mismatch() {
        let model = Matern52Model::new(Matern52Corr(), array![1.0, 1.0], array![1.0]).unwrap();
        let params = GlmParams::new(model).check().unwrap();
        let x = Array2::zeros((4, 3));
        let y = Array2::zeros((4, 1));
        let res = GlmAlgorithm::new(&params, &x, &y);
        assert!(matches!(res, Err(GlmError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_no_optimization() {
        let (x, y) = three_points();
        let params = GlmParams::new(matern52())
            .optimize_parameters(false)
            .keep_cholesky_factor(true)
            .check()
            .unwrap();
        let mut glm = GlmAlgorithm::new(&params, &x, &y).unwrap();
        assert_eq!(glm.optimization_bounds().dim(), 0);
        assert!(!glm.analytical_amplitude());
        glm.run().unwrap();
        let result = glm.result().unwrap();
        assert_eq!(result.covariance_model().scale(), array![1.0]);
        assert_eq!(result.covariance_model().amplitude(), array![1.0]);
        assert!(result.cholesky_factor().is_some());

        glm.set_optimize_parameters(true).unwrap();
        assert!(glm.result().is_none());
        assert_eq!(glm.optimization_bounds().dim(), 1);
        assert!(glm.analytical_amplitude());
        assert!(glm
            .set_optimization_bounds(OptimizationBounds::uniform(2, 0.1, 1.))
            .is_err());
        glm.set_optimization_bounds(OptimizationBounds::uniform(1, 0.1, 1.))
            .unwrap();
        glm.run().unwrap();
        let scale = glm.result().unwrap().covariance_model().scale()[0];
        assert!((0.1..=1.).contains(&scale));
    }

    #[test]
    fn test_retained_factor_scaled_by_amplitude() {
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let x: Array2<f64> = Array::random_using((12, 1), Uniform::new(0., 10.), &mut rng);
        let y = xsinx(&x);
        let params = GlmParams::new(matern52())
            .basis(vec![TrendBasis::Linear])
            .keep_cholesky_factor(true)
            .check()
            .unwrap();
        let result = params.fit(&Dataset::new(x.to_owned(), y)).unwrap();
        let model = result.covariance_model();
        let cov = model.discretize(&x);
        match result.cholesky_factor() {
            Some(crate::CovarianceFactor::Dense(l)) => {
                let l = l.matrix();
                let mut expected = cov.to_owned();
                expected
                    .diag_mut()
                    .mapv_inplace(|v| v + result.cumulated_scaling() * model.amplitude()[0].powi(2));
                assert_abs_diff_eq!(l.dot(&l.t()), expected, epsilon = 1e-6 * cov[[0, 0]]);
            }
            _ => panic!("dense factor expected"),
        }
    }

    #[test]
    fn test_multi_output() {
        let mut rng = Xoshiro256Plus::seed_from_u64(0);
        let x: Array2<f64> = Array::random_using((10, 2), Uniform::new(0., 1.), &mut rng);
        let mut y = Array2::zeros((10, 2));
        Zip::from(y.rows_mut()).and(x.rows()).for_each(|mut yi, xi| {
            yi[0] = xi[0] + xi[1].sin();
            yi[1] = xi[0] * xi[1];
        });
        let params = GlmParams::new(matern52())
            .basis(replicated_basis(TrendBasis::Constant, 2))
            .normalize(true)
            .check()
            .unwrap();
        let mut glm = GlmAlgorithm::new(&params, &x, &y).unwrap();
        assert!(matches!(
            glm.covariance_model(),
            ReducedCovariance::TensorizedProduct(_)
        ));
        // no analytical amplitude for vector outputs
        assert!(!glm.analytical_amplitude());
        assert_eq!(glm.design_matrix().dim(), (20, 2));
        glm.run().unwrap();
        let result = glm.result().unwrap();
        assert_eq!(result.trend_coefficients().len(), 2);
        assert_eq!(result.residuals().len(), 2);
        let predicted = result.kriging().predict(&x).unwrap();
        assert_abs_diff_eq!(predicted, y, epsilon = 1e-3);
    }

    #[test]
    fn test_hierarchical_matches_dense() {
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let x: Array2<f64> = Array::random_using((40, 1), Uniform::new(0., 10.), &mut rng);
        let y = xsinx(&x);
        let hmat = HMatrixParameters {
            assembly_epsilon: 1e-12,
            recompression_epsilon: 1e-12,
            max_leaf_size: 8,
        };
        let dense = GlmParams::new(matern52())
            .basis(vec![TrendBasis::Constant])
            .optimize_parameters(false)
            .check()
            .unwrap();
        let hierarchical = GlmParams::new_from_valid(&dense)
            .linear_algebra(LinearAlgebra::Hierarchical)
            .hmat(hmat)
            .check()
            .unwrap();
        let mut glm_dense = GlmAlgorithm::new(&dense, &x, &y).unwrap();
        let mut glm_hmat = GlmAlgorithm::new(&hierarchical, &x, &y).unwrap();
        let p = Array1::<f64>::zeros(0);
        let ld = glm_dense.compute_reduced_log_likelihood(&p).unwrap();
        let lh = glm_hmat.compute_reduced_log_likelihood(&p).unwrap();
        assert_abs_diff_eq!(ld, lh, epsilon = 1e-5 * ld.abs().max(1.));
        glm_dense.run().unwrap();
        glm_hmat.run().unwrap();
        let xtest = array![[1.5], [4.2], [7.7]];
        assert_abs_diff_eq!(
            glm_dense.result().unwrap().kriging().predict(&xtest).unwrap(),
            glm_hmat.result().unwrap().kriging().predict(&xtest).unwrap(),
            epsilon = 1e-4
        );
    }

    #[test]
    fn test_hierarchical_matches_dense_multi_output() {
        let mut rng = Xoshiro256Plus::seed_from_u64(0);
        let x: Array2<f64> = Array::random_using((30, 1), Uniform::new(0., 10.), &mut rng);
        let y = concatenate![Axis(1), xsinx(&x), x.mapv(|v| v.cos())];
        let dense = GlmParams::new(matern52())
            .basis(replicated_basis(TrendBasis::Constant, 2))
            .optimize_parameters(false)
            .check()
            .unwrap();
        let hierarchical = GlmParams::new_from_valid(&dense)
            .linear_algebra(LinearAlgebra::Hierarchical)
            .hmat(HMatrixParameters {
                assembly_epsilon: 1e-12,
                recompression_epsilon: 1e-12,
                max_leaf_size: 4,
            })
            .check()
            .unwrap();
        let mut glm_dense = GlmAlgorithm::new(&dense, &x, &y).unwrap();
        let mut glm_hmat = GlmAlgorithm::new(&hierarchical, &x, &y).unwrap();
        assert!(matches!(
            glm_hmat.covariance_model(),
            ReducedCovariance::Tensorized(_)
        ));
        let p = Array1::<f64>::zeros(0);
        let ld = glm_dense.compute_reduced_log_likelihood(&p).unwrap();
        let lh = glm_hmat.compute_reduced_log_likelihood(&p).unwrap();
        assert_abs_diff_eq!(ld, lh, epsilon = 1e-5 * ld.abs().max(1.));
        glm_dense.run().unwrap();
        glm_hmat.run().unwrap();
        let dense_result = glm_dense.result().unwrap();
        let hmat_result = glm_hmat.result().unwrap();
        for (bd, bh) in dense_result
            .trend_coefficients()
            .iter()
            .zip(hmat_result.trend_coefficients())
        {
            assert_abs_diff_eq!(bd, bh, epsilon = 1e-5);
        }
        let xtest = array![[1.5], [4.2], [7.7]];
        assert_abs_diff_eq!(
            dense_result.kriging().predict(&xtest).unwrap(),
            hmat_result.kriging().predict(&xtest).unwrap(),
            epsilon = 1e-4
        );
    }

    #[test]
    fn test_user_transformation() {
        let (x, y) = three_points();
        let transformation = InputTransformation::new(array![1.0], array![2.0]).unwrap();
        let params = GlmParams::new(matern52())
            .with_input_transformation(transformation)
            .check()
            .unwrap();
        let glm = GlmAlgorithm::new(&params, &x, &y).unwrap();
        assert_eq!(
            glm.normalized_input_sample(),
            &array![[-0.5], [0.], [0.5]]
        );

        let wrong = InputTransformation::new(array![1.0, 0.], array![2.0, 1.]).unwrap();
        let params = GlmParams::new(matern52())
            .with_input_transformation(wrong)
            .check()
            .unwrap();
        assert!(GlmAlgorithm::new(&params, &x, &y).is_err());
    }

    /// Returns a fixed point off the last evaluated one
    struct Stubborn(Arc<AtomicUsize>);

    impl Optimizer for Stubborn {
        fn optimize(
            &self,
            objective: &mut dyn FnMut(&[f64]) -> f64,
            _start: &[f64],
            _bounds: &[(f64, f64)],
            _maximize: bool,
        ) -> Result<OptimizationOutcome> {
            let f_opt = objective(&[0.5]);
            objective(&[2.0]);
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(OptimizationOutcome {
                x_opt: vec![0.5],
                f_opt,
            })
        }
    }

    #[test]
    fn test_reevaluation_at_optimum() {
        let (x, y) = three_points();
        let params = GlmParams::new(matern52()).check().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut glm = GlmAlgorithm::new(&params, &x, &y).unwrap();
        glm.set_optimizer(Stubborn(calls.clone()));
        glm.run().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let result = glm.result().unwrap();
        assert_eq!(result.covariance_model().scale(), array![0.5]);
        let optimum = result.optimal_log_likelihood();
        let expected = glm.compute_reduced_log_likelihood(&array![0.5]).unwrap();
        assert_eq!(optimum, expected);
    }
}
