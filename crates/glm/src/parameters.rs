use crate::covariance_models::CovarianceModel;
use crate::errors::{GlmError, Result};
use crate::factorization::LinearAlgebra;
use crate::hmat::HMatrixParameters;
use crate::optimization::CobylaParams;
use crate::trend::TrendBasis;
use crate::utils::InputTransformation;
use crate::{
    GLM_MAXIMAL_SCALING, GLM_MEAN_EPSILON, GLM_OPTIMIZATION_LOWER_BOUND,
    GLM_OPTIMIZATION_UPPER_BOUND, GLM_STARTING_SCALING,
};
use linfa::{Float, ParamGuard};

/// GLM fitting algorithm parameters
#[derive(Clone, Debug)]
pub struct GlmValidParams<F: Float, M: CovarianceModel<F>> {
    /// Covariance model of the error term, adapted to the problem dimensions at fit time
    pub(crate) covariance_model: M,
    /// Trend basis per output marginal, empty for no trend
    pub(crate) basis: Vec<TrendBasis<F>>,
    /// Whether input points are centered and reduced
    pub(crate) normalize: bool,
    /// User given input transformation, takes precedence over the computed one
    pub(crate) input_transformation: Option<InputTransformation<F>>,
    /// Whether the Cholesky factor is kept in the result
    pub(crate) keep_cholesky_factor: bool,
    /// Whether covariance parameters are optimized
    pub(crate) optimize_parameters: bool,
    /// Whether the amplitude of a scalar model is estimated analytically
    pub(crate) analytical_amplitude: bool,
    /// Whether the analytical amplitude uses the unbiased variance estimate
    pub(crate) unbiased_variance: bool,
    /// First diagonal boost of the regularization
    pub(crate) starting_scaling: F,
    /// Cumulated diagonal boost beyond which regularization gives up
    pub(crate) maximal_scaling: F,
    /// Threshold of the output mean to consider it centered
    pub(crate) mean_epsilon: F,
    /// Default (lower, upper) bounds of each optimized parameter
    pub(crate) optimization_bounds: (F, F),
    /// Factorization backend
    pub(crate) linear_algebra: LinearAlgebra,
    /// Hierarchical backend settings
    pub(crate) hmat: HMatrixParameters,
    /// Default optimizer settings
    pub(crate) cobyla: CobylaParams,
    /// Number of additional random optimization starts
    pub(crate) n_start: usize,
    /// Seed of the random starts
    pub(crate) seed: Option<u64>,
}

impl<F: Float, M: CovarianceModel<F>> GlmValidParams<F, M> {
    fn with_model(covariance_model: M) -> Self {
        GlmValidParams {
            covariance_model,
            basis: Vec::new(),
            normalize: false,
            input_transformation: None,
            keep_cholesky_factor: false,
            optimize_parameters: true,
            analytical_amplitude: true,
            unbiased_variance: false,
            starting_scaling: F::cast(GLM_STARTING_SCALING),
            maximal_scaling: F::cast(GLM_MAXIMAL_SCALING),
            mean_epsilon: F::cast(GLM_MEAN_EPSILON),
            optimization_bounds: (
                F::cast(GLM_OPTIMIZATION_LOWER_BOUND),
                F::cast(GLM_OPTIMIZATION_UPPER_BOUND),
            ),
            linear_algebra: LinearAlgebra::default(),
            hmat: HMatrixParameters::default(),
            cobyla: CobylaParams::default(),
            n_start: 0,
            seed: None,
        }
    }

    /// Get covariance model
    pub fn covariance_model(&self) -> &M {
        &self.covariance_model
    }

    /// Get trend basis collection
    pub fn basis(&self) -> &[TrendBasis<F>] {
        &self.basis
    }

    /// Get whether inputs are normalized
    pub fn normalize(&self) -> bool {
        self.normalize || self.input_transformation.is_some()
    }

    /// Get the user given input transformation
    pub fn input_transformation(&self) -> Option<&InputTransformation<F>> {
        self.input_transformation.as_ref()
    }

    /// Get whether the Cholesky factor is kept
    pub fn keep_cholesky_factor(&self) -> bool {
        self.keep_cholesky_factor
    }

    /// Get whether covariance parameters are optimized
    pub fn optimize_parameters(&self) -> bool {
        self.optimize_parameters
    }

    /// Get whether amplitude is estimated analytically when possible
    pub fn analytical_amplitude(&self) -> bool {
        self.analytical_amplitude
    }

    /// Get whether the analytical amplitude is unbiased
    pub fn unbiased_variance(&self) -> bool {
        self.unbiased_variance
    }

    /// Get the linear algebra backend
    pub fn linear_algebra(&self) -> LinearAlgebra {
        self.linear_algebra
    }

    /// Get default optimization bounds
    pub fn optimization_bounds(&self) -> (F, F) {
        self.optimization_bounds
    }
}

#[derive(Clone, Debug)]
/// The set of parameters that can be specified for the execution of
/// the [GLM algorithm](crate::GlmAlgorithm).
pub struct GlmParams<F: Float, M: CovarianceModel<F>>(GlmValidParams<F, M>);

impl<F: Float, M: CovarianceModel<F>> GlmParams<F, M> {
    /// A constructor for GLM parameters given a covariance model
    pub fn new(covariance_model: M) -> GlmParams<F, M> {
        Self(GlmValidParams::with_model(covariance_model))
    }

    /// A constructor for GLM parameters from validated parameters
    pub fn new_from_valid(params: &GlmValidParams<F, M>) -> Self {
        Self(params.clone())
    }

    /// Set covariance model.
    pub fn covariance_model(mut self, covariance_model: M) -> Self {
        self.0.covariance_model = covariance_model;
        self
    }

    /// Set the trend basis collection, one basis per output marginal, empty for no trend.
    pub fn basis(mut self, basis: Vec<TrendBasis<F>>) -> Self {
        self.0.basis = basis;
        self
    }

    /// Center and reduce input points before fitting.
    pub fn normalize(mut self, normalize: bool) -> Self {
        self.0.normalize = normalize;
        self
    }

    /// Set the input transformation applied before fitting, enables normalization.
    pub fn with_input_transformation(mut self, transformation: InputTransformation<F>) -> Self {
        self.0.input_transformation = Some(transformation);
        self
    }

    /// Keep the Cholesky factor of the covariance matrix in the result.
    pub fn keep_cholesky_factor(mut self, keep: bool) -> Self {
        self.0.keep_cholesky_factor = keep;
        self
    }

    /// Optimize covariance parameters or keep them as given.
    pub fn optimize_parameters(mut self, optimize: bool) -> Self {
        self.0.optimize_parameters = optimize;
        self
    }

    /// Estimate the amplitude of scalar models analytically.
    pub fn analytical_amplitude(mut self, analytical: bool) -> Self {
        self.0.analytical_amplitude = analytical;
        self
    }

    /// Use `N - p` instead of `N` as denominator of the analytical amplitude.
    pub fn unbiased_variance(mut self, unbiased: bool) -> Self {
        self.0.unbiased_variance = unbiased;
        self
    }

    /// Set the diagonal regularization boosts.
    /// Should be 0 < starting_scaling <= maximal_scaling
    pub fn scaling(mut self, starting_scaling: F, maximal_scaling: F) -> Self {
        self.0.starting_scaling = starting_scaling;
        self.0.maximal_scaling = maximal_scaling;
        self
    }

    /// Set the threshold of the output mean below which outputs are considered centered.
    pub fn mean_epsilon(mut self, mean_epsilon: F) -> Self {
        self.0.mean_epsilon = mean_epsilon;
        self
    }

    /// Set the default bounds of every optimized covariance parameter.
    pub fn optimization_bounds(mut self, lower: F, upper: F) -> Self {
        self.0.optimization_bounds = (lower, upper);
        self
    }

    /// Set the linear algebra backend.
    pub fn linear_algebra(mut self, linear_algebra: LinearAlgebra) -> Self {
        self.0.linear_algebra = linear_algebra;
        self
    }

    /// Set hierarchical backend settings.
    pub fn hmat(mut self, hmat: HMatrixParameters) -> Self {
        self.0.hmat = hmat;
        self
    }

    /// Set default optimizer settings.
    pub fn cobyla(mut self, cobyla: CobylaParams) -> Self {
        self.0.cobyla = cobyla;
        self
    }

    /// Set the number of additional random starts of the optimizer.
    pub fn n_start(mut self, n_start: usize) -> Self {
        self.0.n_start = n_start;
        self
    }

    /// Set the seed of the random starts.
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.0.seed = seed;
        self
    }
}

impl<F: Float, M: CovarianceModel<F>> From<GlmValidParams<F, M>> for GlmParams<F, M> {
    fn from(valid: GlmValidParams<F, M>) -> Self {
        GlmParams(valid)
    }
}

impl<F: Float, M: CovarianceModel<F>> ParamGuard for GlmParams<F, M> {
    type Checked = GlmValidParams<F, M>;
    type Error = GlmError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        let p = &self.0;
        if !(p.starting_scaling > F::zero()) || !(p.maximal_scaling > F::zero()) {
            return Err(GlmError::InvalidValueError(format!(
                "Scalings should be positive, got starting {} and maximal {}",
                p.starting_scaling, p.maximal_scaling
            )));
        }
        if p.starting_scaling > p.maximal_scaling {
            return Err(GlmError::InvalidValueError(format!(
                "Starting scaling {} should be less than maximal scaling {}",
                p.starting_scaling, p.maximal_scaling
            )));
        }
        if !(p.mean_epsilon > F::zero()) {
            return Err(GlmError::InvalidValueError(format!(
                "Mean epsilon should be positive, got {}",
                p.mean_epsilon
            )));
        }
        let (lower, upper) = p.optimization_bounds;
        if !(lower < upper) {
            return Err(GlmError::InvalidValueError(format!(
                "Lower bound {lower} should be less than upper bound {upper}"
            )));
        }
        if !(p.hmat.assembly_epsilon > 0.) || !(p.hmat.recompression_epsilon > 0.) {
            return Err(GlmError::InvalidValueError(
                "Hierarchical matrix epsilons should be positive".to_string(),
            ));
        }
        if p.hmat.max_leaf_size == 0 {
            return Err(GlmError::InvalidValueError(
                "Hierarchical matrix leaf size cannot be 0".to_string(),
            ));
        }
        if p.cobyla.maxeval == 0 || !(p.cobyla.rhobeg > 0.) {
            return Err(GlmError::InvalidValueError(
                "Cobyla max evaluations and initial radius should be positive".to_string(),
            ));
        }
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}
