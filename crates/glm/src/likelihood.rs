use crate::covariance_models::CovarianceModel;
use crate::errors::{GlmError, Result};
use crate::factorization::{factorize, log_min, whiten, CovarianceFactor, FactorizationInput, Whitening};
use crate::reduction::ReducedCovariance;
use crate::utils::parameter_key;
use linfa::Float;
use log::debug;
use ndarray::{Array1, Array2};
use std::collections::{HashMap, VecDeque};

/// State derived from the last likelihood evaluation
#[derive(Clone, Debug)]
pub(crate) struct LikelihoodState<F: Float> {
    /// Factor of the covariance matrix (with amplitude 1 in analytical amplitude mode)
    pub factor: Option<CovarianceFactor<F>>,
    /// Whitened residual of the generalized least squares
    pub rho: Array1<F>,
    /// Trend coefficients
    pub beta: Array1<F>,
    pub last_log_likelihood: F,
    /// Diagonal boost used by the last factorization
    pub cumulated_scaling: F,
}

impl<F: Float> Default for LikelihoodState<F> {
    fn default() -> Self {
        LikelihoodState {
            factor: None,
            rho: Array1::zeros(0),
            beta: Array1::zeros(0),
            last_log_likelihood: log_min(),
            cumulated_scaling: F::zero(),
        }
    }
}

impl<F: Float> LikelihoodState<F> {
    /// Drop everything derived from previous covariance parameters
    pub fn invalidate(&mut self) {
        *self = LikelihoodState::default();
    }
}

/// Observations and settings the likelihood is evaluated with
pub(crate) struct LikelihoodInput<'a, F: Float> {
    pub factorization: FactorizationInput<'a, F>,
    /// Flattened outputs, `y[i * d + k]` is marginal `k` at point `i`
    pub y: &'a Array1<F>,
    pub design: &'a Array2<F>,
    pub unbiased_variance: bool,
}

/// Maximum number of memoized likelihood values
pub(crate) const LIKELIHOOD_CACHE_SIZE: usize = 1024;

/// The reduced log-likelihood of the covariance parameters, memoized by parameter vector.
/// The oldest values are evicted beyond the cache capacity.
#[derive(Clone, Debug)]
pub(crate) struct ReducedLikelihood<F: Float, M: CovarianceModel<F>> {
    /// Working copy of the covariance model holding the active parameters being optimized
    pub model: ReducedCovariance<F, M>,
    pub analytical_amplitude: bool,
    pub state: LikelihoodState<F>,
    cache: HashMap<Vec<u64>, F>,
    /// Cached keys in insertion order
    cache_order: VecDeque<Vec<u64>>,
    cache_capacity: usize,
}

impl<F: Float, M: CovarianceModel<F>> ReducedLikelihood<F, M> {
    pub fn new(model: ReducedCovariance<F, M>, analytical_amplitude: bool) -> Self {
        ReducedLikelihood {
            model,
            analytical_amplitude,
            state: LikelihoodState::default(),
            cache: HashMap::new(),
            cache_order: VecDeque::new(),
            cache_capacity: LIKELIHOOD_CACHE_SIZE,
        }
    }

    /// Number of parameters of the objective
    pub fn dim(&self) -> usize {
        self.model.active_parameter().len()
    }

    /// Memoized log-likelihood, a cached value leaves the state untouched
    pub fn evaluate(&mut self, parameter: &[F], input: &LikelihoodInput<F>) -> Result<F> {
        self.check_dim(parameter)?;
        if let Some(value) = self.cache.get(&parameter_key(parameter)) {
            return Ok(*value);
        }
        self.compute(parameter, input)
    }

    /// Log-likelihood computed from scratch, updating the state and the cache
    pub fn compute(&mut self, parameter: &[F], input: &LikelihoodInput<F>) -> Result<F> {
        self.check_dim(parameter)?;
        self.state.invalidate();
        if parameter.iter().any(|v| !v.is_finite()) {
            return Ok(log_min());
        }

        if self.analytical_amplitude {
            self.model.set_amplitude(&Array1::ones(1))?;
        }
        self.model
            .set_parameter(&Array1::from(parameter.to_vec()))?;

        let (factor, cumulated_scaling) = factorize(&self.model, &input.factorization)?;
        let Whitening {
            mut rho,
            beta,
            mut log_determinant,
        } = whiten(&factor, input.y, input.design)?;

        let mut epsilon = rho.dot(&rho);
        if self.analytical_amplitude && epsilon > F::zero() {
            let n = input.factorization.points.nrows();
            let dof = if input.unbiased_variance && n > beta.len() {
                n - beta.len()
            } else {
                n
            };
            let sigma = (epsilon / F::cast(dof)).sqrt();
            debug!("Analytical amplitude sigma = {sigma}");
            self.model.set_amplitude(&Array1::from_elem(1, sigma))?;
            log_determinant += F::cast(2 * n) * sigma.ln();
            rho.mapv_inplace(|v| v / sigma);
            epsilon = rho.dot(&rho);
        }

        let log_likelihood = if epsilon <= F::zero() {
            log_min()
        } else {
            F::cast(-0.5) * (log_determinant + epsilon)
        };
        debug!("Reduced log-likelihood = {log_likelihood} (log_determinant = {log_determinant}, epsilon = {epsilon})");

        self.state = LikelihoodState {
            factor: Some(factor),
            rho,
            beta,
            last_log_likelihood: log_likelihood,
            cumulated_scaling,
        };
        self.memoize(parameter_key(parameter), log_likelihood);
        Ok(log_likelihood)
    }

    fn memoize(&mut self, key: Vec<u64>, value: F) {
        if self.cache.insert(key.clone(), value).is_none() {
            self.cache_order.push_back(key);
        }
        while self.cache_order.len() > self.cache_capacity {
            if let Some(oldest) = self.cache_order.pop_front() {
                self.cache.remove(&oldest);
            }
        }
    }

    /// Forget memoized values and derived state, the objective itself changed
    pub fn reset(&mut self) {
        self.cache.clear();
        self.cache_order.clear();
        self.state.invalidate();
    }

    /// Number of memoized evaluations
    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    fn check_dim(&self, parameter: &[F]) -> Result<()> {
        if parameter.len() != self.dim() {
            return Err(GlmError::dimension_mismatch(
                "reduced covariance parameter",
                self.dim(),
                parameter.len(),
            ));
        }
        Ok(())
    }
}
