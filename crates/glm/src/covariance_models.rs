//! A module for parametric covariance models used to model the error term of the GLM.
//!
//! A covariance model `C(s, t)` is a `(d, d)` matrix valued function of two locations `s` and `t`
//! of dimension `spatial_dim`, where `d` is the output dimension. Its parameters are:
//! * a `scale` vector (length `spatial_dim`) applied to the lag `(s - t)`,
//! * an `amplitude` vector (length `d`) giving the marginal standard deviations.
//!
//! The full parameter vector is laid out as `[scale_0, ..., scale_{n-1}, amplitude_0, ..., amplitude_{d-1}]`
//! and only the entries listed in the active parameter set are seen by the likelihood optimizer.
//!
//! The following stationary correlation kernels are implemented:
//! * squared exponential,
//! * absolute exponential,
//! * matern 3/2,
//! * matern 5/2.

use crate::errors::{GlmError, Result};
use linfa::Float;
use ndarray::{concatenate, s, Array1, Array2, ArrayBase, ArrayView1, Axis, Data, Ix2, Zip};
use paste::paste;
use std::fmt;

/// Description of the amplitude parameter eligible to the analytical estimation
pub const FIRST_AMPLITUDE: &str = "amplitude_0";

/// A trait for covariance models used in GLM fitting
pub trait CovarianceModel<F: Float>: Clone + fmt::Debug + fmt::Display + Send + Sync {
    /// Dimension of the locations
    fn spatial_dim(&self) -> usize;

    /// Dimension of the output (number of marginals)
    fn dim(&self) -> usize;

    /// Scale parameter (length `spatial_dim`)
    fn scale(&self) -> Array1<F>;

    /// Set scale parameter, values must be positive
    fn set_scale(&mut self, scale: &Array1<F>) -> Result<()>;

    /// Amplitude parameter (length `dim`)
    fn amplitude(&self) -> Array1<F>;

    /// Set amplitude parameter, values must be positive
    fn set_amplitude(&mut self, amplitude: &Array1<F>) -> Result<()>;

    /// Factor of the squared amplitudes added on the diagonal of discretized matrices
    fn nugget_factor(&self) -> F;

    /// Indices of the full parameter components seen as parameters
    fn active_parameter(&self) -> &[usize];

    /// Set active parameter indices, indices must be valid and unique
    fn set_active_parameter(&mut self, active: Vec<usize>) -> Result<()>;

    /// Covariance `(d, d)` matrix between locations `s` and `t`, nugget excluded.
    fn compute(&self, s: &ArrayView1<F>, t: &ArrayView1<F>) -> Array2<F>;

    /// Full parameter vector `[scale, amplitude]`
    fn full_parameter(&self) -> Array1<F> {
        concatenate![Axis(0), self.scale(), self.amplitude()]
    }

    /// Set full parameter vector `[scale, amplitude]`
    fn set_full_parameter(&mut self, parameter: &Array1<F>) -> Result<()> {
        let n_scale = self.spatial_dim();
        let expected = n_scale + self.dim();
        if parameter.len() != expected {
            return Err(GlmError::dimension_mismatch(
                "full covariance parameter",
                expected,
                parameter.len(),
            ));
        }
        self.set_scale(&parameter.slice(s![..n_scale]).to_owned())?;
        self.set_amplitude(&parameter.slice(s![n_scale..]).to_owned())
    }

    /// Names of the full parameter components
    fn full_parameter_description(&self) -> Vec<String> {
        (0..self.spatial_dim())
            .map(|i| format!("scale_{i}"))
            .chain((0..self.dim()).map(|k| format!("amplitude_{k}")))
            .collect()
    }

    /// Active part of the full parameter
    fn parameter(&self) -> Array1<F> {
        let full = self.full_parameter();
        self.active_parameter().iter().map(|&i| full[i]).collect()
    }

    /// Set the active part of the full parameter
    fn set_parameter(&mut self, parameter: &Array1<F>) -> Result<()> {
        let active = self.active_parameter().to_vec();
        if parameter.len() != active.len() {
            return Err(GlmError::dimension_mismatch(
                "covariance parameter",
                active.len(),
                parameter.len(),
            ));
        }
        let mut full = self.full_parameter();
        Zip::from(parameter)
            .and(&Array1::from(active))
            .for_each(|&v, &i| full[i] = v);
        self.set_full_parameter(&full)
    }

    /// Names of the active parameter components
    fn parameter_description(&self) -> Vec<String> {
        let full = self.full_parameter_description();
        self.active_parameter()
            .iter()
            .map(|&i| full[i].clone())
            .collect()
    }

    /// Values added on the diagonal of each `(d, d)` diagonal block when discretizing
    fn nugget_diagonal(&self) -> Array1<F> {
        let nugget = self.nugget_factor();
        self.amplitude().mapv(|a| nugget * a * a)
    }

    /// Discretize the model over `x` points given as a (n, nx) matrix.
    /// Returns the symmetric (n * d, n * d) matrix where entry `(i * d + k, j * d + l)`
    /// is the covariance between marginal `k` at `x_i` and marginal `l` at `x_j`.
    fn discretize(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array2<F> {
        let n = x.nrows();
        let d = self.dim();
        let mut cov = Array2::zeros((n * d, n * d));
        for i in 0..n {
            for j in 0..=i {
                let block = self.compute(&x.row(i), &x.row(j));
                cov.slice_mut(s![i * d..(i + 1) * d, j * d..(j + 1) * d])
                    .assign(&block);
                if i != j {
                    cov.slice_mut(s![j * d..(j + 1) * d, i * d..(i + 1) * d])
                        .assign(&block.t());
                }
            }
        }
        let nugget = self.nugget_diagonal();
        if nugget.iter().any(|v| *v > F::zero()) {
            for i in 0..n {
                for k in 0..d {
                    cov[[i * d + k, i * d + k]] += nugget[k];
                }
            }
        }
        cov
    }
}

/// Check active parameter indices against the full parameter size
pub(crate) fn check_active_parameter(active: &[usize], size: usize) -> Result<()> {
    for (k, &i) in active.iter().enumerate() {
        if i >= size {
            return Err(GlmError::InvalidValueError(format!(
                "Active parameter index {i} out of range, model has {size} parameters"
            )));
        }
        if active[..k].contains(&i) {
            return Err(GlmError::InvalidValueError(format!(
                "Active parameter index {i} given twice"
            )));
        }
    }
    Ok(())
}

pub(crate) fn check_positive<F: Float>(what: &str, values: &Array1<F>, size: usize) -> Result<()> {
    if values.len() != size {
        return Err(GlmError::dimension_mismatch(what, size, values.len()));
    }
    if values.iter().any(|v| !(*v > F::zero()) || !v.is_finite()) {
        return Err(GlmError::InvalidValueError(format!(
            "{what} should be positive, got {values}"
        )));
    }
    Ok(())
}

/// A trait for stationary correlation kernels `r(tau)` where `tau = (s - t) / scale`
pub trait CorrelationFunction<F: Float>:
    Clone + Copy + Default + fmt::Debug + fmt::Display + Send + Sync
{
    /// Correlation value at the scaled lag `tau`, `r(0) = 1`
    fn value(&self, tau: &ArrayView1<F>) -> F;
}

/// Squared exponential correlation kernel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct SquaredExponentialCorr();

impl<F: Float> CorrelationFunction<F> for SquaredExponentialCorr {
    /// exp( - |tau|^2 / 2 )
    fn value(&self, tau: &ArrayView1<F>) -> F {
        F::exp(F::cast(-0.5) * tau.dot(tau))
    }
}

/// Absolute exponential correlation kernel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct AbsoluteExponentialCorr();

impl<F: Float> CorrelationFunction<F> for AbsoluteExponentialCorr {
    /// exp( - |tau|_1 )
    fn value(&self, tau: &ArrayView1<F>) -> F {
        F::exp(-tau.mapv(|v| v.abs()).sum())
    }
}

/// Matern 3/2 correlation kernel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Matern32Corr();

impl<F: Float> CorrelationFunction<F> for Matern32Corr {
    /// (1 + sqrt(3) * |tau|) exp( - sqrt(3) * |tau| )
    fn value(&self, tau: &ArrayView1<F>) -> F {
        let r = F::cast(3.).sqrt() * tau.dot(tau).sqrt();
        (F::one() + r) * F::exp(-r)
    }
}

/// Matern 5/2 correlation kernel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Matern52Corr();

impl<F: Float> CorrelationFunction<F> for Matern52Corr {
    /// (1 + sqrt(5) * |tau| + 5/3 * |tau|^2) exp( - sqrt(5) * |tau| )
    fn value(&self, tau: &ArrayView1<F>) -> F {
        let r = F::cast(5.).sqrt() * tau.dot(tau).sqrt();
        (F::one() + r + r * r / F::cast(3.)) * F::exp(-r)
    }
}

macro_rules! declare_corr_util_impls {
    ($corr:ident) => {
        paste! {
            impl fmt::Display for [<$corr Corr>] {
                fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                    write!(f, "{}", stringify!($corr))
                }
            }
        }
    };
}

declare_corr_util_impls!(SquaredExponential);
declare_corr_util_impls!(AbsoluteExponential);
declare_corr_util_impls!(Matern32);
declare_corr_util_impls!(Matern52);

/// A stationary covariance model
///
/// `C(s, t) = diag(amplitude) . R . diag(amplitude) * r((s - t) / scale)`
///
/// where `R` is the `(d, d)` correlation matrix between outputs (identity by default)
/// and `r` a [CorrelationFunction].
#[derive(Clone, Debug, PartialEq)]
pub struct StationaryCovariance<F: Float, Corr: CorrelationFunction<F>> {
    corr: Corr,
    scale: Array1<F>,
    amplitude: Array1<F>,
    output_correlation: Array2<F>,
    nugget_factor: F,
    active: Vec<usize>,
}

impl<F: Float, Corr: CorrelationFunction<F>> Default for StationaryCovariance<F, Corr> {
    fn default() -> Self {
        Self {
            corr: Corr::default(),
            scale: Array1::ones(1),
            amplitude: Array1::ones(1),
            output_correlation: Array2::eye(1),
            nugget_factor: F::zero(),
            active: vec![0, 1],
        }
    }
}

impl<F: Float, Corr: CorrelationFunction<F>> StationaryCovariance<F, Corr> {
    /// Constructor given a correlation kernel, a scale (spatial dimension) and an amplitude (output dimension).
    /// All parameters are active.
    pub fn new(corr: Corr, scale: Array1<F>, amplitude: Array1<F>) -> Result<Self> {
        if scale.is_empty() || amplitude.is_empty() {
            return Err(GlmError::InvalidValueError(
                "Scale and amplitude of a covariance model cannot be empty".to_string(),
            ));
        }
        check_positive("scale", &scale, scale.len())?;
        check_positive("amplitude", &amplitude, amplitude.len())?;
        let dim = amplitude.len();
        let n_params = scale.len() + dim;
        Ok(Self {
            corr,
            scale,
            amplitude,
            output_correlation: Array2::eye(dim),
            nugget_factor: F::zero(),
            active: (0..n_params).collect(),
        })
    }

    /// Set the correlation matrix between outputs.
    /// Should be a symmetric (d, d) matrix with a unit diagonal.
    pub fn with_output_correlation(mut self, correlation: Array2<F>) -> Result<Self> {
        let d = self.amplitude.len();
        if correlation.dim() != (d, d) {
            return Err(GlmError::dimension_mismatch(
                "output correlation",
                format!("({d}, {d})"),
                format!("{:?}", correlation.dim()),
            ));
        }
        let tol = F::cast(1e-12);
        for i in 0..d {
            if (correlation[[i, i]] - F::one()).abs() > tol {
                return Err(GlmError::InvalidValueError(
                    "Output correlation should have a unit diagonal".to_string(),
                ));
            }
            for j in 0..i {
                if (correlation[[i, j]] - correlation[[j, i]]).abs() > tol {
                    return Err(GlmError::InvalidValueError(
                        "Output correlation should be symmetric".to_string(),
                    ));
                }
            }
        }
        self.output_correlation = correlation;
        Ok(self)
    }

    /// Set the nugget factor, should be non negative
    pub fn with_nugget_factor(mut self, nugget_factor: F) -> Result<Self> {
        if nugget_factor < F::zero() {
            return Err(GlmError::InvalidValueError(format!(
                "Nugget factor should be non negative, got {nugget_factor}"
            )));
        }
        self.nugget_factor = nugget_factor;
        Ok(self)
    }

    /// Correlation kernel
    pub fn corr(&self) -> &Corr {
        &self.corr
    }

    /// Correlation matrix between outputs
    pub fn output_correlation(&self) -> &Array2<F> {
        &self.output_correlation
    }
}

impl<F: Float, Corr: CorrelationFunction<F>> CovarianceModel<F> for StationaryCovariance<F, Corr> {
    fn spatial_dim(&self) -> usize {
        self.scale.len()
    }

    fn dim(&self) -> usize {
        self.amplitude.len()
    }

    fn scale(&self) -> Array1<F> {
        self.scale.to_owned()
    }

    fn set_scale(&mut self, scale: &Array1<F>) -> Result<()> {
        check_positive("scale", scale, self.scale.len())?;
        self.scale.assign(scale);
        Ok(())
    }

    fn amplitude(&self) -> Array1<F> {
        self.amplitude.to_owned()
    }

    fn set_amplitude(&mut self, amplitude: &Array1<F>) -> Result<()> {
        check_positive("amplitude", amplitude, self.amplitude.len())?;
        self.amplitude.assign(amplitude);
        Ok(())
    }

    fn nugget_factor(&self) -> F {
        self.nugget_factor
    }

    fn active_parameter(&self) -> &[usize] {
        &self.active
    }

    fn set_active_parameter(&mut self, active: Vec<usize>) -> Result<()> {
        check_active_parameter(&active, self.scale.len() + self.amplitude.len())?;
        self.active = active;
        Ok(())
    }

    fn compute(&self, s: &ArrayView1<F>, t: &ArrayView1<F>) -> Array2<F> {
        let tau = (s - t) / &self.scale;
        let r = self.corr.value(&tau.view());
        let d = self.amplitude.len();
        Array2::from_shape_fn((d, d), |(k, l)| {
            self.amplitude[k] * self.output_correlation[[k, l]] * self.amplitude[l] * r
        })
    }
}

impl<F: Float, Corr: CorrelationFunction<F>> fmt::Display for StationaryCovariance<F, Corr> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}(scale={}, amplitude={}, nugget={})",
            self.corr, self.scale, self.amplitude, self.nugget_factor
        )
    }
}

/// Squared exponential covariance model shortcut
pub type SquaredExponentialModel<F> = StationaryCovariance<F, SquaredExponentialCorr>;
/// Absolute exponential covariance model shortcut
pub type AbsoluteExponentialModel<F> = StationaryCovariance<F, AbsoluteExponentialCorr>;
/// Matern 3/2 covariance model shortcut
pub type Matern32Model<F> = StationaryCovariance<F, Matern32Corr>;
/// Matern 5/2 covariance model shortcut
pub type Matern52Model<F> = StationaryCovariance<F, Matern52Corr>;
