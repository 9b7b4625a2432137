//! Cholesky factorizations of the discretized covariance used by the likelihood.
//!
//! Two backends share the [CholeskyFactor] contract: a dense one ([DenseCholesky]) and a
//! hierarchical one ([HMatrix]) approximating off-diagonal blocks by low-rank products.
//! Both are built with the same diagonal regularization retry strategy.

use crate::covariance_models::CovarianceModel;
use crate::dense::DenseCholesky;
use crate::errors::{GlmError, Result};
use crate::hmat::{HMatrix, HMatrixParameters};
use linfa::Float;
use linfa_linalg::{qr::*, svd::*};
use log::{debug, warn};
use ndarray::{Array1, Array2, Axis};

/// Logarithm of the smallest positive value, returned as the likelihood of degenerate cases
pub fn log_min<F: Float>() -> F {
    F::min_positive_value().ln()
}

/// Logarithm of the largest value, returned as the log-determinant of non positive factors
pub fn log_max<F: Float>() -> F {
    F::max_value().ln()
}

/// Linear algebra backend used to factorize the covariance matrix
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LinearAlgebra {
    /// Full matrix Cholesky factorization
    #[default]
    Dense,
    /// Hierarchical matrix with low-rank off-diagonal blocks
    Hierarchical,
}

/// A lower triangular factor `L` of a covariance matrix `C = L.Lt`, possibly up to a symmetric
/// permutation of its rows and columns.
pub trait CholeskyFactor<F: Float> {
    /// Number of rows of the factored matrix
    fn size(&self) -> usize;

    /// Solve `L.x = b` where `b` rows follow the covariance matrix ordering
    fn solve_lower(&self, b: &Array2<F>) -> Result<Array2<F>>;

    /// Solve `Lt.x = b`, the result rows follow the covariance matrix ordering
    fn solve_upper(&self, b: &Array2<F>) -> Result<Array2<F>>;

    /// Diagonal of `L`
    fn diagonal(&self) -> Array1<F>;

    /// In place multiplication of `L` by `alpha`
    fn scale(&mut self, alpha: F);
}

/// The factor computed by the selected [LinearAlgebra] backend
#[derive(Clone, Debug)]
pub enum CovarianceFactor<F: Float> {
    /// Dense lower triangular factor
    Dense(DenseCholesky<F>),
    /// Hierarchical factor
    Hierarchical(HMatrix<F>),
}

impl<F: Float> CholeskyFactor<F> for CovarianceFactor<F> {
    fn size(&self) -> usize {
        match self {
            CovarianceFactor::Dense(l) => l.size(),
            CovarianceFactor::Hierarchical(h) => h.size(),
        }
    }

    fn solve_lower(&self, b: &Array2<F>) -> Result<Array2<F>> {
        match self {
            CovarianceFactor::Dense(l) => l.solve_lower(b),
            CovarianceFactor::Hierarchical(h) => h.solve_lower(b),
        }
    }

    fn solve_upper(&self, b: &Array2<F>) -> Result<Array2<F>> {
        match self {
            CovarianceFactor::Dense(l) => l.solve_upper(b),
            CovarianceFactor::Hierarchical(h) => h.solve_upper(b),
        }
    }

    fn diagonal(&self) -> Array1<F> {
        match self {
            CovarianceFactor::Dense(l) => l.diagonal(),
            CovarianceFactor::Hierarchical(h) => h.diagonal(),
        }
    }

    fn scale(&mut self, alpha: F) {
        match self {
            CovarianceFactor::Dense(l) => l.scale(alpha),
            CovarianceFactor::Hierarchical(h) => h.scale(alpha),
        }
    }
}

/// Diagonal regularization strategy applied when a factorization fails:
/// `scaling` is added to the diagonal then doubled until the cumulated amount
/// reaches `maximal_scaling`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Regularization<F: Float> {
    pub starting_scaling: F,
    pub maximal_scaling: F,
}

impl<F: Float> Regularization<F> {
    /// Run `attempt` with the cumulated diagonal boost and the retry index until it succeeds.
    /// `attempt` returns `Ok(None)` when the factorization failed and should be retried.
    ///
    /// Returns the successful outcome with the cumulated boost used to get it.
    pub fn run<T>(&self, mut attempt: impl FnMut(F, usize) -> Result<Option<T>>) -> Result<(T, F)> {
        let mut cumulated_scaling = F::zero();
        let mut scaling = self.starting_scaling;
        let mut retry = 0;
        loop {
            if let Some(outcome) = attempt(cumulated_scaling, retry)? {
                if cumulated_scaling > F::zero() {
                    warn!(
                        "Covariance matrix factorized after adding {cumulated_scaling} to its diagonal"
                    );
                }
                return Ok((outcome, cumulated_scaling));
            }
            if cumulated_scaling >= self.maximal_scaling {
                return Err(GlmError::NumericalInstability {
                    cumulated_scaling: cumulated_scaling.to_f64().unwrap_or(f64::NAN),
                });
            }
            cumulated_scaling += scaling;
            scaling *= F::cast(2.);
            retry += 1;
            debug!("Factorization failed, retry with diagonal boost {cumulated_scaling}");
        }
    }
}

/// Input of a factorization: points, per point noise variances and backend settings
pub(crate) struct FactorizationInput<'a, F: Float> {
    pub points: &'a Array2<F>,
    pub noise: Option<&'a Array1<F>>,
    pub linear_algebra: LinearAlgebra,
    pub hmat: &'a HMatrixParameters,
    pub regularization: Regularization<F>,
}

/// Factorize the covariance of `model` discretized on the input points with the selected backend.
/// Returns the factor and the cumulated diagonal boost used.
pub(crate) fn factorize<F: Float, M: CovarianceModel<F>>(
    model: &M,
    input: &FactorizationInput<F>,
) -> Result<(CovarianceFactor<F>, F)> {
    match input.linear_algebra {
        LinearAlgebra::Dense => {
            let (l, scaling) =
                DenseCholesky::factorize(model, input.points, input.noise, &input.regularization)?;
            Ok((CovarianceFactor::Dense(l), scaling))
        }
        LinearAlgebra::Hierarchical => {
            let (h, scaling) = HMatrix::factorize(
                model,
                input.points,
                input.noise,
                input.hmat,
                &input.regularization,
            )?;
            Ok((CovarianceFactor::Hierarchical(h), scaling))
        }
    }
}

/// Observations projected with the factor
#[derive(Clone, Debug)]
pub(crate) struct Whitening<F: Float> {
    /// Residual `L^-1.(y - F.beta)`
    pub rho: Array1<F>,
    /// Generalized least squares trend coefficients
    pub beta: Array1<F>,
    /// `log(det(C))` or the [log_max] sentinel
    pub log_determinant: F,
}

/// Solve `L.rho = y`, and when a basis exists `L.phi = F` then `phi.beta ~ rho` in the
/// least squares sense with `rho -= phi.beta`.
pub(crate) fn whiten<F: Float, L: CholeskyFactor<F>>(
    factor: &L,
    y: &Array1<F>,
    design: &Array2<F>,
) -> Result<Whitening<F>> {
    let rho = factor.solve_lower(&y.to_owned().insert_axis(Axis(1)))?;
    let (rho, beta) = if design.ncols() > 0 {
        let phi = factor.solve_lower(design)?;
        let beta = least_squares(&phi, &rho)?;
        let rho = rho - phi.dot(&beta);
        (rho.column(0).to_owned(), beta.column(0).to_owned())
    } else {
        (rho.column(0).to_owned(), Array1::zeros(0))
    };
    let log_determinant = log_determinant(&factor.diagonal());
    debug!("log_determinant = {log_determinant}");
    Ok(Whitening {
        rho,
        beta,
        log_determinant,
    })
}

/// Thin SVD `m = u.diag(sv).vt`
pub(crate) fn full_svd<F: Float>(m: &Array2<F>) -> Result<(Array2<F>, Array1<F>, Array2<F>)> {
    let (u, sv, vt) = m.svd(true, true)?;
    match (u, vt) {
        (Some(u), Some(vt)) => Ok((u, sv, vt)),
        _ => Err(GlmError::InvalidValueError(
            "SVD did not return singular vectors".to_string(),
        )),
    }
}

/// Minimum norm least squares solution of `a.x ~ b`.
///
/// Singular values of `a` below `sqrt(epsilon)` times the largest one are discarded
/// so that a rank deficient basis gives bounded coefficients.
pub(crate) fn least_squares<F: Float>(a: &Array2<F>, b: &Array2<F>) -> Result<Array2<F>> {
    let (u, sv, vt) = if a.nrows() >= a.ncols() {
        let (q, r) = a.qr()?.into_decomp();
        let (w, sv, vt) = full_svd(&r)?;
        (q.dot(&w), sv, vt)
    } else {
        full_svd(a)?
    };
    let threshold = sv.fold(F::zero(), |acc, &s| acc.max(s)) * F::epsilon().sqrt();
    let mut x = Array2::zeros((a.ncols(), b.ncols()));
    for (k, &s) in sv.iter().enumerate() {
        if s > threshold {
            let coefficients = u.column(k).dot(b).mapv(|c| c / s);
            x += &vt
                .row(k)
                .insert_axis(Axis(1))
                .dot(&coefficients.insert_axis(Axis(0)));
        }
    }
    let rank = sv.iter().filter(|&&s| s > threshold).count();
    if rank < a.ncols() {
        debug!("Rank deficient trend basis: rank {rank} < {}", a.ncols());
    }
    Ok(x)
}

/// `2.sum(log(L_ii))`, or the [log_max] sentinel when a diagonal value is not positive
pub(crate) fn log_determinant<F: Float>(diagonal: &Array1<F>) -> F {
    let mut log_det = F::zero();
    for &lii in diagonal.iter() {
        if lii <= F::zero() {
            return log_max();
        }
        log_det += lii.ln();
    }
    F::cast(2.) * log_det
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_sentinels() {
        assert!(log_min::<f64>() < -700.);
        assert!(log_max::<f64>() > 700.);
        assert_eq!(log_determinant(&array![1.0, -1.0]), log_max::<f64>());
        assert_abs_diff_eq!(log_determinant(&array![2.0, 3.0]), 2. * 6f64.ln());
    }

    /// Identity factor of the given size
    struct Identity(usize);

    impl CholeskyFactor<f64> for Identity {
        fn size(&self) -> usize {
            self.0
        }
        fn solve_lower(&self, b: &Array2<f64>) -> Result<Array2<f64>> {
            Ok(b.to_owned())
        }
        fn solve_upper(&self, b: &Array2<f64>) -> Result<Array2<f64>> {
            Ok(b.to_owned())
        }
        fn diagonal(&self) -> Array1<f64> {
            Array1::ones(self.0)
        }
        fn scale(&mut self, _alpha: f64) {}
    }

    #[test]
    fn test_whiten() {
        let y = array![1., 2., 4., 3.];
        let design = array![[1., 0.], [1., 1.], [1., 2.], [1., 3.]];
        let w = whiten(&Identity(4), &y, &design).unwrap();
        assert_abs_diff_eq!(w.beta, array![1.3, 0.8], epsilon = 1e-12);
        assert_abs_diff_eq!(design.t().dot(&w.rho), array![0., 0.], epsilon = 1e-12);
        assert_eq!(w.log_determinant, 0.);
    }

    #[test]
    fn test_whiten_collinear_basis() {
        // second column is 5 times the first one
        let y = array![1., 2., 3., 4.];
        let design = array![[1., 5.], [1., 5.], [1., 5.], [1., 5.]];
        let w = whiten(&Identity(4), &y, &design).unwrap();
        // minimum norm solution of beta_0 + 5 beta_1 = mean(y)
        assert_abs_diff_eq!(w.beta, array![2.5 / 26., 12.5 / 26.], epsilon = 1e-10);
        assert_abs_diff_eq!(w.rho, array![-1.5, -0.5, 0.5, 1.5], epsilon = 1e-10);
    }

    #[test]
    fn test_least_squares_wide() {
        // fewer equations than unknowns
        let a = array![[1., 1., 0.]];
        let x = least_squares(&a, &array![[2.]]).unwrap();
        assert_abs_diff_eq!(x, array![[1.], [1.], [0.]], epsilon = 1e-10);
    }

    #[test]
    fn test_regularization_ladder() {
        let ladder = Regularization {
            starting_scaling: 1e-13,
            maximal_scaling: 1e5,
        };
        let mut attempts = 0;
        let res: Result<((), f64)> = ladder.run(|_, _| {
            attempts += 1;
            Ok(None)
        });
        match res {
            Err(GlmError::NumericalInstability { cumulated_scaling }) => {
                assert!(cumulated_scaling >= 1e5);
            }
            _ => panic!("numerical instability expected"),
        }
        // 1e-13 * (2^k - 1) >= 1e5 from k = 60
        assert_eq!(attempts, 61);

        let (retry, scaling) = ladder
            .run(|cumulated, retry| Ok((cumulated >= 1e-3).then_some(retry)))
            .unwrap();
        assert!(scaling >= 1e-3);
        assert!(retry > 0);
    }
}
