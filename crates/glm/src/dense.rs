use crate::covariance_models::CovarianceModel;
use crate::errors::Result;
use crate::factorization::{CholeskyFactor, Regularization};
use linfa::Float;
use linfa_linalg::{cholesky::*, triangular::*};
use log::debug;
use ndarray::{Array1, Array2};

/// Lower triangular Cholesky factor of a dense covariance matrix
#[derive(Clone, Debug, PartialEq)]
pub struct DenseCholesky<F: Float> {
    l: Array2<F>,
}

impl<F: Float> DenseCholesky<F> {
    /// Discretize `model` on `points`, add `noise` variances of each point to its diagonal entries
    /// and compute the Cholesky factor, regularizing the diagonal on failure.
    pub(crate) fn factorize<M: CovarianceModel<F>>(
        model: &M,
        points: &Array2<F>,
        noise: Option<&Array1<F>>,
        regularization: &Regularization<F>,
    ) -> Result<(Self, F)> {
        let mut cov = model.discretize(points);
        if let Some(noise) = noise {
            add_noise(&mut cov, noise, model.dim());
        }
        debug!("Dense covariance matrix of size {}", cov.nrows());
        regularization.run(|cumulated_scaling, _| {
            let mut boosted = cov.to_owned();
            if cumulated_scaling > F::zero() {
                boosted
                    .diag_mut()
                    .mapv_inplace(|v| v + cumulated_scaling);
            }
            Ok(boosted.cholesky().ok().map(|l| DenseCholesky { l }))
        })
    }

    /// The lower triangular factor
    pub fn matrix(&self) -> &Array2<F> {
        &self.l
    }
}

/// Add `noise[i]` to the diagonal entries of the `dim` rows of point `i`
pub(crate) fn add_noise<F: Float>(cov: &mut Array2<F>, noise: &Array1<F>, dim: usize) {
    for (i, &nu) in noise.iter().enumerate() {
        for k in 0..dim {
            cov[[i * dim + k, i * dim + k]] += nu;
        }
    }
}

impl<F: Float> CholeskyFactor<F> for DenseCholesky<F> {
    fn size(&self) -> usize {
        self.l.nrows()
    }

    fn solve_lower(&self, b: &Array2<F>) -> Result<Array2<F>> {
        Ok(self.l.solve_triangular(b, UPLO::Lower)?)
    }

    fn solve_upper(&self, b: &Array2<F>) -> Result<Array2<F>> {
        Ok(self.l.t().solve_triangular(b, UPLO::Upper)?)
    }

    fn diagonal(&self) -> Array1<F> {
        self.l.diag().to_owned()
    }

    fn scale(&mut self, alpha: F) {
        self.l.mapv_inplace(|v| v * alpha);
    }
}
