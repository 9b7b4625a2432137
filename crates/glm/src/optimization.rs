use crate::errors::{GlmError, Result};
use linfa::Float;
use log::{debug, warn};
use ndarray::{Array1, Array2};
use ndarray_rand::rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256Plus;
use std::cell::RefCell;

/// Box constraints over the reduced covariance parameters
#[derive(Clone, Debug, PartialEq)]
pub struct OptimizationBounds<F: Float> {
    lower: Array1<F>,
    upper: Array1<F>,
}

impl<F: Float> OptimizationBounds<F> {
    /// Constructor, `lower[i] <= upper[i]` is required
    pub fn new(lower: Array1<F>, upper: Array1<F>) -> Result<Self> {
        if lower.len() != upper.len() {
            return Err(GlmError::dimension_mismatch(
                "upper bound",
                lower.len(),
                upper.len(),
            ));
        }
        if lower.iter().zip(upper.iter()).any(|(lo, up)| !(lo <= up)) {
            return Err(GlmError::InvalidValueError(format!(
                "Lower bound {lower} should be less than upper bound {upper}"
            )));
        }
        Ok(Self { lower, upper })
    }

    /// The same `[lower, upper]` interval for the `dim` parameters
    pub fn uniform(dim: usize, lower: F, upper: F) -> Self {
        Self {
            lower: Array1::from_elem(dim, lower),
            upper: Array1::from_elem(dim, upper),
        }
    }

    /// Number of bounded parameters
    pub fn dim(&self) -> usize {
        self.lower.len()
    }

    /// Lower bound
    pub fn lower(&self) -> &Array1<F> {
        &self.lower
    }

    /// Upper bound
    pub fn upper(&self) -> &Array1<F> {
        &self.upper
    }

    /// Bounds as `(lower, upper)` pairs
    pub fn to_pairs(&self) -> Vec<(f64, f64)> {
        self.lower
            .iter()
            .zip(self.upper.iter())
            .map(|(lo, up)| {
                (
                    lo.to_f64().unwrap_or(f64::NEG_INFINITY),
                    up.to_f64().unwrap_or(f64::INFINITY),
                )
            })
            .collect()
    }
}

/// Best point found by an [Optimizer]
#[derive(Clone, Debug, PartialEq)]
pub struct OptimizationOutcome {
    /// Optimal point
    pub x_opt: Vec<f64>,
    /// Objective value at `x_opt`
    pub f_opt: f64,
}

/// A bound constrained optimizer of a black-box objective
pub trait Optimizer: Send + Sync {
    /// Optimize `objective` from `start` within `bounds`, maximizing if `maximize` is set.
    /// The objective may be called any number of times, always serially.
    fn optimize(
        &self,
        objective: &mut dyn FnMut(&[f64]) -> f64,
        start: &[f64],
        bounds: &[(f64, f64)],
        maximize: bool,
    ) -> Result<OptimizationOutcome>;
}

/// Cobyla optimizer settings
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CobylaParams {
    /// Initial trust region radius
    pub rhobeg: f64,
    /// Relative tolerance on the objective value
    pub ftol_rel: f64,
    /// Maximum number of objective evaluations per start
    pub maxeval: usize,
}

impl Default for CobylaParams {
    fn default() -> Self {
        CobylaParams {
            rhobeg: 0.5,
            ftol_rel: 1e-4,
            maxeval: 200,
        }
    }
}

/// The default [Optimizer]: derivative-free COBYLA run from the given start
/// and from `n_start` additional random points within the bounds.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Cobyla {
    params: CobylaParams,
    n_start: usize,
    seed: Option<u64>,
}

impl Cobyla {
    /// Constructor
    pub fn new(params: CobylaParams, n_start: usize, seed: Option<u64>) -> Self {
        Cobyla {
            params,
            n_start,
            seed,
        }
    }

    /// Starting points: `start` then `n_start` uniform random points within bounds
    fn starting_points(&self, start: &[f64], bounds: &[(f64, f64)]) -> Array2<f64> {
        let mut starts = Array2::zeros((self.n_start + 1, start.len()));
        starts.row_mut(0).assign(&Array1::from(start.to_vec()));
        if self.n_start > 0 {
            let mut rng = match self.seed {
                Some(seed) => Xoshiro256Plus::seed_from_u64(seed),
                None => Xoshiro256Plus::from_entropy(),
            };
            for mut row in starts.rows_mut().into_iter().skip(1) {
                for (v, (lo, up)) in row.iter_mut().zip(bounds.iter()) {
                    *v = if lo < up { rng.gen_range(*lo..*up) } else { *lo };
                }
            }
        }
        starts
    }
}

impl Optimizer for Cobyla {
    fn optimize(
        &self,
        objective: &mut dyn FnMut(&[f64]) -> f64,
        start: &[f64],
        bounds: &[(f64, f64)],
        maximize: bool,
    ) -> Result<OptimizationOutcome> {
        use cobyla::{minimize, Func, StopTols};

        if start.len() != bounds.len() {
            return Err(GlmError::dimension_mismatch(
                "optimization bounds",
                start.len(),
                bounds.len(),
            ));
        }
        let sign = if maximize { -1. } else { 1. };
        let objective = RefCell::new(objective);
        let clamp = |x: &[f64]| -> Vec<f64> {
            x.iter()
                .zip(bounds.iter())
                .map(|(v, (lo, up))| v.max(*lo).min(*up))
                .collect()
        };
        let objfn = |x: &[f64], _u: &mut ()| -> f64 {
            let mut f = objective.borrow_mut();
            let value = sign * (*f)(&clamp(x));
            if f64::is_nan(value) {
                f64::INFINITY
            } else {
                value
            }
        };
        let cons: Vec<&dyn Func<()>> = vec![];

        let mut best: Option<(f64, Vec<f64>)> = None;
        for x0 in self.starting_points(start, bounds).rows() {
            let (fval, x_opt) = match minimize(
                objfn,
                &x0.to_vec(),
                bounds,
                &cons,
                (),
                self.params.maxeval,
                cobyla::RhoBeg::All(self.params.rhobeg),
                Some(StopTols {
                    ftol_rel: self.params.ftol_rel,
                    ..StopTols::default()
                }),
            ) {
                Ok((status, x_opt, fval)) => {
                    debug!("Cobyla status={status:?} f={fval}");
                    (fval, x_opt)
                }
                Err((status, x_opt, _)) => {
                    warn!("ERROR Cobyla optimizer status={status:?}");
                    (f64::INFINITY, x_opt)
                }
            };
            let fval = if f64::is_nan(fval) { f64::INFINITY } else { fval };
            if best.as_ref().map_or(true, |(f, _)| fval < *f) {
                best = Some((fval, x_opt));
            }
        }

        match best {
            Some((fval, x_opt)) if fval < f64::INFINITY => Ok(OptimizationOutcome {
                x_opt: clamp(&x_opt),
                f_opt: sign * fval,
            }),
            _ => Err(GlmError::OptimizationError(
                "Cobyla did not find any finite objective value".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_cobyla_maximize() {
        let optimizer = Cobyla::default();
        let mut count = 0;
        let mut objective = |x: &[f64]| {
            count += 1;
            -(x[0] - 1.).powi(2) - (x[1] + 0.5).powi(2)
        };
        let outcome = optimizer
            .optimize(&mut objective, &[0., 0.], &[(-2., 2.), (-2., 2.)], true)
            .unwrap();
        assert_abs_diff_eq!(outcome.x_opt[0], 1., epsilon = 1e-2);
        assert_abs_diff_eq!(outcome.x_opt[1], -0.5, epsilon = 1e-2);
        assert!(outcome.f_opt <= 0.);
        assert!(count > 0);
    }

    #[test]
    fn test_cobyla_bounds() {
        let optimizer = Cobyla::new(CobylaParams::default(), 3, Some(42));
        let mut objective = |x: &[f64]| x[0];
        let outcome = optimizer
            .optimize(&mut objective, &[0.5], &[(0.1, 1.)], false)
            .unwrap();
        assert_abs_diff_eq!(outcome.x_opt[0], 0.1, epsilon = 1e-3);
    }

    #[test]
    fn test_starting_points() {
        let optimizer = Cobyla::new(CobylaParams::default(), 4, Some(0));
        let starts = optimizer.starting_points(&[1., 2.], &[(0., 1.5), (2., 2.)]);
        assert_eq!(starts.nrows(), 5);
        assert_eq!(starts.row(0), array![1., 2.]);
        for row in starts.rows() {
            assert!(row[0] >= 0. && row[0] <= 1.5);
            assert_eq!(row[1], 2.);
        }
    }

    #[test]
    fn test_bounds() {
        assert!(OptimizationBounds::new(array![0., 1.], array![1.]).is_err());
        assert!(OptimizationBounds::new(array![2.], array![1.]).is_err());
        let bounds = OptimizationBounds::<f64>::uniform(2, 1e-2, 1e2);
        assert_eq!(bounds.to_pairs(), vec![(1e-2, 1e2), (1e-2, 1e2)]);
    }
}
