//! A module for the trend term of the GLM: functional bases, design matrix and fitted trend.
//!
//! A basis collection holds one [TrendBasis] per output marginal. Built-in bases are the
//! usual small degree polynomials:
//! * constant,
//! * linear,
//! * quadratic,
//!
//! while [TrendBasis::Functions] wraps user given scalar functions.

use crate::errors::{GlmError, Result};
use crate::utils::InputTransformation;
use linfa::prelude::PredictInplace;
use linfa::Float;
use log::warn;
use ndarray::{concatenate, s, Array1, Array2, ArrayBase, ArrayView1, Axis, Data, Ix2, Zip};
use std::fmt;
use std::sync::Arc;

/// A scalar function of a point used as a basis element
pub type BasisFunction<F> = Arc<dyn Fn(&ArrayView1<F>) -> F + Send + Sync>;

/// A functional basis of the trend of one output marginal
#[derive(Clone)]
pub enum TrendBasis<F: Float> {
    /// regr(x) = [1]
    Constant,
    /// regr(x) = [1, x_1, ..., x_n]
    Linear,
    /// regr(x) = [1, { x_i }, { x_i * x_j, j >= i }]
    Quadratic,
    /// User given basis functions
    Functions(Vec<BasisFunction<F>>),
}

impl<F: Float> TrendBasis<F> {
    /// Basis made of the given functions
    pub fn from_functions<Fun>(functions: Vec<Fun>) -> Self
    where
        Fun: Fn(&ArrayView1<F>) -> F + Send + Sync + 'static,
    {
        TrendBasis::Functions(
            functions
                .into_iter()
                .map(|f| Arc::new(f) as BasisFunction<F>)
                .collect(),
        )
    }

    /// Number of basis elements for inputs of dimension `input_dim`
    pub fn size(&self, input_dim: usize) -> usize {
        match self {
            TrendBasis::Constant => 1,
            TrendBasis::Linear => 1 + input_dim,
            TrendBasis::Quadratic => 1 + input_dim + input_dim * (input_dim + 1) / 2,
            TrendBasis::Functions(functions) => functions.len(),
        }
    }

    /// Evaluate the basis on (n, nx) points, returns the (n, size) matrix of values
    pub fn value(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array2<F> {
        let ones = Array2::<F>::ones((x.nrows(), 1));
        match self {
            TrendBasis::Constant => ones,
            TrendBasis::Linear => concatenate![Axis(1), ones, x.view()],
            TrendBasis::Quadratic => {
                let mut res = concatenate![Axis(1), ones, x.view()];
                for k in 0..x.ncols() {
                    let part = x.slice(s![.., k..]).to_owned() * x.slice(s![.., k..k + 1]);
                    res = concatenate![Axis(1), res, part]
                }
                res
            }
            TrendBasis::Functions(functions) => {
                let mut res = Array2::zeros((x.nrows(), functions.len()));
                Zip::from(res.rows_mut())
                    .and(x.rows())
                    .par_for_each(|mut row, xi| {
                        for (v, f) in row.iter_mut().zip(functions.iter()) {
                            *v = f(&xi);
                        }
                    });
                res
            }
        }
    }
}

impl<F: Float> fmt::Debug for TrendBasis<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TrendBasis::Functions(functions) => write!(f, "Functions({})", functions.len()),
            _ => write!(f, "{self}"),
        }
    }
}

impl<F: Float> fmt::Display for TrendBasis<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TrendBasis::Constant => write!(f, "Constant"),
            TrendBasis::Linear => write!(f, "Linear"),
            TrendBasis::Quadratic => write!(f, "Quadratic"),
            TrendBasis::Functions(functions) => write!(f, "Functions[{}]", functions.len()),
        }
    }
}

/// The same basis for each of the `output_dim` output marginals
pub fn replicated_basis<F: Float>(basis: TrendBasis<F>, output_dim: usize) -> Vec<TrendBasis<F>> {
    vec![basis; output_dim]
}

/// Check a basis collection against the problem dimensions.
///
/// An empty collection, or one made of empty bases, means no trend. Otherwise it should hold
/// one basis per marginal and the total size cannot exceed the number of observations.
pub(crate) fn check_basis<F: Float>(
    basis: &[TrendBasis<F>],
    n_points: usize,
    input_dim: usize,
    output_dim: usize,
) -> Result<()> {
    if basis.is_empty() {
        return Ok(());
    }
    if basis.len() != output_dim {
        return Err(GlmError::dimension_mismatch(
            "basis collection",
            output_dim,
            basis.len(),
        ));
    }
    let total: usize = basis.iter().map(|b| b.size(input_dim)).sum();
    if total > n_points * output_dim {
        return Err(GlmError::InvalidValueError(format!(
            "Total basis size {total} exceeds the number of observations {}",
            n_points * output_dim
        )));
    }
    if total > 0 && output_dim > 1 && basis.iter().any(|b| b.size(input_dim) == 0) {
        warn!("Some output marginals have no trend basis");
    }
    Ok(())
}

/// Build the (n * d, total basis size) design matrix where row `i * d + k` holds
/// the values of the basis of marginal `k` at point `i` in the columns of that basis.
pub(crate) fn design_matrix<F: Float>(
    basis: &[TrendBasis<F>],
    x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    output_dim: usize,
) -> Array2<F> {
    let n = x.nrows();
    let sizes: Vec<usize> = basis.iter().map(|b| b.size(x.ncols())).collect();
    let total: usize = sizes.iter().sum();
    let mut design = Array2::zeros((n * output_dim, total));
    let mut offset = 0;
    for (k, (b, &size)) in basis.iter().zip(sizes.iter()).enumerate() {
        if size == 0 {
            continue;
        }
        let values = b.value(x);
        for i in 0..n {
            design
                .slice_mut(s![i * output_dim + k, offset..offset + size])
                .assign(&values.row(i));
        }
        offset += size;
    }
    design
}

/// The fitted trend: the basis of each marginal linearly combined with its coefficients,
/// composed with the input transformation if any.
#[derive(Clone, Debug)]
pub struct TrendFunction<F: Float> {
    basis: Vec<TrendBasis<F>>,
    coefficients: Vec<Array1<F>>,
    transformation: Option<InputTransformation<F>>,
    input_dim: usize,
    output_dim: usize,
}

impl<F: Float> TrendFunction<F> {
    pub(crate) fn new(
        basis: Vec<TrendBasis<F>>,
        beta: &Array1<F>,
        transformation: Option<InputTransformation<F>>,
        input_dim: usize,
        output_dim: usize,
    ) -> Self {
        let mut offset = 0;
        let coefficients = basis
            .iter()
            .map(|b| {
                let size = b.size(input_dim);
                let c = beta.slice(s![offset..offset + size]).to_owned();
                offset += size;
                c
            })
            .collect();
        Self {
            basis,
            coefficients,
            transformation,
            input_dim,
            output_dim,
        }
    }

    /// Trend coefficients per output marginal, empty when there is no basis
    pub fn coefficients(&self) -> &[Array1<F>] {
        &self.coefficients
    }

    /// Evaluate the trend at (n, nx) points, returns (n, d) values
    pub fn predict(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array2<F>> {
        if x.ncols() != self.input_dim {
            return Err(GlmError::dimension_mismatch(
                "prediction points",
                self.input_dim,
                x.ncols(),
            ));
        }
        let xt = match &self.transformation {
            Some(t) => t.apply(x)?,
            None => x.to_owned(),
        };
        let mut y = Array2::zeros((x.nrows(), self.output_dim));
        for (k, (b, c)) in self.basis.iter().zip(self.coefficients.iter()).enumerate() {
            if !c.is_empty() {
                y.column_mut(k).assign(&b.value(&xt).dot(c));
            }
        }
        Ok(y)
    }
}

impl<F, D> PredictInplace<ArrayBase<D, Ix2>, Array2<F>> for TrendFunction<F>
where
    F: Float,
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
                warn!("Trend evaluation failed: {err}");
                y.fill(F::nan());
            }
        }
    }

    fn default_target(&self, x: &ArrayBase<D, Ix2>) -> Array2<F> {
        Array2::zeros((x.nrows(), self.output_dim))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_quadratic() {
        let a = array![[1., 2., 3.], [3., 4., 5.]];
        let actual = TrendBasis::<f64>::Quadratic.value(&a);
        let expected = array![
            [1.0, 1.0, 2.0, 3.0, 1.0, 2.0, 3.0, 4.0, 6.0, 9.0],
            [1.0, 3.0, 4.0, 5.0, 9.0, 12.0, 15.0, 16.0, 20.0, 25.0]
        ];
        assert_abs_diff_eq!(expected, actual);
        assert_eq!(TrendBasis::<f64>::Quadratic.size(3), 10);
    }

    #[test]
    fn test_functions() {
        let sum: fn(&ArrayView1<f64>) -> f64 = |x| x.sum();
        let product: fn(&ArrayView1<f64>) -> f64 = |x| x[0] * x[1];
        let basis = TrendBasis::from_functions(vec![sum, product]);
        let actual = basis.value(&array![[1., 2.], [3., 4.]]);
        assert_abs_diff_eq!(actual, array![[3., 2.], [7., 12.]]);
    }

    #[test]
    fn test_design_matrix() {
        let x = array![[1.], [2.], [3.]];
        let basis = vec![TrendBasis::Linear, TrendBasis::Constant];
        let design = design_matrix(&basis, &x, 2);
        let expected = array![
            [1., 1., 0.],
            [0., 0., 1.],
            [1., 2., 0.],
            [0., 0., 1.],
            [1., 3., 0.],
            [0., 0., 1.]
        ];
        assert_abs_diff_eq!(design, expected);
    }

    #[test]
    fn test_check_basis() {
        let basis = replicated_basis(TrendBasis::<f64>::Constant, 2);
        assert!(check_basis(&basis, 3, 1, 2).is_ok());
        assert!(matches!(
            check_basis(&basis, 3, 1, 3),
            Err(GlmError::DimensionMismatch { .. })
        ));
        // empty bases stand for no trend
        let empty = vec![TrendBasis::<f64>::Functions(vec![])];
        assert!(check_basis(&empty, 3, 1, 1).is_ok());
        let empty_pair = replicated_basis(TrendBasis::<f64>::Functions(vec![]), 2);
        assert!(check_basis(&empty_pair, 3, 1, 2).is_ok());
        let trend = TrendFunction::new(empty, &Array1::zeros(0), None, 1, 1);
        assert_eq!(trend.predict(&array![[0.], [1.]]).unwrap(), Array2::zeros((2, 1)));
        assert!(check_basis(&[TrendBasis::<f64>::Quadratic], 2, 2, 1).is_err());
    }

    #[test]
    fn test_trend_function() {
        let basis = vec![TrendBasis::Linear];
        let trend = TrendFunction::new(basis, &array![1., 2.], None, 1, 1);
        let y = trend.predict(&array![[0.], [1.], [2.]]).unwrap();
        assert_abs_diff_eq!(y, array![[1.], [3.], [5.]]);
        assert_eq!(trend.coefficients(), &[array![1., 2.]]);
    }
}
