use crate::errors::{GlmError, Result};
use linfa::Float;
use log::warn;
use ndarray::{Array1, Array2, ArrayBase, Axis, Data, Ix2};

/// An affine transformation of input points `x -> (x - center) / scale`
/// applied before covariance and trend evaluations.
#[derive(Clone, Debug, PartialEq)]
pub struct InputTransformation<F: Float> {
    /// Subtracted center, typically the sample mean
    center: Array1<F>,
    /// Divisor, typically the sample standard deviation
    scale: Array1<F>,
}

impl<F: Float> InputTransformation<F> {
    /// Constructor given center and scale vectors of the input dimension.
    /// Scale values should be finite and non zero.
    pub fn new(center: Array1<F>, scale: Array1<F>) -> Result<Self> {
        if center.len() != scale.len() {
            return Err(GlmError::dimension_mismatch(
                "input transformation scale",
                center.len(),
                scale.len(),
            ));
        }
        if scale.iter().any(|v| *v == F::zero() || !v.is_finite()) {
            return Err(GlmError::InvalidValueError(format!(
                "Input transformation scale should be finite and non zero, got {scale}"
            )));
        }
        Ok(Self { center, scale })
    }

    /// Transformation centering and reducing the given (n, nx) sample.
    /// Components with a standard deviation below `epsilon` are only centered.
    pub fn from_sample(x: &ArrayBase<impl Data<Elem = F>, Ix2>, epsilon: F) -> Self {
        let center = x
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(x.ncols()));
        let mut scale = x.std_axis(Axis(0), F::one());
        scale.mapv_inplace(|v| if v > epsilon && v.is_finite() { v } else { F::one() });
        Self { center, scale }
    }

    /// Input dimension
    pub fn dim(&self) -> usize {
        self.center.len()
    }

    /// Center vector
    pub fn center(&self) -> &Array1<F> {
        &self.center
    }

    /// Scale vector
    pub fn scale(&self) -> &Array1<F> {
        &self.scale
    }

    /// Transform (n, nx) points
    pub fn apply(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array2<F>> {
        if x.ncols() != self.dim() {
            return Err(GlmError::dimension_mismatch(
                "points to transform",
                self.dim(),
                x.ncols(),
            ));
        }
        Ok((x - &self.center) / &self.scale)
    }
}

/// Warn when the output sample is not centered, returns whether it is
pub(crate) fn check_centered<F: Float>(
    y: &ArrayBase<impl Data<Elem = F>, Ix2>,
    mean_epsilon: F,
) -> bool {
    let mean = y
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(y.ncols()));
    let centered = mean.iter().all(|m| m.abs() < mean_epsilon);
    if !centered {
        warn!(
            "No trend basis while output sample is not centered (mean = {mean}), \
             consider adding a constant basis"
        );
    }
    centered
}

/// Key of a parameter vector for exact equality lookups, `-0.0` is identified with `0.0`
pub(crate) fn parameter_key<F: Float>(parameter: &[F]) -> Vec<u64> {
    parameter
        .iter()
        .map(|v| {
            let v = v.to_f64().unwrap_or(f64::NAN);
            if v == 0. { 0f64 } else { v }.to_bits()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_from_sample() {
        let x = array![[1., 2.], [3., 2.], [5., 2.]];
        let t = InputTransformation::from_sample(&x, 1e-12);
        assert_eq!(t.center(), &array![3., 2.]);
        assert_eq!(t.scale(), &array![2., 1.]);
        let xn = t.apply(&x).unwrap();
        assert_abs_diff_eq!(xn, array![[-1., 0.], [0., 0.], [1., 0.]]);
        assert!(t.apply(&array![[1., 2., 3.]]).is_err());
    }

    #[test]
    fn test_invalid_transformation() {
        assert!(InputTransformation::new(array![0., 1.], array![1.]).is_err());
        assert!(InputTransformation::new(array![0.], array![0.]).is_err());
    }

    #[test]
    fn test_check_centered() {
        assert!(check_centered(&array![[-1.], [1.]], 1e-12));
        assert!(!check_centered(&array![[1.], [2.]], 1e-12));
    }

    #[test]
    fn test_parameter_key() {
        assert_eq!(parameter_key(&[-0.0, 1.0]), parameter_key(&[0.0, 1.0]));
        assert_ne!(parameter_key(&[1.0]), parameter_key(&[1.0 + f64::EPSILON]));
    }
}
