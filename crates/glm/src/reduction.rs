//! Adaptation of a covariance model to the dimensions of a fitting problem
//! and reduction of its active parameters before likelihood maximization.

use crate::composite_models::{ProductCovariance, TensorizedCovariance};
use crate::covariance_models::{CovarianceModel, FIRST_AMPLITUDE};
use crate::errors::{GlmError, Result};
use linfa::Float;
use log::info;
use ndarray::{Array1, Array2, ArrayView1};
use std::fmt;

/// The covariance model shapes the fitting engine can work with.
///
/// The shape is selected once from the model and problem dimensions by [ReducedCovariance::adapt].
#[derive(Clone, Debug)]
pub enum ReducedCovariance<F: Float, M: CovarianceModel<F>> {
    /// Model matching the problem dimensions
    AsIs(M),
    /// Product of scalar 1D models, one per input component
    Product(ProductCovariance<F, M>),
    /// Tensorization of scalar models, one per output marginal
    Tensorized(TensorizedCovariance<F, M>),
    /// Tensorization of products of scalar 1D models
    TensorizedProduct(TensorizedCovariance<F, ProductCovariance<F, M>>),
}

macro_rules! dispatch {
    ($self:ident, $m:ident => $e:expr) => {
        match $self {
            ReducedCovariance::AsIs($m) => $e,
            ReducedCovariance::Product($m) => $e,
            ReducedCovariance::Tensorized($m) => $e,
            ReducedCovariance::TensorizedProduct($m) => $e,
        }
    };
}

impl<F: Float, M: CovarianceModel<F>> ReducedCovariance<F, M> {
    /// Adapt `model` to a problem with inputs of dimension `input_dim` and outputs of dimension `output_dim`.
    ///
    /// # Errors
    ///
    /// [GlmError::DimensionMismatch] when the model cannot be adapted to the problem dimensions.
    pub fn adapt(model: &M, input_dim: usize, output_dim: usize) -> Result<Self> {
        let spatial_dim = model.spatial_dim();
        let dim = model.dim();
        if spatial_dim == input_dim && dim == output_dim {
            Ok(ReducedCovariance::AsIs(model.clone()))
        } else if spatial_dim == 1 && dim == 1 && output_dim == 1 {
            info!("Build a product of {input_dim} copies of the covariance model");
            Ok(ReducedCovariance::Product(ProductCovariance::new(vec![
                model.clone();
                input_dim
            ])?))
        } else if spatial_dim == input_dim && dim == 1 {
            info!("Build a tensorization of {output_dim} copies of the covariance model");
            Ok(ReducedCovariance::Tensorized(TensorizedCovariance::new(
                vec![model.clone(); output_dim],
            )?))
        } else if spatial_dim == 1 && dim == 1 {
            info!(
                "Build a tensorization of {output_dim} products of {input_dim} copies of the covariance model"
            );
            let product = ProductCovariance::new(vec![model.clone(); input_dim])?;
            Ok(ReducedCovariance::TensorizedProduct(
                TensorizedCovariance::new(vec![product; output_dim])?,
            ))
        } else {
            Err(GlmError::dimension_mismatch(
                "covariance model (input dimension, output dimension)",
                format!(
                    "({input_dim}, {output_dim}) or (1, 1) or ({input_dim}, 1) or (1, {output_dim})"
                ),
                format!("({spatial_dim}, {dim})"),
            ))
        }
    }

    /// Reduced working copy of the model used by the likelihood.
    ///
    /// When `optimize` is false no parameter is active. Otherwise, if `analytical_amplitude` is
    /// enabled and the model is scalar with an active `amplitude_0`, that parameter is removed from
    /// the active set and the amplitude fixed to 1.
    ///
    /// Returns the reduced model and whether the amplitude is estimated analytically.
    pub fn reduce(&self, optimize: bool, analytical_amplitude: bool) -> Result<(Self, bool)> {
        let mut reduced = self.clone();
        if !optimize {
            reduced.set_active_parameter(vec![])?;
            return Ok((reduced, false));
        }
        if !analytical_amplitude || reduced.dim() != 1 {
            return Ok((reduced, false));
        }
        let description = reduced.full_parameter_description();
        let amplitude_index = description.iter().position(|d| d == FIRST_AMPLITUDE);
        match amplitude_index {
            Some(index) if reduced.active_parameter().contains(&index) => {
                let active: Vec<usize> = reduced
                    .active_parameter()
                    .iter()
                    .copied()
                    .filter(|&i| i != index)
                    .collect();
                reduced.set_active_parameter(active)?;
                reduced.set_amplitude(&Array1::ones(1))?;
                info!("Amplitude is estimated analytically");
                Ok((reduced, true))
            }
            _ => Ok((reduced, false)),
        }
    }
}

impl<F: Float, M: CovarianceModel<F>> CovarianceModel<F> for ReducedCovariance<F, M> {
    fn spatial_dim(&self) -> usize {
        dispatch!(self, m => m.spatial_dim())
    }

    fn dim(&self) -> usize {
        dispatch!(self, m => m.dim())
    }

    fn scale(&self) -> Array1<F> {
        dispatch!(self, m => m.scale())
    }

    fn set_scale(&mut self, scale: &Array1<F>) -> Result<()> {
        dispatch!(self, m => m.set_scale(scale))
    }

    fn amplitude(&self) -> Array1<F> {
        dispatch!(self, m => m.amplitude())
    }

    fn set_amplitude(&mut self, amplitude: &Array1<F>) -> Result<()> {
        dispatch!(self, m => m.set_amplitude(amplitude))
    }

    fn nugget_factor(&self) -> F {
        dispatch!(self, m => m.nugget_factor())
    }

    fn active_parameter(&self) -> &[usize] {
        dispatch!(self, m => m.active_parameter())
    }

    fn set_active_parameter(&mut self, active: Vec<usize>) -> Result<()> {
        dispatch!(self, m => m.set_active_parameter(active))
    }

    fn compute(&self, s: &ArrayView1<F>, t: &ArrayView1<F>) -> Array2<F> {
        dispatch!(self, m => m.compute(s, t))
    }

    fn full_parameter_description(&self) -> Vec<String> {
        dispatch!(self, m => m.full_parameter_description())
    }
}

impl<F: Float, M: CovarianceModel<F>> fmt::Display for ReducedCovariance<F, M> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        dispatch!(self, m => write!(f, "{m}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariance_models::*;
    use ndarray::array;

    fn scalar_1d() -> SquaredExponentialModel<f64> {
        SquaredExponentialModel::new(SquaredExponentialCorr(), array![1.0], array![1.0]).unwrap()
    }

    #[test]
    fn test_as_is() {
        let model =
            Matern52Model::new(Matern52Corr(), array![1.0, 1.0, 1.0], array![1.0]).unwrap();
        let reduced = ReducedCovariance::adapt(&model, 3, 1).unwrap();
        assert!(matches!(reduced, ReducedCovariance::AsIs(_)));
        assert_eq!((reduced.spatial_dim(), reduced.dim()), (3, 1));
    }

    #[test]
    fn test_product() {
        let reduced = ReducedCovariance::adapt(&scalar_1d(), 4, 1).unwrap();
        assert!(matches!(reduced, ReducedCovariance::Product(_)));
        assert_eq!((reduced.spatial_dim(), reduced.dim()), (4, 1));
        assert_eq!(reduced.full_parameter().len(), 5);
    }

    #[test]
    fn test_tensorized() {
        let model =
            Matern32Model::new(Matern32Corr(), array![1.0, 1.0], array![1.0]).unwrap();
        let reduced = ReducedCovariance::adapt(&model, 2, 3).unwrap();
        assert!(matches!(reduced, ReducedCovariance::Tensorized(_)));
        assert_eq!((reduced.spatial_dim(), reduced.dim()), (2, 3));
    }

    #[test]
    fn test_tensorized_product() {
        let reduced = ReducedCovariance::adapt(&scalar_1d(), 3, 2).unwrap();
        assert!(matches!(reduced, ReducedCovariance::TensorizedProduct(_)));
        assert_eq!((reduced.spatial_dim(), reduced.dim()), (3, 2));
        assert_eq!(
            reduced.full_parameter_description(),
            vec!["scale_0", "scale_1", "scale_2", "amplitude_0", "amplitude_1"]
        );
    }

    #[test]
    fn test_mismatch() {
        let model =
            Matern32Model::new(Matern32Corr(), array![1.0, 1.0], array![1.0, 1.0]).unwrap();
        match ReducedCovariance::adapt(&model, 3, 1) {
            Err(GlmError::DimensionMismatch {
                expected, actual, ..
            }) => {
                assert!(expected.contains("(3, 1)"));
                assert_eq!(actual, "(2, 2)");
            }
            _ => panic!("dimension mismatch expected"),
        }
    }

    #[test]
    fn test_reduce() {
        let reduced = ReducedCovariance::adapt(&scalar_1d(), 2, 1).unwrap();
        let mut full = reduced.clone();
        full.set_amplitude(&array![3.0]).unwrap();

        let (r, analytical) = full.reduce(true, true).unwrap();
        assert!(analytical);
        assert_eq!(r.active_parameter(), &[0, 1]);
        assert_eq!(r.amplitude(), array![1.0]);

        let (r, analytical) = full.reduce(true, false).unwrap();
        assert!(!analytical);
        assert_eq!(r.parameter().len(), 3);

        let (r, analytical) = full.reduce(false, true).unwrap();
        assert!(!analytical);
        assert!(r.parameter().is_empty());
    }

    #[test]
    fn test_reduce_multivariate() {
        let reduced = ReducedCovariance::adapt(&scalar_1d(), 1, 2).unwrap();
        let (r, analytical) = reduced.reduce(true, true).unwrap();
        assert!(!analytical);
        assert_eq!(r.parameter().len(), 3);
    }
}
