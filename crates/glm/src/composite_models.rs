//! Covariance models built from other covariance models.
//!
//! * [ProductCovariance] multiplies scalar models each acting on a subset of the input components,
//! * [TensorizedCovariance] stacks models sharing the same inputs into a block diagonal multivariate model.

use crate::covariance_models::{check_active_parameter, check_positive, CovarianceModel};
use crate::errors::{GlmError, Result};
use linfa::Float;
use ndarray::{s, Array1, Array2, ArrayView1};
use std::fmt;
use std::marker::PhantomData;

/// A scalar covariance model defined as the product of scalar covariance models
/// each one acting on its own consecutive components of the locations.
///
/// The amplitude of the product is held by the product itself, factors amplitudes are set to 1.
/// The scale is the concatenation of the factors scales.
#[derive(Clone, Debug)]
pub struct ProductCovariance<F: Float, M: CovarianceModel<F>> {
    factors: Vec<M>,
    amplitude: F,
    nugget_factor: F,
    active: Vec<usize>,
    phantom: PhantomData<F>,
}

impl<F: Float, M: CovarianceModel<F>> ProductCovariance<F, M> {
    /// Constructor from scalar factors, the amplitude is the product of the factors amplitudes
    pub fn new(factors: Vec<M>) -> Result<Self> {
        if factors.is_empty() {
            return Err(GlmError::InvalidValueError(
                "Product covariance needs at least one factor".to_string(),
            ));
        }
        if let Some(f) = factors.iter().find(|f| f.dim() != 1) {
            return Err(GlmError::dimension_mismatch(
                "product covariance factor output",
                1,
                f.dim(),
            ));
        }
        let mut amplitude = F::one();
        let mut factors = factors;
        for f in factors.iter_mut() {
            amplitude *= f.amplitude()[0];
            f.set_amplitude(&Array1::ones(1))?;
        }
        let nugget_factor = factors[0].nugget_factor();
        let spatial_dim: usize = factors.iter().map(|f| f.spatial_dim()).sum();
        Ok(Self {
            factors,
            amplitude,
            nugget_factor,
            active: (0..spatial_dim + 1).collect(),
            phantom: PhantomData,
        })
    }

    /// Factors of the product
    pub fn factors(&self) -> &[M] {
        &self.factors
    }
}

impl<F: Float, M: CovarianceModel<F>> CovarianceModel<F> for ProductCovariance<F, M> {
    fn spatial_dim(&self) -> usize {
        self.factors.iter().map(|f| f.spatial_dim()).sum()
    }

    fn dim(&self) -> usize {
        1
    }

    fn scale(&self) -> Array1<F> {
        self.factors.iter().flat_map(|f| f.scale().to_vec()).collect()
    }

    fn set_scale(&mut self, scale: &Array1<F>) -> Result<()> {
        check_positive("scale", scale, self.spatial_dim())?;
        let mut offset = 0;
        for f in self.factors.iter_mut() {
            let n = f.spatial_dim();
            f.set_scale(&scale.slice(s![offset..offset + n]).to_owned())?;
            offset += n;
        }
        Ok(())
    }

    fn amplitude(&self) -> Array1<F> {
        Array1::from_elem(1, self.amplitude)
    }

    fn set_amplitude(&mut self, amplitude: &Array1<F>) -> Result<()> {
        check_positive("amplitude", amplitude, 1)?;
        self.amplitude = amplitude[0];
        Ok(())
    }

    fn nugget_factor(&self) -> F {
        self.nugget_factor
    }

    fn active_parameter(&self) -> &[usize] {
        &self.active
    }

    fn set_active_parameter(&mut self, active: Vec<usize>) -> Result<()> {
        check_active_parameter(&active, self.spatial_dim() + 1)?;
        self.active = active;
        Ok(())
    }

    fn compute(&self, s: &ArrayView1<F>, t: &ArrayView1<F>) -> Array2<F> {
        let mut offset = 0;
        let mut value = self.amplitude * self.amplitude;
        for f in self.factors.iter() {
            let n = f.spatial_dim();
            let c = f.compute(
                &s.slice(s![offset..offset + n]),
                &t.slice(s![offset..offset + n]),
            );
            value *= c[[0, 0]];
            offset += n;
        }
        Array2::from_elem((1, 1), value)
    }
}

impl<F: Float, M: CovarianceModel<F>> fmt::Display for ProductCovariance<F, M> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let factors: Vec<String> = self.factors.iter().map(|m| m.to_string()).collect();
        write!(
            f,
            "Product(amplitude={}, factors=[{}])",
            self.amplitude,
            factors.join(", ")
        )
    }
}

/// A multivariate covariance model made of independent models, one per output marginal.
///
/// All models share the same input dimension and the same scale, the amplitude is
/// the concatenation of the models amplitudes and the covariance is block diagonal.
#[derive(Clone, Debug)]
pub struct TensorizedCovariance<F: Float, M: CovarianceModel<F>> {
    models: Vec<M>,
    active: Vec<usize>,
    phantom: PhantomData<F>,
}

impl<F: Float, M: CovarianceModel<F>> TensorizedCovariance<F, M> {
    /// Constructor from models with the same spatial dimension, the scale of the first
    /// model is shared by all models.
    pub fn new(models: Vec<M>) -> Result<Self> {
        let first = models.first().ok_or_else(|| {
            GlmError::InvalidValueError(
                "Tensorized covariance needs at least one model".to_string(),
            )
        })?;
        let spatial_dim = first.spatial_dim();
        if let Some(m) = models.iter().find(|m| m.spatial_dim() != spatial_dim) {
            return Err(GlmError::dimension_mismatch(
                "tensorized covariance model input",
                spatial_dim,
                m.spatial_dim(),
            ));
        }
        let scale = first.scale();
        let mut models = models;
        for m in models.iter_mut() {
            m.set_scale(&scale)?;
        }
        let dim: usize = models.iter().map(|m| m.dim()).sum();
        Ok(Self {
            models,
            active: (0..spatial_dim + dim).collect(),
            phantom: PhantomData,
        })
    }

    /// Underlying models, one per block
    pub fn models(&self) -> &[M] {
        &self.models
    }
}

impl<F: Float, M: CovarianceModel<F>> CovarianceModel<F> for TensorizedCovariance<F, M> {
    fn spatial_dim(&self) -> usize {
        self.models[0].spatial_dim()
    }

    fn dim(&self) -> usize {
        self.models.iter().map(|m| m.dim()).sum()
    }

    fn scale(&self) -> Array1<F> {
        self.models[0].scale()
    }

    fn set_scale(&mut self, scale: &Array1<F>) -> Result<()> {
        check_positive("scale", scale, self.spatial_dim())?;
        for m in self.models.iter_mut() {
            m.set_scale(scale)?;
        }
        Ok(())
    }

    fn amplitude(&self) -> Array1<F> {
        self.models.iter().flat_map(|m| m.amplitude().to_vec()).collect()
    }

    fn set_amplitude(&mut self, amplitude: &Array1<F>) -> Result<()> {
        check_positive("amplitude", amplitude, self.dim())?;
        let mut offset = 0;
        for m in self.models.iter_mut() {
            let d = m.dim();
            m.set_amplitude(&amplitude.slice(s![offset..offset + d]).to_owned())?;
            offset += d;
        }
        Ok(())
    }

    fn nugget_factor(&self) -> F {
        self.models[0].nugget_factor()
    }

    fn active_parameter(&self) -> &[usize] {
        &self.active
    }

    fn set_active_parameter(&mut self, active: Vec<usize>) -> Result<()> {
        check_active_parameter(&active, self.spatial_dim() + self.dim())?;
        self.active = active;
        Ok(())
    }

    fn compute(&self, s: &ArrayView1<F>, t: &ArrayView1<F>) -> Array2<F> {
        let d = self.dim();
        let mut cov = Array2::zeros((d, d));
        let mut offset = 0;
        for m in self.models.iter() {
            let dm = m.dim();
            cov.slice_mut(s![offset..offset + dm, offset..offset + dm])
                .assign(&m.compute(s, t));
            offset += dm;
        }
        cov
    }
}

impl<F: Float, M: CovarianceModel<F>> fmt::Display for TensorizedCovariance<F, M> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let models: Vec<String> = self.models.iter().map(|m| m.to_string()).collect();
        write!(f, "Tensorized([{}])", models.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariance_models::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_product_covariance() {
        let f1 = SquaredExponentialModel::new(SquaredExponentialCorr(), array![1.0], array![2.0])
            .unwrap();
        let f2 = SquaredExponentialModel::new(SquaredExponentialCorr(), array![0.5], array![3.0])
            .unwrap();
        let mut product = ProductCovariance::new(vec![f1.clone(), f2.clone()]).unwrap();
        assert_eq!(product.spatial_dim(), 2);
        assert_eq!(product.dim(), 1);
        assert_eq!(product.amplitude(), array![6.0]);
        assert_eq!(product.full_parameter(), array![1.0, 0.5, 6.0]);

        let s = array![0.3, -0.2];
        let t = array![1.0, 0.4];
        // factors amplitudes 2 and 3 carry over to the product amplitude
        let expected = f1.compute(&s.slice(s![0..1]), &t.slice(s![0..1]))[[0, 0]]
            * f2.compute(&s.slice(s![1..2]), &t.slice(s![1..2]))[[0, 0]];
        assert_abs_diff_eq!(
            product.compute(&s.view(), &t.view())[[0, 0]],
            expected,
            epsilon = 1e-12
        );

        product.set_parameter(&array![2.0, 1.0, 1.0]).unwrap();
        assert_eq!(product.factors()[0].scale(), array![2.0]);
        assert_eq!(product.factors()[1].scale(), array![1.0]);
    }

    #[test]
    fn test_tensorized_covariance() {
        let m = Matern32Model::new(Matern32Corr(), array![1.0, 2.0], array![1.5]).unwrap();
        let mut tensorized = TensorizedCovariance::new(vec![m.clone(), m.clone(), m]).unwrap();
        assert_eq!(tensorized.spatial_dim(), 2);
        assert_eq!(tensorized.dim(), 3);
        assert_eq!(
            tensorized.full_parameter_description(),
            vec!["scale_0", "scale_1", "amplitude_0", "amplitude_1", "amplitude_2"]
        );

        tensorized
            .set_full_parameter(&array![0.5, 0.5, 1.0, 2.0, 3.0])
            .unwrap();
        let c = tensorized.compute(&array![0.0, 0.0].view(), &array![0.0, 0.0].view());
        assert_abs_diff_eq!(c, Array2::from_diag(&array![1.0, 4.0, 9.0]), epsilon = 1e-12);
        for model in tensorized.models() {
            assert_eq!(model.scale(), array![0.5, 0.5]);
        }
    }

    #[test]
    fn test_tensorized_mismatch() {
        let m1 = Matern32Model::new(Matern32Corr(), array![1.0, 2.0], array![1.5]).unwrap();
        let m2 = Matern32Model::new(Matern32Corr(), array![1.0], array![1.5]).unwrap();
        assert!(matches!(
            TensorizedCovariance::new(vec![m1, m2]),
            Err(GlmError::DimensionMismatch { .. })
        ));
    }
}
