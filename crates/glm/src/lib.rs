//! This library implements the fitting of generalized linear models with a
//! [Gaussian Process](https://en.wikipedia.org/wiki/Gaussian_process) error term,
//! also known as universal [Kriging](https://en.wikipedia.org/wiki/Kriging).
//!
//! Given an input sample, a scalar or vector output sample, a parametric covariance model
//! and optionally a trend basis per output marginal, the covariance parameters and the trend
//! coefficients are estimated by maximizing the reduced log-likelihood of the sample.
//!
//! The covariance matrix of the sample is factorized either densely, or for large samples
//! as a hierarchical matrix whose off-diagonal blocks are low-rank approximations,
//! see [LinearAlgebra]. Both backends retry a failing factorization with a growing
//! regularization of the diagonal.
//!
//! The fitting is implemented by [GlmAlgorithm] parameterized by [GlmParams], it produces a
//! [GlmResult] giving the fitted trend, the fitted covariance model, residual diagnostics and
//! the [KrigingPredictor] of the model.
//!
//! The covariance model is given through the [CovarianceModel] trait, the crate provides
//! stationary models ([StationaryCovariance]) and their compositions ([ProductCovariance],
//! [TensorizedCovariance]). The optimizer is given through the [Optimizer] trait, the default
//! one being [Cobyla].
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
mod algorithm;
pub mod composite_models;
pub mod covariance_models;
mod dense;
mod errors;
mod factorization;
mod hmat;
mod likelihood;
mod optimization;
mod parameters;
mod reduction;
mod result;
pub mod trend;
mod utils;

pub use algorithm::*;
pub use composite_models::*;
pub use covariance_models::*;
pub use dense::DenseCholesky;
pub use errors::*;
pub use factorization::{log_max, log_min, CholeskyFactor, CovarianceFactor, LinearAlgebra};
pub use hmat::{HMatrix, HMatrixParameters};
pub use optimization::*;
pub use parameters::*;
pub use reduction::ReducedCovariance;
pub use result::*;
pub use trend::{replicated_basis, BasisFunction, TrendBasis, TrendFunction};
pub use utils::InputTransformation;
