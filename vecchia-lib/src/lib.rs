//! This library implements Vecchia approximations of Gaussian processes (GP),
//! optionally augmented with a low-rank inducing-point part (full-scale Vecchia, FSA).
//!
//! A Vecchia approximation orders the $n$ training points and conditions every
//! point only on (at most) $k$ earlier points, its neighbours $N(i)$.
//! This gives a sparse factorisation of the precision matrix
//!
//! $ \bm{\Sigma}^{-1} \approx \bm{B}^{\intercal}\bm{D}^{-1}\bm{B} $
//!
//! where $\bm{B}$ is unit lower triangular with row $i$ equal to $-A_{i}^{\intercal}$ on $N(i)$,
//! $A_{i} = \bm{C}_{N(i)N(i)}^{-1}\bm{C}_{N(i)i}$ and $\bm{D}$ is diagonal with the conditional variances.
//!
//! With inducing points the covariance is split as
//!
//! $ \bm{\Sigma} \approx \bm{\Sigma}_{cross}^{\intercal}\bm{\Sigma}_{ip}^{-1}\bm{\Sigma}_{cross} + \bm{R} $
//!
//! and only the residual $\bm{R}$ is Vecchia-approximated.
//!
//! # Implementation
//!
//! * Based of [Faer](https://github.com/sarah-ek/faer-rs) to provide linear algebra subroutines
//! * Neighbours by Euclidean distance or by the correlation of the residual process
//!   (cover tree index for large prefixes)
//! * Analytic gradients of $\bm{B}$ and $\bm{D}$ with respect to the covariance parameters and nugget
//! * Random coefficient GPs
//! * Prediction in observed-first, predicted-first and latent orderings
//! * Parallelised with [Rayon](https://github.com/rayon-rs/rayon)
//!
//! # Reference
//!
//! Vecchia, A. V. "Estimation and model identification for continuous spatial processes."
//! Journal of the Royal Statistical Society: Series B 50.2 (1988): 297-312.
//!
//! Katzfuss, M., Guinness, J. "A general framework for Vecchia approximations of Gaussian processes."
//! Statistical Science 36.1 (2021): 124-141.
//!
//! Gyger, T., Furrer, R., Sigrist, F. "Iterative methods for full-scale Gaussian process approximations
//! for large spatial data." arXiv:2405.14492 [stat.ML]
//!
//! Ra, S.-W., Kim, J.-K. "A fast mean-distance-ordered partial codebook search algorithm for image
//! vector quantization." IEEE Transactions on Circuits and Systems II 40.9 (1993): 576-579.
//!
//! Beygelzimer, A., Kakade, S., Langford, J. "Cover trees for nearest neighbor."
//! Proceedings of the 23rd international conference on Machine learning (2006).

#![warn(
    clippy::pedantic,
    clippy::suspicious,
    clippy::perf,
    clippy::complexity,
    clippy::style
)]
#![forbid(unsafe_code)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]

use faer_cholesky::llt::CholeskyError;
use thiserror::Error;

pub mod config;
pub mod coords;
pub mod cover_tree;
pub mod covariance;
pub mod distance;
pub mod factor;
pub mod inducing;
pub mod linalg;
pub mod model;
pub mod neighbors;
pub mod ordering;
pub mod predict;

#[cfg(test)]
mod test_utils;

pub use config::{
    GpApprox, Likelihood, NeighborSelection, PredictionMode, VecchiaConfig, VecchiaOrdering,
};
pub use coords::Coords;
pub use covariance::{CovFunction, Covariance, GradScale, Params};
pub use factor::{FactorOptions, ParamGradient, VecchiaFactors};
pub use linalg::SparseRows;
pub use model::{ConvergenceCallback, VecchiaModel};
pub use neighbors::Neighborhoods;
pub use predict::{PredictOptions, Prediction, PredictionFactors};

/// Below this distance two points are treated as duplicates
pub(crate) const EPSILON_NUMBERS: f64 = 1e-10;

#[derive(Debug, Error)]
/// Error in the Vecchia engine
pub enum VecchiaError {
    /// the input arrays have incompatible sizes
    #[error("mismatched inputs: {0}")]
    MismatchedInputs(String),
    /// cholesky decomposition failure
    #[error("Cholesky decomposition failed; the matrix is not positive definite")]
    Cholesky,
    /// a conditional variance of the Vecchia factor is not positive
    #[error("the Vecchia diagonal D[{index}] = {value} is not positive")]
    NonPositiveD { index: usize, value: f64 },
    /// duplicate coordinates where they cannot be handled
    #[error("duplicate coordinates: {0}")]
    DuplicateCoordinates(String),
    /// time based ordering without a space-time covariance function
    #[error("ordering '{0}' requires a space-time covariance function")]
    NotSpaceTime(String),
    /// a combination of options that is not implemented
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// invalid configuration value
    #[error("invalid configuration: {0}")]
    Config(String),
    /// configuration file could not be parsed
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
    /// configuration file could not be read
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<CholeskyError> for VecchiaError {
    fn from(_e: CholeskyError) -> VecchiaError {
        VecchiaError::Cholesky
    }
}
