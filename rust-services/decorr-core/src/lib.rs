//! Noise decorrelation for multi-material CT reconstruction.
//!
//! The noise covariance between material channels is estimated from the data
//! itself with a high-pass filter ([`estimate_cov`], [`cov_matrix`]); its
//! inverse square root ([`inverse_sqrt_matrix`]) whitens the channels, and
//! [`ChannelMixing`] applies it pixelwise inside the weighted data fidelity.

pub mod covariance;
pub mod data;
pub mod error;
pub mod logger;
pub mod operator;
pub mod whitening;

pub use covariance::{convolve2d_full, cov_matrix, cov_matrix_from_channels, estimate_cov};
pub use data::{load_channel_stack, load_covariance, AcquisitionGeometry, UniformPartition};
pub use error::{DecorrError, Result};
pub use operator::{weighted_l2_squared, ChannelMixing, LinearOperator};
pub use whitening::{inverse_sqrt_matrix, regularize};
