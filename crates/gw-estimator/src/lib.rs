//! # gw-estimator: WLS/Huber State Estimation
//!
//! Determines the most likely bus voltage profile from redundant,
//! noisy field measurements, then screens the residuals for bad data.
//!
//! - [`estimator`] - Gauss-Newton WLS and Huber M-estimation
//! - [`bad_data`] - chi-square and largest-normalized-residual tests,
//!   calibration suggestions
//!
//! ## Example
//!
//! ```no_run
//! use gw_estimator::{estimate, Algorithm};
//! # fn demo(network: &gw_core::Network, measurements: &[gw_core::Measurement]) -> anyhow::Result<()> {
//! let solution = estimate(network, measurements, Algorithm::Wls)?;
//! let report = gw_estimator::bad_data::detect(&solution, 0.95);
//! if report.global_suspect {
//!     println!("worst channel: {}", report.top_suspect().unwrap().key);
//! }
//! # Ok(())
//! # }
//! ```

pub mod bad_data;
mod error;
mod estimator;
mod model;

pub use bad_data::{BadDataReport, CalibrationSuggestion, Classification, ResidualSample};
pub use error::EstimatorError;
pub use estimator::{estimate, Algorithm, Residual, StateEstimate, StateEstimator};
