//! # gw-service: Engine Facade
//!
//! Ties the estimator, calibration store, contingency engine and
//! telemetry generator together behind one service type, resolving
//! grids through a [`GridSource`] and solving load flow through the
//! collaborator-supplied [`gw_core::PowerFlow`] implementation.

mod catalog;
mod config;
mod error;
mod service;

pub use catalog::{GridCatalog, GridSource};
pub use config::ServiceConfig;
pub use error::ServiceError;
pub use service::{EstimationOutcome, EstimationService};
