//! # gw-rtca: Real-Time Contingency Analysis
//!
//! N-1/N-2 outage screening against thermal, voltage and angle-spread
//! limits, run as cancellable background jobs with streamed progress.
//!
//! - [`contingency`] - case enumeration in deterministic order
//! - [`scan`] - the blocking scan loop and security screening
//! - [`jobs`] - job registry, event channels, cancellation, retention

pub mod contingency;
pub mod jobs;
pub mod scan;

pub use contingency::{enumerate_n1, enumerate_n2, Contingency};
pub use jobs::{JobEvent, JobId, JobRegistry, JobSnapshot, JobStatus};
pub use scan::{
    run_scan, Limits, OutageRecord, ScanConfig, ScanCounts, ScanKind, ScanProgress, ScanResult,
    Severity, Violation,
};

/// Errors from the contingency engine.
#[derive(Debug, thiserror::Error)]
pub enum RtcaError {
    #[error("no such job {0}")]
    JobNotFound(JobId),

    #[error("scan cancelled")]
    Cancelled,
}
