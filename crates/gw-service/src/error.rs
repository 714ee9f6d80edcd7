use gw_calib::CalibError;
use gw_estimator::EstimatorError;
use gw_rtca::RtcaError;

/// Errors surfaced by the engine facade.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("unknown grid '{0}'")]
    GridNotFound(String),

    #[error("power flow failed: {0}")]
    PowerFlow(#[source] anyhow::Error),

    #[error("power flow did not converge for grid '{0}'")]
    PowerFlowDiverged(String),

    #[error(transparent)]
    Estimator(#[from] EstimatorError),

    #[error(transparent)]
    Calibration(#[from] CalibError),

    #[error(transparent)]
    Rtca(#[from] RtcaError),
}
