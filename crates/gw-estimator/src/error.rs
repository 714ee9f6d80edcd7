use crate::StateEstimate;

/// Errors from state estimation.
#[derive(Debug, thiserror::Error)]
pub enum EstimatorError {
    /// The measurement set references unknown elements, unsupported
    /// quantities, or carries non-positive standard deviations.
    #[error("invalid measurement set: {0}")]
    Validation(String),

    /// Too few or too poorly placed measurements to determine the state.
    #[error("network not observable: {detail}")]
    Observability { detail: String },

    /// Gauss-Newton ran out of iterations. The partial estimate is
    /// attached so callers can still inspect residuals.
    #[error("estimation did not converge after {iterations} iterations (max |dx| = {max_delta:.3e})")]
    Convergence {
        iterations: usize,
        max_delta: f64,
        estimate: Box<StateEstimate>,
    },
}
