use thiserror::Error;

/// Errors surfaced by the scheduler and its collaborators.
#[derive(Debug, Error)]
pub enum ClockError {
    /// The operation is not valid in the scheduler's current mode. No state was changed.
    #[error("cannot {operation}: {reason}")]
    StateConflict {
        operation: &'static str,
        reason: String,
    },

    /// A relay output could not be driven.
    #[error("relay hardware fault: {0}")]
    HardwareFault(String),

    /// The offset store could not be read or written.
    #[error("offset store fault: {0}")]
    PersistenceFault(String),

    #[error("invalid dial reading: {0}")]
    InvalidDialReading(String),
}

impl ClockError {
    pub fn conflict(operation: &'static str, reason: impl Into<String>) -> Self {
        ClockError::StateConflict {
            operation,
            reason: reason.into(),
        }
    }
}
