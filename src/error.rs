//! Error types for the acquisition core.
//!
//! All recoverable conditions (dropped buffers, busy pipeline, ring lock-out
//! timeouts) are absorbed inside the controller loop with diagnostic logging;
//! only fatal device failures surface as state transitions. Client-facing
//! calls return `OctResult` instead of panicking.

use thiserror::Error;

use crate::messages::ScanState;

/// Convenience alias for results using the crate error type.
pub type OctResult<T> = std::result::Result<T, OctError>;

#[derive(Error, Debug)]
pub enum OctError {
    #[error("device error: {0}")]
    Device(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation not permitted in state {0:?}")]
    InvalidState(ScanState),

    #[error("processing pool has a job in flight")]
    PipelineBusy,

    #[error("configuration rejected while an acquisition is running")]
    AcquisitionActive,

    #[error("controller command queue is full")]
    ControlQueueFull,

    #[error("controller is not running")]
    ControllerStopped,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OctError::Device("camera open failed".to_string());
        assert_eq!(err.to_string(), "device error: camera open failed");
    }

    #[test]
    fn test_invalid_state_display() {
        let err = OctError::InvalidState(ScanState::Acquiring);
        assert!(err.to_string().contains("Acquiring"));
    }
}
