//! Error types for crabtest.

use std::io;
use thiserror::Error;

/// Result type for crabtest operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for crabtest operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// No serial port matching the board descriptor was found.
    #[error("Board not found on any serial port")]
    PortNotFound,

    /// The serial link dropped mid-session.
    #[error("Device disconnect: {0}")]
    Disconnect(String),

    /// A firmware-named test (or an analyzer verdict) failed.
    #[error("Test failed: {name}")]
    TestFailed {
        /// Name of the failed test, as reported over telemetry.
        name: String,
    },

    /// The device programmer exited abnormally or the device identifier
    /// was missing from its output.
    #[error("Programmer failure: {0}")]
    Programmer(String),

    /// The bootloader upload tool did not report a clean download.
    #[error("Upload failure: {0}")]
    Upload(String),

    /// A polling stage exceeded its configured deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The operator interrupted the run.
    #[error("Interrupted by operator")]
    Interrupted,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this failure may be resolved by re-discovering the device.
    ///
    /// Only link drops qualify; everything else is a hard stop for the
    /// orchestrator.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Disconnect(_) | Self::PortNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_is_retryable() {
        assert!(Error::Disconnect("unplugged".into()).is_retryable());
        assert!(Error::PortNotFound.is_retryable());
    }

    #[test]
    fn test_fatal_errors_are_not_retryable() {
        assert!(!Error::TestFailed { name: "GPIO".into() }.is_retryable());
        assert!(!Error::Programmer("exit 1".into()).is_retryable());
        assert!(!Error::Upload("no status".into()).is_retryable());
        assert!(!Error::Interrupted.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let e = Error::TestFailed { name: "ADC CH0".into() };
        assert_eq!(e.to_string(), "Test failed: ADC CH0");
    }
}
