//! Error types shared by every stage of a measurement campaign.
//!
//! Variants are grouped by how far a failure propagates:
//!
//! - `FrequencyOutOfRange` ends the remaining sweep steps of one measurement.
//! - `Instrument`, `ResolutionUnattainable`, `UnitMismatch` and
//!   `InvalidMeasurement` end one measurement.
//! - `BufferAllocation`, `SpectrometerStartup` and `ExternalProcess` end one
//!   capture step; the session is torn down and the error is handed on to the
//!   measurement-level handler.

use std::process::ExitStatus;

use thiserror::Error;

use crate::units::{Dimension, Unit};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Spectrum analyser reported error {code}: {message}")]
    Instrument { code: i32, message: String },

    #[error("Requested value outside of the analyser's valid range: {0}")]
    FrequencyOutOfRange(String),

    #[error("Resolution requires an FFT length of {required} points, maximum is {max}")]
    ResolutionUnattainable { required: u64, max: u64 },

    #[error("Expected a {expected} quantity, got unit '{found}'")]
    UnitMismatch { expected: Dimension, found: Unit },

    #[error("Unknown unit '{0}'")]
    UnknownUnit(String),

    #[error("Invalid measurement '{tag}': {reason}")]
    InvalidMeasurement { tag: String, reason: String },

    #[error("Could not parse reply '{reply}' to query '{query}'")]
    Reply { query: String, reply: String },

    #[error("Ring buffer allocation failed: {0}")]
    BufferAllocation(Box<Error>),

    #[error("Spectrometer exited before becoming ready ({status})")]
    SpectrometerStartup { status: String },

    #[error("Command: '{command}' failed ({status})\nstdout: {stdout}\nstderr: {stderr}")]
    ExternalProcess {
        command: String,
        status: String,
        stdout: String,
        stderr: String,
    },

    #[error("Capture session is in state {state:?}, cannot {operation}")]
    SessionState {
        state: crate::capture::SessionState,
        operation: &'static str,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Metadata serialization error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("Cannot install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build an `ExternalProcess` error from a finished command
    pub fn external(command: &str, status: ExitStatus, stdout: &[u8], stderr: &[u8]) -> Self {
        Error::ExternalProcess {
            command: command.to_owned(),
            status: status.to_string(),
            stdout: String::from_utf8_lossy(stdout).trim_end().to_owned(),
            stderr: String::from_utf8_lossy(stderr).trim_end().to_owned(),
        }
    }

    /// True when the remaining steps of the current sweep should be skipped
    /// rather than failing the whole measurement.
    pub fn is_out_of_range(&self) -> bool {
        matches!(self, Error::FrequencyOutOfRange(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instrument_display() {
        let err = Error::Instrument {
            code: -113,
            message: "\"Undefined header\"".to_owned(),
        };
        assert_eq!(
            err.to_string(),
            "Spectrum analyser reported error -113: \"Undefined header\""
        );
    }

    #[test]
    fn test_out_of_range_classification() {
        assert!(Error::FrequencyOutOfRange("-222".into()).is_out_of_range());
        assert!(!Error::Instrument {
            code: -100,
            message: String::new()
        }
        .is_out_of_range());
    }

    #[test]
    fn test_buffer_allocation_wraps_process_failure() {
        let inner = Error::ExternalProcess {
            command: "dada_db -k dada".into(),
            status: "exit status: 1".into(),
            stdout: String::new(),
            stderr: "could not create shared memory".into(),
        };
        let err = Error::BufferAllocation(Box::new(inner));
        assert!(err.to_string().contains("could not create shared memory"));
    }
}
