//! Error types for the capture subsystem.
//!
//! None of these are fatal. Errors from the watched operations themselves
//! never pass through here; they are returned to the caller untouched.

use opcap_common::DecodeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("offset {offset} is outside the {capacity}-byte mapping buffer")]
    OutOfRange { offset: usize, capacity: usize },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    #[error("mapping buffer is already open")]
    Busy,

    #[error("mapping buffer is not open")]
    NotOpen,

    #[error(transparent)]
    MalformedRecord(#[from] DecodeError),

    #[error("cannot resolve path of {what}: {source}")]
    PathUnresolved {
        what: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot snapshot mappings of pid {pid}: {reason}")]
    Snapshot { pid: u32, reason: String },
}

pub type Result<T, E = CaptureError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let err = CaptureError::OutOfRange {
            offset: 512,
            capacity: 512,
        };
        assert_eq!(
            err.to_string(),
            "offset 512 is outside the 512-byte mapping buffer"
        );
        assert_eq!(CaptureError::Busy.to_string(), "mapping buffer is already open");
    }

    #[test]
    fn decode_errors_convert() {
        let err: CaptureError = DecodeError::MalformedRecord {
            expected: 12,
            actual: 3,
        }
        .into();
        assert!(matches!(err, CaptureError::MalformedRecord(_)));
        assert!(err.to_string().contains("expected 12 bytes"));
    }
}
