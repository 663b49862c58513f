//! Error types for rendezvous-worker.
//!
//! Every failure a call can end with is a [`WorkerError`]. Errors travel back
//! to the caller as a [`StatusCode`] plus message; see
//! [`WorkerError::status_code`].

use thiserror::Error;

/// Wire status codes, numbered like gRPC.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// Success (not an error).
    Ok = 0,
    /// Operation was cancelled.
    Cancelled = 1,
    /// Malformed request.
    InvalidArgument = 3,
    /// Requested entity (device, method) not found.
    NotFound = 5,
    /// System not in the state required by the operation.
    FailedPrecondition = 9,
    /// Operation aborted (step aborted, worker restarted).
    Aborted = 10,
    /// Method recognised but not served.
    Unimplemented = 12,
    /// Internal invariant broken.
    Internal = 13,
    /// Transient failure; the client may retry.
    Unavailable = 14,
    /// Unrecoverable data loss.
    DataLoss = 15,
}

impl StatusCode {
    /// Convert from a wire byte.
    /// Returns `None` if the byte doesn't match a known status code.
    pub fn from_u8(val: u8) -> Option<Self> {
        Some(match val {
            0 => StatusCode::Ok,
            1 => StatusCode::Cancelled,
            3 => StatusCode::InvalidArgument,
            5 => StatusCode::NotFound,
            9 => StatusCode::FailedPrecondition,
            10 => StatusCode::Aborted,
            12 => StatusCode::Unimplemented,
            13 => StatusCode::Internal,
            14 => StatusCode::Unavailable,
            15 => StatusCode::DataLoss,
            _ => return None,
        })
    }

    /// Wire byte for this code.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Main error type for all worker operations.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// I/O error on the connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error (configuration files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// The rendezvous key could not be parsed.
    #[error("Malformed rendezvous key {key:?}: {reason}")]
    MalformedKey { key: String, reason: String },

    /// The key parsed but names no local device.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The key was minted for an earlier incarnation of the source device.
    #[error(
        "Device {device} has incarnation {actual:#x} but the key expects {expected:#x}; \
         the worker was probably restarted"
    )]
    IncarnationMismatch {
        device: String,
        expected: u64,
        actual: u64,
    },

    /// The rendezvous store could not produce the value.
    #[error("Rendezvous lookup failed for step {step_id}: {message}")]
    Rendezvous { step_id: i64, message: String },

    /// The step was aborted or cleaned up before the value arrived.
    #[error("Step {step_id} aborted: {reason}")]
    Aborted { step_id: i64, reason: String },

    /// An accelerator-resident value reached a host-only path.
    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// The device reported a failed device-to-host copy.
    #[error("Device to host copy failed: {0}")]
    CopyFailed(String),

    /// Method recognised but intentionally not served.
    #[error("Unimplemented: {0}")]
    Unimplemented(&'static str),

    /// Method byte outside the known method set.
    #[error("Unknown method id: {0}")]
    UnknownMethod(u8),

    /// Error produced by a collaborator with an explicit status.
    #[error("{message}")]
    Status { code: StatusCode, message: String },

    /// Protocol error (bad frame, wrong magic, oversized payload, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Internal invariant broken.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Response body does not fit the frame's u32 length field.
    #[error("Response of {0} bytes exceeds the frame size limit")]
    ResponseTooLarge(usize),

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

impl WorkerError {
    /// Status code reported to the caller for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            WorkerError::Json(_)
            | WorkerError::MsgPackEncode(_)
            | WorkerError::MsgPackDecode(_)
            | WorkerError::MalformedKey { .. }
            | WorkerError::Protocol(_) => StatusCode::InvalidArgument,
            WorkerError::DeviceNotFound(_) => StatusCode::NotFound,
            WorkerError::IncarnationMismatch { .. } | WorkerError::Aborted { .. } => {
                StatusCode::Aborted
            }
            WorkerError::Rendezvous { .. }
            | WorkerError::Io(_)
            | WorkerError::ConnectionClosed
            | WorkerError::BackpressureTimeout => StatusCode::Unavailable,
            WorkerError::UnsupportedConfiguration(_) => StatusCode::FailedPrecondition,
            WorkerError::Unimplemented(_) | WorkerError::UnknownMethod(_) => {
                StatusCode::Unimplemented
            }
            WorkerError::Status { code, .. } => *code,
            WorkerError::CopyFailed(_) | WorkerError::Internal(_) => StatusCode::Internal,
            WorkerError::ResponseTooLarge(_) => StatusCode::DataLoss,
        }
    }

    /// Rebuild an error received from the wire.
    pub fn from_status(code: StatusCode, message: impl Into<String>) -> Self {
        WorkerError::Status {
            code,
            message: message.into(),
        }
    }
}

/// Result type alias using WorkerError.
pub type Result<T> = std::result::Result<T, WorkerError>;
