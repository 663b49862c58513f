//! Frame struct with typed accessors.
//!
//! Represents a complete protocol frame with header and payload.
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use rendezvous_worker::protocol::{Frame, Header};
//! use bytes::Bytes;
//!
//! let header = Header::request(2, 42, 5);
//! let frame = Frame::new(header, Bytes::from_static(b"hello"));
//!
//! assert_eq!(frame.method(), 2);
//! assert_eq!(frame.tag(), 42);
//! assert_eq!(frame.payload(), b"hello");
//! ```

use bytes::Bytes;

use super::wire_format::{Header, HEADER_SIZE};
use crate::error::{StatusCode, WorkerError};

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header and payload.
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[inline]
    pub fn method(&self) -> u8 {
        self.header.method
    }

    #[inline]
    pub fn tag(&self) -> u64 {
        self.header.tag
    }

    #[inline]
    pub fn is_response(&self) -> bool {
        self.header.is_response()
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.header.is_error()
    }

    #[inline]
    pub fn is_cancel(&self) -> bool {
        self.header.is_cancel()
    }

    /// Status carried by a response frame, as an error for error frames.
    ///
    /// Unknown status bytes map to [`StatusCode::Internal`].
    pub fn status(&self) -> std::result::Result<(), WorkerError> {
        if !self.is_error() {
            return Ok(());
        }
        let code = StatusCode::from_u8(self.header.status).unwrap_or(StatusCode::Internal);
        let message = String::from_utf8_lossy(&self.payload).into_owned();
        Err(WorkerError::from_status(code, message))
    }
}

/// Build a complete frame as a single byte vector.
///
/// ```
/// use rendezvous_worker::protocol::{build_frame, Header, HEADER_SIZE};
///
/// let bytes = build_frame(&Header::request(2, 42, 5), b"hello");
/// assert_eq!(bytes.len(), HEADER_SIZE + 5);
/// ```
pub fn build_frame(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_accessors() {
        let frame = Frame::new(Header::response(3, 42, 5), Bytes::from_static(b"hello"));
        assert_eq!(frame.method(), 3);
        assert_eq!(frame.tag(), 42);
        assert!(frame.is_response());
        assert!(!frame.is_error());
        assert!(frame.status().is_ok());
    }

    #[test]
    fn test_error_frame_status() {
        let frame = Frame::new(
            Header::error(2, 1, StatusCode::InvalidArgument, 7),
            Bytes::from_static(b"bad key"),
        );
        let err = frame.status().unwrap_err();
        assert_eq!(err.status_code(), StatusCode::InvalidArgument);
        assert_eq!(err.to_string(), "bad key");
    }

    #[test]
    fn test_unknown_status_byte_is_internal() {
        let frame = Frame::new(Header::new(2, 0x03, 200, 1, 0), Bytes::new());
        assert_eq!(frame.status().unwrap_err().status_code(), StatusCode::Internal);
    }

    #[test]
    fn test_build_frame_layout() {
        let header = Header::request(2, 7, 3);
        let bytes = build_frame(&header, b"abc");
        assert_eq!(Header::decode(&bytes[..HEADER_SIZE]), Some(header));
        assert_eq!(&bytes[HEADER_SIZE..], b"abc");
    }
}
