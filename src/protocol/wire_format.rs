//! Wire format encoding and decoding.
//!
//! Implements the 16-byte frame header:
//! ```text
//! ┌───────┬────────┬───────┬────────┬──────────┬──────────┐
//! │ Magic │ Method │ Flags │ Status │ Tag      │ Length   │
//! │ 1 byte│ 1 byte │ 1 byte│ 1 byte │ 8 bytes  │ 4 bytes  │
//! │       │        │       │        │ uint64 BE│ uint32 BE│
//! └───────┴────────┴───────┴────────┴──────────┴──────────┘
//! ```
//!
//! All multi-byte integers are Big Endian. The tag pairs a response (or a
//! cancel) with the request it belongs to.

use crate::error::{Result, StatusCode, WorkerError};

/// Header size in bytes (fixed, exactly 16).
pub const HEADER_SIZE: usize = 16;

/// First byte of every frame.
pub const FRAME_MAGIC: u8 = 0x7E;

/// Default maximum payload size (1 GB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 1_073_741_824;

/// Reserved method byte (never sent).
pub const RESERVED_METHOD_ID: u8 = 0;

/// Flag constants for the protocol.
pub mod flags {
    /// Message type: response (1) or request (0).
    pub const IS_RESPONSE: u8 = 0b0000_0001;
    /// Error flag: the payload is an error message.
    pub const IS_ERROR: u8 = 0b0000_0010;
    /// Cancel the in-flight request with the same tag.
    pub const IS_CANCEL: u8 = 0b0000_0100;

    /// Reserved bits mask (bits 3-7).
    pub const RESERVED_MASK: u8 = 0b1111_1000;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }

    /// Error response flags = 0x03
    pub const ERROR_RESPONSE: u8 = IS_RESPONSE | IS_ERROR;
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Method byte (see [`MethodId`](crate::service::MethodId)).
    pub method: u8,
    /// Flags byte (see `flags` module).
    pub flags: u8,
    /// Status byte; 0 except on error responses.
    pub status: u8,
    /// Request tag.
    pub tag: u64,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(method: u8, flags: u8, status: u8, tag: u64, payload_length: u32) -> Self {
        Self {
            method,
            flags,
            status,
            tag,
            payload_length,
        }
    }

    /// Request header.
    pub fn request(method: u8, tag: u64, payload_length: u32) -> Self {
        Self::new(method, 0, StatusCode::Ok.as_u8(), tag, payload_length)
    }

    /// Successful response header.
    pub fn response(method: u8, tag: u64, payload_length: u32) -> Self {
        Self::new(
            method,
            flags::IS_RESPONSE,
            StatusCode::Ok.as_u8(),
            tag,
            payload_length,
        )
    }

    /// Error response header.
    pub fn error(method: u8, tag: u64, status: StatusCode, payload_length: u32) -> Self {
        Self::new(
            method,
            flags::ERROR_RESPONSE,
            status.as_u8(),
            tag,
            payload_length,
        )
    }

    /// Cancel header for the request `tag`.
    pub fn cancel(method: u8, tag: u64) -> Self {
        Self::new(method, flags::IS_CANCEL, StatusCode::Ok.as_u8(), tag, 0)
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use rendezvous_worker::protocol::{Header, HEADER_SIZE};
    ///
    /// let header = Header::response(2, 42, 100);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), HEADER_SIZE);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = FRAME_MAGIC;
        buf[1] = self.method;
        buf[2] = self.flags;
        buf[3] = self.status;
        buf[4..12].copy_from_slice(&self.tag.to_be_bytes());
        buf[12..16].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if the buffer is too short.
    /// The magic byte is checked by [`validate`](Self::validate).
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        let mut tag = [0u8; 8];
        tag.copy_from_slice(&buf[4..12]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&buf[12..16]);
        Some(Self {
            method: buf[1],
            flags: buf[2],
            status: buf[3],
            tag: u64::from_be_bytes(tag),
            payload_length: u32::from_be_bytes(len),
        })
    }

    /// Validate a raw header for protocol compliance.
    ///
    /// Checks:
    /// - Magic byte matches
    /// - Method byte is not 0 (reserved)
    /// - Payload length doesn't exceed max
    /// - Reserved flag bits are 0
    pub fn validate(raw: &[u8], max_payload_size: u32) -> Result<Self> {
        let header = Self::decode(raw)
            .ok_or_else(|| WorkerError::Protocol("Truncated header".to_string()))?;

        if raw[0] != FRAME_MAGIC {
            return Err(WorkerError::Protocol(format!(
                "Bad frame magic {:#04x}",
                raw[0]
            )));
        }

        if header.method == RESERVED_METHOD_ID {
            return Err(WorkerError::Protocol("Method 0 is reserved".to_string()));
        }

        if header.payload_length > max_payload_size {
            return Err(WorkerError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                header.payload_length, max_payload_size
            )));
        }

        if header.flags & flags::RESERVED_MASK != 0 {
            return Err(WorkerError::Protocol(
                "Reserved flag bits must be 0".to_string(),
            ));
        }

        Ok(header)
    }

    /// Check if this is a response.
    #[inline]
    pub fn is_response(&self) -> bool {
        flags::has_flag(self.flags, flags::IS_RESPONSE)
    }

    /// Check if this is an error response.
    #[inline]
    pub fn is_error(&self) -> bool {
        flags::has_flag(self.flags, flags::IS_ERROR)
    }

    /// Check if this is a cancel signal.
    #[inline]
    pub fn is_cancel(&self) -> bool {
        flags::has_flag(self.flags, flags::IS_CANCEL)
    }
}
