//! Reassembly of frames from arbitrary read boundaries.
//!
//! Bytes accumulate in a `BytesMut`; each complete frame's payload is split
//! off and frozen, so payloads share the read buffer's allocation.

use bytes::{Buf, Bytes, BytesMut};

use super::wire_format::{Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
use super::Frame;
use crate::error::Result;

/// Initial capacity of the reassembly buffer.
const INITIAL_CAPACITY: usize = 64 * 1024;

/// Accumulates incoming bytes and yields complete frames.
pub struct FrameBuffer {
    buffer: BytesMut,
    /// Header already validated, waiting for its payload.
    pending: Option<Header>,
    max_payload_size: u32,
}

impl FrameBuffer {
    /// Buffer accepting payloads up to 1 GiB.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
            pending: None,
            max_payload_size,
        }
    }

    /// Append `data` and return every frame it completes.
    ///
    /// A trailing partial frame stays buffered for the next call.
    ///
    /// # Errors
    ///
    /// A header with bad magic, a reserved method or flag, or a payload
    /// above the limit. The stream cannot be resynchronised after that.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        loop {
            let header = match self.pending.take() {
                Some(header) => header,
                None if self.buffer.len() >= HEADER_SIZE => {
                    let header = Header::validate(&self.buffer[..HEADER_SIZE], self.max_payload_size)?;
                    self.buffer.advance(HEADER_SIZE);
                    header
                }
                None => break,
            };

            let len = header.payload_length as usize;
            if self.buffer.len() < len {
                self.pending = Some(header);
                break;
            }
            let payload = if len == 0 {
                Bytes::new()
            } else {
                self.buffer.split_to(len).freeze()
            };
            frames.push(Frame::new(header, payload));
        }
        Ok(frames)
    }

    /// Bytes buffered but not yet returned as part of a frame.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// True while a header has been read and its payload is incomplete.
    pub fn is_mid_frame(&self) -> bool {
        self.pending.is_some()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::build_frame;

    fn request_bytes(method: u8, tag: u64, payload: &[u8]) -> Vec<u8> {
        build_frame(&Header::request(method, tag, payload.len() as u32), payload)
    }

    #[test]
    fn test_several_frames_in_one_read() {
        let mut buffer = FrameBuffer::new();
        let mut bytes = request_bytes(2, 1, b"recv");
        bytes.extend_from_slice(&request_bytes(16, 2, b"fused"));
        bytes.extend_from_slice(&request_bytes(3, 3, b""));

        let frames = buffer.push(&bytes).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].payload(), b"recv");
        assert_eq!(frames[1].method(), 16);
        assert!(frames[2].payload().is_empty());
        assert!(buffer.is_empty());
        assert!(!buffer.is_mid_frame());
    }

    #[test]
    fn test_split_inside_header_then_payload() {
        let mut buffer = FrameBuffer::new();
        let bytes = request_bytes(2, 42, b"step 7 key payload");

        assert!(buffer.push(&bytes[..5]).unwrap().is_empty());
        assert!(!buffer.is_mid_frame());

        assert!(buffer.push(&bytes[5..HEADER_SIZE + 3]).unwrap().is_empty());
        assert!(buffer.is_mid_frame());
        assert_eq!(buffer.len(), 3);

        let frames = buffer.push(&bytes[HEADER_SIZE + 3..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].tag(), 42);
        assert_eq!(frames[0].payload(), b"step 7 key payload");
        assert!(!buffer.is_mid_frame());
    }

    #[test]
    fn test_single_byte_reads() {
        let mut buffer = FrameBuffer::new();
        let bytes = request_bytes(16, 7, b"hi");

        let mut all = Vec::new();
        for byte in &bytes {
            all.extend(buffer.push(&[*byte]).unwrap());
        }
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].method(), 16);
        assert_eq!(all[0].payload(), b"hi");
    }

    #[test]
    fn test_oversized_payload_rejected_before_buffering() {
        let mut buffer = FrameBuffer::with_max_payload(100);
        let header = Header::request(2, 1, 1000).encode();
        let err = buffer.push(&header).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_garbage_is_rejected() {
        let mut buffer = FrameBuffer::new();
        assert!(buffer.push(&[0xFFu8; HEADER_SIZE]).is_err());
    }
}
