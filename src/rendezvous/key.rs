//! Rendezvous key parsing.
//!
//! A key names one edge of one step:
//!
//! ```text
//! src_device;src_incarnation;dst_device;edge_name;frame_id:iter_id
//! ```
//!
//! Devices are full names (`/job:worker/replica:0/task:1/device:GPU:0`), the
//! incarnation is hex, and the last part is the control-flow frame and
//! iteration the value belongs to.
//!
//! # Example
//!
//! ```
//! use rendezvous_worker::rendezvous::{FrameAndIter, RendezvousKey};
//!
//! let text = RendezvousKey::create(
//!     "/job:worker/replica:0/task:0/device:CPU:0",
//!     0x1f,
//!     "/job:ps/replica:0/task:0/device:CPU:0",
//!     "weights",
//!     FrameAndIter::default(),
//! );
//! let key = RendezvousKey::parse(&text).unwrap();
//! assert_eq!(key.edge_name(), "weights");
//! assert_eq!(key.src_incarnation(), 0x1f);
//! ```

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, WorkerError};

/// Control-flow frame and loop iteration of a value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FrameAndIter {
    pub frame_id: u64,
    pub iter_id: i64,
}

impl FrameAndIter {
    pub fn new(frame_id: u64, iter_id: i64) -> Self {
        Self { frame_id, iter_id }
    }
}

/// Parsed components of a full device name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceName {
    pub job: String,
    pub replica: u32,
    pub task: u32,
    pub device_type: String,
    pub id: u32,
}

impl DeviceName {
    /// Parse `/job:<j>/replica:<r>/task:<t>/device:<TYPE>:<id>`.
    ///
    /// The legacy `/cpu:0` / `/gpu:0` device segment is accepted too.
    pub fn parse(name: &str) -> Option<Self> {
        let rest = name.strip_prefix('/')?;
        let mut job = None;
        let mut replica = None;
        let mut task = None;
        let mut device = None;

        for segment in rest.split('/') {
            let mut fields = segment.split(':');
            let head = fields.next()?;
            match head {
                "job" => job = Some(non_empty(fields.next()?)?.to_string()),
                "replica" => replica = Some(fields.next()?.parse().ok()?),
                "task" => task = Some(fields.next()?.parse().ok()?),
                "device" => {
                    let device_type = non_empty(fields.next()?)?.to_string();
                    let id = fields.next()?.parse().ok()?;
                    device = Some((device_type, id));
                }
                "cpu" | "gpu" | "CPU" | "GPU" => {
                    let id = fields.next()?.parse().ok()?;
                    device = Some((head.to_ascii_uppercase(), id));
                }
                _ => return None,
            }
            if fields.next().is_some() {
                return None;
            }
        }

        let (device_type, id) = device?;
        Some(Self {
            job: job?,
            replica: replica?,
            task: task?,
            device_type,
            id,
        })
    }
}

fn non_empty(s: &str) -> Option<&str> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// A parsed rendezvous key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RendezvousKey {
    full_key: String,
    src_device: String,
    src: DeviceName,
    src_incarnation: u64,
    dst_device: String,
    dst: DeviceName,
    edge_name: String,
    frame_iter: FrameAndIter,
}

impl RendezvousKey {
    /// Build the canonical key string.
    pub fn create(
        src_device: &str,
        src_incarnation: u64,
        dst_device: &str,
        edge_name: &str,
        frame_iter: FrameAndIter,
    ) -> String {
        format!(
            "{};{:016x};{};{};{}:{}",
            src_device,
            src_incarnation,
            dst_device,
            edge_name,
            frame_iter.frame_id,
            frame_iter.iter_id
        )
    }

    /// Parse a key received from the wire.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::MalformedKey`] naming the first part that is
    /// wrong.
    pub fn parse(key: &str) -> Result<Self> {
        let malformed = |reason: &str| WorkerError::MalformedKey {
            key: key.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = key.split(';').collect();
        if parts.len() != 5 {
            return Err(malformed(&format!("expected 5 parts, found {}", parts.len())));
        }

        let src = DeviceName::parse(parts[0]).ok_or_else(|| malformed("bad source device"))?;
        let src_incarnation =
            u64::from_str_radix(parts[1], 16).map_err(|_| malformed("bad source incarnation"))?;
        let dst = DeviceName::parse(parts[2]).ok_or_else(|| malformed("bad destination device"))?;
        if parts[3].is_empty() {
            return Err(malformed("empty edge name"));
        }

        let (frame, iter) = parts[4]
            .split_once(':')
            .ok_or_else(|| malformed("bad frame and iteration"))?;
        let frame_iter = FrameAndIter {
            frame_id: frame
                .parse()
                .map_err(|_| malformed("bad frame and iteration"))?,
            iter_id: iter
                .parse()
                .map_err(|_| malformed("bad frame and iteration"))?,
        };

        Ok(Self {
            full_key: key.to_string(),
            src_device: parts[0].to_string(),
            src,
            src_incarnation,
            dst_device: parts[2].to_string(),
            dst,
            edge_name: parts[3].to_string(),
            frame_iter,
        })
    }

    /// The key exactly as received.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.full_key
    }

    #[inline]
    pub fn src_device(&self) -> &str {
        &self.src_device
    }

    pub fn src(&self) -> &DeviceName {
        &self.src
    }

    #[inline]
    pub fn src_incarnation(&self) -> u64 {
        self.src_incarnation
    }

    #[inline]
    pub fn dst_device(&self) -> &str {
        &self.dst_device
    }

    pub fn dst(&self) -> &DeviceName {
        &self.dst
    }

    #[inline]
    pub fn edge_name(&self) -> &str {
        &self.edge_name
    }

    #[inline]
    pub fn frame_iter(&self) -> FrameAndIter {
        self.frame_iter
    }
}

impl FromStr for RendezvousKey {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for RendezvousKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_key)
    }
}
