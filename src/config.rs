//! Worker configuration.
//!
//! [`WorkerConfig`] can be built in code (see [`ServerBuilder`](crate::ServerBuilder))
//! or loaded from JSON. Every field has a default, so a config file only
//! needs to mention what it changes:
//!
//! ```
//! use rendezvous_worker::WorkerConfig;
//!
//! let config = WorkerConfig::from_json_str(r#"{ "max_concurrent_calls": 32 }"#).unwrap();
//! assert_eq!(config.max_concurrent_calls, 32);
//! assert!(!config.abort_on_bad_key);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::DEFAULT_MAX_PAYLOAD_SIZE;
use crate::writer::WriterConfig;

/// Default bound on calls executing at once in the compute pool.
pub const DEFAULT_MAX_CONCURRENT_CALLS: usize = 256;

/// Default writer channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default maximum pending response frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default backpressure timeout in milliseconds.
pub const DEFAULT_BACKPRESSURE_TIMEOUT_MS: u64 = 5_000;

/// Configuration for a worker server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Maximum number of calls running in the compute pool at once.
    pub max_concurrent_calls: usize,
    /// Capacity of each connection's response channel.
    pub channel_capacity: usize,
    /// Pending response frames per connection before senders wait.
    pub max_pending_frames: usize,
    /// How long a sender waits for backpressure to clear.
    pub backpressure_timeout_ms: u64,
    /// Largest accepted request payload in bytes.
    pub max_payload_size: u32,
    /// Emit request timing traces (handler start, scheduling, response send).
    pub trace_timing: bool,
    /// Terminate the process when a single receive names a malformed key
    /// or an unknown device, instead of failing only that call. Fused
    /// receives only fail the call.
    pub abort_on_bad_key: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: DEFAULT_MAX_CONCURRENT_CALLS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            backpressure_timeout_ms: DEFAULT_BACKPRESSURE_TIMEOUT_MS,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            trace_timing: false,
            abort_on_bad_key: false,
        }
    }
}

impl WorkerConfig {
    /// Parse a configuration from a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Backpressure timeout as a [`Duration`].
    pub fn backpressure_timeout(&self) -> Duration {
        Duration::from_millis(self.backpressure_timeout_ms)
    }

    /// Writer settings derived from this configuration.
    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            max_pending_frames: self.max_pending_frames,
            channel_capacity: self.channel_capacity,
            backpressure_timeout: self.backpressure_timeout(),
        }
    }
}
