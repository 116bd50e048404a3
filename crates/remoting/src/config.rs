//! Connection settings.

use std::time::Duration;

/// Per-connection settings, fixed when the `Connection` is created.
#[derive(Debug, Clone)]
pub struct Config {
    /// Label used in diagnostics, e.g. "server" or "client".
    pub side_name: String,
    /// How long an outgoing call waits for its reply.
    pub call_timeout: Duration,
    /// Largest frame a transport accepts before failing the channel.
    pub max_frame_len: usize,
    /// Number of encode buffers kept for reuse.
    pub buffer_pool_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            side_name: "peer".to_string(),
            call_timeout: Duration::from_secs(30),
            max_frame_len: 64 * 1024 * 1024,
            buffer_pool_capacity: 16,
        }
    }
}

impl Config {
    pub fn with_side_name(mut self, name: impl Into<String>) -> Self {
        self.side_name = name.into();
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    pub fn with_buffer_pool_capacity(mut self, capacity: usize) -> Self {
        self.buffer_pool_capacity = capacity;
        self
    }
}
