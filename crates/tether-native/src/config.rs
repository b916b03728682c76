//! Session configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Upper bound for the consumer read chunk size.
pub const MAX_READ_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Tunables applied when a session is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// TCP connect timeout in milliseconds (used by `Session::connect`)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Native blocking timeout in milliseconds; 0 waits forever
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    /// Keepalive interval in seconds; 0 disables keepalives
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u32,
    /// Whether keepalives ask the server for a reply
    #[serde(default)]
    pub keepalive_want_reply: bool,
    /// Buffer size consumers use for each read call
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_session_timeout_ms() -> u32 {
    30_000
}

fn default_keepalive_interval_secs() -> u32 {
    30
}

fn default_read_chunk_size() -> usize {
    32 * 1024 // one SFTP packet
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            session_timeout_ms: default_session_timeout_ms(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            keepalive_want_reply: false,
            read_chunk_size: default_read_chunk_size(),
        }
    }
}

impl SessionConfig {
    /// Connect timeout as a `Duration`
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Native session timeout as a `Duration`
    #[must_use]
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.session_timeout_ms))
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if a value is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_ms == 0 {
            return Err(Error::InvalidArgument(
                "connect timeout must be greater than zero".to_string(),
            ));
        }

        if self.read_chunk_size == 0 || self.read_chunk_size > MAX_READ_CHUNK_SIZE {
            return Err(Error::InvalidArgument(format!(
                "read chunk size must be between 1 and {MAX_READ_CHUNK_SIZE} bytes"
            )));
        }

        Ok(())
    }
}
