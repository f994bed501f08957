//! Server tunables.
//!
//! [`ServerConfig`] carries everything except the bind address: idle
//! timeout, buffer sizing and the resource limits applied per connection.
//! It can be built in code with the `with_*` setters or deserialized from
//! JSON, where durations are given in milliseconds:
//!
//! ```
//! use std::time::Duration;
//! use embhttp::ServerConfig;
//!
//! let config = ServerConfig::from_json(r#"{ "idle_timeout_ms": 5000, "max_headers": 32 }"#).unwrap();
//! assert_eq!(config.idle_timeout, Duration::from_secs(5));
//! assert_eq!(config.max_headers, 32);
//! assert_eq!(config.buffer_size, ServerConfig::default().buffer_size);
//! ```

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors produced while loading or validating a [`ServerConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {field} must be greater than zero")]
    Zero { field: &'static str },
}

/// Per-server connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Inactivity period after which a connection is destroyed.
    #[serde(rename = "idle_timeout_ms", deserialize_with = "duration_ms")]
    pub idle_timeout: Duration,

    /// Initial size and growth step of the per-connection buffers.
    pub buffer_size: usize,

    /// Maximum header pairs per request; one more is answered with 400.
    pub max_headers: usize,

    /// Maximum bytes of request line plus headers.
    pub max_head_size: usize,

    /// Maximum bytes of URL, headers and body per request; more is answered with 413.
    pub max_request_size: usize,

    /// Maximum bytes of queued response data per connection.
    pub max_write_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            buffer_size: 4096,
            max_headers: 64,
            max_head_size: 16 * 1024,
            max_request_size: 8 * 1024 * 1024,
            max_write_buffer: 16 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// Parses a JSON document; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Json`] for malformed input or unknown fields and
    /// [`ConfigError::Zero`] when a limit is zero.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every limit is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("idle_timeout_ms", self.idle_timeout.is_zero()),
            ("buffer_size", self.buffer_size == 0),
            ("max_headers", self.max_headers == 0),
            ("max_head_size", self.max_head_size == 0),
            ("max_request_size", self.max_request_size == 0),
            ("max_write_buffer", self.max_write_buffer == 0),
        ];
        match checks.iter().find(|(_, zero)| *zero) {
            Some(&(field, _)) => Err(ConfigError::Zero { field }),
            None => Ok(()),
        }
    }

    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    #[must_use]
    pub fn with_max_headers(mut self, max_headers: usize) -> Self {
        self.max_headers = max_headers;
        self
    }

    #[must_use]
    pub fn with_max_head_size(mut self, max_head_size: usize) -> Self {
        self.max_head_size = max_head_size;
        self
    }

    #[must_use]
    pub fn with_max_request_size(mut self, max_request_size: usize) -> Self {
        self.max_request_size = max_request_size;
        self
    }

    #[must_use]
    pub fn with_max_write_buffer(mut self, max_write_buffer: usize) -> Self {
        self.max_write_buffer = max_write_buffer;
        self
    }
}

fn duration_ms<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}
