//! Transport configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::{MAX_REQUESTS, RECEIVE_BUFFER_SIZE};

/// Smallest receive buffer that still holds a typical request record.
pub const MIN_RECEIVE_BUFFER_SIZE: usize = 4 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

/// Settings for one [`HttpRequestQueue`](crate::transport::HttpRequestQueue).
///
/// Missing fields take their defaults:
///
/// ```
/// use playwire::config::TransportConfig;
///
/// let config = TransportConfig::from_json(r#"{ "prefixes": ["/api/"] }"#).unwrap();
/// assert_eq!(config.max_requests, 64);
/// assert_eq!(config.receive_buffer_size, 256 * 1024);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// Concurrent in-flight requests.
    pub max_requests: usize,
    /// Bytes per receive buffer, at most [`RECEIVE_BUFFER_SIZE`]; larger
    /// request records fail.
    pub receive_buffer_size: usize,
    /// URL prefixes bound when the server starts.
    pub prefixes: Vec<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_requests: MAX_REQUESTS,
            receive_buffer_size: RECEIVE_BUFFER_SIZE,
            prefixes: Vec::new(),
        }
    }
}

impl TransportConfig {
    /// Parses and validates a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_requests == 0 {
            return Err(ConfigError::Invalid {
                field: "max_requests",
                reason: "must be at least 1".to_owned(),
            });
        }
        if !(MIN_RECEIVE_BUFFER_SIZE..=RECEIVE_BUFFER_SIZE).contains(&self.receive_buffer_size) {
            return Err(ConfigError::Invalid {
                field: "receive_buffer_size",
                reason: format!(
                    "must be between {MIN_RECEIVE_BUFFER_SIZE} and {RECEIVE_BUFFER_SIZE} bytes"
                ),
            });
        }
        if let Some(prefix) = self.prefixes.iter().find(|prefix| !prefix.ends_with('/')) {
            return Err(ConfigError::Invalid {
                field: "prefixes",
                reason: format!("{prefix:?} must end with '/'"),
            });
        }
        Ok(())
    }
}
