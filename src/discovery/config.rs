//! Engine configuration
//!
//! `one_off_threshold` (K) is a tuning parameter set by the discovery
//! service's rate-limit economics, not a structural constant.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default one-off threshold
pub const DEFAULT_ONE_OFF_THRESHOLD: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Targeted refreshes with more sanitized identifiers than this run as a full sync
    #[serde(default = "default_one_off_threshold")]
    pub one_off_threshold: usize,

    /// Upper bound on one discovery round trip, e.g. "30s" (none if unset)
    #[serde(default)]
    pub request_timeout: Option<String>,
}

fn default_one_off_threshold() -> usize {
    DEFAULT_ONE_OFF_THRESHOLD
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            one_off_threshold: DEFAULT_ONE_OFF_THRESHOLD,
            request_timeout: None,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid request_timeout {value:?}: {source}")]
    InvalidTimeout {
        value: String,
        #[source]
        source: humantime::DurationError,
    },

    #[error("request_timeout must be greater than zero")]
    ZeroTimeout,
}

impl DiscoveryConfig {
    pub fn with_threshold(one_off_threshold: usize) -> Self {
        Self {
            one_off_threshold,
            ..Self::default()
        }
    }

    /// Parsed `request_timeout`
    pub fn request_timeout(&self) -> Result<Option<Duration>, ConfigError> {
        let Some(value) = self.request_timeout.as_deref() else {
            return Ok(None);
        };

        let timeout =
            humantime::parse_duration(value).map_err(|source| ConfigError::InvalidTimeout {
                value: value.to_string(),
                source,
            })?;

        if timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }

        Ok(Some(timeout))
    }
}
