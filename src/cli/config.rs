//! cds-sync configuration file handling
//!
//! Provides default configuration generation and loading for the operator
//! CLI. Configuration files are TOML and live in the user data directory
//! next to the discovery state file by default.

use cds_sync::discovery::DiscoveryConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default log level
const DEFAULT_LOG_LEVEL: &str = "info";

/// Application directory under the user data dir
const APP_DIR: &str = "cds-sync";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdsConfig {
    /// Engine tuning
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Discovery state store
    pub state: StateConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Path of the JSON file holding the confirmed set and continuation token
    pub path: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            file: None,
        }
    }
}

impl CdsConfig {
    /// Create a new configuration with the given state path
    pub fn new(state_path: PathBuf) -> Self {
        Self {
            discovery: DiscoveryConfig::default(),
            state: StateConfig { path: state_path },
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file '{}': {}", path.display(), e))?;

        let config: CdsConfig = toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config file '{}': {}", path.display(), e))?;

        // Surface a bad timeout at load time rather than on first refresh
        config.discovery.request_timeout()?;

        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults
    pub fn load_or_default(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::new(default_state_path()))
        }
    }

    /// Save configuration to a TOML file
    #[allow(dead_code)]
    pub fn save(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;
        }

        fs::write(path, contents)
            .map_err(|e| format!("Failed to write config file '{}': {}", path.display(), e))?;

        Ok(())
    }

    /// Generate default configuration content as a string with comments
    pub fn generate_default_toml(state_path: &Path) -> String {
        format!(
            r#"# cds-sync Configuration
#
# Operator settings for the contact discovery synchronization engine.

[discovery]
# Targeted refreshes with more sanitized identifiers than this are run as a
# full sync (then filtered to the targets) instead of a one-off request.
# One-off requests cost a fixed unit of rate-limit quota each, so keep this small.
one_off_threshold = 3

# Upper bound on a single discovery round trip (optional), e.g. "30s", "2m"
# request_timeout = "30s"

[state]
# Confirmed identifier set and continuation token (JSON)
path = "{state_path}"

[logging]
# Log level: trace, debug, info, warn, error (RUST_LOG overrides)
level = "info"

# Log file path (optional, logs to stderr if not specified)
# file = "/var/log/cds-sync/cds-sync.log"
"#,
            state_path = state_path.display()
        )
    }

    /// Create and save a default configuration file
    pub fn create_default(
        config_path: &Path,
        state_path: &Path,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let contents = Self::generate_default_toml(state_path);

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;
        }

        fs::write(config_path, contents).map_err(|e| {
            format!(
                "Failed to write config file '{}': {}",
                config_path.display(),
                e
            )
        })?;

        Ok(())
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Get the default config file path
pub fn default_config_path() -> PathBuf {
    data_dir().join("config.toml")
}

/// Get the default discovery state path
pub fn default_state_path() -> PathBuf {
    data_dir().join("discovery-state.json")
}
