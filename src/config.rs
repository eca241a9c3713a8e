//! Runtime settings
//!
//! YAML configuration for the investigation pipeline, plugin loading,
//! result storage and logging. Every field has a default, so an empty or
//! partial file is valid.

use crate::executor::ControllerConfig;
use crate::investigation::OrchestratorConfig;
use crate::model::{InvestigationRequest, RequestError, TargetKind, MAX_DEPTH, MIN_DEPTH};
use crate::store::{InvestigationStore, JsonFileStore, MemoryStore, StoreError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Parsed, but a value is out of range
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Top-level settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub investigation: InvestigationSettings,

    #[serde(default)]
    pub plugins: PluginSettings,

    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Settings {
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes to unit, not to an empty mapping
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Loads `path`, falling back to defaults only when the file does not exist.
    ///
    /// # Errors
    ///
    /// An unreadable or malformed file is an error, not a silent fallback.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            warn!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::from_yaml_file(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let inv = &self.investigation;
        if inv.max_concurrent_requests == 0 {
            return Err(ConfigError::Invalid(
                "investigation.max_concurrent_requests must be at least 1".into(),
            ));
        }
        if inv.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "investigation.request_timeout_secs must be at least 1".into(),
            ));
        }
        if !(MIN_DEPTH..=MAX_DEPTH).contains(&inv.default_depth) {
            return Err(ConfigError::Invalid(format!(
                "investigation.default_depth must be within {}..={}, got {}",
                MIN_DEPTH, MAX_DEPTH, inv.default_depth
            )));
        }
        if inv.max_identifiers_per_kind == 0 {
            return Err(ConfigError::Invalid(
                "investigation.max_identifiers_per_kind must be at least 1".into(),
            ));
        }
        if self.plugins.handshake_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "plugins.handshake_timeout_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Opens the configured result store.
    pub fn build_store(&self) -> Result<Arc<dyn InvestigationStore>, StoreError> {
        match self.store.backend {
            StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
            StoreBackend::Json => Ok(Arc::new(JsonFileStore::open(&self.store.path)?)),
        }
    }
}

/// Investigation pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvestigationSettings {
    /// Depth used when a caller does not pick one
    #[serde(default = "default_depth")]
    pub default_depth: u8,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Minimum spacing between calls to one module
    #[serde(default = "default_rate_limit_delay")]
    pub rate_limit_delay_ms: u64,

    /// Fan-out cap per identifier kind
    #[serde(default = "default_max_identifiers")]
    pub max_identifiers_per_kind: usize,

    /// How long running collector calls may continue after cancellation
    #[serde(default = "default_cancellation_grace")]
    pub cancellation_grace_ms: u64,

    /// Retries for a tier-1 call that timed out
    #[serde(default = "default_timeout_retries")]
    pub max_timeout_retries: u32,
}

impl Default for InvestigationSettings {
    fn default() -> Self {
        Self {
            default_depth: default_depth(),
            max_concurrent_requests: default_max_concurrent(),
            request_timeout_secs: default_request_timeout(),
            rate_limit_delay_ms: default_rate_limit_delay(),
            max_identifiers_per_kind: default_max_identifiers(),
            cancellation_grace_ms: default_cancellation_grace(),
            max_timeout_retries: default_timeout_retries(),
        }
    }
}

impl InvestigationSettings {
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            max_concurrent_requests: self.max_concurrent_requests,
            rate_limit_delay: Duration::from_millis(self.rate_limit_delay_ms),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            cancellation_grace: Duration::from_millis(self.cancellation_grace_ms),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_identifiers_per_kind: self.max_identifiers_per_kind,
            max_timeout_retries: self.max_timeout_retries,
        }
    }

    /// Builds a request at `default_depth`.
    pub fn request(
        &self,
        kind: TargetKind,
        value: impl Into<String>,
    ) -> Result<InvestigationRequest, RequestError> {
        InvestigationRequest::new(kind, value, self.default_depth)
    }
}

fn default_depth() -> u8 {
    2
}

fn default_max_concurrent() -> usize {
    10
}

fn default_request_timeout() -> u64 {
    30
}

fn default_rate_limit_delay() -> u64 {
    1000
}

fn default_max_identifiers() -> usize {
    5
}

fn default_cancellation_grace() -> u64 {
    2000
}

fn default_timeout_retries() -> u32 {
    1
}

/// Plugin discovery settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginSettings {
    /// When false, the loader registers nothing
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Directory scanned for `*.json` manifests
    #[serde(default = "default_plugin_dir")]
    pub directory: PathBuf,

    /// Timeout for the capability handshake with `exec:` plugins
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: default_plugin_dir(),
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

impl PluginSettings {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_plugin_dir() -> PathBuf {
    PathBuf::from("plugins/custom_plugins")
}

fn default_handshake_timeout() -> u64 {
    10
}

/// Result store backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    /// One JSON file per investigation
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Directory for the `json` backend
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/databases")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
