//! Plugin manifests.
//!
//! ```json
//! {
//!   "name": "gravatar",
//!   "version": "1.0.0",
//!   "author": "Jane Doe",
//!   "description": "Gravatar profile lookup",
//!   "entry_point": "exec:gravatar.sh",
//!   "capabilities": { "target_kinds": ["email"], "depth_levels": [1, 2] }
//! }
//! ```

use crate::model::TargetKind;
use crate::traits::Capabilities;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// File extension of manifest files.
pub const MANIFEST_EXTENSION: &str = "json";

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Malformed manifest JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid entry point '{0}' (expected 'factory:<id>' or 'exec:<path>')")]
    EntryPoint(String),

    #[error("Invalid manifest: {0}")]
    Invalid(String),
}

/// How a plugin's collector is instantiated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EntryPoint {
    /// Constructor registered in-process under this id
    Factory(String),
    /// External executable speaking the JSON stdout protocol
    Exec(PathBuf),
}

impl FromStr for EntryPoint {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("factory", id)) if !id.trim().is_empty() => {
                Ok(EntryPoint::Factory(id.trim().to_string()))
            }
            Some(("exec", path)) if !path.trim().is_empty() => {
                Ok(EntryPoint::Exec(PathBuf::from(path.trim())))
            }
            _ => Err(ManifestError::EntryPoint(s.to_string())),
        }
    }
}

impl TryFrom<String> for EntryPoint {
    type Error = ManifestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EntryPoint> for String {
    fn from(entry: EntryPoint) -> Self {
        entry.to_string()
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryPoint::Factory(id) => write!(f, "factory:{}", id),
            EntryPoint::Exec(path) => write!(f, "exec:{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    pub author: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub entry_point: EntryPoint,

    /// Capabilities the plugin promises; checked against the instance at load time
    pub capabilities: Capabilities,

    /// File this manifest was read from (empty when built in code)
    #[serde(skip)]
    pub path: PathBuf,
}

impl PluginManifest {
    /// Parses and validates a manifest.
    pub fn from_json(content: &str) -> Result<Self, ManifestError> {
        let manifest: PluginManifest = serde_json::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Reads a manifest file, remembering where it came from.
    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ManifestError::Invalid(format!("unreadable: {}", e)))?;
        let mut manifest = Self::from_json(&content)?;
        manifest.path = path.to_path_buf();
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        if !is_valid_name(&self.name) {
            return Err(ManifestError::Invalid(format!(
                "name '{}' must be non-empty and use only letters, digits, '_' or '-'",
                self.name
            )));
        }
        if self.version.trim().is_empty() {
            return Err(ManifestError::Invalid("version is empty".into()));
        }
        if let Some(reason) = self.capabilities.problem() {
            return Err(ManifestError::Invalid(format!("capabilities: {}", reason)));
        }
        Ok(())
    }

    /// Executable path for an `exec:` entry point, relative paths resolved
    /// against the manifest's directory.
    pub fn resolve_exec(&self) -> Option<PathBuf> {
        let EntryPoint::Exec(program) = &self.entry_point else {
            return None;
        };
        if program.is_absolute() {
            return Some(program.clone());
        }
        let base = self.path.parent().unwrap_or_else(|| Path::new("."));
        Some(base.join(program))
    }

    /// Skeleton manifest for a new executable plugin.
    pub fn template(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            author: "Unknown".to_string(),
            description: Some(format!("Collector plugin {}", name)),
            entry_point: EntryPoint::Exec(PathBuf::from(format!("{}.sh", name))),
            capabilities: Capabilities::new(
                [TargetKind::Email, TargetKind::Phone, TargetKind::Username],
                [1, 2],
            ),
            path: PathBuf::new(),
        }
    }
}

pub(crate) fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
