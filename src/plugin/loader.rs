//! Plugin discovery, validation and registration.
//!
//! Loading is all-or-nothing per plugin: a collector reaches the registry
//! only after it was constructed, its name matched the manifest and its
//! capabilities covered the declared ones. Across plugins it is best-effort;
//! a rejected manifest is reported and the scan carries on.

use crate::config::PluginSettings;
use crate::plugin::manifest::{is_valid_name, EntryPoint, PluginManifest, MANIFEST_EXTENSION};
use crate::plugin::process::ProcessCollector;
use crate::registry::{CollectorDescriptor, ModuleRegistry, ModuleSource, RegistrationError};
use crate::traits::{panic_message, Capabilities, Collector, CollectorError};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

// ============================================================================
// Errors
// ============================================================================

/// Why one plugin was rejected. Never fatal to the rest of the scan.
#[derive(Error, Debug)]
pub enum PluginLoadError {
    #[error("Plugin I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid plugin manifest '{path}': {reason}")]
    Manifest { path: PathBuf, reason: String },

    #[error("Plugin '{plugin}' references unknown factory '{factory}'")]
    UnknownEntryPoint { plugin: String, factory: String },

    #[error("Plugin '{plugin}' failed during construction: {reason}")]
    Construction { plugin: String, reason: String },

    #[error("Plugin '{plugin}' handshake failed: {reason}")]
    Handshake { plugin: String, reason: String },

    #[error("Plugin '{plugin}' declares capabilities it does not implement: {missing}")]
    CapabilityMismatch { plugin: String, missing: String },

    #[error("Plugin manifest '{plugin}' produced a collector named '{actual}'")]
    NameMismatch { plugin: String, actual: String },

    #[error("Plugin '{plugin}' rejected by registry: {source}")]
    Registration {
        plugin: String,
        #[source]
        source: RegistrationError,
    },
}

// ============================================================================
// Factories
// ============================================================================

/// In-process constructor behind a `factory:<id>` entry point.
pub type CollectorFactory =
    Arc<dyn Fn(&PluginManifest) -> Result<Arc<dyn Collector>, CollectorError> + Send + Sync>;

/// Constructors the host makes available to `factory:` plugins.
#[derive(Clone, Default)]
pub struct FactoryCatalog {
    factories: BTreeMap<String, CollectorFactory>,
}

impl fmt::Debug for FactoryCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryCatalog")
            .field("ids", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FactoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, id: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&PluginManifest) -> Result<Arc<dyn Collector>, CollectorError> + Send + Sync + 'static,
    {
        self.factories.insert(id.into(), Arc::new(factory));
        self
    }

    pub fn get(&self, id: &str) -> Option<CollectorFactory> {
        self.factories.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

// ============================================================================
// Reports
// ============================================================================

/// Manifests found by [`PluginLoader::scan`]; nothing is loaded yet.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub manifests: Vec<PluginManifest>,
    pub rejected: Vec<PluginLoadError>,
}

#[derive(Debug, Default)]
pub struct LoadReport {
    /// Names of registered plugin collectors
    pub loaded: Vec<String>,
    /// Everything rejected, during scan or load
    pub failed: Vec<PluginLoadError>,
}

// ============================================================================
// Loader
// ============================================================================

pub struct PluginLoader {
    registry: Arc<ModuleRegistry>,
    catalog: FactoryCatalog,
    directory: PathBuf,
    handshake_timeout: Duration,
    enabled: bool,
    loaded: Mutex<BTreeMap<String, PluginManifest>>,
}

impl fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginLoader")
            .field("directory", &self.directory)
            .field("catalog", &self.catalog)
            .field("enabled", &self.enabled)
            .field("loaded", &self.loaded().len())
            .finish()
    }
}

impl PluginLoader {
    pub fn new(registry: Arc<ModuleRegistry>, directory: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            catalog: FactoryCatalog::new(),
            directory: directory.into(),
            handshake_timeout: Duration::from_secs(10),
            enabled: true,
            loaded: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn from_settings(
        registry: Arc<ModuleRegistry>,
        catalog: FactoryCatalog,
        settings: &PluginSettings,
    ) -> Self {
        Self::new(registry, settings.directory.clone())
            .with_catalog(catalog)
            .with_handshake_timeout(settings.handshake_timeout())
            .with_enabled(settings.enabled)
    }

    /// A disabled loader neither scans nor registers anything.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_catalog(mut self, catalog: FactoryCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Reads every manifest in the plugin directory without loading anything.
    ///
    /// A missing directory is created and yields an empty report. Files whose
    /// name starts with `_` or `.` are skipped.
    ///
    /// # Errors
    ///
    /// Only if the directory itself cannot be created or listed.
    pub fn scan(&self) -> Result<ScanReport, PluginLoadError> {
        let io_err = |source| PluginLoadError::Io {
            path: self.directory.clone(),
            source,
        };

        if !self.directory.exists() {
            warn!(directory = %self.directory.display(), "Plugin directory not found, creating it");
            std::fs::create_dir_all(&self.directory).map_err(io_err)?;
            return Ok(ScanReport::default());
        }

        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.directory)
            .map_err(io_err)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_manifest_file(path))
            .collect();
        paths.sort();

        let mut report = ScanReport::default();
        for path in paths {
            match PluginManifest::from_file(&path) {
                Ok(manifest) => {
                    debug!(plugin = %manifest.name, path = %path.display(), "Found plugin manifest");
                    report.manifests.push(manifest);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping invalid plugin manifest");
                    report.rejected.push(PluginLoadError::Manifest {
                        path,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    /// Instantiates, validates and registers one plugin.
    #[instrument(skip(self, manifest), fields(plugin = %manifest.name))]
    pub async fn load(&self, manifest: &PluginManifest) -> Result<CollectorDescriptor, PluginLoadError> {
        manifest
            .validate()
            .map_err(|e| PluginLoadError::Manifest {
                path: manifest.path.clone(),
                reason: e.to_string(),
            })?;

        let instance = self.instantiate(manifest).await?;

        if instance.name() != manifest.name {
            return Err(PluginLoadError::NameMismatch {
                plugin: manifest.name.clone(),
                actual: instance.name().to_string(),
            });
        }

        let actual = instance.capabilities();
        if !actual.covers(&manifest.capabilities) {
            return Err(PluginLoadError::CapabilityMismatch {
                plugin: manifest.name.clone(),
                missing: describe_missing(&manifest.capabilities, &actual),
            });
        }

        let descriptor = self
            .registry
            .register(instance, ModuleSource::Plugin)
            .map_err(|source| PluginLoadError::Registration {
                plugin: manifest.name.clone(),
                source,
            })?;

        self.loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(manifest.name.clone(), manifest.clone());
        info!(version = %manifest.version, author = %manifest.author, "Plugin loaded");
        Ok(descriptor)
    }

    async fn instantiate(&self, manifest: &PluginManifest) -> Result<Arc<dyn Collector>, PluginLoadError> {
        match &manifest.entry_point {
            EntryPoint::Factory(id) => {
                let factory = self.catalog.get(id).ok_or_else(|| PluginLoadError::UnknownEntryPoint {
                    plugin: manifest.name.clone(),
                    factory: id.clone(),
                })?;
                let construction_error = |reason| PluginLoadError::Construction {
                    plugin: manifest.name.clone(),
                    reason,
                };
                match catch_unwind(AssertUnwindSafe(|| factory(manifest))) {
                    Ok(Ok(instance)) => Ok(instance),
                    Ok(Err(e)) => Err(construction_error(e.to_string())),
                    Err(payload) => Err(construction_error(format!(
                        "panicked: {}",
                        panic_message(payload.as_ref())
                    ))),
                }
            }
            EntryPoint::Exec(_) => {
                let program = manifest.resolve_exec().unwrap_or_default();
                let collector =
                    ProcessCollector::handshake(&manifest.name, program, self.handshake_timeout)
                        .await
                        .map_err(|e| PluginLoadError::Handshake {
                            plugin: manifest.name.clone(),
                            reason: e.to_string(),
                        })?;
                Ok(Arc::new(collector))
            }
        }
    }

    /// Scans the directory and loads every valid manifest.
    ///
    /// # Errors
    ///
    /// Only if the directory cannot be scanned; per-plugin failures are in the report.
    pub async fn load_all(&self) -> Result<LoadReport, PluginLoadError> {
        if !self.enabled {
            info!(directory = %self.directory.display(), "Plugin loading disabled");
            return Ok(LoadReport::default());
        }
        let scan = self.scan()?;
        let mut report = LoadReport {
            loaded: Vec::new(),
            failed: scan.rejected,
        };

        for manifest in &scan.manifests {
            match self.load(manifest).await {
                Ok(descriptor) => report.loaded.push(descriptor.name),
                Err(e) => {
                    warn!(plugin = %manifest.name, error = %e, "Plugin rejected");
                    report.failed.push(e);
                }
            }
        }

        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            directory = %self.directory.display(),
            "Plugin scan complete"
        );
        Ok(report)
    }

    /// Drops every plugin-sourced collector and loads the directory again.
    ///
    /// Built-in collectors are untouched.
    pub async fn reload(&self) -> Result<LoadReport, PluginLoadError> {
        let removed = self.registry.unregister_source(ModuleSource::Plugin);
        self.loaded.lock().unwrap_or_else(PoisonError::into_inner).clear();
        info!(removed = removed.len(), "Reloading plugins");
        self.load_all().await
    }

    /// Manifests of the currently loaded plugins, sorted by name.
    pub fn loaded(&self) -> Vec<PluginManifest> {
        self.loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Writes a manifest and a shell stub for a new executable plugin.
    ///
    /// Returns the manifest path. Existing files are never overwritten.
    pub fn write_template(&self, name: &str) -> Result<PathBuf, PluginLoadError> {
        let manifest_path = self.directory.join(format!("{}.{}", name, MANIFEST_EXTENSION));
        if !is_valid_name(name) {
            return Err(PluginLoadError::Manifest {
                path: manifest_path,
                reason: format!("invalid plugin name '{}'", name),
            });
        }

        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| PluginLoadError::Io { path, source }
        };
        std::fs::create_dir_all(&self.directory).map_err(io_err(&self.directory))?;

        let mut manifest = PluginManifest::template(name);
        manifest.path = manifest_path.clone();
        let script_path = manifest.resolve_exec().unwrap_or_default();

        let body = serde_json::to_string_pretty(&manifest).map_err(|e| PluginLoadError::Manifest {
            path: manifest_path.clone(),
            reason: e.to_string(),
        })?;
        write_new(&manifest_path, &body).map_err(io_err(&manifest_path))?;
        write_new(&script_path, &template_script(name, &manifest.capabilities))
            .map_err(io_err(&script_path))?;
        make_executable(&script_path).map_err(io_err(&script_path))?;

        info!(plugin = name, path = %manifest_path.display(), "Plugin template created");
        Ok(manifest_path)
    }
}

fn is_manifest_file(path: &Path) -> bool {
    let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    path.is_file()
        && !file_name.starts_with('_')
        && !file_name.starts_with('.')
        && path.extension().and_then(|e| e.to_str()) == Some(MANIFEST_EXTENSION)
}

fn describe_missing(declared: &Capabilities, actual: &Capabilities) -> String {
    let kinds: Vec<&str> = declared
        .target_kinds
        .difference(&actual.target_kinds)
        .map(|k| k.as_str())
        .collect();
    let depths: Vec<String> = declared
        .depth_levels
        .difference(&actual.depth_levels)
        .map(|d| d.to_string())
        .collect();

    let mut parts = Vec::new();
    if !kinds.is_empty() {
        parts.push(format!("target kinds [{}]", kinds.join(", ")));
    }
    if !depths.is_empty() {
        parts.push(format!("depth levels [{}]", depths.join(", ")));
    }
    parts.join(" and ")
}

fn write_new(path: &Path, content: &str) -> std::io::Result<()> {
    use std::io::Write;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    file.write_all(content.as_bytes())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

fn template_script(name: &str, capabilities: &Capabilities) -> String {
    let capabilities = serde_json::to_string(capabilities).unwrap_or_default();
    format!(
        r#"#!/bin/sh
# Collector plugin "{name}".
#   {name}.sh capabilities
#   {name}.sh investigate <kind> <depth> <target>
case "$1" in
  capabilities)
    echo '{capabilities}'
    ;;
  investigate)
    printf '{{"plugin":"%s","target":"%s","kind":"%s","results":{{}}}}\n' "{name}" "$4" "$2"
    ;;
  *)
    echo "usage: $0 capabilities | investigate <kind> <depth> <target>" >&2
    exit 2
    ;;
esac
"#
    )
}

// ============================================================================
// Tests
// ============================================================================
