//! Plugin module - dynamically discovered collectors.
//!
//! A plugin is a JSON manifest in the configured plugin directory:
//! - **Manifest**: name, version, author and declared capabilities via [`PluginManifest`]
//! - **Entry points**: in-process factories ([`FactoryCatalog`]) or external
//!   executables ([`ProcessCollector`])
//! - **Loader**: discovery, validation and registration via [`PluginLoader`]

pub mod loader;
pub mod manifest;
pub mod process;

pub use loader::{
    CollectorFactory, FactoryCatalog, LoadReport, PluginLoadError, PluginLoader, ScanReport,
};
pub use manifest::{EntryPoint, ManifestError, PluginManifest};
pub use process::ProcessCollector;
