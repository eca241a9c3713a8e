//! Orchestration core for OSINT investigations.
//!
//! Collectors register in a [`ModuleRegistry`] (built in, or discovered by the
//! [`PluginLoader`]); the [`InvestigationOrchestrator`] runs a depth-tiered
//! pipeline over them through the [`ConcurrencyController`], correlates what
//! they found with the [`CorrelationEngine`] and persists the frozen
//! [`InvestigationResult`] in an [`InvestigationStore`].

pub mod config;
pub mod correlation;
pub mod executor;
pub mod investigation;
pub mod logging;
pub mod model;
pub mod plugin;
pub mod registry;
pub mod store;
pub mod traits;

#[cfg(test)]
mod test_support;

// Re-export common types for convenience
pub use config::{ConfigError, Settings};
pub use correlation::{CorrelationEngine, IdentifierSet};
pub use executor::*;
pub use investigation::{InvestigationOrchestrator, OrchestratorConfig, OrchestratorError};
pub use model::*;
pub use plugin::{FactoryCatalog, PluginLoadError, PluginLoader, PluginManifest};
pub use registry::{CollectorDescriptor, ModuleRegistry, ModuleSource, RegistrationError};
pub use store::{InvestigationStore, JsonFileStore, MemoryStore, StoreError};
pub use traits::*;
