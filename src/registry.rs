//! Module registry.
//!
//! Owns every collector instance in the process, keyed by name, together with
//! a [`CollectorDescriptor`] that records what the collector can do and
//! whether it is currently usable. Construction failures are recorded as
//! unavailable descriptors instead of propagating: one broken module never
//! takes the rest of the registry down with it.
//!
//! The registry is read-mostly. Reads take a shared lock; only
//! registration, availability changes and plugin reloads take the write lock.

use crate::model::TargetKind;
use crate::traits::{panic_message, Capabilities, Collector, CollectorError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

// ============================================================================
// Descriptors
// ============================================================================

/// Where a collector came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleSource {
    /// Compiled in and registered at process start
    BuiltIn,

    /// Registered by the plugin loader; removed again on reload
    Plugin,
}

/// Registry-side view of a collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorDescriptor {
    pub name: String,
    pub target_kinds: BTreeSet<TargetKind>,
    pub depth_levels: BTreeSet<u8>,
    pub available: bool,
    pub last_error: Option<String>,
    pub source: ModuleSource,
    pub registered_at: DateTime<Utc>,
}

impl CollectorDescriptor {
    fn available(name: &str, capabilities: Capabilities, source: ModuleSource) -> Self {
        Self {
            name: name.to_string(),
            target_kinds: capabilities.target_kinds,
            depth_levels: capabilities.depth_levels,
            available: true,
            last_error: None,
            source,
            registered_at: Utc::now(),
        }
    }

    fn unavailable(name: &str, reason: &str, source: ModuleSource) -> Self {
        Self {
            name: name.to_string(),
            target_kinds: BTreeSet::new(),
            depth_levels: BTreeSet::new(),
            available: false,
            last_error: Some(reason.to_string()),
            source,
            registered_at: Utc::now(),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            target_kinds: self.target_kinds.clone(),
            depth_levels: self.depth_levels.clone(),
        }
    }

    pub fn supports_target(&self, kind: TargetKind) -> bool {
        self.target_kinds.contains(&kind)
    }

    pub fn supports_depth(&self, depth: u8) -> bool {
        self.depth_levels.contains(&depth)
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// An available collector already holds this name; the existing one is kept
    #[error("A collector named '{0}' is already registered")]
    NameCollision(String),

    #[error("Invalid collector name '{0}'")]
    InvalidName(String),

    #[error("Collector '{name}' declares invalid capabilities: {reason}")]
    InvalidCapabilities { name: String, reason: String },

    /// Construction failed; the module is recorded as unavailable
    #[error("Collector '{name}' is unavailable: {reason}")]
    ModuleUnavailable { name: String, reason: String },
}

// ============================================================================
// Registry
// ============================================================================

struct Entry {
    descriptor: CollectorDescriptor,
    instance: Option<Arc<dyn Collector>>,
}

/// Collectors by name, plus their availability history.
///
/// One registry is created per process and shared by reference (`Arc`)
/// with the plugin loader and the orchestrator.
#[derive(Default)]
pub struct ModuleRegistry {
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.status())
            .finish()
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // Entries are only ever replaced whole, so a poisoned lock still guards a
    // consistent map.
    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a collector under its own [`Collector::name`].
    ///
    /// Capabilities are read and validated once, here.
    ///
    /// # Errors
    ///
    /// - [`RegistrationError::NameCollision`] if an available collector already
    ///   uses the name (the first registration is left untouched)
    /// - [`RegistrationError::InvalidName`] / [`RegistrationError::InvalidCapabilities`]
    ///   if the collector describes itself incorrectly
    pub fn register(
        &self,
        instance: Arc<dyn Collector>,
        source: ModuleSource,
    ) -> Result<CollectorDescriptor, RegistrationError> {
        let name = instance.name().trim().to_string();
        if name.is_empty() || name != instance.name() {
            return Err(RegistrationError::InvalidName(instance.name().to_string()));
        }

        let capabilities = instance.capabilities();
        if let Some(reason) = capabilities.problem() {
            return Err(RegistrationError::InvalidCapabilities { name, reason });
        }

        let mut entries = self.write();
        if entries.get(&name).is_some_and(|e| e.descriptor.available) {
            warn!(module = %name, "Rejected duplicate collector registration");
            return Err(RegistrationError::NameCollision(name));
        }

        let descriptor = CollectorDescriptor::available(&name, capabilities, source);
        info!(
            module = %name,
            source = ?source,
            kinds = ?descriptor.target_kinds,
            "Collector registered"
        );
        entries.insert(
            name,
            Entry {
                descriptor: descriptor.clone(),
                instance: Some(instance),
            },
        );
        Ok(descriptor)
    }

    /// Constructs a collector with `factory` and registers it.
    ///
    /// A factory that errors or panics leaves an unavailable descriptor behind
    /// (visible through [`list_all`](Self::list_all)) and yields
    /// [`RegistrationError::ModuleUnavailable`]; the process carries on.
    pub fn register_with<F>(
        &self,
        name: &str,
        source: ModuleSource,
        factory: F,
    ) -> Result<CollectorDescriptor, RegistrationError>
    where
        F: FnOnce() -> Result<Arc<dyn Collector>, CollectorError>,
    {
        let constructed = match catch_unwind(AssertUnwindSafe(factory)) {
            Ok(Ok(instance)) if instance.name() == name => Ok(instance),
            Ok(Ok(instance)) => Err(format!(
                "factory produced a collector named '{}'",
                instance.name()
            )),
            Ok(Err(e)) => Err(e.to_string()),
            Err(payload) => Err(format!(
                "panicked during construction: {}",
                panic_message(payload.as_ref())
            )),
        };

        let result = constructed
            .map_err(|reason| RegistrationError::ModuleUnavailable {
                name: name.to_string(),
                reason,
            })
            .and_then(|instance| self.register(instance, source));

        match result {
            Ok(descriptor) => Ok(descriptor),
            Err(RegistrationError::NameCollision(existing)) => {
                Err(RegistrationError::NameCollision(existing))
            }
            Err(err) => {
                let reason = match &err {
                    RegistrationError::ModuleUnavailable { reason, .. } => reason.clone(),
                    other => other.to_string(),
                };
                self.record_unavailable(name, &reason, source);
                Err(RegistrationError::ModuleUnavailable {
                    name: name.to_string(),
                    reason,
                })
            }
        }
    }

    fn record_unavailable(&self, name: &str, reason: &str, source: ModuleSource) {
        warn!(module = %name, reason = %reason, "Module unavailable");
        let mut entries = self.write();
        match entries.get_mut(name) {
            // Never shadow a working collector with a failed attempt.
            Some(entry) if entry.descriptor.available => {}
            Some(entry) => entry.descriptor.last_error = Some(reason.to_string()),
            None => {
                entries.insert(
                    name.to_string(),
                    Entry {
                        descriptor: CollectorDescriptor::unavailable(name, reason, source),
                        instance: None,
                    },
                );
            }
        }
    }

    /// Flags a registered collector as unusable without forgetting it.
    ///
    /// Returns `false` if no collector has that name.
    pub fn mark_unavailable(&self, name: &str, reason: &str) -> bool {
        let mut entries = self.write();
        let Some(entry) = entries.get_mut(name) else {
            return false;
        };
        warn!(module = %name, reason = %reason, "Collector marked unavailable");
        entry.descriptor.available = false;
        entry.descriptor.last_error = Some(reason.to_string());
        true
    }

    /// Returns the collector if it is registered and available.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Collector>> {
        self.read()
            .get(name)
            .filter(|e| e.descriptor.available)
            .and_then(|e| e.instance.clone())
    }

    pub fn descriptor(&self, name: &str) -> Option<CollectorDescriptor> {
        self.read().get(name).map(|e| e.descriptor.clone())
    }

    pub fn supports_target(&self, name: &str, kind: TargetKind) -> bool {
        self.read()
            .get(name)
            .is_some_and(|e| e.descriptor.available && e.descriptor.supports_target(kind))
    }

    /// Available descriptors, sorted by name.
    pub fn list(&self) -> Vec<CollectorDescriptor> {
        self.read()
            .values()
            .filter(|e| e.descriptor.available)
            .map(|e| e.descriptor.clone())
            .collect()
    }

    /// Every descriptor, including unavailable ones. For diagnostics.
    pub fn list_all(&self) -> Vec<CollectorDescriptor> {
        self.read().values().map(|e| e.descriptor.clone()).collect()
    }

    /// Module name → availability.
    pub fn status(&self) -> BTreeMap<String, bool> {
        self.read()
            .iter()
            .map(|(name, e)| (name.clone(), e.descriptor.available))
            .collect()
    }

    /// Picks the tier-1 collector for a target kind.
    ///
    /// A collector named after the kind wins; otherwise the first available
    /// collector (by name) that supports the kind.
    pub fn find_for_target(
        &self,
        kind: TargetKind,
        exclude: &BTreeSet<String>,
    ) -> Option<(String, Arc<dyn Collector>)> {
        let entries = self.read();
        let usable = |name: &String, e: &Entry| {
            e.descriptor.available && e.descriptor.supports_target(kind) && !exclude.contains(name)
        };

        let by_name = entries
            .get_key_value(kind.as_str())
            .filter(|&(name, e)| usable(name, e));
        let chosen = by_name.or_else(|| entries.iter().find(|&(name, e)| usable(name, e)));

        chosen.and_then(|(name, e)| e.instance.clone().map(|i| (name.clone(), i)))
    }

    /// Available collectors that accept `kind` at `depth`, sorted by name.
    pub fn candidates(&self, kind: TargetKind, depth: u8) -> Vec<(String, Arc<dyn Collector>)> {
        self.read()
            .iter()
            .filter(|(_, e)| {
                e.descriptor.available
                    && e.descriptor.supports_target(kind)
                    && e.descriptor.supports_depth(depth)
            })
            .filter_map(|(name, e)| e.instance.clone().map(|i| (name.clone(), i)))
            .collect()
    }

    /// Removes every entry that came from `source` and returns their names.
    pub fn unregister_source(&self, source: ModuleSource) -> Vec<String> {
        let mut entries = self.write();
        let removed: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.descriptor.source == source)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &removed {
            entries.remove(name);
        }
        debug!(count = removed.len(), source = ?source, "Unregistered collectors");
        removed
    }

    /// Number of available collectors.
    pub fn len(&self) -> usize {
        self.read().values().filter(|e| e.descriptor.available).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Tests
// ============================================================================
