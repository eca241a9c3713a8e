//! Mock collectors shared by the unit tests.

use crate::model::{InvestigationResult, TargetKind};
use crate::traits::{Capabilities, Collector, CollectorError, Enricher};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// What a [`MockCollector`] does when called.
#[derive(Clone)]
pub enum Behavior {
    Return(Value),
    Fail(String),
    /// Never completes within any reasonable test timeout
    Hang,
    Sleep(Duration, Value),
    Panic,
}

/// Configurable collector that counts and records its calls.
pub struct MockCollector {
    name: String,
    capabilities: Capabilities,
    behavior: Behavior,
    calls: AtomicUsize,
    seen: Mutex<Vec<(String, TargetKind, u8)>>,
    starts: Mutex<Vec<Instant>>,
}

impl MockCollector {
    pub fn new(name: &str, kinds: &[TargetKind], behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            capabilities: Capabilities::new(kinds.iter().copied(), [1, 2, 3]),
            behavior,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            starts: Mutex::new(Vec::new()),
        })
    }

    pub fn returning(name: &str, kinds: &[TargetKind], data: Value) -> Arc<Self> {
        Self::new(name, kinds, Behavior::Return(data))
    }

    pub fn empty(name: &str, kinds: &[TargetKind]) -> Arc<Self> {
        Self::returning(name, kinds, json!({}))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<(String, TargetKind, u8)> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// When each call began, in call order.
    pub fn starts(&self) -> Vec<Instant> {
        self.starts.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Collector for MockCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn investigate(
        &self,
        target: &str,
        kind: TargetKind,
        depth: u8,
    ) -> Result<Value, CollectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut starts) = self.starts.lock() {
            starts.push(Instant::now());
        }
        if let Ok(mut seen) = self.seen.lock() {
            seen.push((target.to_string(), kind, depth));
        }
        match &self.behavior {
            Behavior::Return(data) => Ok(data.clone()),
            Behavior::Fail(reason) => Err(CollectorError::Failed(reason.clone())),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Value::Null)
            }
            Behavior::Sleep(delay, data) => {
                tokio::time::sleep(*delay).await;
                Ok(data.clone())
            }
            Behavior::Panic => panic!("mock collector '{}' panicked", self.name),
        }
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }
}

/// Enricher that reports how many identifiers it was shown.
pub struct CountingEnricher {
    name: String,
    fail: bool,
    calls: AtomicUsize,
}

impl CountingEnricher {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self { name: name.to_string(), fail: false, calls: AtomicUsize::new(0) })
    }

    pub fn failing(name: &str) -> Arc<Self> {
        Arc::new(Self { name: name.to_string(), fail: true, calls: AtomicUsize::new(0) })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Enricher for CountingEnricher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enrich(&self, result: &InvestigationResult) -> Result<Value, CollectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(CollectorError::Failed("model unavailable".into()));
        }
        Ok(json!({
            "identifiers": result.identifiers.len(),
            "modules": result.per_module_results.len(),
        }))
    }
}

/// Writes an executable `/bin/sh` script and returns its path.
#[cfg(unix)]
pub fn write_script(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
