//! Contracts consumed by the orchestration core.
//!
//! Every collector, built-in or plugin, implements [`Collector`]; tier-3
//! analysis collaborators implement [`Enricher`].

use crate::model::{InvestigationResult, TargetKind, MAX_DEPTH, MIN_DEPTH};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use thiserror::Error;

/// Failure reported by a collector or enricher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollectorError {
    #[error("Target kind '{0}' is not supported")]
    UnsupportedTarget(TargetKind),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// Upstream service refused or throttled the request
    #[error("Upstream rejected request: {0}")]
    Upstream(String),

    #[error("Collector failed: {0}")]
    Failed(String),
}

impl From<std::io::Error> for CollectorError {
    fn from(e: std::io::Error) -> Self {
        CollectorError::Failed(e.to_string())
    }
}

/// Text of a caught panic, for recording a panicking collector or factory as a failure.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// What a collector can investigate.
///
/// Checked once at registration time; the orchestrator never queries a
/// collector for methods at call time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub target_kinds: BTreeSet<TargetKind>,
    pub depth_levels: BTreeSet<u8>,
}

impl Capabilities {
    pub fn new(
        target_kinds: impl IntoIterator<Item = TargetKind>,
        depth_levels: impl IntoIterator<Item = u8>,
    ) -> Self {
        Self {
            target_kinds: target_kinds.into_iter().collect(),
            depth_levels: depth_levels.into_iter().collect(),
        }
    }

    pub fn supports_kind(&self, kind: TargetKind) -> bool {
        self.target_kinds.contains(&kind)
    }

    pub fn supports_depth(&self, depth: u8) -> bool {
        self.depth_levels.contains(&depth)
    }

    /// Deepest supported level not exceeding `requested`.
    pub fn effective_depth(&self, requested: u8) -> Option<u8> {
        self.depth_levels.range(..=requested).next_back().copied()
    }

    /// `true` when every kind and depth in `declared` is also in `self`.
    pub fn covers(&self, declared: &Capabilities) -> bool {
        declared.target_kinds.is_subset(&self.target_kinds)
            && declared.depth_levels.is_subset(&self.depth_levels)
    }

    /// Human-readable reason this capability set cannot be registered.
    pub fn problem(&self) -> Option<String> {
        if self.target_kinds.is_empty() {
            return Some("no target kinds declared".to_string());
        }
        if self.depth_levels.is_empty() {
            return Some("no depth levels declared".to_string());
        }
        self.depth_levels
            .iter()
            .find(|d| !(MIN_DEPTH..=MAX_DEPTH).contains(*d))
            .map(|d| format!("depth level {} outside {}..={}", d, MIN_DEPTH, MAX_DEPTH))
    }
}

#[async_trait]
pub trait Collector: Send + Sync {
    /// Unique name this collector registers under (e.g., "email", "twitter").
    fn name(&self) -> &str;

    /// Investigates `target` and returns whatever the collector found.
    async fn investigate(
        &self,
        target: &str,
        kind: TargetKind,
        depth: u8,
    ) -> Result<Value, CollectorError>;

    fn capabilities(&self) -> Capabilities;
}

/// Tier-3 analysis collaborator (AI analysis, risk scoring, ...).
#[async_trait]
pub trait Enricher: Send + Sync {
    fn name(&self) -> &str;

    /// Derives additional findings from an in-progress result.
    async fn enrich(&self, result: &InvestigationResult) -> Result<Value, CollectorError>;
}
