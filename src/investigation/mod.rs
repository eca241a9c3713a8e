//! Investigation module - the depth-tiered orchestration pipeline.
//!
//! - **Pipeline**: [`InvestigationOrchestrator`] runs direct, cross-platform
//!   and enrichment tiers and persists the frozen result
//! - **State**: the in-progress result and its state machine

pub mod pipeline;
mod state;

pub use pipeline::{InvestigationOrchestrator, OrchestratorConfig, OrchestratorError};
