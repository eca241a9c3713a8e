//! In-progress investigation state.
//!
//! An [`InvestigationRun`] owns the result while tiers execute. Only the
//! orchestrator task writes to it; tier-2 tasks hand their outcomes back
//! through a join set, so every per-module and per-identifier slot has a
//! single writer.

use crate::model::{
    CrossPlatformEntry, InvestigationId, InvestigationRequest, InvestigationResult,
    InvestigationState, ModuleOutcome,
};
use crate::traits::Collector;
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

/// The collector tier 1 used, kept for retries and fan-out exclusion.
#[derive(Clone)]
pub(crate) struct DirectCall {
    pub module: String,
    pub collector: Arc<dyn Collector>,
    pub depth: u8,
}

pub(crate) struct InvestigationRun {
    result: InvestigationResult,
    direct: Option<DirectCall>,
}

impl InvestigationRun {
    pub fn new(request: InvestigationRequest) -> Self {
        Self {
            result: InvestigationResult::new(InvestigationId::new(), request),
            direct: None,
        }
    }

    pub fn id(&self) -> InvestigationId {
        self.result.id
    }

    pub fn request(&self) -> &InvestigationRequest {
        &self.result.request
    }

    pub fn result(&self) -> &InvestigationResult {
        &self.result
    }

    pub fn result_mut(&mut self) -> &mut InvestigationResult {
        &mut self.result
    }

    pub fn state(&self) -> InvestigationState {
        self.result.state
    }

    /// Moves the state machine forward.
    ///
    /// An illegal transition is an orchestrator defect; the returned message
    /// becomes an `OrchestratorError::Fault`.
    pub fn advance(&mut self, next: InvestigationState) -> Result<(), String> {
        let current = self.result.state;
        if !current.can_transition_to(next) {
            return Err(format!("illegal state transition {} -> {}", current, next));
        }
        debug!(investigation_id = %self.result.id, from = %current, to = %next, "State transition");
        self.result.state = next;
        match next {
            InvestigationState::Tier1 => self.result.tiers_run.push(1),
            InvestigationState::Tier2 => self.result.tiers_run.push(2),
            InvestigationState::Tier3 => self.result.tiers_run.push(3),
            _ => {}
        }
        Ok(())
    }

    pub fn direct(&self) -> Option<&DirectCall> {
        self.direct.as_ref()
    }

    pub fn record_direct(&mut self, call: DirectCall, outcome: ModuleOutcome) {
        self.result.per_module_results.insert(call.module.clone(), outcome);
        self.direct = Some(call);
    }

    /// Outcome tier 1 recorded, if it ran a collector.
    pub fn direct_outcome(&self) -> Option<&ModuleOutcome> {
        let module = &self.direct.as_ref()?.module;
        self.result.per_module_results.get(module)
    }

    pub fn replace_direct_outcome(&mut self, outcome: ModuleOutcome) {
        if let Some(call) = &self.direct {
            self.result.per_module_results.insert(call.module.clone(), outcome);
        }
    }

    /// Stores tier-2 outcomes in a deterministic order.
    pub fn record_cross_platform(&mut self, mut entries: Vec<CrossPlatformEntry>) {
        entries.sort_by(|a, b| {
            (a.module.as_str(), &a.identifier).cmp(&(b.module.as_str(), &b.identifier))
        });
        self.result.cross_platform_results = entries;
    }

    pub fn record_enrichment(&mut self, enricher: &str, outcome: ModuleOutcome) {
        self.result.enrichment.insert(enricher.to_string(), outcome);
    }

    pub fn has_direct_success(&self) -> bool {
        self.result.per_module_results.values().any(ModuleOutcome::is_success)
    }

    /// Completes the run and hands the result out, frozen.
    pub fn complete(mut self, cancelled: bool) -> Result<Arc<InvestigationResult>, (String, Self)> {
        if let Err(reason) = self.advance(InvestigationState::Completed) {
            return Err((reason, self));
        }
        self.result.cancelled = cancelled;
        self.result.completed_at = Some(Utc::now());
        Ok(Arc::new(self.result))
    }

    /// Marks the run failed and freezes whatever it gathered.
    pub fn fail(mut self, cancelled: bool) -> Arc<InvestigationResult> {
        if !self.result.state.is_terminal() {
            self.result.state = InvestigationState::Failed;
        }
        self.result.cancelled = cancelled;
        self.result.completed_at = Some(Utc::now());
        Arc::new(self.result)
    }
}
