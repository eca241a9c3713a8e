//! Three-tier investigation pipeline.
//!
//! [`InvestigationOrchestrator`] drives one investigation through:
//! 1. **Direct**: the collector matching the target kind
//! 2. **Cross-platform** (depth ≥ 2): identifiers extracted from tier-1 output,
//!    fanned out concurrently to every other collector that accepts them
//! 3. **Enrichment** (depth ≥ 3): external analysis over the accumulated result
//!
//! Collector failures, timeouts and panics are recorded and never abort the
//! run. Only orchestrator defects (illegal state transitions, a failed
//! fan-out task, a store error) end an investigation in `Failed`.

use crate::correlation::{CorrelationEngine, IdentifierSet, SEED_CONFIDENCE};
use crate::executor::ConcurrencyController;
use crate::investigation::state::{DirectCall, InvestigationRun};
use crate::model::{
    CrossPlatformEntry, Identifier, InvestigationId, InvestigationRequest,
    InvestigationResult, InvestigationState, ModuleOutcome, Provenance, RequestError, MIN_DEPTH,
};
use crate::registry::ModuleRegistry;
use crate::store::InvestigationStore;
use crate::traits::{Collector, Enricher};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Depth at which tier-2 calls are made.
const FAN_OUT_DEPTH: u8 = 1;

/// Provenance module name for the request's own target when it seeds fan-out.
const SEED_MODULE: &str = "request";

// ============================================================================
// Configuration & errors
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Distinct identifier values fanned out per kind (default: 5)
    pub max_identifiers_per_kind: usize,

    /// Extra attempts for a timed-out tier-1 call, made at the start of tier 2 (default: 1)
    pub max_timeout_retries: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_identifiers_per_kind: 5,
            max_timeout_retries: 1,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum OrchestratorError {
    /// Rejected before any tier ran
    #[error("Invalid investigation request: {0}")]
    InvalidRequest(#[from] RequestError),

    /// Internal defect; `partial` holds what was gathered, frozen as `Failed`
    #[error("Investigation {id} failed: {reason}")]
    Fault {
        id: InvestigationId,
        reason: String,
        partial: Arc<InvestigationResult>,
    },
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct InvestigationOrchestrator {
    registry: Arc<ModuleRegistry>,
    controller: Arc<ConcurrencyController>,
    store: Arc<dyn InvestigationStore>,
    engine: CorrelationEngine,
    enrichers: Vec<Arc<dyn Enricher>>,
    config: OrchestratorConfig,
}

impl std::fmt::Debug for InvestigationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvestigationOrchestrator")
            .field("registry", &self.registry)
            .field("controller", &self.controller)
            .field("enrichers", &self.enrichers.iter().map(|e| e.name()).collect::<Vec<_>>())
            .field("config", &self.config)
            .finish()
    }
}

impl InvestigationOrchestrator {
    pub fn new(
        registry: Arc<ModuleRegistry>,
        controller: Arc<ConcurrencyController>,
        store: Arc<dyn InvestigationStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            controller,
            store,
            engine: CorrelationEngine::new(),
            enrichers: Vec::new(),
            config,
        }
    }

    /// Adds a tier-3 collaborator. Enrichers run in the order they were added.
    pub fn with_enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enrichers.push(enricher);
        self
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn InvestigationStore> {
        &self.store
    }

    /// Runs an investigation to completion.
    pub async fn start(
        &self,
        request: InvestigationRequest,
    ) -> Result<Arc<InvestigationResult>, OrchestratorError> {
        self.start_with_cancel(request, CancellationToken::new()).await
    }

    /// Runs an investigation that stops scheduling work once `cancel` fires.
    ///
    /// A cancelled investigation still completes: it is finalized with
    /// `cancelled = true`, persisted and returned.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::InvalidRequest`] if the request is malformed
    /// - [`OrchestratorError::Fault`] on an internal defect or store failure
    #[instrument(
        skip(self, request, cancel),
        fields(target_kind = %request.target_kind, depth = request.depth)
    )]
    pub async fn start_with_cancel(
        &self,
        request: InvestigationRequest,
        cancel: CancellationToken,
    ) -> Result<Arc<InvestigationResult>, OrchestratorError> {
        request.validate()?;
        let started = Instant::now();
        let mut run = InvestigationRun::new(request);
        let id = run.id();
        info!(investigation_id = %id, "Investigation started");

        if let Err(reason) = self.run_tiers(&mut run, &cancel).await {
            return Err(self.fault(run, reason, &cancel).await);
        }

        let result = match run.complete(cancel.is_cancelled()) {
            Ok(result) => result,
            Err((reason, run)) => return Err(self.fault(run, reason, &cancel).await),
        };

        if let Err(e) = self.store.save(result.clone()).await {
            let reason = format!("failed to persist result: {}", e);
            error!(investigation_id = %id, error = %e, "Investigation could not be stored");
            let mut partial = (*result).clone();
            partial.state = InvestigationState::Failed;
            return Err(OrchestratorError::Fault {
                id,
                reason,
                partial: Arc::new(partial),
            });
        }

        info!(
            investigation_id = %id,
            modules = result.per_module_results.len(),
            cross_platform = result.cross_platform_results.len(),
            identifiers = result.identifiers.len(),
            edges = result.correlation_edges.len(),
            cancelled = result.cancelled,
            duration_ms = started.elapsed().as_millis() as u64,
            "Investigation completed"
        );
        Ok(result)
    }

    async fn fault(
        &self,
        run: InvestigationRun,
        reason: String,
        cancel: &CancellationToken,
    ) -> OrchestratorError {
        let id = run.id();
        error!(investigation_id = %id, state = %run.state(), reason = %reason, "Orchestrator fault");
        let partial = run.fail(cancel.is_cancelled());
        if let Err(e) = self.store.save(partial.clone()).await {
            warn!(investigation_id = %id, error = %e, "Partial result could not be stored");
        }
        OrchestratorError::Fault { id, reason, partial }
    }

    async fn run_tiers(&self, run: &mut InvestigationRun, cancel: &CancellationToken) -> Result<(), String> {
        run.advance(InvestigationState::Tier1)?;
        self.direct_tier(run, cancel).await;

        if run.request().runs_cross_platform() && !cancel.is_cancelled() {
            run.advance(InvestigationState::Tier2)?;
            self.cross_platform_tier(run, cancel).await?;
        }

        self.correlate(run);

        let enrich = run.request().runs_enrichment() && run.request().options.enrichment;
        if enrich && !cancel.is_cancelled() {
            run.advance(InvestigationState::Tier3)?;
            self.enrichment_tier(run, cancel).await;
        }

        run.advance(InvestigationState::Finalizing)?;
        self.correlate(run);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Tier 1
    // ------------------------------------------------------------------------

    async fn direct_tier(&self, run: &mut InvestigationRun, cancel: &CancellationToken) {
        let request = run.request().clone();
        let Some((module, collector)) = self
            .registry
            .find_for_target(request.target_kind, &request.options.exclude_modules)
        else {
            info!(
                investigation_id = %run.id(),
                target_kind = %request.target_kind,
                "No collector for target kind; target seeds fan-out"
            );
            return;
        };

        let depth = collector
            .capabilities()
            .effective_depth(request.depth)
            .unwrap_or(MIN_DEPTH);
        let report = self
            .controller
            .invoke(&module, collector.clone(), &request.target_value, request.target_kind, depth, cancel)
            .await;
        info!(investigation_id = %run.id(), module = %module, outcome = ?report.outcome, "Direct investigation finished");

        run.record_direct(
            DirectCall { module, collector, depth },
            report.into_module_outcome(),
        );
    }

    /// Re-runs a timed-out tier-1 call. Hard failures are never retried.
    async fn retry_direct(&self, run: &mut InvestigationRun, cancel: &CancellationToken) {
        let Some(call) = run.direct().cloned() else {
            return;
        };
        let request = run.request().clone();

        for attempt in 1..=self.config.max_timeout_retries {
            let timed_out = run.direct_outcome().is_some_and(ModuleOutcome::is_timeout);
            if !timed_out || cancel.is_cancelled() {
                break;
            }
            warn!(investigation_id = %run.id(), module = %call.module, attempt, "Retrying timed-out direct investigation");
            let report = self
                .controller
                .invoke(
                    &call.module,
                    call.collector.clone(),
                    &request.target_value,
                    request.target_kind,
                    call.depth,
                    cancel,
                )
                .await;
            run.replace_direct_outcome(report.into_module_outcome());
        }
    }

    // ------------------------------------------------------------------------
    // Tier 2
    // ------------------------------------------------------------------------

    /// Identifiers tier 2 fans out on, capped per kind.
    fn fan_out_identifiers(&self, run: &InvestigationRun) -> Vec<Identifier> {
        let mut identifiers: IdentifierSet = self.engine.extract_identifiers(run.result());

        if !run.has_direct_success() {
            let request = run.request();
            if let Some(kind) = request.target_kind.identifier_kind() {
                identifiers.extend(Identifier::new(
                    kind,
                    &request.target_value,
                    SEED_CONFIDENCE,
                    Provenance::direct(SEED_MODULE),
                ));
            }
        }

        identifiers.select_for_fan_out(self.config.max_identifiers_per_kind)
    }

    async fn cross_platform_tier(
        &self,
        run: &mut InvestigationRun,
        cancel: &CancellationToken,
    ) -> Result<(), String> {
        self.retry_direct(run, cancel).await;

        let identifiers = self.fan_out_identifiers(run);
        let excluded = &run.request().options.exclude_modules;
        let direct_module = run.direct().map(|call| call.module.clone());

        let mut tasks = JoinSet::new();
        for identifier in &identifiers {
            let key = identifier.key();
            let kind = key.kind.target_kind();
            for (module, collector) in self.registry.candidates(kind, FAN_OUT_DEPTH) {
                if direct_module.as_deref() == Some(module.as_str()) || excluded.contains(&module) {
                    continue;
                }
                let controller = self.controller.clone();
                let cancel = cancel.clone();
                let key = key.clone();
                tasks.spawn(async move {
                    let report = controller
                        .invoke(&module, collector, &key.value, kind, FAN_OUT_DEPTH, &cancel)
                        .await;
                    (module, key, report)
                });
            }
        }

        info!(
            investigation_id = %run.id(),
            identifiers = identifiers.len(),
            calls = tasks.len(),
            "Cross-platform fan-out scheduled"
        );

        // Every call settles on its own once cancelled: queued calls return at
        // once, running ones within the controller's grace period.
        let mut entries = Vec::with_capacity(tasks.len());
        let mut cancel_seen = false;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled(), if !cancel_seen => None,
                joined = tasks.join_next() => Some(joined),
            };
            match next {
                None => {
                    cancel_seen = true;
                    warn!(
                        investigation_id = %run.id(),
                        in_flight = tasks.len(),
                        grace_ms = self.controller.config().cancellation_grace.as_millis() as u64,
                        "Investigation cancelled; waiting for in-flight calls"
                    );
                }
                Some(Some(joined)) => {
                    let (module, identifier, report) =
                        joined.map_err(|e| format!("fan-out task failed: {}", e))?;
                    entries.push(CrossPlatformEntry {
                        module,
                        identifier,
                        outcome: report.into_module_outcome(),
                    });
                }
                Some(None) => break,
            }
        }

        run.record_cross_platform(entries);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Tier 3
    // ------------------------------------------------------------------------

    async fn enrichment_tier(&self, run: &mut InvestigationRun, cancel: &CancellationToken) {
        for enricher in &self.enrichers {
            if cancel.is_cancelled() {
                break;
            }
            let snapshot = Arc::new(run.result().clone());
            let report = self
                .controller
                .invoke_enricher(enricher.clone(), snapshot, cancel)
                .await;
            run.record_enrichment(enricher.name(), report.into_module_outcome());
        }
    }

    /// Rebuilds identifiers and edges from everything collected so far.
    fn correlate(&self, run: &mut InvestigationRun) {
        let identifiers = self.engine.extract_identifiers(run.result()).into_vec();
        let edges = self.engine.correlate(&identifiers);
        let result = run.result_mut();
        result.identifiers = identifiers;
        result.correlation_edges = edges;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ControllerConfig;
    use crate::model::{Coverage, IdentifierKind, InvestigationOptions, TargetKind};
    use crate::registry::ModuleSource;
    use crate::store::{MemoryStore, StoreError};
    use crate::test_support::{Behavior, CountingEnricher, MockCollector};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    const USERNAME_AND_DOMAIN: &[TargetKind] = &[TargetKind::Username, TargetKind::Domain];

    fn controller(request_timeout: Duration) -> Arc<ConcurrencyController> {
        Arc::new(ConcurrencyController::new(ControllerConfig {
            max_concurrent_requests: 10,
            rate_limit_delay: Duration::ZERO,
            request_timeout,
            cancellation_grace: Duration::from_millis(100),
        }))
    }

    fn orchestrator(
        registry: &Arc<ModuleRegistry>,
        store: &Arc<MemoryStore>,
        request_timeout: Duration,
        config: OrchestratorConfig,
    ) -> InvestigationOrchestrator {
        InvestigationOrchestrator::new(
            registry.clone(),
            controller(request_timeout),
            store.clone(),
            config,
        )
    }

    fn register(registry: &ModuleRegistry, collector: &Arc<MockCollector>) {
        registry
            .register(collector.clone(), ModuleSource::BuiltIn)
            .unwrap();
    }

    fn email_request(depth: u8) -> InvestigationRequest {
        InvestigationRequest::new(TargetKind::Email, "a@b.com", depth).unwrap()
    }

    fn fan_out_targets(result: &InvestigationResult, module: &str) -> Vec<String> {
        result
            .cross_platform_results
            .iter()
            .filter(|e| e.module == module)
            .map(|e| e.identifier.to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_depth_gates_tiers() {
        for depth in 1..=3u8 {
            let registry = Arc::new(ModuleRegistry::new());
            let store = Arc::new(MemoryStore::new());
            let email =
                MockCollector::returning("email", &[TargetKind::Email], json!({"username": "foo"}));
            let github = MockCollector::empty("github", &[TargetKind::Username]);
            register(&registry, &email);
            register(&registry, &github);
            let enricher = CountingEnricher::new("risk");

            let result = orchestrator(&registry, &store, Duration::from_secs(5), OrchestratorConfig::default())
                .with_enricher(enricher.clone())
                .start(email_request(depth))
                .await
                .unwrap();

            assert_eq!(email.calls(), 1, "depth {}", depth);
            assert_eq!(email.seen()[0].2, depth);
            assert_eq!(github.calls(), usize::from(depth >= 2), "depth {}", depth);
            assert_eq!(enricher.calls(), usize::from(depth >= 3), "depth {}", depth);
            assert_eq!(result.tiers_run, (1..=depth).collect::<Vec<_>>());
            assert_eq!(result.state, InvestigationState::Completed);
            assert!(result.completed_at.is_some());
        }
    }

    #[tokio::test]
    async fn test_depth_one_email_scenario() {
        let registry = Arc::new(ModuleRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let email = MockCollector::returning(
            "email",
            &[TargetKind::Email],
            json!({"username": "foo", "domain": "b.com"}),
        );
        register(&registry, &email);

        let result = orchestrator(&registry, &store, Duration::from_secs(5), OrchestratorConfig::default())
            .start(email_request(1))
            .await
            .unwrap();

        assert_eq!(result.per_module_results.keys().collect::<Vec<_>>(), vec!["email"]);
        assert!(result.per_module_results["email"].is_success());
        assert!(result.cross_platform_results.is_empty());
        assert_eq!(result.identifiers.len(), 2);
        assert_eq!(result.correlation_edges.len(), 1);
        assert_eq!(result.coverage(), Coverage::DataFound);

        let stored = store.get(&result.id).await.unwrap().unwrap();
        assert_eq!(stored.as_ref(), result.as_ref());
    }

    #[tokio::test]
    async fn test_depth_two_fans_out_to_every_other_collector() {
        let registry = Arc::new(ModuleRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let email = MockCollector::returning(
            "email",
            &[TargetKind::Email],
            json!({"username": "foo", "domain": "b.com"}),
        );
        let alpha = MockCollector::returning(
            "alpha",
            USERNAME_AND_DOMAIN,
            json!({"profile": "https://alpha.example/foo"}),
        );
        let beta = MockCollector::new("beta", USERNAME_AND_DOMAIN, Behavior::Fail("HTTP 500".into()));
        let gamma = MockCollector::empty("gamma", USERNAME_AND_DOMAIN);
        for collector in [&email, &alpha, &beta, &gamma] {
            register(&registry, collector);
        }

        let result = orchestrator(&registry, &store, Duration::from_secs(5), OrchestratorConfig::default())
            .start(email_request(2))
            .await
            .unwrap();

        assert_eq!(result.cross_platform_results.len(), 6);
        for (module, collector) in [("alpha", &alpha), ("beta", &beta), ("gamma", &gamma)] {
            assert_eq!(collector.calls(), 2);
            assert_eq!(
                fan_out_targets(&result, module),
                vec!["username:foo", "domain:b.com"]
            );
        }
        assert_eq!(email.calls(), 1);
        assert!(result
            .cross_platform_results
            .iter()
            .filter(|e| e.module == "beta")
            .all(|e| e.outcome == ModuleOutcome::Failure { error: "Collector failed: HTTP 500".into() }));
        assert!(result
            .cross_platform_results
            .iter()
            .filter(|e| e.module != "beta")
            .all(|e| e.outcome.is_success()));

        // Tier-2 output is correlated too
        assert!(result
            .identifiers
            .iter()
            .any(|i| i.kind == IdentifierKind::Domain && i.value == "alpha.example"));
    }

    #[tokio::test]
    async fn test_fan_out_caps_identifiers_per_kind() {
        let registry = Arc::new(ModuleRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let usernames: Vec<String> = (0..8).map(|i| format!("user{}", i)).collect();
        let email =
            MockCollector::returning("email", &[TargetKind::Email], json!({ "usernames": usernames }));
        let github = MockCollector::empty("github", &[TargetKind::Username]);
        register(&registry, &email);
        register(&registry, &github);

        let result = orchestrator(&registry, &store, Duration::from_secs(5), OrchestratorConfig::default())
            .start(email_request(2))
            .await
            .unwrap();

        assert_eq!(github.calls(), 5);
        let mut seen: Vec<String> = github.seen().into_iter().map(|(target, _, _)| target).collect();
        seen.sort();
        assert_eq!(seen, vec!["user0", "user1", "user2", "user3", "user4"]);
        assert_eq!(result.cross_platform_results.len(), 5);
        // Extraction still reports everything it found
        assert_eq!(result.identifiers.len(), 8);
    }

    #[tokio::test]
    async fn test_hanging_collector_does_not_delay_siblings() {
        let registry = Arc::new(ModuleRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let email =
            MockCollector::returning("email", &[TargetKind::Email], json!({"username": "foo"}));
        let slow = MockCollector::new("slow", &[TargetKind::Username], Behavior::Hang);
        let fast = MockCollector::returning("fast", &[TargetKind::Username], json!({"ok": true}));
        for collector in [&email, &slow, &fast] {
            register(&registry, collector);
        }

        let started = Instant::now();
        let result = orchestrator(&registry, &store, Duration::from_millis(300), OrchestratorConfig::default())
            .start(email_request(2))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));

        let outcome = |module: &str| {
            result
                .cross_platform_results
                .iter()
                .find(|e| e.module == module)
                .map(|e| e.outcome.clone())
                .unwrap()
        };
        assert_eq!(outcome("slow"), ModuleOutcome::Timeout { after_ms: 300 });
        match outcome("fast") {
            ModuleOutcome::Success { elapsed_ms, .. } => assert!(elapsed_ms < 300),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(result.state, InvestigationState::Completed);
    }

    #[tokio::test]
    async fn test_failed_direct_call_seeds_fan_out_with_target() {
        let registry = Arc::new(ModuleRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let email = MockCollector::new("email", &[TargetKind::Email], Behavior::Fail("blocked".into()));
        let breach = MockCollector::empty("breach", &[TargetKind::Email]);
        register(&registry, &email);
        register(&registry, &breach);

        let result = orchestrator(&registry, &store, Duration::from_secs(5), OrchestratorConfig::default())
            .start(email_request(2))
            .await
            .unwrap();

        assert!(matches!(
            result.per_module_results["email"],
            ModuleOutcome::Failure { .. }
        ));
        assert_eq!(breach.seen(), vec![("a@b.com".to_string(), TargetKind::Email, 1)]);
        assert_eq!(fan_out_targets(&result, "breach"), vec!["email:a@b.com"]);
        assert_eq!(result.coverage(), Coverage::NoDataFound);
        assert_eq!(result.state, InvestigationState::Completed);
    }

    #[tokio::test]
    async fn test_panicking_collector_is_recorded_as_failure() {
        let registry = Arc::new(ModuleRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let github = MockCollector::new("github", &[TargetKind::Username], Behavior::Panic);
        register(&registry, &github);

        let request = InvestigationRequest::new(TargetKind::Username, "foo", 1).unwrap();
        let result = orchestrator(&registry, &store, Duration::from_secs(5), OrchestratorConfig::default())
            .start(request)
            .await
            .unwrap();

        match &result.per_module_results["github"] {
            ModuleOutcome::Failure { error } => assert!(error.contains("panicked"), "{}", error),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(result.state, InvestigationState::Completed);
    }

    #[tokio::test]
    async fn test_no_matching_collector_still_completes() {
        let registry = Arc::new(ModuleRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let email = MockCollector::empty("email", &[TargetKind::Email]);
        register(&registry, &email);

        let request = InvestigationRequest::new(TargetKind::Wallet, "bc1qxy2kgdygjrsqtzq2n0yrf2493p83kkfjhx0wlh", 2).unwrap();
        let result = orchestrator(&registry, &store, Duration::from_secs(5), OrchestratorConfig::default())
            .start(request)
            .await
            .unwrap();

        assert!(result.per_module_results.is_empty());
        assert!(result.cross_platform_results.is_empty());
        assert_eq!(result.coverage(), Coverage::NoCollectorAttempted);
        assert_eq!(result.tiers_run, vec![1, 2]);
        assert_eq!(email.calls(), 0);
    }

    #[tokio::test]
    async fn test_direct_timeout_is_retried_only_in_tier_two() {
        for (depth, expected_calls) in [(1u8, 1usize), (2, 2)] {
            let registry = Arc::new(ModuleRegistry::new());
            let store = Arc::new(MemoryStore::new());
            let email = MockCollector::new("email", &[TargetKind::Email], Behavior::Hang);
            register(&registry, &email);

            let result = orchestrator(&registry, &store, Duration::from_millis(100), OrchestratorConfig::default())
                .start(email_request(depth))
                .await
                .unwrap();

            assert_eq!(email.calls(), expected_calls, "depth {}", depth);
            assert!(result.per_module_results["email"].is_timeout());
        }
    }

    #[tokio::test]
    async fn test_hard_failure_is_not_retried() {
        let registry = Arc::new(ModuleRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let email = MockCollector::new("email", &[TargetKind::Email], Behavior::Fail("nope".into()));
        register(&registry, &email);

        orchestrator(&registry, &store, Duration::from_secs(5), OrchestratorConfig::default())
            .start(email_request(2))
            .await
            .unwrap();
        assert_eq!(email.calls(), 1);
    }

    #[tokio::test]
    async fn test_excluded_modules_are_skipped() {
        let registry = Arc::new(ModuleRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let email =
            MockCollector::returning("email", &[TargetKind::Email], json!({"username": "foo"}));
        let github = MockCollector::empty("github", &[TargetKind::Username]);
        let twitter = MockCollector::empty("twitter", &[TargetKind::Username]);
        for collector in [&email, &github, &twitter] {
            register(&registry, collector);
        }

        let options = InvestigationOptions {
            exclude_modules: ["twitter".to_string()].into_iter().collect(),
            ..InvestigationOptions::default()
        };
        let result = orchestrator(&registry, &store, Duration::from_secs(5), OrchestratorConfig::default())
            .start(email_request(2).with_options(options))
            .await
            .unwrap();

        assert_eq!(github.calls(), 1);
        assert_eq!(twitter.calls(), 0);
        assert_eq!(result.cross_platform_results.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let registry = Arc::new(ModuleRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let email =
            MockCollector::returning("email", &[TargetKind::Email], json!({"username": "foo"}));
        register(&registry, &email);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = orchestrator(&registry, &store, Duration::from_secs(5), OrchestratorConfig::default())
            .start_with_cancel(email_request(3), cancel)
            .await
            .unwrap();

        assert_eq!(email.calls(), 0);
        assert_eq!(result.per_module_results["email"], ModuleOutcome::Cancelled);
        assert_eq!(result.coverage(), Coverage::NoCollectorAttempted);
        assert!(result.cancelled);
        assert_eq!(result.tiers_run, vec![1]);
        assert_eq!(result.state, InvestigationState::Completed);
        assert!(store.get(&result.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cancellation_during_direct_call_ends_after_grace() {
        let registry = Arc::new(ModuleRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let email = MockCollector::new("email", &[TargetKind::Email], Behavior::Hang);
        let github = MockCollector::empty("github", &[TargetKind::Username]);
        register(&registry, &email);
        register(&registry, &github);
        let enricher = CountingEnricher::new("risk");

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = orchestrator(&registry, &store, Duration::from_secs(5), OrchestratorConfig::default())
            .with_enricher(enricher.clone())
            .start_with_cancel(email_request(3), cancel)
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
        assert_eq!(email.calls(), 1);
        assert_eq!(result.per_module_results["email"], ModuleOutcome::Cancelled);
        assert_eq!(github.calls(), 0);
        assert_eq!(enricher.calls(), 0);
        assert_eq!(result.tiers_run, vec![1]);
        assert!(result.cancelled);
        assert_eq!(result.state, InvestigationState::Completed);
    }

    #[tokio::test]
    async fn test_cancellation_during_fan_out_abandons_in_flight_calls() {
        let registry = Arc::new(ModuleRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let email =
            MockCollector::returning("email", &[TargetKind::Email], json!({"username": "foo"}));
        let slow = MockCollector::new("slow", &[TargetKind::Username], Behavior::Hang);
        let quick = MockCollector::new(
            "quick",
            &[TargetKind::Username],
            Behavior::Sleep(Duration::from_millis(10), json!({"ok": true})),
        );
        for collector in [&email, &slow, &quick] {
            register(&registry, collector);
        }
        let enricher = CountingEnricher::new("risk");

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = orchestrator(&registry, &store, Duration::from_secs(30), OrchestratorConfig::default())
            .with_enricher(enricher.clone())
            .start_with_cancel(email_request(3), cancel)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));

        let outcome = |module: &str| {
            result
                .cross_platform_results
                .iter()
                .find(|e| e.module == module)
                .map(|e| e.outcome.clone())
                .unwrap()
        };
        assert_eq!(outcome("slow"), ModuleOutcome::Cancelled);
        assert!(outcome("quick").is_success());
        assert!(result.cancelled);
        assert_eq!(result.tiers_run, vec![1, 2]);
        assert_eq!(enricher.calls(), 0);
        assert_eq!(result.state, InvestigationState::Completed);
    }

    #[tokio::test]
    async fn test_enrichment_failure_keeps_collected_data() {
        let registry = Arc::new(ModuleRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let email =
            MockCollector::returning("email", &[TargetKind::Email], json!({"username": "foo"}));
        register(&registry, &email);
        let broken = CountingEnricher::failing("ai");
        let risk = CountingEnricher::new("risk");

        let result = orchestrator(&registry, &store, Duration::from_secs(5), OrchestratorConfig::default())
            .with_enricher(broken.clone())
            .with_enricher(risk.clone())
            .start(email_request(3))
            .await
            .unwrap();

        assert_eq!(broken.calls(), 1);
        assert_eq!(risk.calls(), 1);
        assert!(matches!(result.enrichment["ai"], ModuleOutcome::Failure { .. }));
        assert_eq!(
            result.enrichment["risk"].data(),
            Some(&json!({"identifiers": 1, "modules": 1}))
        );
        assert!(result.per_module_results["email"].is_success());
    }

    #[tokio::test]
    async fn test_enrichment_can_be_disabled() {
        let registry = Arc::new(ModuleRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let email = MockCollector::empty("email", &[TargetKind::Email]);
        register(&registry, &email);
        let risk = CountingEnricher::new("risk");

        let options = InvestigationOptions {
            enrichment: false,
            ..InvestigationOptions::default()
        };
        let result = orchestrator(&registry, &store, Duration::from_secs(5), OrchestratorConfig::default())
            .with_enricher(risk.clone())
            .start(email_request(3).with_options(options))
            .await
            .unwrap();

        assert_eq!(risk.calls(), 0);
        assert_eq!(result.tiers_run, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected() {
        let registry = Arc::new(ModuleRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let request = InvestigationRequest {
            target_kind: TargetKind::Email,
            target_value: "a@b.com".into(),
            depth: 0,
            options: InvestigationOptions::default(),
        };

        let err = orchestrator(&registry, &store, Duration::from_secs(5), OrchestratorConfig::default())
            .start(request)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::InvalidRequest(RequestError::InvalidDepth(0))
        ));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_investigation_ids_are_unique() {
        let registry = Arc::new(ModuleRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let orchestrator =
            orchestrator(&registry, &store, Duration::from_secs(5), OrchestratorConfig::default());

        let (a, b) = tokio::join!(
            orchestrator.start(email_request(1)),
            orchestrator.start(email_request(1))
        );
        assert_ne!(a.unwrap().id, b.unwrap().id);
        assert_eq!(store.ids().await.unwrap().len(), 2);
    }

    struct BrokenStore;

    #[async_trait]
    impl InvestigationStore for BrokenStore {
        async fn save(&self, _result: Arc<InvestigationResult>) -> Result<(), StoreError> {
            Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )))
        }

        async fn get(
            &self,
            _id: &InvestigationId,
        ) -> Result<Option<Arc<InvestigationResult>>, StoreError> {
            Ok(None)
        }

        async fn ids(&self) -> Result<Vec<InvestigationId>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_store_failure_is_an_orchestrator_fault() {
        let registry = Arc::new(ModuleRegistry::new());
        let email =
            MockCollector::returning("email", &[TargetKind::Email], json!({"username": "foo"}));
        register(&registry, &email);

        let orchestrator = InvestigationOrchestrator::new(
            registry,
            controller(Duration::from_secs(5)),
            Arc::new(BrokenStore),
            OrchestratorConfig::default(),
        );
        match orchestrator.start(email_request(1)).await {
            Err(OrchestratorError::Fault { reason, partial, .. }) => {
                assert!(reason.contains("disk full"), "{}", reason);
                assert_eq!(partial.state, InvestigationState::Failed);
                assert!(partial.per_module_results["email"].is_success());
            }
            other => panic!("expected fault, got {:?}", other.map(|r| r.id)),
        }
    }
}
