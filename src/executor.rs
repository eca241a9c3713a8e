//! Bounded, rate-limited, timeout-guarded collector invocation.
//!
//! [`ConcurrencyController`] is the only path through which the orchestrator
//! calls a collector or an enricher. Each call:
//! 1. takes a worker permit from the shared pool
//! 2. claims the module's rate-limit slot (per module, never global)
//! 3. runs on its own task under `request_timeout`
//!
//! Timeouts, failures, panics and cancellations all come back as a
//! [`CallOutcome`]; nothing a collector does can fail the caller.

use crate::model::{InvestigationResult, ModuleOutcome, TargetKind};
use crate::traits::{panic_message, Collector, CollectorError, Enricher};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Pool size, spacing, timeout and cancellation grace for collector calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Worker pool size (default: 10)
    pub max_concurrent_requests: usize,

    /// Minimum spacing between two call starts on the same module (default: 1s)
    pub rate_limit_delay: Duration,

    /// Per-call timeout (default: 30s)
    pub request_timeout: Duration,

    /// How long a running call may continue once its investigation is cancelled (default: 2s)
    pub cancellation_grace: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 10,
            rate_limit_delay: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
            cancellation_grace: Duration::from_secs(2),
        }
    }
}

/// How a single guarded call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Completed(Value),
    Failed(String),
    /// Exceeded `request_timeout`; distinct from `Failed` so it can be retried
    TimedOut,
    /// Cancelled before it started, or still running when the grace period ran out
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallReport {
    pub outcome: CallOutcome,
    pub elapsed: Duration,
    pub timeout: Duration,
}

impl CallReport {
    fn new(outcome: CallOutcome, started: Instant, timeout: Duration) -> Self {
        Self {
            outcome,
            elapsed: started.elapsed(),
            timeout,
        }
    }

    pub fn into_module_outcome(self) -> ModuleOutcome {
        match self.outcome {
            CallOutcome::Completed(data) => ModuleOutcome::Success {
                data,
                elapsed_ms: self.elapsed.as_millis() as u64,
            },
            CallOutcome::Failed(error) => ModuleOutcome::Failure { error },
            CallOutcome::TimedOut => ModuleOutcome::Timeout {
                after_ms: self.timeout.as_millis() as u64,
            },
            CallOutcome::Cancelled => ModuleOutcome::Cancelled,
        }
    }
}

// ============================================================================
// Rate limiting
// ============================================================================

/// Per-module minimum spacing between call starts.
///
/// A slot is claimed only by a call that already holds a worker, so calls
/// that queued behind a saturated pool still start `delay` apart. Other
/// modules are never affected.
#[derive(Debug)]
pub struct RateLimiter {
    delay: Duration,
    next_slot: Mutex<HashMap<String, Instant>>,
}

impl RateLimiter {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    /// Waits until `module` may start a call, without claiming the slot.
    pub async fn ready(&self, module: &str) {
        let now = Instant::now();
        let slot = self.slots().get(module).copied();
        if let Some(slot) = slot.filter(|slot| *slot > now) {
            debug!(module, wait_ms = (slot - now).as_millis() as u64, "Rate limited");
            sleep_until(slot).await;
        }
    }

    /// Claims the module's slot if it is open, otherwise returns when it opens.
    pub fn try_claim(&self, module: &str) -> Result<(), Instant> {
        if self.delay.is_zero() {
            return Ok(());
        }
        let now = Instant::now();
        let mut slots = self.slots();
        match slots.get(module) {
            Some(&next) if next > now => Err(next),
            _ => {
                slots.insert(module.to_string(), now + self.delay);
                Ok(())
            }
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.next_slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Aborts the wrapped task when dropped, releasing its worker permit even if
/// the caller stops waiting (timeout, abandoned after cancellation).
struct CallTask<T>(JoinHandle<T>);

impl<T> Drop for CallTask<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct ConcurrencyController {
    semaphore: Arc<Semaphore>,
    limiter: RateLimiter,
    config: ControllerConfig,
}

impl std::fmt::Debug for ConcurrencyController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyController")
            .field("config", &self.config)
            .field("available_permits", &self.semaphore.available_permits())
            .finish()
    }
}

impl ConcurrencyController {
    pub fn new(config: ControllerConfig) -> Self {
        let permits = config.max_concurrent_requests.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            limiter: RateLimiter::new(config.rate_limit_delay),
            config,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Idle workers right now.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Invokes `collector` for one target under rate limit, pool bound and timeout.
    ///
    /// If `cancel` fires before the call starts, the call is dropped and
    /// reported as [`CallOutcome::Cancelled`]. A call already running gets
    /// `cancellation_grace` to finish; after that it is aborted and reported
    /// as cancelled too.
    #[instrument(skip(self, collector, target, cancel))]
    pub async fn invoke(
        &self,
        module: &str,
        collector: Arc<dyn Collector>,
        target: &str,
        kind: TargetKind,
        depth: u8,
        cancel: &CancellationToken,
    ) -> CallReport {
        let target = target.to_string();
        self.run_guarded(module, true, cancel, async move {
            collector.investigate(&target, kind, depth).await
        })
        .await
    }

    /// Runs an enrichment collaborator under the pool bound and timeout.
    ///
    /// Enrichers are not rate limited; they are local analysis, not third-party APIs.
    #[instrument(skip(self, enricher, snapshot, cancel), fields(enricher = enricher.name()))]
    pub async fn invoke_enricher(
        &self,
        enricher: Arc<dyn Enricher>,
        snapshot: Arc<InvestigationResult>,
        cancel: &CancellationToken,
    ) -> CallReport {
        let name = enricher.name().to_string();
        self.run_guarded(&name, false, cancel, async move { enricher.enrich(&snapshot).await })
            .await
    }

    async fn run_guarded<F>(
        &self,
        module: &str,
        rate_limited: bool,
        cancel: &CancellationToken,
        call: F,
    ) -> CallReport
    where
        F: Future<Output = Result<Value, CollectorError>> + Send + 'static,
    {
        let started = Instant::now();
        let timeout_after = self.config.request_timeout;

        let permit = match self.start_slot(module, rate_limited, cancel).await {
            Ok(permit) => permit,
            Err(outcome) => return CallReport::new(outcome, started, timeout_after),
        };

        debug!(module, "Collector call started");
        let running = Instant::now();
        let mut task = CallTask(tokio::spawn(async move {
            let _permit = permit;
            call.await
        }));

        let first = tokio::select! {
            biased;
            joined = timeout(timeout_after, &mut task.0) => Some(joined),
            _ = cancel.cancelled() => None,
        };

        let outcome = match first {
            Some(Ok(joined)) => classify(module, joined),
            Some(Err(_)) => {
                warn!(
                    module,
                    timeout_secs = timeout_after.as_secs_f64(),
                    "Collector call timed out"
                );
                CallOutcome::TimedOut
            }
            None => {
                let grace = self
                    .config
                    .cancellation_grace
                    .min(timeout_after.saturating_sub(running.elapsed()));
                match timeout(grace, &mut task.0).await {
                    Ok(joined) => classify(module, joined),
                    Err(_) => {
                        warn!(
                            module,
                            grace_ms = grace.as_millis() as u64,
                            "Collector call abandoned after cancellation"
                        );
                        CallOutcome::Cancelled
                    }
                }
            }
        };
        drop(task);

        let report = CallReport::new(outcome, started, timeout_after);
        debug!(module, elapsed_ms = report.elapsed.as_millis() as u64, "Collector call finished");
        report
    }

    /// Waits for a worker and, for rate-limited calls, the module's next slot.
    ///
    /// No worker is held while waiting on a module's spacing: a call that gets
    /// a worker but finds its slot taken gives the worker back and waits again.
    async fn start_slot(
        &self,
        module: &str,
        rate_limited: bool,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, CallOutcome> {
        loop {
            if rate_limited {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(CallOutcome::Cancelled),
                    _ = self.limiter.ready(module) => {}
                }
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CallOutcome::Cancelled),
                permit = self.semaphore.clone().acquire_owned() => permit,
            };
            let permit =
                permit.map_err(|e| CallOutcome::Failed(format!("worker pool closed: {}", e)))?;

            if !rate_limited || self.limiter.try_claim(module).is_ok() {
                return Ok(permit);
            }
            drop(permit);
        }
    }
}

fn classify(module: &str, joined: Result<Result<Value, CollectorError>, JoinError>) -> CallOutcome {
    match joined {
        Err(join_err) if join_err.is_panic() => {
            let message = panic_message(join_err.into_panic().as_ref());
            warn!(module, panic = %message, "Collector panicked");
            CallOutcome::Failed(format!("collector panicked: {}", message))
        }
        Err(_) => CallOutcome::Cancelled,
        Ok(Err(e)) => {
            warn!(module, error = %e, "Collector call failed");
            CallOutcome::Failed(e.to_string())
        }
        Ok(Ok(data)) => CallOutcome::Completed(data),
    }
}

// ============================================================================
// Tests
// ============================================================================
