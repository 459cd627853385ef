//! # Resilience Engine
//!
//! Consumes classified faults from the fault channel, deduplicates them into
//! error reports, tracks per-component circuit breakers, and dispatches
//! registered recovery actions under cooldown and attempt-budget control.
//!
//! The engine holds its lock only around bookkeeping. Recovery actions run
//! outside the lock, then their outcome is folded back in: a success marks
//! the report recovered and closes the component's breaker, a failure counts
//! against the breaker.

pub mod breaker;
pub mod recovery;
pub mod report;
pub mod retry;

pub use retry::RetryPolicy;

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{RecoveryPolicy, ResilienceConfig};
use crate::error::{CoreError, CoreResult, Fault, FaultKind, Severity};
pub use breaker::BreakerState;
pub use recovery::{RecoveryActionKind, RecoveryFn};
pub use report::{ErrorReport, ErrorStats};

use breaker::CircuitBreaker;
use recovery::{action_for, ActionRegistry};
use report::report_id;

struct EngineInner {
    reports: HashMap<String, ErrorReport>,
    breakers: HashMap<String, CircuitBreaker>,
    registry: ActionRegistry,
}

pub struct ResilienceEngine {
    cfg: ResilienceConfig,
    inner: Mutex<EngineInner>,
    /// Count of unrecovered critical reports, for the status derivation.
    critical_tx: watch::Sender<usize>,
}

impl ResilienceEngine {
    pub fn new(cfg: ResilienceConfig) -> Self {
        let (critical_tx, _) = watch::channel(0);
        Self {
            cfg,
            inner: Mutex::new(EngineInner {
                reports: HashMap::new(),
                breakers: HashMap::new(),
                registry: ActionRegistry::default(),
            }),
            critical_tx,
        }
    }

    /// Registers (or replaces) the implementation for one action kind.
    pub fn register_action(&self, kind: RecoveryActionKind, run: RecoveryFn) {
        let mut inner = self.inner.lock().expect("ResilienceEngine lock poisoned");
        inner.registry.register(kind, run);
    }

    /// Drains the fault channel until cancelled, handling each fault in
    /// arrival order. Returns the receiver so a restart can resume draining
    /// the same channel.
    pub async fn run(
        &self,
        mut faults: mpsc::UnboundedReceiver<Fault>,
        cancel: CancellationToken,
    ) -> mpsc::UnboundedReceiver<Fault> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("Fault pump stopped.");
                    return faults;
                }
                fault = faults.recv() => {
                    match fault {
                        Some(fault) => self.handle_fault(fault).await,
                        None => {
                            log::debug!("Fault channel closed.");
                            return faults;
                        }
                    }
                }
            }
        }
    }

    /// Full handling of one classified fault: dedup into a report, breaker
    /// bookkeeping, severity escalation, and recovery dispatch.
    pub async fn handle_fault(&self, fault: Fault) {
        log::debug!(
            "Fault [{}] from '{}': {}",
            fault.kind,
            fault.component,
            fault.message
        );
        let dispatch = {
            let mut inner = self.inner.lock().expect("ResilienceEngine lock poisoned");
            let action = action_for(fault.kind, fault.severity);
            let id = report_id(fault.kind, &fault.component, &fault.message);
            match inner.reports.get_mut(&id) {
                Some(existing) => {
                    existing.record_repeat(&fault);
                    if existing.recovery_action.is_none() {
                        existing.recovery_action = action;
                    }
                }
                None => {
                    inner
                        .reports
                        .insert(id.clone(), ErrorReport::from_fault(&fault, action));
                }
            }

            // Low-severity faults (routine frame drops) never count against
            // the component breaker.
            let threshold = self.cfg.breaker_threshold;
            let open_timeout = self.cfg.breaker_open_timeout();
            let breaker = inner
                .breakers
                .entry(fault.component.clone())
                .or_insert_with(|| CircuitBreaker::new(threshold, open_timeout));
            let breaker_state = if fault.severity >= Severity::Medium {
                breaker.record_failure()
            } else {
                breaker.state()
            };

            let attempts = action.map(|k| attempts_for(&inner, k)).unwrap_or(0);
            let budget_exhausted = match action {
                Some(kind) => attempts > self.policy_for(kind).max_attempts,
                None => false,
            };

            // Escalation: a sustained connection failure (breaker open) or an
            // exhausted recovery budget is a critical condition even when the
            // individual fault was not.
            let escalate = fault.kind == FaultKind::CriticalSystemError
                || (fault.kind == FaultKind::ConnectionError && breaker_state == BreakerState::Open)
                || budget_exhausted;
            if escalate {
                if let Some(report) = inner.reports.get_mut(&id) {
                    if report.severity < Severity::Critical {
                        log::error!("Escalating report {} to critical.", id);
                        report.severity = Severity::Critical;
                    }
                }
            }

            let mut dispatch = None;
            if let Some(kind) = action {
                if budget_exhausted {
                    log::error!(
                        "Recovery '{}' budget exhausted ({} reports); not dispatching.",
                        kind,
                        attempts
                    );
                } else {
                    let cooldown = self.policy_for(kind).cooldown();
                    match inner.registry.get_mut(kind) {
                        Some(entry) => {
                            let ready = entry
                                .last_attempt
                                .map_or(true, |at| at.elapsed() >= cooldown);
                            if ready {
                                entry.last_attempt = Some(Instant::now());
                                dispatch = Some((kind, entry.run.clone()));
                            } else {
                                log::debug!("Recovery '{}' still cooling down.", kind);
                            }
                        }
                        None => log::debug!("No implementation registered for '{}'.", kind),
                    }
                }
            }

            self.publish_critical(&inner);
            dispatch.map(|(kind, run)| (id, fault.component.clone(), kind, run))
        };

        let Some((id, component, kind, run)) = dispatch else {
            return;
        };
        log::info!("Dispatching recovery '{}' for '{}'.", kind, component);
        let outcome = run().await;

        let mut inner = self.inner.lock().expect("ResilienceEngine lock poisoned");
        match outcome {
            Ok(()) => {
                log::info!("Recovery '{}' succeeded.", kind);
                if let Some(report) = inner.reports.get_mut(&id) {
                    report.recovered = true;
                }
                if let Some(breaker) = inner.breakers.get_mut(&component) {
                    breaker.record_success();
                }
            }
            Err(e) => {
                log::warn!("Recovery '{}' failed: {}", kind, e);
                if let Some(breaker) = inner.breakers.get_mut(&component) {
                    breaker.record_failure();
                }
            }
        }
        self.publish_critical(&inner);
    }

    /// Manually triggers one recovery action. Bypasses the attempt budget but
    /// still honors the cooldown.
    pub async fn trigger_recovery(&self, kind: RecoveryActionKind) -> CoreResult<()> {
        let run = {
            let mut inner = self.inner.lock().expect("ResilienceEngine lock poisoned");
            let cooldown = self.policy_for(kind).cooldown();
            let entry = inner
                .registry
                .get_mut(kind)
                .ok_or_else(|| CoreError::UnknownAction(kind.as_str().to_string()))?;
            let ready = entry
                .last_attempt
                .map_or(true, |at| at.elapsed() >= cooldown);
            if !ready {
                return Err(CoreError::RecoveryFailed {
                    action: kind.as_str().to_string(),
                    reason: "cooldown active".to_string(),
                });
            }
            entry.last_attempt = Some(Instant::now());
            entry.run.clone()
        };
        log::info!("Manual recovery '{}' triggered.", kind);
        let outcome = run().await;

        let mut inner = self.inner.lock().expect("ResilienceEngine lock poisoned");
        match outcome {
            Ok(()) => {
                if let Some(breaker) = inner.breakers.get_mut(component_for(kind)) {
                    breaker.record_success();
                }
                Ok(())
            }
            Err(e) => {
                if let Some(breaker) = inner.breakers.get_mut(component_for(kind)) {
                    breaker.record_failure();
                }
                Err(e)
            }
        }
    }

    fn policy_for(&self, kind: RecoveryActionKind) -> RecoveryPolicy {
        match kind {
            RecoveryActionKind::ChannelReconnect => self.cfg.channel_reconnect,
            RecoveryActionKind::SyncReset => self.cfg.sync_reset,
            RecoveryActionKind::QualityReduction => self.cfg.quality_reduction,
            RecoveryActionKind::MemoryCleanup => self.cfg.memory_cleanup,
            RecoveryActionKind::StateRefresh => self.cfg.state_refresh,
            RecoveryActionKind::FullRestart => self.cfg.full_restart,
        }
    }

    fn publish_critical(&self, inner: &EngineInner) {
        let count = inner
            .reports
            .values()
            .filter(|r| r.severity == Severity::Critical && !r.recovered)
            .count();
        self.critical_tx.send_replace(count);
    }

    /// Reports ordered newest-activity first.
    pub fn error_reports(&self) -> Vec<ErrorReport> {
        let inner = self.inner.lock().expect("ResilienceEngine lock poisoned");
        let mut out: Vec<_> = inner.reports.values().cloned().collect();
        out.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        out
    }

    pub fn error_stats(&self) -> ErrorStats {
        let inner = self.inner.lock().expect("ResilienceEngine lock poisoned");
        ErrorStats::from_reports(inner.reports.values())
    }

    pub fn breaker_states(&self) -> HashMap<String, BreakerState> {
        let mut inner = self.inner.lock().expect("ResilienceEngine lock poisoned");
        inner
            .breakers
            .iter_mut()
            .map(|(k, b)| (k.clone(), b.state()))
            .collect()
    }

    pub fn critical_count(&self) -> usize {
        *self.critical_tx.borrow()
    }

    pub fn watch_critical(&self) -> watch::Receiver<usize> {
        self.critical_tx.subscribe()
    }

    /// Clears reports, breakers and cooldown bookkeeping.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("ResilienceEngine lock poisoned");
        inner.reports.clear();
        inner.breakers.clear();
        inner.registry.clear_attempts();
        self.publish_critical(&inner);
        log::info!("Resilience engine reset.");
    }
}

/// Attempts already burned for an action: the number of reports that were
/// routed to it. Deduplication keeps a flapping single cause at one report,
/// so the budget bounds distinct failure signatures, not raw fault volume.
fn attempts_for(inner: &EngineInner, kind: RecoveryActionKind) -> u32 {
    inner
        .reports
        .values()
        .filter(|r| r.recovery_action == Some(kind))
        .count() as u32
}

/// Component whose breaker a manual action outcome is attributed to.
fn component_for(kind: RecoveryActionKind) -> &'static str {
    match kind {
        RecoveryActionKind::ChannelReconnect => "channel",
        RecoveryActionKind::SyncReset
        | RecoveryActionKind::QualityReduction
        | RecoveryActionKind::MemoryCleanup => "sync",
        RecoveryActionKind::StateRefresh => "health",
        RecoveryActionKind::FullRestart => "orchestrator",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn engine() -> ResilienceEngine {
        ResilienceEngine::new(ResilienceConfig::default())
    }

    fn counting_action(counter: Arc<AtomicU32>) -> RecoveryFn {
        Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    fn failing_action() -> RecoveryFn {
        Arc::new(|| Box::pin(async { Err(CoreError::Transport("still down".into())) }))
    }

    #[tokio::test]
    async fn identical_faults_collapse_into_one_report() {
        let engine = engine();
        for _ in 0..3 {
            engine
                .handle_fault(Fault::new(
                    FaultKind::ParsingError,
                    Severity::Low,
                    "health",
                    "malformed status payload",
                ))
                .await;
        }
        let reports = engine.error_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].occurrences, 3);
        assert_eq!(engine.error_stats().total_occurrences, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn routed_action_runs_and_marks_the_report_recovered() {
        let engine = engine();
        let calls = Arc::new(AtomicU32::new(0));
        engine.register_action(RecoveryActionKind::SyncReset, counting_action(calls.clone()));

        engine
            .handle_fault(Fault::new(
                FaultKind::SynchronizationError,
                Severity::High,
                "sync",
                "cursor diverged",
            ))
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let reports = engine.error_reports();
        assert!(reports[0].recovered);
        assert_eq!(reports[0].recovery_action, Some(RecoveryActionKind::SyncReset));
        // The successful recovery closed the component breaker.
        assert_eq!(engine.breaker_states()["sync"], BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_gates_repeat_dispatch() {
        let engine = engine();
        let calls = Arc::new(AtomicU32::new(0));
        engine.register_action(RecoveryActionKind::SyncReset, counting_action(calls.clone()));
        let fault = || {
            Fault::new(
                FaultKind::SynchronizationError,
                Severity::Medium,
                "sync",
                "cursor diverged",
            )
        };

        engine.handle_fault(fault()).await;
        engine.handle_fault(fault()).await;
        // Second dispatch suppressed: still inside the 10s sync_reset cooldown.
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        engine.handle_fault(fault()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_stops_dispatch_and_escalates() {
        let cfg = ResilienceConfig {
            sync_reset: crate::config::RecoveryPolicy {
                cooldown_ms: 0,
                max_attempts: 1,
            },
            ..Default::default()
        };
        let engine = ResilienceEngine::new(cfg);
        let calls = Arc::new(AtomicU32::new(0));
        engine.register_action(RecoveryActionKind::SyncReset, counting_action(calls.clone()));

        engine
            .handle_fault(Fault::new(
                FaultKind::SynchronizationError,
                Severity::Medium,
                "sync",
                "cursor diverged",
            ))
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A second distinct signature routed to the same action busts the
        // one-attempt budget.
        engine
            .handle_fault(Fault::new(
                FaultKind::SynchronizationError,
                Severity::Medium,
                "sync",
                "buffers disagree on shared index",
            ))
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let escalated = engine
            .error_reports()
            .iter()
            .any(|r| r.severity == Severity::Critical && !r.recovered);
        assert!(escalated);
        assert_eq!(engine.critical_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_connection_failure_opens_breaker_and_escalates() {
        let cfg = ResilienceConfig {
            breaker_threshold: 2,
            channel_reconnect: crate::config::RecoveryPolicy {
                cooldown_ms: 0,
                max_attempts: 10,
            },
            ..Default::default()
        };
        let engine = ResilienceEngine::new(cfg);
        engine.register_action(RecoveryActionKind::ChannelReconnect, failing_action());

        engine
            .handle_fault(Fault::new(
                FaultKind::ConnectionError,
                Severity::Medium,
                "channel",
                "socket closed by peer",
            ))
            .await;
        // Fault plus the failed reconnect hit the threshold of two.
        assert_eq!(engine.breaker_states()["channel"], BreakerState::Open);

        engine
            .handle_fault(Fault::new(
                FaultKind::ConnectionError,
                Severity::Medium,
                "channel",
                "connect refused",
            ))
            .await;
        let reports = engine.error_reports();
        let refused = reports
            .iter()
            .find(|r| r.message == "connect refused")
            .unwrap();
        assert_eq!(refused.severity, Severity::Critical);
        assert!(engine.critical_count() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_trigger_bypasses_budget_but_honors_cooldown() {
        let engine = engine();
        let calls = Arc::new(AtomicU32::new(0));
        engine.register_action(
            RecoveryActionKind::MemoryCleanup,
            counting_action(calls.clone()),
        );

        engine
            .trigger_recovery(RecoveryActionKind::MemoryCleanup)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let again = engine.trigger_recovery(RecoveryActionKind::MemoryCleanup).await;
        assert!(matches!(again, Err(CoreError::RecoveryFailed { .. })));

        tokio::time::advance(Duration::from_secs(31)).await;
        engine
            .trigger_recovery(RecoveryActionKind::MemoryCleanup)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let unknown = engine.trigger_recovery(RecoveryActionKind::FullRestart).await;
        assert!(matches!(unknown, Err(CoreError::UnknownAction(_))));
    }

    #[tokio::test]
    async fn pump_drains_faults_and_returns_the_receiver_on_cancel() {
        let engine = Arc::new(engine());
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let pump = {
            let engine = engine.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { engine.run(rx, cancel).await })
        };

        tx.send(Fault::new(
            FaultKind::ValidationError,
            Severity::Low,
            "health",
            "snapshot out of range",
        ))
        .unwrap();
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.error_reports().len(), 1);

        cancel.cancel();
        let rx = pump.await.unwrap();
        // The same channel can feed a fresh pump after a restart.
        drop(rx);
    }

    #[tokio::test]
    async fn reset_clears_reports_and_breakers() {
        let engine = engine();
        engine
            .handle_fault(Fault::new(
                FaultKind::CriticalSystemError,
                Severity::Critical,
                "orchestrator",
                "watchdog tripped",
            ))
            .await;
        assert_eq!(engine.critical_count(), 1);

        engine.reset();
        assert!(engine.error_reports().is_empty());
        assert!(engine.breaker_states().is_empty());
        assert_eq!(engine.critical_count(), 0);
    }
}
