//! # Orchestrator
//!
//! Owns the component set as one unit: wires the dispatcher routes and
//! recovery actions at construction, derives the aggregate system status
//! from the components' watch channels, and drives the start / stop /
//! restart lifecycle.
//!
//! Auto-restart fires at most once per transition into the error state with
//! outstanding critical reports. The restart resets the synchronizer and the
//! resilience engine, so a recurrence of the same condition is a new
//! transition and earns a new restart.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::interval_at;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelClient, ChannelState, ConnectionQuality, Dispatcher, Envelope, EnvelopeKind, Transport};
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult, Fault, FaultKind, Severity};
use crate::health::HealthAggregator;
use crate::resilience::recovery::{RecoveryActionKind, RecoveryFn};
use crate::resilience::retry::run_with_retry;
use crate::resilience::ResilienceEngine;
use crate::sync::StreamSynchronizer;

/// Aggregate status of the whole ingestion core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemStatus {
    Stopped,
    Initializing,
    Active,
    Degraded,
    Error,
}

pub struct Orchestrator {
    cfg: CoreConfig,
    channel: Arc<ChannelClient>,
    sync: Arc<StreamSynchronizer>,
    health: Arc<HealthAggregator>,
    engine: Arc<ResilienceEngine>,
    faults: mpsc::UnboundedSender<Fault>,
    status_tx: watch::Sender<SystemStatus>,
    /// Receiver side of the fault channel; taken while the pump runs and put
    /// back on stop so a restart can resume draining the same channel.
    fault_rx: Mutex<Option<mpsc::UnboundedReceiver<Fault>>>,
    pump: Mutex<Option<JoinHandle<mpsc::UnboundedReceiver<Fault>>>>,
    cancel: Mutex<Option<CancellationToken>>,
    restart_notify: Arc<Notify>,
    restart_count: AtomicU64,
    capabilities: Arc<Mutex<Vec<String>>>,
}

impl Orchestrator {
    /// Builds the component set, wires the dispatcher routes and registers
    /// the recovery actions. Nothing runs until `start()`.
    pub fn new(cfg: CoreConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        let dispatcher = Arc::new(Dispatcher::new());
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(ChannelClient::new(
            cfg.channel.clone(),
            transport,
            Arc::clone(&dispatcher),
            fault_tx.clone(),
        ));
        let sync = Arc::new(StreamSynchronizer::new(cfg.sync.clone(), fault_tx.clone()));
        let health = Arc::new(HealthAggregator::new(cfg.health.clone(), fault_tx.clone()));
        let engine = Arc::new(ResilienceEngine::new(cfg.resilience.clone()));
        let restart_notify = Arc::new(Notify::new());
        let capabilities = Arc::new(Mutex::new(Vec::new()));

        wire_routes(&dispatcher, &channel, &sync, &health, &capabilities, &fault_tx);
        register_actions(&cfg, &engine, &channel, &sync, &health, &restart_notify);

        let (status_tx, _) = watch::channel(SystemStatus::Stopped);
        Arc::new(Self {
            cfg,
            channel,
            sync,
            health,
            engine,
            faults: fault_tx,
            status_tx,
            fault_rx: Mutex::new(Some(fault_rx)),
            pump: Mutex::new(None),
            cancel: Mutex::new(None),
            restart_notify,
            restart_count: AtomicU64::new(0),
            capabilities,
        })
    }

    /// Starts the fault pump, status derivation and periodic cleanup, and
    /// connects the channel when configured to. A no-op while running.
    /// Fails when the configured eager connect cannot be established; the
    /// background tasks stay up so recovery can still reconnect.
    pub async fn start(self: &Arc<Self>) -> CoreResult<()> {
        {
            let guard = self.cancel.lock().expect("Orchestrator lock poisoned");
            if guard.is_some() {
                return Ok(());
            }
        }
        let fault_rx = self
            .fault_rx
            .lock()
            .expect("Orchestrator lock poisoned")
            .take()
            .ok_or_else(|| CoreError::Config("fault channel already in use".to_string()))?;

        let cancel = CancellationToken::new();
        *self.cancel.lock().expect("Orchestrator lock poisoned") = Some(cancel.clone());
        self.status_tx.send_replace(SystemStatus::Initializing);
        log::info!("Ingestion core starting.");

        let pump = {
            let engine = Arc::clone(&self.engine);
            let cancel = cancel.clone();
            tokio::spawn(async move { engine.run(fault_rx, cancel).await })
        };
        *self.pump.lock().expect("Orchestrator lock poisoned") = Some(pump);

        tokio::spawn(status_loop(Arc::clone(self), cancel.clone()));
        tokio::spawn(cleanup_loop(
            Arc::clone(&self.health),
            self.cfg.health.cleanup_interval(),
            cancel.clone(),
        ));
        tokio::spawn(status_request_loop(
            Arc::clone(&self.channel),
            self.cfg.orchestrator.status_request_interval(),
            cancel,
        ));
        self.sync.play();

        if self.cfg.channel.auto_connect {
            if let Err(e) = self.channel.connect().await {
                log::error!("Initial connect failed: {}", e);
                // The fault still reaches the engine so recovery can keep
                // retrying in the background; the caller sees the failure.
                let _ = self.faults.send(Fault::new(
                    FaultKind::ConnectionError,
                    Severity::High,
                    crate::channel::CHANNEL_COMPONENT,
                    format!("initial connect failed: {}", e),
                ));
                return Err(e);
            }
        }
        Ok(())
    }

    /// Stops all background work and the channel. Idempotent.
    pub async fn stop(&self) {
        let token = self
            .cancel
            .lock()
            .expect("Orchestrator lock poisoned")
            .take();
        if let Some(token) = token {
            token.cancel();
            log::info!("Ingestion core stopping.");
        }
        self.channel.disconnect();

        let pump = self.pump.lock().expect("Orchestrator lock poisoned").take();
        if let Some(handle) = pump {
            match handle.await {
                Ok(rx) => {
                    *self.fault_rx.lock().expect("Orchestrator lock poisoned") = Some(rx);
                }
                Err(e) => log::error!("Fault pump task failed: {}", e),
            }
        }
        self.status_tx.send_replace(SystemStatus::Stopped);
    }

    /// Full stop / reset / start cycle with a quiescence delay in between.
    ///
    /// Boxed: the status loop spawned by `start()` awaits this future, so an
    /// unboxed return type would make `start`'s future recursively contain
    /// itself.
    pub fn restart(self: &Arc<Self>) -> BoxFuture<'static, CoreResult<()>> {
        let orch = Arc::clone(self);
        Box::pin(async move {
            let n = orch.restart_count.fetch_add(1, Ordering::SeqCst) + 1;
            log::warn!("Restarting ingestion core (restart #{}).", n);
            orch.stop().await;
            orch.sync.reset();
            orch.engine.reset();
            tokio::time::sleep(orch.cfg.orchestrator.restart_delay()).await;
            orch.start().await
        })
    }

    /// Manually triggers one recovery action through the engine.
    pub async fn trigger_recovery(&self, kind: RecoveryActionKind) -> CoreResult<()> {
        self.engine.trigger_recovery(kind).await
    }

    /// Asks the backend to start streaming tracking updates. Returns false
    /// when the channel is not connected.
    pub fn subscribe_tracking(&self) -> bool {
        self.channel.send(Envelope::new(EnvelopeKind::SubscribeTracking))
    }

    pub fn unsubscribe_tracking(&self) -> bool {
        self.channel
            .send(Envelope::new(EnvelopeKind::UnsubscribeTracking))
    }

    /// Asks the backend for an immediate status snapshot.
    pub fn request_status(&self) -> bool {
        self.channel.send(Envelope::new(EnvelopeKind::RequestStatus))
    }

    pub fn status(&self) -> SystemStatus {
        *self.status_tx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<SystemStatus> {
        self.status_tx.subscribe()
    }

    /// Sender half of the fault channel, for embedding code that observes
    /// faults outside the built-in components.
    pub fn fault_sender(&self) -> mpsc::UnboundedSender<Fault> {
        self.faults.clone()
    }

    pub fn restart_count(&self) -> u64 {
        self.restart_count.load(Ordering::SeqCst)
    }

    /// Capabilities announced by the backend on connection_established.
    pub fn capabilities(&self) -> Vec<String> {
        self.capabilities
            .lock()
            .expect("Orchestrator lock poisoned")
            .clone()
    }

    pub fn channel(&self) -> &Arc<ChannelClient> {
        &self.channel
    }

    pub fn sync(&self) -> &Arc<StreamSynchronizer> {
        &self.sync
    }

    pub fn health(&self) -> &Arc<HealthAggregator> {
        &self.health
    }

    pub fn engine(&self) -> &Arc<ResilienceEngine> {
        &self.engine
    }
}

/// Pure status derivation from the component signals.
fn derive_runtime_status(
    state: ChannelState,
    quality: ConnectionQuality,
    fps: f64,
    criticals: usize,
    fps_floor: f64,
) -> SystemStatus {
    if criticals > 0 || state == ChannelState::Error {
        return SystemStatus::Error;
    }
    match state {
        ChannelState::Connected => {
            if quality <= ConnectionQuality::Poor || (fps > 0.0 && fps < fps_floor) {
                SystemStatus::Degraded
            } else {
                SystemStatus::Active
            }
        }
        _ => SystemStatus::Initializing,
    }
}

fn wire_routes(
    dispatcher: &Arc<Dispatcher>,
    channel: &Arc<ChannelClient>,
    sync: &Arc<StreamSynchronizer>,
    health: &Arc<HealthAggregator>,
    capabilities: &Arc<Mutex<Vec<String>>>,
    faults: &mpsc::UnboundedSender<Fault>,
) {
    {
        let sync = Arc::clone(sync);
        let faults = faults.clone();
        dispatcher.on(
            EnvelopeKind::TrackingUpdate,
            Box::new(move |env| {
                let source = env.payload.get("source").and_then(|v| v.as_str());
                let index = env.payload.get("frameIndex").and_then(|v| v.as_u64());
                match (source, index) {
                    (Some(source), Some(index)) => {
                        sync.ingest(source, index, env.payload.clone());
                    }
                    _ => {
                        let _ = faults.send(Fault::new(
                            FaultKind::ValidationError,
                            Severity::Low,
                            crate::sync::SYNC_COMPONENT,
                            "tracking update missing source or frameIndex",
                        ));
                    }
                }
                Ok(())
            }),
        );
    }
    for kind in [EnvelopeKind::StatusUpdate, EnvelopeKind::SystemStatus] {
        let health = Arc::clone(health);
        dispatcher.on(
            kind,
            Box::new(move |env| {
                health.ingest_envelope(&env.payload);
                Ok(())
            }),
        );
    }
    {
        let capabilities = Arc::clone(capabilities);
        // Weak reference: the client owns the dispatcher that owns this
        // handler, so a strong reference here would be a cycle.
        let channel = Arc::downgrade(channel);
        dispatcher.on(
            EnvelopeKind::ConnectionEstablished,
            Box::new(move |env| {
                let caps: Vec<String> = env
                    .payload
                    .get("capabilities")
                    .and_then(|v| v.as_array())
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                log::info!("Backend connection established; capabilities: {:?}", caps);
                *capabilities.lock().expect("Orchestrator lock poisoned") = caps;
                if let Some(channel) = channel.upgrade() {
                    channel.send(Envelope::new(EnvelopeKind::SubscribeTracking));
                    channel.send(Envelope::new(EnvelopeKind::RequestStatus));
                }
                Ok(())
            }),
        );
    }
}

fn register_actions(
    cfg: &CoreConfig,
    engine: &Arc<ResilienceEngine>,
    channel: &Arc<ChannelClient>,
    sync: &Arc<StreamSynchronizer>,
    health: &Arc<HealthAggregator>,
    restart_notify: &Arc<Notify>,
) {
    let reconnect: RecoveryFn = {
        let channel = Arc::clone(channel);
        let policy = cfg.resilience.reconnect_retry;
        let enabled = cfg.channel.auto_reconnect;
        Arc::new(move || {
            let channel = Arc::clone(&channel);
            Box::pin(async move {
                if !enabled {
                    return Err(CoreError::RecoveryFailed {
                        action: "channel_reconnect".to_string(),
                        reason: "automatic reconnect disabled".to_string(),
                    });
                }
                channel.disconnect();
                run_with_retry("channel_reconnect", &policy, || {
                    let channel = Arc::clone(&channel);
                    async move { channel.connect().await }
                })
                .await
            })
        })
    };
    engine.register_action(RecoveryActionKind::ChannelReconnect, reconnect);

    let sync_reset: RecoveryFn = {
        let sync = Arc::clone(sync);
        Arc::new(move || {
            let sync = Arc::clone(&sync);
            Box::pin(async move {
                sync.reset();
                Ok(())
            })
        })
    };
    engine.register_action(RecoveryActionKind::SyncReset, sync_reset);

    let quality_reduction: RecoveryFn = {
        let sync = Arc::clone(sync);
        Arc::new(move || {
            let sync = Arc::clone(&sync);
            Box::pin(async move {
                sync.reduce_target_rate();
                Ok(())
            })
        })
    };
    engine.register_action(RecoveryActionKind::QualityReduction, quality_reduction);

    let memory_cleanup: RecoveryFn = {
        let sync = Arc::clone(sync);
        let health = Arc::clone(health);
        Arc::new(move || {
            let sync = Arc::clone(&sync);
            let health = Arc::clone(&health);
            Box::pin(async move {
                sync.trim_buffers();
                health.cleanup();
                Ok(())
            })
        })
    };
    engine.register_action(RecoveryActionKind::MemoryCleanup, memory_cleanup);

    let state_refresh: RecoveryFn = {
        let channel = Arc::clone(channel);
        Arc::new(move || {
            let channel = Arc::clone(&channel);
            Box::pin(async move {
                if channel.send(Envelope::new(EnvelopeKind::RequestStatus)) {
                    Ok(())
                } else {
                    Err(CoreError::NotConnected)
                }
            })
        })
    };
    engine.register_action(RecoveryActionKind::StateRefresh, state_refresh);

    let full_restart: RecoveryFn = {
        let notify = Arc::clone(restart_notify);
        Arc::new(move || {
            let notify = Arc::clone(&notify);
            Box::pin(async move {
                notify.notify_one();
                Ok(())
            })
        })
    };
    engine.register_action(RecoveryActionKind::FullRestart, full_restart);
}

/// Recomputes the derived status whenever any component signal changes and
/// drives the once-per-transition auto-restart.
async fn status_loop(orch: Arc<Orchestrator>, cancel: CancellationToken) {
    let mut state_rx = orch.channel.watch_state();
    let mut quality_rx = orch.channel.watch_quality();
    let mut fps_rx = orch.health.watch_fps();
    let mut crit_rx = orch.engine.watch_critical();
    let mut restarted_this_episode = false;

    loop {
        let criticals = *crit_rx.borrow();
        let derived = derive_runtime_status(
            *state_rx.borrow(),
            *quality_rx.borrow(),
            *fps_rx.borrow(),
            criticals,
            orch.cfg.orchestrator.fps_floor,
        );
        let previous = *orch.status_tx.borrow();
        if derived != previous {
            log::info!("System status {:?} -> {:?}", previous, derived);
            orch.status_tx.send_replace(derived);
        }

        if derived != SystemStatus::Error {
            restarted_this_episode = false;
        } else if criticals > 0 && !restarted_this_episode {
            restarted_this_episode = true;
            log::error!("Critical failure condition; scheduling automatic restart.");
            let orch = Arc::clone(&orch);
            tokio::spawn(async move {
                if let Err(e) = orch.restart().await {
                    log::error!("Automatic restart failed: {}", e);
                }
            });
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            r = state_rx.changed() => { if r.is_err() { break; } }
            r = quality_rx.changed() => { if r.is_err() { break; } }
            r = fps_rx.changed() => { if r.is_err() { break; } }
            r = crit_rx.changed() => { if r.is_err() { break; } }
            _ = orch.restart_notify.notified() => {
                log::warn!("Full restart requested via recovery action.");
                let orch2 = Arc::clone(&orch);
                tokio::spawn(async move {
                    if let Err(e) = orch2.restart().await {
                        log::error!("Requested restart failed: {}", e);
                    }
                });
            }
        }
    }
    log::debug!("Status loop stopped.");
}

/// Polls the backend for a status snapshot on a fixed cadence so the health
/// view stays fresh even when the backend only answers on request.
async fn status_request_loop(
    channel: Arc<ChannelClient>,
    period: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut tick = interval_at(tokio::time::Instant::now() + period, period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                // Silently skipped while disconnected; reconnection re-syncs
                // via the connection_established handshake anyway.
                channel.send(Envelope::new(EnvelopeKind::RequestStatus));
            }
        }
    }
}

async fn cleanup_loop(
    health: Arc<HealthAggregator>,
    period: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut tick = interval_at(tokio::time::Instant::now() + period, period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => health.cleanup(),
        }
    }
}
