//! # Channel Client
//!
//! Owns the bidirectional streaming connection to the backend: the
//! connect/disconnect lifecycle, outbound sends, inbound dispatch by tag,
//! periodic liveness probing and the derived connection-quality score.
//!
//! The client never reconnects on its own. A lost or hung link is reported
//! as a fault on the fault channel and the resilience engine's
//! channel_reconnect action decides when to bring the link back.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::channel::dispatcher::Dispatcher;
use crate::channel::envelope::{Envelope, EnvelopeKind};
use crate::channel::quality::{self, ConnectionQuality, LinkStats};
use crate::channel::transport::Transport;
use crate::config::ChannelConfig;
use crate::error::{CoreError, CoreResult, Fault, FaultKind, Severity};

/// Component name used for faults raised by the client.
pub const CHANNEL_COMPONENT: &str = "channel";

/// Connection lifecycle state, owned exclusively by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

pub struct ChannelClient {
    cfg: ChannelConfig,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    faults: mpsc::UnboundedSender<Fault>,
    state_tx: watch::Sender<ChannelState>,
    quality_tx: watch::Sender<ConnectionQuality>,
    stats: Arc<Mutex<LinkStats>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl ChannelClient {
    pub fn new(
        cfg: ChannelConfig,
        transport: Arc<dyn Transport>,
        dispatcher: Arc<Dispatcher>,
        faults: mpsc::UnboundedSender<Fault>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        let (quality_tx, _) = watch::channel(ConnectionQuality::Excellent);
        let stats = Arc::new(Mutex::new(LinkStats::new(cfg.latency_window)));
        Self {
            cfg,
            transport,
            dispatcher,
            faults,
            state_tx,
            quality_tx,
            stats,
            outbound: Mutex::new(None),
            cancel: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    pub fn quality(&self) -> ConnectionQuality {
        *self.quality_tx.borrow()
    }

    pub fn watch_quality(&self) -> watch::Receiver<ConnectionQuality> {
        self.quality_tx.subscribe()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Establishes the connection: disconnected -> connecting -> connected,
    /// or into the error state if the transport fails or the connect deadline
    /// elapses. A no-op while already connecting or connected.
    pub async fn connect(&self) -> CoreResult<()> {
        match self.state() {
            ChannelState::Connecting | ChannelState::Connected => return Ok(()),
            _ => {}
        }
        self.state_tx.send_replace(ChannelState::Connecting);

        let connecting = self.transport.connect(&self.cfg.url);
        let conn = match tokio::time::timeout(self.cfg.connect_timeout(), connecting).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                log::error!("Channel connect failed: {}", e);
                self.state_tx.send_replace(ChannelState::Error);
                return Err(e);
            }
            Err(_) => {
                log::error!(
                    "Channel connect timed out after {}ms",
                    self.cfg.connect_timeout_ms
                );
                self.state_tx.send_replace(ChannelState::Error);
                return Err(CoreError::Timeout(format!(
                    "connect to {}",
                    self.cfg.url
                )));
            }
        };

        let cancel = CancellationToken::new();
        {
            let mut guard = self.outbound.lock().expect("ChannelClient lock poisoned");
            *guard = Some(conn.outbound.clone());
        }
        {
            let mut guard = self.cancel.lock().expect("ChannelClient lock poisoned");
            if let Some(old) = guard.replace(cancel.clone()) {
                old.cancel();
            }
        }
        self.stats
            .lock()
            .expect("ChannelClient lock poisoned")
            .reset();
        self.state_tx.send_replace(ChannelState::Connected);
        log::info!("Channel connected to {}", self.cfg.url);

        let ctx = ReaderCtx {
            cfg: self.cfg.clone(),
            dispatcher: Arc::clone(&self.dispatcher),
            faults: self.faults.clone(),
            state_tx: self.state_tx.clone(),
            stats: Arc::clone(&self.stats),
            outbound: conn.outbound,
        };
        tokio::spawn(read_loop(ctx, conn.inbound, cancel.clone()));
        tokio::spawn(quality_loop(
            self.cfg.clone(),
            Arc::clone(&self.stats),
            self.quality_tx.clone(),
            cancel,
        ));
        Ok(())
    }

    /// Forces a clean transition to disconnected and cancels the read and
    /// quality loops, including any pending liveness probe.
    pub fn disconnect(&self) {
        if let Some(token) = self
            .cancel
            .lock()
            .expect("ChannelClient lock poisoned")
            .take()
        {
            token.cancel();
        }
        *self.outbound.lock().expect("ChannelClient lock poisoned") = None;
        self.state_tx.send_replace(ChannelState::Disconnected);
        log::info!("Channel disconnected.");
    }

    /// Queues an envelope for sending. Returns false when not connected.
    pub fn send(&self, envelope: Envelope) -> bool {
        if self.state() != ChannelState::Connected {
            return false;
        }
        match &*self.outbound.lock().expect("ChannelClient lock poisoned") {
            Some(tx) => tx.send(envelope).is_ok(),
            None => false,
        }
    }
}

struct ReaderCtx {
    cfg: ChannelConfig,
    dispatcher: Arc<Dispatcher>,
    faults: mpsc::UnboundedSender<Fault>,
    state_tx: watch::Sender<ChannelState>,
    stats: Arc<Mutex<LinkStats>>,
    outbound: mpsc::UnboundedSender<Envelope>,
}

/// Inbound pump plus liveness probing. Runs until cancelled or the stream
/// dies. A probe reply that misses its deadline is converted into an
/// observable connection error, never a silent stall.
async fn read_loop(
    ctx: ReaderCtx,
    mut inbound: mpsc::UnboundedReceiver<Envelope>,
    cancel: CancellationToken,
) {
    let mut ping_timer = interval_at(
        Instant::now() + ctx.cfg.ping_interval(),
        ctx.cfg.ping_interval(),
    );
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // (sent, deadline) of the probe currently in flight.
    let mut pending_ping: Option<(Instant, Instant)> = None;

    loop {
        let pong_deadline = pending_ping.map(|(_, deadline)| deadline);
        tokio::select! {
            _ = cancel.cancelled() => {
                log::debug!("Channel read loop cancelled.");
                break;
            }
            msg = inbound.recv() => match msg {
                Some(envelope) => {
                    {
                        let mut stats = ctx.stats.lock().expect("ChannelClient lock poisoned");
                        stats.record_arrival();
                        if envelope.kind == EnvelopeKind::Pong {
                            if let Some((sent, _)) = pending_ping.take() {
                                stats.record_latency(sent.elapsed().as_secs_f64() * 1000.0);
                            }
                        }
                    }
                    ctx.dispatcher.dispatch(&envelope);
                }
                None => {
                    log::warn!("Channel stream closed by remote end.");
                    ctx.state_tx.send_replace(ChannelState::Error);
                    let _ = ctx.faults.send(Fault::new(
                        FaultKind::ConnectionError,
                        Severity::High,
                        CHANNEL_COMPONENT,
                        "channel stream closed by remote end",
                    ));
                    break;
                }
            },
            _ = ping_timer.tick() => {
                if pending_ping.is_none() {
                    let now = Instant::now();
                    if ctx.outbound.send(Envelope::new(EnvelopeKind::Ping)).is_ok() {
                        pending_ping = Some((now, now + ctx.cfg.pong_timeout()));
                    }
                }
            }
            _ = maybe_deadline(pong_deadline) => {
                log::warn!(
                    "Liveness probe reply overdue ({}ms); treating as connection error.",
                    ctx.cfg.pong_timeout_ms
                );
                ctx.state_tx.send_replace(ChannelState::Error);
                let _ = ctx.faults.send(Fault::new(
                    FaultKind::TimeoutError,
                    Severity::High,
                    CHANNEL_COMPONENT,
                    "liveness probe reply overdue",
                ));
                break;
            }
        }
    }
}

async fn maybe_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Recomputes connection quality on a fixed interval from the rolling link
/// stats, moving one band at a time.
async fn quality_loop(
    cfg: ChannelConfig,
    stats: Arc<Mutex<LinkStats>>,
    quality_tx: watch::Sender<ConnectionQuality>,
    cancel: CancellationToken,
) {
    let mut tick = interval_at(
        Instant::now() + cfg.quality_interval(),
        cfg.quality_interval(),
    );
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let (avg, rate) = {
                    let mut stats = stats.lock().expect("ChannelClient lock poisoned");
                    (stats.avg_latency_ms(), stats.take_rate())
                };
                let target = quality::target_band(avg, rate);
                let current = *quality_tx.borrow();
                let next = quality::step_toward(current, target);
                if next != current {
                    log::debug!("Connection quality {:?} -> {:?} (target {:?})", current, next, target);
                    quality_tx.send_replace(next);
                }
            }
        }
    }
}
