//! # Typed Configuration
//!
//! Every recognized option is an explicit, named field with a default. The
//! whole tree deserializes from JSON with `#[serde(default)]`, so a partial
//! config file only overrides the fields it names. Durations are carried as
//! millisecond integers on the wire and converted at the point of use.

use std::time::Duration;

use serde::Deserialize;

use crate::resilience::retry::RetryPolicy;

/// Top-level configuration for the whole ingestion core.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CoreConfig {
    pub channel: ChannelConfig,
    pub sync: SyncConfig,
    pub health: HealthConfig,
    pub resilience: ResilienceConfig,
    pub orchestrator: OrchestratorConfig,
}

/// Channel client options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChannelConfig {
    /// Backend WebSocket endpoint.
    pub url: String,
    /// Connect eagerly when the orchestrator starts.
    pub auto_connect: bool,
    /// Allow the channel_reconnect recovery action to re-establish the link.
    pub auto_reconnect: bool,
    pub connect_timeout_ms: u64,
    /// Liveness probe cadence.
    pub ping_interval_ms: u64,
    /// A probe reply later than this is a connection fault, not a stall.
    pub pong_timeout_ms: u64,
    /// Connection quality recomputation cadence.
    pub quality_interval_ms: u64,
    /// Number of latency samples kept for the rolling average.
    pub latency_window: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9030/stream".to_string(),
            auto_connect: false,
            auto_reconnect: true,
            connect_timeout_ms: 10_000,
            ping_interval_ms: 5_000,
            pong_timeout_ms: 3_000,
            quality_interval_ms: 1_000,
            latency_window: 30,
        }
    }
}

impl ChannelConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }
    pub fn quality_interval(&self) -> Duration {
        Duration::from_millis(self.quality_interval_ms)
    }
}

/// Stream synchronizer options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Target playback/alignment rate, frames per second.
    pub target_fps: u32,
    /// Maximum buffered frames per source; oldest evicted beyond this.
    pub max_buffer: usize,
    /// Trailing window over which drop rates are scored.
    pub drop_window_ms: u64,
    /// Sources silent for longer than this are excluded from the aggregate
    /// sync-quality score.
    pub stale_source_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            target_fps: 30,
            max_buffer: 90,
            drop_window_ms: 10_000,
            stale_source_ms: 5_000,
        }
    }
}

impl SyncConfig {
    pub fn drop_window(&self) -> Duration {
        Duration::from_millis(self.drop_window_ms)
    }
    pub fn stale_source_after(&self) -> Duration {
        Duration::from_millis(self.stale_source_ms)
    }
}

/// One threshold pair for a metric: breach of `warning` raises a warning
/// alert, breach of `critical` escalates the same alert in place.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricBand {
    pub warning: f64,
    pub critical: f64,
}

/// Per-metric alert thresholds. `fps` triggers *below* its bands, everything
/// else triggers *above*.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AlertThresholds {
    pub fps: MetricBand,
    pub latency_ms: MetricBand,
    pub cpu_pct: MetricBand,
    pub memory_mb: MetricBand,
    pub frame_drops: MetricBand,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            fps: MetricBand { warning: 20.0, critical: 10.0 },
            latency_ms: MetricBand { warning: 200.0, critical: 500.0 },
            cpu_pct: MetricBand { warning: 80.0, critical: 95.0 },
            memory_mb: MetricBand { warning: 1024.0, critical: 2048.0 },
            frame_drops: MetricBand { warning: 10.0, critical: 50.0 },
        }
    }
}

/// Health & status aggregator options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HealthConfig {
    /// Bounded length of the performance snapshot history ring.
    pub history_len: usize,
    pub thresholds: AlertThresholds,
    /// How long resolved alerts are retained before the cleanup pass purges
    /// them. Operationally 24 hours.
    pub alert_retention_ms: u64,
    /// Cap on outstanding (resolved + unresolved) alerts.
    pub max_alerts: usize,
    /// Cadence of the periodic cleanup pass, driven by the orchestrator.
    pub cleanup_interval_ms: u64,
    /// A service not seen in a status snapshot for this long is marked down.
    pub service_down_after_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            history_len: 300,
            thresholds: AlertThresholds::default(),
            alert_retention_ms: 24 * 60 * 60 * 1000,
            max_alerts: 100,
            cleanup_interval_ms: 60_000,
            service_down_after_ms: 15_000,
        }
    }
}

impl HealthConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

/// Cooldown and attempt ceiling for one recovery action kind.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryPolicy {
    /// No two attempts of the same action within this window.
    pub cooldown_ms: u64,
    /// Ceiling on automatic attempts, counted against the action kind.
    pub max_attempts: u32,
}

impl RecoveryPolicy {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Resilience engine options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResilienceConfig {
    /// Consecutive failures before a component breaker opens.
    pub breaker_threshold: u32,
    /// Time an open breaker waits before probing via half-open.
    pub breaker_open_timeout_ms: u64,
    pub channel_reconnect: RecoveryPolicy,
    pub sync_reset: RecoveryPolicy,
    pub quality_reduction: RecoveryPolicy,
    pub memory_cleanup: RecoveryPolicy,
    pub state_refresh: RecoveryPolicy,
    pub full_restart: RecoveryPolicy,
    /// Backoff schedule used by the channel_reconnect action.
    pub reconnect_retry: RetryPolicy,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            breaker_threshold: 5,
            breaker_open_timeout_ms: 30_000,
            channel_reconnect: RecoveryPolicy { cooldown_ms: 5_000, max_attempts: 5 },
            sync_reset: RecoveryPolicy { cooldown_ms: 10_000, max_attempts: 3 },
            quality_reduction: RecoveryPolicy { cooldown_ms: 15_000, max_attempts: 3 },
            memory_cleanup: RecoveryPolicy { cooldown_ms: 30_000, max_attempts: 2 },
            state_refresh: RecoveryPolicy { cooldown_ms: 10_000, max_attempts: 3 },
            full_restart: RecoveryPolicy { cooldown_ms: 60_000, max_attempts: 1 },
            reconnect_retry: RetryPolicy::default(),
        }
    }
}

impl ResilienceConfig {
    pub fn breaker_open_timeout(&self) -> Duration {
        Duration::from_millis(self.breaker_open_timeout_ms)
    }
}

/// Orchestrator options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OrchestratorConfig {
    /// Quiescence delay between stop and start during a restart.
    pub restart_delay_ms: u64,
    /// Below this fps the derived system status degrades.
    pub fps_floor: f64,
    /// Cadence of proactive status requests to the backend.
    pub status_request_interval_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            restart_delay_ms: 2_000,
            fps_floor: 10.0,
            status_request_interval_ms: 10_000,
        }
    }
}

impl OrchestratorConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
    pub fn status_request_interval(&self) -> Duration {
        Duration::from_millis(self.status_request_interval_ms)
    }
}
