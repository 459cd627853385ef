//! # Health & Status Aggregator
//!
//! Consumes periodic status snapshots from the backend, keeps a bounded
//! performance history, derives per-service health, and maintains the
//! deduplicated alert set with two-band hysteresis thresholds.
//!
//! Threshold evaluation is idempotent: re-evaluating the same steady-state
//! snapshot updates the existing unresolved alert for a condition id instead
//! of creating duplicates, and a metric returning below its warning band
//! resolves the alert exactly once.

pub mod alerts;

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::config::{HealthConfig, MetricBand};
use crate::error::{Fault, FaultKind, Severity};
use alerts::{Alert, AlertBook, AlertSeverity};

/// Component name used for faults raised by the aggregator.
pub const HEALTH_COMPONENT: &str = "health";

/// One periodic performance snapshot, immutable once ingested. Wire form is
/// camelCase to match the backend's status payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PerformanceSnapshot {
    pub fps: f64,
    /// End-to-end latency in milliseconds.
    pub latency: f64,
    pub frame_drops: u64,
    /// Resident memory in megabytes.
    pub memory_usage: f64,
    pub cpu_usage: f64,
    pub gpu_usage: f64,
    /// Kilobits per second.
    pub network_bandwidth: f64,
    pub timestamp: DateTime<Utc>,
}

impl Default for PerformanceSnapshot {
    fn default() -> Self {
        Self {
            fps: 0.0,
            latency: 0.0,
            frame_drops: 0,
            memory_usage: 0.0,
            cpu_usage: 0.0,
            gpu_usage: 0.0,
            network_bandwidth: 0.0,
            timestamp: Utc::now(),
        }
    }
}

/// Aggregate health derived from the unresolved alert set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// No snapshot ingested yet.
    Unknown,
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Healthy,
    Degraded,
    Down,
}

/// Health of one named backend service, derived from status snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub name: String,
    pub state: ServiceState,
    pub last_seen: DateTime<Utc>,
    pub detail: Option<String>,
}

struct HealthInner {
    history: std::collections::VecDeque<PerformanceSnapshot>,
    alerts: AlertBook,
    services: HashMap<String, ServiceHealth>,
    latest: Option<PerformanceSnapshot>,
}

pub struct HealthAggregator {
    cfg: HealthConfig,
    inner: Mutex<HealthInner>,
    faults: mpsc::UnboundedSender<Fault>,
    fps_tx: watch::Sender<f64>,
}

enum Direction {
    Below,
    Above,
}

impl HealthAggregator {
    pub fn new(cfg: HealthConfig, faults: mpsc::UnboundedSender<Fault>) -> Self {
        let inner = HealthInner {
            history: std::collections::VecDeque::with_capacity(cfg.history_len.min(1024)),
            alerts: AlertBook::new(cfg.max_alerts, cfg.alert_retention_ms),
            services: HashMap::new(),
            latest: None,
        };
        let (fps_tx, _) = watch::channel(0.0);
        Self {
            cfg,
            inner: Mutex::new(inner),
            faults,
            fps_tx,
        }
    }

    /// Ingests a status envelope payload: the snapshot itself (or a nested
    /// `metrics` object) plus an optional `services` map. A payload carrying
    /// no metric fields at all (services-only updates) skips the snapshot
    /// path entirely rather than evaluating thresholds against zeros.
    pub fn ingest_envelope(&self, payload: &serde_json::Value) {
        const METRIC_KEYS: [&str; 7] = [
            "fps",
            "latency",
            "frameDrops",
            "memoryUsage",
            "cpuUsage",
            "gpuUsage",
            "networkBandwidth",
        ];
        let metrics = match payload.get("metrics") {
            Some(nested) => Some(nested),
            None if METRIC_KEYS.iter().any(|k| payload.get(k).is_some()) => Some(payload),
            None => None,
        };
        if let Some(metrics) = metrics {
            match serde_json::from_value::<PerformanceSnapshot>(metrics.clone()) {
                Ok(snapshot) => self.ingest_status(snapshot),
                Err(e) => {
                    log::warn!("Malformed status payload: {}", e);
                    let _ = self.faults.send(Fault::new(
                        FaultKind::ParsingError,
                        Severity::Low,
                        HEALTH_COMPONENT,
                        "malformed status payload",
                    ));
                }
            }
        }
        if let Some(services) = payload.get("services").and_then(|v| v.as_object()) {
            for (name, value) in services {
                let (state, detail) = parse_service_entry(value);
                self.update_service(name, state, detail);
            }
        }
    }

    /// Updates current status, appends to the bounded history, and evaluates
    /// the alert thresholds.
    pub fn ingest_status(&self, snapshot: PerformanceSnapshot) {
        let mut inner = self.inner.lock().expect("HealthAggregator lock poisoned");
        if inner.history.len() == self.cfg.history_len {
            inner.history.pop_front();
        }
        inner.history.push_back(snapshot.clone());

        let t = self.cfg.thresholds.clone();
        self.evaluate(
            &mut inner,
            "fps_low",
            snapshot.fps,
            &t.fps,
            Direction::Below,
            "fps",
        );
        self.evaluate(
            &mut inner,
            "latency_high",
            snapshot.latency,
            &t.latency_ms,
            Direction::Above,
            "latency",
        );
        self.evaluate(
            &mut inner,
            "cpu_high",
            snapshot.cpu_usage,
            &t.cpu_pct,
            Direction::Above,
            "cpu usage",
        );
        self.evaluate(
            &mut inner,
            "memory_high",
            snapshot.memory_usage,
            &t.memory_mb,
            Direction::Above,
            "memory usage",
        );
        self.evaluate(
            &mut inner,
            "frame_drops_high",
            snapshot.frame_drops as f64,
            &t.frame_drops,
            Direction::Above,
            "frame drops",
        );

        self.fps_tx.send_replace(snapshot.fps);
        inner.latest = Some(snapshot);
    }

    fn evaluate(
        &self,
        inner: &mut HealthInner,
        id: &str,
        value: f64,
        band: &MetricBand,
        direction: Direction,
        label: &str,
    ) {
        match breach_level(value, band, &direction) {
            Some(severity) => {
                let bound = match severity {
                    AlertSeverity::Critical => band.critical,
                    _ => band.warning,
                };
                let verb = match direction {
                    Direction::Below => "below",
                    Direction::Above => "above",
                };
                inner.alerts.raise(
                    id,
                    severity,
                    format!("{} {:.1} {} threshold {:.1}", label, value, verb, bound),
                    HEALTH_COMPONENT,
                );
                if severity == AlertSeverity::Critical {
                    let _ = self.faults.send(Fault::new(
                        FaultKind::PerformanceError,
                        Severity::High,
                        HEALTH_COMPONENT,
                        format!("{} past critical threshold", label),
                    ));
                }
            }
            None => {
                inner.alerts.resolve(id);
            }
        }
    }

    pub fn update_service(&self, name: &str, state: ServiceState, detail: Option<String>) {
        let mut inner = self.inner.lock().expect("HealthAggregator lock poisoned");
        let entry = inner
            .services
            .entry(name.to_string())
            .or_insert_with(|| ServiceHealth {
                name: name.to_string(),
                state,
                last_seen: Utc::now(),
                detail: None,
            });
        if entry.state != state {
            log::info!("Service '{}' is now {:?}", name, state);
        }
        entry.state = state;
        entry.last_seen = Utc::now();
        entry.detail = detail;
    }

    /// Aggregate health derived from the unresolved alert set. Pure read.
    pub fn current_status(&self) -> HealthState {
        let inner = self.inner.lock().expect("HealthAggregator lock poisoned");
        if inner.latest.is_none() {
            return HealthState::Unknown;
        }
        let open = inner.alerts.unresolved();
        if open.iter().any(|a| a.severity == AlertSeverity::Critical) {
            HealthState::Critical
        } else if !open.is_empty() {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    }

    pub fn latest_snapshot(&self) -> Option<PerformanceSnapshot> {
        self.inner
            .lock()
            .expect("HealthAggregator lock poisoned")
            .latest
            .clone()
    }

    pub fn performance_history(&self) -> Vec<PerformanceSnapshot> {
        self.inner
            .lock()
            .expect("HealthAggregator lock poisoned")
            .history
            .iter()
            .cloned()
            .collect()
    }

    pub fn unresolved_alerts(&self) -> Vec<Alert> {
        self.inner
            .lock()
            .expect("HealthAggregator lock poisoned")
            .alerts
            .unresolved()
    }

    pub fn resolved_alerts(&self) -> Vec<Alert> {
        self.inner
            .lock()
            .expect("HealthAggregator lock poisoned")
            .alerts
            .resolved()
    }

    pub fn service_health(&self) -> Vec<ServiceHealth> {
        let inner = self.inner.lock().expect("HealthAggregator lock poisoned");
        let mut out: Vec<_> = inner.services.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Latest fps as a watch channel, consumed by the orchestrator's status
    /// derivation.
    pub fn watch_fps(&self) -> watch::Receiver<f64> {
        self.fps_tx.subscribe()
    }

    /// Retention/cap pass over alerts plus staleness marking for services.
    /// Driven by the orchestrator's cleanup tick.
    pub fn cleanup(&self) {
        let mut inner = self.inner.lock().expect("HealthAggregator lock poisoned");
        let now = Utc::now();
        inner.alerts.cleanup(now);
        let down_after = chrono::Duration::milliseconds(self.cfg.service_down_after_ms as i64);
        for service in inner.services.values_mut() {
            if service.state != ServiceState::Down
                && now.signed_duration_since(service.last_seen) > down_after
            {
                log::warn!("Service '{}' has gone silent; marking down.", service.name);
                service.state = ServiceState::Down;
            }
        }
    }

    /// Clears history, alerts and service state.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("HealthAggregator lock poisoned");
        inner.history.clear();
        inner.alerts.clear();
        inner.services.clear();
        inner.latest = None;
        self.fps_tx.send_replace(0.0);
        log::info!("Health aggregator reset.");
    }
}

fn breach_level(value: f64, band: &MetricBand, direction: &Direction) -> Option<AlertSeverity> {
    match direction {
        Direction::Below => {
            if value < band.critical {
                Some(AlertSeverity::Critical)
            } else if value < band.warning {
                Some(AlertSeverity::Warning)
            } else {
                None
            }
        }
        Direction::Above => {
            if value > band.critical {
                Some(AlertSeverity::Critical)
            } else if value > band.warning {
                Some(AlertSeverity::Warning)
            } else {
                None
            }
        }
    }
}

fn parse_service_entry(value: &serde_json::Value) -> (ServiceState, Option<String>) {
    let status = value
        .as_str()
        .or_else(|| value.get("status").and_then(|s| s.as_str()))
        .unwrap_or("degraded");
    let state = match status {
        "healthy" | "ok" | "up" => ServiceState::Healthy,
        "down" | "offline" | "error" => ServiceState::Down,
        _ => ServiceState::Degraded,
    };
    let detail = value
        .get("detail")
        .and_then(|d| d.as_str())
        .map(|s| s.to_string());
    (state, detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn aggregator() -> (HealthAggregator, mpsc::UnboundedReceiver<Fault>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (HealthAggregator::new(HealthConfig::default(), tx), rx)
    }

    fn snapshot(fps: f64) -> PerformanceSnapshot {
        PerformanceSnapshot {
            fps,
            latency: 50.0,
            cpu_usage: 40.0,
            memory_usage: 512.0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn steady_state_breach_never_duplicates_alerts() {
        let (health, _faults) = aggregator();
        for _ in 0..5 {
            health.ingest_status(snapshot(15.0));
        }
        let open = health.unresolved_alerts();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, "fps_low");
        assert_eq!(open[0].severity, AlertSeverity::Warning);
    }

    #[tokio::test]
    async fn severity_escalates_in_place_not_by_duplication() {
        let (health, mut faults) = aggregator();
        // fps falls 30 -> 18 -> 8 across ticks: warning band then critical.
        health.ingest_status(snapshot(30.0));
        assert!(health.unresolved_alerts().is_empty());
        health.ingest_status(snapshot(18.0));
        health.ingest_status(snapshot(8.0));

        let open = health.unresolved_alerts();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].severity, AlertSeverity::Critical);

        // The critical breach surfaced a performance fault.
        let fault = faults.recv().await.unwrap();
        assert_eq!(fault.kind, FaultKind::PerformanceError);
    }

    #[tokio::test]
    async fn clearing_condition_resolves_exactly_once() {
        let (health, _faults) = aggregator();
        health.ingest_status(snapshot(15.0));
        health.ingest_status(snapshot(25.0));
        health.ingest_status(snapshot(25.0));

        assert!(health.unresolved_alerts().is_empty());
        let resolved = health.resolved_alerts();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, "fps_low");
    }

    #[tokio::test]
    async fn history_ring_is_bounded_oldest_first_out() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let cfg = HealthConfig {
            history_len: 3,
            ..Default::default()
        };
        let health = HealthAggregator::new(cfg, tx);
        for fps in [31.0, 32.0, 33.0, 34.0] {
            health.ingest_status(snapshot(fps));
        }
        let history = health.performance_history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].fps, 32.0);
        assert_eq!(history[2].fps, 34.0);
    }

    #[tokio::test]
    async fn status_derivation_tracks_worst_open_alert() {
        let (health, _faults) = aggregator();
        assert_eq!(health.current_status(), HealthState::Unknown);

        health.ingest_status(snapshot(30.0));
        assert_eq!(health.current_status(), HealthState::Healthy);

        health.ingest_status(snapshot(15.0));
        assert_eq!(health.current_status(), HealthState::Degraded);

        health.ingest_status(snapshot(5.0));
        assert_eq!(health.current_status(), HealthState::Critical);
    }

    #[tokio::test]
    async fn envelope_payload_feeds_metrics_and_services() {
        let (health, _faults) = aggregator();
        health.ingest_envelope(&json!({
            "metrics": {"fps": 30.0, "latency": 42.0},
            "services": {
                "tracker": "healthy",
                "recorder": {"status": "down", "detail": "disk full"}
            }
        }));

        assert_eq!(health.latest_snapshot().unwrap().latency, 42.0);
        let services = health.service_health();
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].name, "recorder");
        assert_eq!(services[0].state, ServiceState::Down);
        assert_eq!(services[0].detail.as_deref(), Some("disk full"));
        assert_eq!(services[1].state, ServiceState::Healthy);
    }

    #[tokio::test]
    async fn services_only_payload_never_alerts_on_absent_metrics() {
        let (health, mut faults) = aggregator();
        health.ingest_envelope(&json!({"services": {"tracker": "healthy"}}));

        // No snapshot, no alerts, no faults: zeros were never fabricated.
        assert!(health.latest_snapshot().is_none());
        assert!(health.unresolved_alerts().is_empty());
        assert!(faults.try_recv().is_err());
        assert_eq!(health.service_health().len(), 1);
        assert_eq!(health.service_health()[0].state, ServiceState::Healthy);
    }

    #[tokio::test]
    async fn malformed_metrics_raise_a_parsing_fault() {
        let (health, mut faults) = aggregator();
        health.ingest_envelope(&json!({"metrics": {"fps": "fast"}}));
        assert_eq!(faults.recv().await.unwrap().kind, FaultKind::ParsingError);
        assert!(health.latest_snapshot().is_none());
    }

    #[tokio::test]
    async fn reset_returns_every_read_to_empty() {
        let (health, _faults) = aggregator();
        health.ingest_status(snapshot(5.0));
        health.update_service("tracker", ServiceState::Healthy, None);

        health.reset();
        assert_eq!(health.current_status(), HealthState::Unknown);
        assert!(health.performance_history().is_empty());
        assert!(health.unresolved_alerts().is_empty());
        assert!(health.resolved_alerts().is_empty());
        assert!(health.service_health().is_empty());
    }
}
