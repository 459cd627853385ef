//! Deduplicated alert set with hysteresis and retention.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;

/// Alert severity as shown to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// One alert. The id is stable per condition, not per occurrence: repeated
/// breaches of the same condition update the existing entry in place.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Owns the alert map. Only the health aggregator mutates it; readers get
/// clones.
pub(crate) struct AlertBook {
    alerts: HashMap<String, Alert>,
    max_alerts: usize,
    retention: ChronoDuration,
}

impl AlertBook {
    pub fn new(max_alerts: usize, retention_ms: u64) -> Self {
        Self {
            alerts: HashMap::new(),
            max_alerts: max_alerts.max(1),
            retention: ChronoDuration::milliseconds(retention_ms as i64),
        }
    }

    /// Creates the alert on first breach, or updates the unresolved entry in
    /// place (severity escalation included). A previously resolved alert for
    /// the same condition id is reopened as a fresh occurrence.
    pub fn raise(
        &mut self,
        id: &str,
        severity: AlertSeverity,
        message: impl Into<String>,
        source: &str,
    ) {
        let now = Utc::now();
        match self.alerts.get_mut(id) {
            Some(existing) if !existing.resolved => {
                existing.severity = severity;
                existing.message = message.into();
                existing.timestamp = now;
            }
            _ => {
                self.alerts.insert(
                    id.to_string(),
                    Alert {
                        id: id.to_string(),
                        severity,
                        message: message.into(),
                        source: source.to_string(),
                        timestamp: now,
                        resolved: false,
                        resolved_at: None,
                    },
                );
                log::warn!("Alert raised: {} ({:?})", id, severity);
            }
        }
    }

    /// Marks the alert resolved exactly once. Returns true on the transition.
    pub fn resolve(&mut self, id: &str) -> bool {
        if let Some(alert) = self.alerts.get_mut(id) {
            if !alert.resolved {
                alert.resolved = true;
                alert.resolved_at = Some(Utc::now());
                log::info!("Alert resolved: {}", id);
                return true;
            }
        }
        false
    }

    /// Purges resolved alerts past the retention window and enforces the
    /// outstanding cap, evicting the oldest resolved entries first.
    pub fn cleanup(&mut self, now: DateTime<Utc>) {
        let retention = self.retention;
        self.alerts.retain(|_, a| match a.resolved_at {
            Some(at) => now.signed_duration_since(at) < retention,
            None => true,
        });

        while self.alerts.len() > self.max_alerts {
            // Oldest resolved first; only then the oldest unresolved.
            let victim = self
                .alerts
                .values()
                .filter(|a| a.resolved)
                .min_by_key(|a| a.timestamp)
                .or_else(|| self.alerts.values().min_by_key(|a| a.timestamp))
                .map(|a| a.id.clone());
            match victim {
                Some(id) => {
                    self.alerts.remove(&id);
                }
                None => break,
            }
        }
    }

    pub fn unresolved(&self) -> Vec<Alert> {
        let mut out: Vec<_> = self
            .alerts
            .values()
            .filter(|a| !a.resolved)
            .cloned()
            .collect();
        out.sort_by_key(|a| a.timestamp);
        out
    }

    pub fn resolved(&self) -> Vec<Alert> {
        let mut out: Vec<_> = self
            .alerts
            .values()
            .filter(|a| a.resolved)
            .cloned()
            .collect();
        out.sort_by_key(|a| a.timestamp);
        out
    }

    pub fn get(&self, id: &str) -> Option<&Alert> {
        self.alerts.get(id)
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn clear(&mut self) {
        self.alerts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> AlertBook {
        AlertBook::new(100, 24 * 60 * 60 * 1000)
    }

    #[test]
    fn repeated_breaches_update_in_place() {
        let mut book = book();
        book.raise("fps_low", AlertSeverity::Warning, "fps 18", "health");
        book.raise("fps_low", AlertSeverity::Warning, "fps 17", "health");
        book.raise("fps_low", AlertSeverity::Critical, "fps 8", "health");

        let open = book.unresolved();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].severity, AlertSeverity::Critical);
        assert_eq!(open[0].message, "fps 8");
    }

    #[test]
    fn resolve_fires_exactly_once() {
        let mut book = book();
        book.raise("cpu_high", AlertSeverity::Warning, "cpu 85", "health");
        assert!(book.resolve("cpu_high"));
        assert!(!book.resolve("cpu_high"));
        assert!(book.unresolved().is_empty());
        assert_eq!(book.resolved().len(), 1);
    }

    #[test]
    fn reopened_condition_starts_a_fresh_occurrence() {
        let mut book = book();
        book.raise("cpu_high", AlertSeverity::Warning, "cpu 85", "health");
        book.resolve("cpu_high");
        book.raise("cpu_high", AlertSeverity::Warning, "cpu 88", "health");

        assert_eq!(book.unresolved().len(), 1);
        // The resolved occurrence was replaced, not kept alongside.
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn retention_purges_resolved_alerts() {
        let mut book = AlertBook::new(100, 1_000);
        book.raise("memory_high", AlertSeverity::Warning, "mem", "health");
        book.resolve("memory_high");
        book.raise("cpu_high", AlertSeverity::Warning, "cpu", "health");

        let later = Utc::now() + ChronoDuration::milliseconds(2_000);
        book.cleanup(later);
        // Resolved alert purged; unresolved one survives.
        assert!(book.get("memory_high").is_none());
        assert!(book.get("cpu_high").is_some());
    }

    #[test]
    fn cap_evicts_oldest_resolved_first() {
        let mut book = AlertBook::new(2, 1_000_000_000);
        book.raise("a", AlertSeverity::Warning, "a", "health");
        book.resolve("a");
        book.raise("b", AlertSeverity::Warning, "b", "health");
        book.raise("c", AlertSeverity::Warning, "c", "health");

        book.cleanup(Utc::now());
        assert_eq!(book.len(), 2);
        assert!(book.get("a").is_none());
        assert!(book.get("b").is_some());
        assert!(book.get("c").is_some());
    }
}
