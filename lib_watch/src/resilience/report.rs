//! Deduplicated error reports.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{Fault, FaultKind, Severity};
use crate::resilience::recovery::RecoveryActionKind;

/// A deduplicated record of one fault signature. Repeats of the same
/// signature bump `occurrences` instead of creating new reports.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    /// Content-derived id, stable across occurrences of the same signature.
    pub id: String,
    pub kind: FaultKind,
    pub severity: Severity,
    pub component: String,
    pub message: String,
    pub context: serde_json::Value,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrences: u64,
    /// The recovery action this report was routed to, if any.
    pub recovery_action: Option<RecoveryActionKind>,
    /// Set once a recovery attempt for this report succeeds.
    pub recovered: bool,
}

/// Signature hash: kind, component and a message prefix. Reports differing
/// only in volatile message tails (counters, timestamps) still collapse into
/// one signature as long as the first 64 bytes match.
pub fn report_id(kind: FaultKind, component: &str, message: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(component.as_bytes());
    hasher.update(b"|");
    hasher.update(&message.as_bytes()[..floor_char_boundary(message, 64)]);
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

impl ErrorReport {
    pub fn from_fault(fault: &Fault, action: Option<RecoveryActionKind>) -> Self {
        let now = Utc::now();
        Self {
            id: report_id(fault.kind, &fault.component, &fault.message),
            kind: fault.kind,
            severity: fault.severity,
            component: fault.component.clone(),
            message: fault.message.clone(),
            context: fault.context.clone(),
            first_seen: now,
            last_seen: now,
            occurrences: 1,
            recovery_action: action,
            recovered: false,
        }
    }

    /// Folds a repeat occurrence into this report. Severity only ratchets
    /// upward; a recurrence clears any earlier recovered mark.
    pub fn record_repeat(&mut self, fault: &Fault) {
        self.occurrences += 1;
        self.last_seen = Utc::now();
        self.message = fault.message.clone();
        if fault.severity > self.severity {
            self.severity = fault.severity;
        }
        if !fault.context.is_null() {
            self.context = fault.context.clone();
        }
        self.recovered = false;
    }
}

/// Aggregate counts over the report set, cheap enough to recompute per read.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorStats {
    pub total_reports: usize,
    pub total_occurrences: u64,
    pub by_kind: HashMap<String, u64>,
    pub by_severity: HashMap<String, u64>,
    pub recovered: usize,
}

impl ErrorStats {
    pub fn from_reports<'a>(reports: impl Iterator<Item = &'a ErrorReport>) -> Self {
        let mut stats = ErrorStats::default();
        for report in reports {
            stats.total_reports += 1;
            stats.total_occurrences += report.occurrences;
            *stats
                .by_kind
                .entry(report.kind.as_str().to_string())
                .or_insert(0) += report.occurrences;
            *stats
                .by_severity
                .entry(report.severity.to_string())
                .or_insert(0) += report.occurrences;
            if report.recovered {
                stats.recovered += 1;
            }
        }
        stats
    }

    /// Fraction of report signatures with a successful recovery. Zero when
    /// there are no reports.
    pub fn recovery_rate(&self) -> f64 {
        if self.total_reports == 0 {
            0.0
        } else {
            self.recovered as f64 / self.total_reports as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_stable_for_the_same_signature() {
        let a = report_id(FaultKind::ConnectionError, "channel", "socket closed");
        let b = report_id(FaultKind::ConnectionError, "channel", "socket closed");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn id_distinguishes_kind_component_and_message() {
        let base = report_id(FaultKind::ConnectionError, "channel", "socket closed");
        assert_ne!(
            base,
            report_id(FaultKind::NetworkError, "channel", "socket closed")
        );
        assert_ne!(
            base,
            report_id(FaultKind::ConnectionError, "sync", "socket closed")
        );
        assert_ne!(
            base,
            report_id(FaultKind::ConnectionError, "channel", "pong overdue")
        );
    }

    #[test]
    fn long_messages_collapse_on_their_prefix() {
        let head = "x".repeat(64);
        let a = report_id(FaultKind::MemoryError, "sync", &format!("{}-tail-1", head));
        let b = report_id(FaultKind::MemoryError, "sync", &format!("{}-tail-2", head));
        assert_eq!(a, b);
    }

    #[test]
    fn stats_expose_the_recovery_rate() {
        assert_eq!(ErrorStats::default().recovery_rate(), 0.0);

        let mut recovered = ErrorReport::from_fault(
            &Fault::new(FaultKind::SynchronizationError, Severity::High, "sync", "cursor diverged"),
            Some(RecoveryActionKind::SyncReset),
        );
        recovered.recovered = true;
        let pending = ErrorReport::from_fault(
            &Fault::new(FaultKind::ConnectionError, Severity::High, "channel", "socket closed"),
            Some(RecoveryActionKind::ChannelReconnect),
        );

        let stats = ErrorStats::from_reports([&recovered, &pending].into_iter());
        assert_eq!(stats.total_reports, 2);
        assert_eq!(stats.recovered, 1);
        assert_eq!(stats.recovery_rate(), 0.5);
    }

    #[test]
    fn repeat_ratchets_severity_and_counts() {
        let fault = Fault::new(FaultKind::TimeoutError, Severity::Medium, "channel", "pong");
        let mut report = ErrorReport::from_fault(&fault, None);
        report.recovered = true;

        let worse = Fault::new(FaultKind::TimeoutError, Severity::High, "channel", "pong");
        report.record_repeat(&worse);
        assert_eq!(report.occurrences, 2);
        assert_eq!(report.severity, Severity::High);
        assert!(!report.recovered);

        let milder = Fault::new(FaultKind::TimeoutError, Severity::Low, "channel", "pong");
        report.record_repeat(&milder);
        // Severity never ratchets back down.
        assert_eq!(report.severity, Severity::High);
    }
}
