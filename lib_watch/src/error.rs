//! # Error Types and Fault Taxonomy
//!
//! Two distinct kinds of "error" live here and they are deliberately separate:
//!
//! 1. `CoreError` — the operational error type returned by fallible library
//!    calls (`connect()`, recovery execution, config parsing). Standard
//!    `thiserror` enum, propagated with `?`.
//!
//! 2. `Fault` — a *classified* runtime fault handed to the resilience engine
//!    over the fault channel. Faults never cross component boundaries as
//!    panics or `Err` returns; they are captured where they occur, tagged with
//!    a `FaultKind` and `Severity`, and routed for deduplication and recovery.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Result alias used throughout the crate.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Operational errors returned by the library's fallible operations.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Transport-level failure (connect refused, socket error, codec error).
    #[error("transport error: {0}")]
    Transport(String),

    /// An operation exceeded its configured deadline.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The channel is not in a state that allows the requested operation.
    #[error("channel is not connected")]
    NotConnected,

    /// A recovery action kind with no registered implementation.
    #[error("recovery action '{0}' is not registered")]
    UnknownAction(String),

    /// A recovery action executed but did not succeed.
    #[error("recovery '{action}' failed: {reason}")]
    RecoveryFailed { action: String, reason: String },

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid or inconsistent configuration values.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// The fixed classification taxonomy for runtime faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    ConnectionError,
    FrameProcessingError,
    SynchronizationError,
    PerformanceError,
    ValidationError,
    TimeoutError,
    MemoryError,
    NetworkError,
    ParsingError,
    CriticalSystemError,
}

impl FaultKind {
    /// Stable wire/name form of the kind, used in report ids and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::ConnectionError => "connection_error",
            FaultKind::FrameProcessingError => "frame_processing_error",
            FaultKind::SynchronizationError => "synchronization_error",
            FaultKind::PerformanceError => "performance_error",
            FaultKind::ValidationError => "validation_error",
            FaultKind::TimeoutError => "timeout_error",
            FaultKind::MemoryError => "memory_error",
            FaultKind::NetworkError => "network_error",
            FaultKind::ParsingError => "parsing_error",
            FaultKind::CriticalSystemError => "critical_system_error",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fault severity, independent of the fault kind.
///
/// Ordering is ascending, so `Severity::Critical` compares greater than the
/// other variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// A classified runtime fault, as sent over the fault channel to the
/// resilience engine.
#[derive(Debug, Clone)]
pub struct Fault {
    pub kind: FaultKind,
    pub severity: Severity,
    /// Name of the component that observed the fault (e.g. `"channel"`).
    pub component: String,
    pub message: String,
    /// Free-form structured context attached to the report.
    pub context: serde_json::Value,
}

impl Fault {
    pub fn new(
        kind: FaultKind,
        severity: Severity,
        component: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            severity,
            component: component.into(),
            message: message.into(),
            context: serde_json::Value::Null,
        }
    }

    /// Attaches structured context to the fault.
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_ascending() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn fault_kind_round_trips_through_serde() {
        let json = serde_json::to_string(&FaultKind::ConnectionError).unwrap();
        assert_eq!(json, "\"connection_error\"");
        let back: FaultKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, FaultKind::ConnectionError);
    }
}
