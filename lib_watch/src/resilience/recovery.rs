//! Recovery action registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{CoreResult, FaultKind, Severity};

/// The fixed set of recovery actions the engine can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryActionKind {
    ChannelReconnect,
    SyncReset,
    QualityReduction,
    MemoryCleanup,
    StateRefresh,
    FullRestart,
}

impl RecoveryActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryActionKind::ChannelReconnect => "channel_reconnect",
            RecoveryActionKind::SyncReset => "sync_reset",
            RecoveryActionKind::QualityReduction => "quality_reduction",
            RecoveryActionKind::MemoryCleanup => "memory_cleanup",
            RecoveryActionKind::StateRefresh => "state_refresh",
            RecoveryActionKind::FullRestart => "full_restart",
        }
    }
}

impl fmt::Display for RecoveryActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a fault classification to the action that addresses it. `None` means
/// the fault is recorded but nothing is dispatched.
pub fn action_for(kind: FaultKind, severity: Severity) -> Option<RecoveryActionKind> {
    match kind {
        FaultKind::ConnectionError | FaultKind::NetworkError | FaultKind::TimeoutError => {
            Some(RecoveryActionKind::ChannelReconnect)
        }
        FaultKind::SynchronizationError => Some(RecoveryActionKind::SyncReset),
        FaultKind::FrameProcessingError | FaultKind::ParsingError => {
            Some(RecoveryActionKind::StateRefresh)
        }
        FaultKind::PerformanceError if severity >= Severity::High => {
            Some(RecoveryActionKind::QualityReduction)
        }
        FaultKind::PerformanceError => None,
        FaultKind::MemoryError => Some(RecoveryActionKind::MemoryCleanup),
        FaultKind::ValidationError => None,
        FaultKind::CriticalSystemError => Some(RecoveryActionKind::FullRestart),
    }
}

/// Boxed async implementation of one recovery action.
pub type RecoveryFn = Arc<dyn Fn() -> BoxFuture<'static, CoreResult<()>> + Send + Sync>;

/// A registered recovery action with its per-kind runtime state.
#[derive(Clone)]
pub(crate) struct RecoveryAction {
    pub kind: RecoveryActionKind,
    pub run: RecoveryFn,
    pub last_attempt: Option<Instant>,
}

impl fmt::Debug for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryAction")
            .field("kind", &self.kind)
            .field("last_attempt", &self.last_attempt)
            .finish()
    }
}

/// Registry of recovery implementations, keyed by action kind.
#[derive(Default)]
pub(crate) struct ActionRegistry {
    actions: HashMap<RecoveryActionKind, RecoveryAction>,
}

impl ActionRegistry {
    pub fn register(&mut self, kind: RecoveryActionKind, run: RecoveryFn) {
        self.actions.insert(
            kind,
            RecoveryAction {
                kind,
                run,
                last_attempt: None,
            },
        );
    }

    pub fn get(&self, kind: RecoveryActionKind) -> Option<&RecoveryAction> {
        self.actions.get(&kind)
    }

    pub fn get_mut(&mut self, kind: RecoveryActionKind) -> Option<&mut RecoveryAction> {
        self.actions.get_mut(&kind)
    }

    /// Clears cooldown bookkeeping for every action.
    pub fn clear_attempts(&mut self) {
        for action in self.actions.values_mut() {
            action.last_attempt = None;
        }
    }
}
