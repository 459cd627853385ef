//! Typed message envelopes exchanged over the streaming channel.
//!
//! An envelope is immutable once received: it is routed by its tag, never
//! mutated. Payloads stay opaque (`serde_json::Value`) — the core only needs
//! the tag to route and the frame fields to buffer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Envelope type tags. Inbound tags are dispatched to their consumers;
/// outbound tags are bare commands with no payload beyond the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    // Inbound.
    ConnectionEstablished,
    TrackingUpdate,
    SystemStatus,
    StatusUpdate,
    Pong,
    // Outbound.
    SubscribeTracking,
    UnsubscribeTracking,
    RequestStatus,
    Ping,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::ConnectionEstablished => "connection_established",
            EnvelopeKind::TrackingUpdate => "tracking_update",
            EnvelopeKind::SystemStatus => "system_status",
            EnvelopeKind::StatusUpdate => "status_update",
            EnvelopeKind::Pong => "pong",
            EnvelopeKind::SubscribeTracking => "subscribe_tracking",
            EnvelopeKind::UnsubscribeTracking => "unsubscribe_tracking",
            EnvelopeKind::RequestStatus => "request_status",
            EnvelopeKind::Ping => "ping",
        }
    }
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One typed message unit. Wire form is JSON with a `type` discriminator:
/// `{"type": "tracking_update", "payload": {...}, "timestamp": "..."}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// A bare envelope carrying only its tag.
    pub fn new(kind: EnvelopeKind) -> Self {
        Self {
            kind,
            payload: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_payload(kind: EnvelopeKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }
}
