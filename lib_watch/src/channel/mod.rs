//! Streaming channel: envelopes, dispatch, transport, client and quality.

pub mod client;
pub mod dispatcher;
pub mod envelope;
pub mod quality;
pub mod transport;

pub use client::{ChannelClient, ChannelState, CHANNEL_COMPONENT};
pub use dispatcher::{Dispatcher, EnvelopeHandler, HandlerId};
pub use envelope::{Envelope, EnvelopeKind};
pub use quality::ConnectionQuality;
pub use transport::{BackendPeer, Connection, MemoryTransport, Transport, WsTransport};
