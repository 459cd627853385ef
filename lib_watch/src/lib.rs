//! Real-time ingestion and resilience core for a live camera monitoring
//! dashboard.
//!
//! The crate is organized around five cooperating pieces:
//!
//! * [`channel`] — the streaming connection to the backend: envelope codec,
//!   tag-based dispatch, liveness probing and connection quality.
//! * [`sync`] — per-source frame buffers kept on a shared, strictly
//!   increasing frame index, with drop accounting and playback scrubbing.
//! * [`health`] — performance snapshot history, per-service health and the
//!   deduplicated threshold alert set.
//! * [`resilience`] — fault classification into deduplicated error reports,
//!   per-component circuit breakers and the recovery action registry.
//! * [`orchestrator`] — wires the above together, derives the aggregate
//!   system status and owns the start / stop / restart lifecycle.
//!
//! Components never call each other directly. Faults flow over one mpsc
//! channel into the resilience engine; state flows out through watch
//! channels that the orchestrator folds into a single [`SystemStatus`].

pub mod channel;
pub mod config;
pub mod error;
pub mod health;
pub mod orchestrator;
pub mod resilience;
pub mod sync;

pub use config::CoreConfig;
pub use error::{CoreError, CoreResult, Fault, FaultKind, Severity};
pub use orchestrator::{Orchestrator, SystemStatus};
