//! # Envelope Dispatcher
//!
//! The dispatcher is the fan-out point for inbound envelopes: a typed topic
//! (the envelope tag) maps to an ordered list of subscriber callbacks.
//!
//! Contract:
//!
//! - Multiple handlers per tag are supported and invoked in registration
//!   order; envelopes of a single tag are dispatched in arrival order because
//!   the channel reader calls `dispatch` sequentially.
//! - A handler returning `Err` is logged and never propagates — one bad
//!   subscriber cannot take down the dispatch loop.
//! - `on()` hands back a `HandlerId` so subscribers can unregister safely
//!   without touching the registry internals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::channel::envelope::{Envelope, EnvelopeKind};
use crate::error::CoreError;

/// Fallible subscriber callback. Errors are caught and logged by the
/// dispatcher.
pub type EnvelopeHandler = Box<dyn Fn(&Envelope) -> Result<(), CoreError> + Send + Sync>;

/// Opaque registration handle returned by [`Dispatcher::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId {
    kind: EnvelopeKind,
    seq: u64,
}

pub struct Dispatcher {
    handlers: Mutex<HashMap<EnvelopeKind, Vec<(u64, Arc<EnvelopeHandler>)>>>,
    next_seq: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Registers a handler for one envelope tag and returns its id.
    pub fn on(&self, kind: EnvelopeKind, handler: EnvelopeHandler) -> HandlerId {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut handlers = self.handlers.lock().expect("Dispatcher lock poisoned");
        handlers.entry(kind).or_default().push((seq, Arc::new(handler)));
        HandlerId { kind, seq }
    }

    /// Unregisters a handler. Returns false if the id was already gone.
    pub fn off(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock().expect("Dispatcher lock poisoned");
        if let Some(list) = handlers.get_mut(&id.kind) {
            let before = list.len();
            list.retain(|(seq, _)| *seq != id.seq);
            return list.len() != before;
        }
        false
    }

    /// Fans one envelope out to every handler registered for its tag, in
    /// registration order. Returns the number of handlers invoked.
    ///
    /// Handlers run on a snapshot taken outside the registry lock, so a
    /// handler may call `on()`/`off()` (including removing itself) without
    /// deadlocking; such changes take effect from the next dispatch.
    pub fn dispatch(&self, envelope: &Envelope) -> usize {
        let snapshot: Vec<(u64, Arc<EnvelopeHandler>)> = {
            let handlers = self.handlers.lock().expect("Dispatcher lock poisoned");
            match handlers.get(&envelope.kind) {
                Some(list) => list.clone(),
                None => {
                    log::trace!("No handlers for envelope tag '{}'", envelope.kind);
                    return 0;
                }
            }
        };
        for (seq, handler) in &snapshot {
            if let Err(e) = handler(envelope) {
                log::warn!(
                    "Handler {} for '{}' failed: {}",
                    seq,
                    envelope.kind,
                    e
                );
            }
        }
        snapshot.len()
    }

    pub fn handler_count(&self, kind: EnvelopeKind) -> usize {
        let handlers = self.handlers.lock().expect("Dispatcher lock poisoned");
        handlers.get(&kind).map_or(0, |l| l.len())
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn fans_out_to_all_handlers_in_registration_order() {
        let dispatcher = Dispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            dispatcher.on(
                EnvelopeKind::TrackingUpdate,
                Box::new(move |_| {
                    order.lock().unwrap().push(tag);
                    Ok(())
                }),
            );
        }

        let invoked = dispatcher.dispatch(&Envelope::new(EnvelopeKind::TrackingUpdate));
        assert_eq!(invoked, 3);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn handler_errors_do_not_stop_the_fan_out() {
        let dispatcher = Dispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));

        dispatcher.on(
            EnvelopeKind::SystemStatus,
            Box::new(|_| Err(CoreError::NotConnected)),
        );
        let hits2 = Arc::clone(&hits);
        dispatcher.on(
            EnvelopeKind::SystemStatus,
            Box::new(move |_| {
                hits2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        dispatcher.dispatch(&Envelope::new(EnvelopeKind::SystemStatus));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_unregisters_exactly_one_handler() {
        let dispatcher = Dispatcher::new();
        let id = dispatcher.on(EnvelopeKind::Pong, Box::new(|_| Ok(())));
        dispatcher.on(EnvelopeKind::Pong, Box::new(|_| Ok(())));

        assert!(dispatcher.off(id));
        assert!(!dispatcher.off(id));
        assert_eq!(dispatcher.handler_count(EnvelopeKind::Pong), 1);
    }

    #[test]
    fn handler_may_unregister_itself_during_dispatch() {
        let dispatcher = Arc::new(Dispatcher::new());
        let slot = Arc::new(Mutex::new(None::<HandlerId>));

        let id = {
            let registry = Arc::clone(&dispatcher);
            let slot = Arc::clone(&slot);
            dispatcher.on(
                EnvelopeKind::StatusUpdate,
                Box::new(move |_| {
                    // One-shot subscriber: remove ourselves on first delivery.
                    if let Some(id) = slot.lock().unwrap().take() {
                        assert!(registry.off(id));
                    }
                    Ok(())
                }),
            )
        };
        *slot.lock().unwrap() = Some(id);

        let env = Envelope::new(EnvelopeKind::StatusUpdate);
        assert_eq!(dispatcher.dispatch(&env), 1);
        assert_eq!(dispatcher.handler_count(EnvelopeKind::StatusUpdate), 0);
        assert_eq!(dispatcher.dispatch(&env), 0);
    }

    #[test]
    fn dispatch_without_handlers_is_a_no_op() {
        let dispatcher = Dispatcher::new();
        assert_eq!(dispatcher.dispatch(&Envelope::new(EnvelopeKind::Ping)), 0);
    }
}
