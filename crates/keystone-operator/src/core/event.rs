//!
//! # Cancellation
//!
//! `CancelEvent` stops one reconcile or the whole controller. `CancelRegistry`
//! tracks the event of every reconcile in flight, keyed by server.
//!
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use event_listener::Event;
use tracing::trace;

use keystone_metadata::ObjectKey;

/// why a cancel event fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// controller is stopping
    Shutdown,
    /// server went away while being reconciled
    ServerDeleted,
}

impl CancelReason {
    fn encode(self) -> u8 {
        match self {
            Self::Shutdown => 1,
            Self::ServerDeleted => 2,
        }
    }

    fn decode(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Shutdown),
            2 => Some(Self::ServerDeleted),
            _ => None,
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown => write!(f, "shutdown"),
            Self::ServerDeleted => write!(f, "server deleted"),
        }
    }
}

/// Cancellation signal that stays fired.
///
/// Waiters registered before or after `cancel` all resolve. Only the first
/// reason is kept.
#[derive(Debug)]
pub struct CancelEvent {
    reason: AtomicU8,
    event: Event,
}

impl Default for CancelEvent {
    fn default() -> Self {
        Self {
            reason: AtomicU8::new(0),
            event: Event::new(),
        }
    }
}

impl CancelEvent {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        CancelReason::decode(self.reason.load(Ordering::Acquire))
    }

    /// resolve once cancelled
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            // registered before the re-check so a concurrent cancel is not lost
            let listener = self.event.listen();
            if self.is_cancelled() {
                return;
            }
            listener.await;
        }
    }

    pub fn cancel(&self) {
        self.cancel_with(CancelReason::Shutdown);
    }

    /// fire with `reason`; returns false if already cancelled
    pub fn cancel_with(&self, reason: CancelReason) -> bool {
        let fired = self
            .reason
            .compare_exchange(0, reason.encode(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if fired {
            trace!(%reason, "cancelled");
            self.event.notify(usize::MAX);
        }
        fired
    }
}

/// cancel events of in flight reconciles
#[derive(Debug, Default)]
pub struct CancelRegistry {
    events: HashMap<ObjectKey, Arc<CancelEvent>>,
}

impl CancelRegistry {
    /// fresh event for `key`, replacing any previous one
    pub fn register(&mut self, key: ObjectKey) -> Arc<CancelEvent> {
        let event = CancelEvent::shared();
        self.events.insert(key, event.clone());
        event
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.events.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// cancel the reconcile of `key`, if one is running
    pub fn cancel(&self, key: &ObjectKey, reason: CancelReason) -> bool {
        match self.events.get(key) {
            Some(event) => event.cancel_with(reason),
            None => false,
        }
    }

    /// forget `key` once its reconcile finished
    pub fn release(&mut self, key: &ObjectKey) -> Option<Arc<CancelEvent>> {
        self.events.remove(key)
    }

    pub fn cancel_all(&self, reason: CancelReason) {
        for event in self.events.values() {
            event.cancel_with(reason);
        }
    }
}
