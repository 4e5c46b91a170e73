//! Connection signals.
//!
//! Listeners are called on the control loop: `Ready` from the completion
//! dispatcher after each handler, `Connect` from `add_server`, `Close` from
//! `close()`. A panicking listener is logged and skipped.

use parking_lot::RwLock;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Event emitted by a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Signal {
    /// A server was added.
    Connect,
    /// One completion handler has returned.
    Ready,
    /// The connection was closed.
    Close,
}

impl Signal {
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Connect => "connect",
            Signal::Ready => "ready",
            Signal::Close => "close",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Handle returned by [`Connection::on`](crate::Connection::on).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(Signal) + Send + Sync + 'static>;

/// Registered listeners.
#[derive(Default)]
pub(crate) struct SignalHub {
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
}

impl SignalHub {
    pub(crate) fn new() -> Self {
        SignalHub::default()
    }

    pub(crate) fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(Signal) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener; returns whether it was registered.
    pub(crate) fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(registered, _)| *registered != id);
        listeners.len() != before
    }

    pub(crate) fn emit(&self, signal: Signal) {
        // Listeners may register or remove listeners; call them unlocked
        let snapshot: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(signal))).is_err() {
                error!("Listener for '{}' signal panicked", signal);
            }
        }
    }
}
