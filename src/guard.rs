//! Connection lifetime guard.
//!
//! Every dispatched operation holds a [`KeepAlive`] token: a strong handle to
//! the connection state plus one unit of the outstanding-operation count. The
//! state cannot be reclaimed while a token exists, so handles may be dropped
//! with work still in flight and every handler still fires. When the last
//! token is released the count returns to zero and normal reclamation applies.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Outstanding-operation counter.
#[derive(Debug, Default)]
pub(crate) struct LifetimeGuard {
    outstanding: AtomicUsize,
}

impl LifetimeGuard {
    pub(crate) fn new() -> Self {
        LifetimeGuard {
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Record one more in-flight operation; returns the new count.
    pub(crate) fn acquire(&self) -> usize {
        self.outstanding.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Record a completion; returns the new count.
    ///
    /// Releasing with nothing outstanding is a bookkeeping bug: it panics in
    /// debug builds and leaves the count at zero otherwise.
    pub(crate) fn release(&self) -> usize {
        match self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(previous) => previous - 1,
            Err(_) => {
                debug_assert!(false, "lifetime guard released below zero");
                error!("Lifetime guard released below zero");
                0
            }
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

/// Anything that carries a [`LifetimeGuard`] and can be pinned.
pub(crate) trait Guarded: Send + Sync {
    fn guard(&self) -> &LifetimeGuard;
}

/// Keep-alive token for one in-flight operation.
///
/// Created on dispatch, dropped after the completion handler has run. Each
/// token releases exactly once because release happens in `Drop`.
pub(crate) struct KeepAlive<S: Guarded> {
    target: Arc<S>,
}

impl<S: Guarded> KeepAlive<S> {
    pub(crate) fn pin(target: Arc<S>) -> Self {
        let outstanding = target.guard().acquire();
        trace!("Pinned connection ({} outstanding)", outstanding);
        KeepAlive { target }
    }

    pub(crate) fn target(&self) -> &Arc<S> {
        &self.target
    }
}

impl<S: Guarded> Drop for KeepAlive<S> {
    fn drop(&mut self) {
        let outstanding = self.target.guard().release();
        if outstanding == 0 {
            trace!("Released last pin on connection");
        }
    }
}

impl<S: Guarded> fmt::Debug for KeepAlive<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeepAlive")
            .field("outstanding", &self.target.guard().outstanding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Target {
        guard: LifetimeGuard,
    }

    impl Guarded for Target {
        fn guard(&self) -> &LifetimeGuard {
            &self.guard
        }
    }

    fn target() -> Arc<Target> {
        Arc::new(Target {
            guard: LifetimeGuard::new(),
        })
    }

    #[test]
    fn test_guard_counts() {
        let guard = LifetimeGuard::new();
        assert_eq!(guard.acquire(), 1);
        assert_eq!(guard.acquire(), 2);
        assert_eq!(guard.release(), 1);
        assert_eq!(guard.release(), 0);
        assert_eq!(guard.outstanding(), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "released below zero")]
    fn test_guard_double_release_panics_in_debug() {
        let guard = LifetimeGuard::new();
        guard.release();
    }

    #[test]
    fn test_pin_keeps_target_alive() {
        let target = target();
        let weak = Arc::downgrade(&target);

        let pin = KeepAlive::pin(Arc::clone(&target));
        assert_eq!(target.guard().outstanding(), 1);

        drop(target);
        // The pin is now the only strong handle
        assert!(weak.upgrade().is_some());
        assert_eq!(pin.target().guard().outstanding(), 1);

        drop(pin);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_pins_release_in_any_order() {
        let target = target();
        let pins: Vec<_> = (0..5).map(|_| KeepAlive::pin(Arc::clone(&target))).collect();
        assert_eq!(target.guard().outstanding(), 5);

        for (i, pin) in pins.into_iter().rev().enumerate() {
            drop(pin);
            assert_eq!(target.guard().outstanding(), 4 - i);
        }
    }

    #[test]
    fn test_pins_across_threads() {
        let target = target();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pin = KeepAlive::pin(Arc::clone(&target));
                std::thread::spawn(move || drop(pin))
            })
            .collect();

        for handle in handles {
            handle.join().expect("Thread panicked");
        }
        assert_eq!(target.guard().outstanding(), 0);
    }
}
