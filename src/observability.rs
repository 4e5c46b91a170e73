//! Observability hooks for the operation lifecycle.
//!
//! Implement [`ConnectionMetrics`] to feed your monitoring system:
//!
//! ```ignore
//! use memcache_async::observability::ConnectionMetrics;
//! use memcache_async::operation::OpKind;
//! use std::time::Duration;
//!
//! struct PrometheusMetrics;
//!
//! impl ConnectionMetrics for PrometheusMetrics {
//!     fn record_completion(&self, _id: u64, kind: OpKind, elapsed: Duration) {
//!         // histogram!("memcache_latency", "verb" => kind.as_str()).record(elapsed);
//!     }
//!     // ... override the other hooks as needed
//! }
//!
//! // let conn = Connection::with_metrics(backend, config, Box::new(PrometheusMetrics))?;
//! ```
//!
//! Every hook has a default body that logs through the `log` crate, so an
//! implementation only overrides what it cares about. [`NoOpMetrics`] silences
//! everything except handler panics.
//!
//! # Hooks
//!
//! - `record_dispatch()` - Operation offloaded
//! - `record_completion()` - Handler is about to receive a successful outcome
//! - `record_error()` - Handler is about to receive an error outcome
//! - `report_handler_panic()` - Fatal-error channel: a handler panicked

use std::time::Duration;

use crate::error::Error;
use crate::operation::OpKind;

/// Trait for connection metrics collection.
pub trait ConnectionMetrics: Send + Sync {
    /// Record an operation handed to the offload executor.
    fn record_dispatch(&self, id: u64, kind: OpKind) {
        trace!("Dispatch #{} {}", id, kind);
    }

    /// Record a successful completion and its end-to-end latency.
    fn record_completion(&self, id: u64, kind: OpKind, elapsed: Duration) {
        debug!("Complete #{} {} took {:?}", id, kind, elapsed);
    }

    /// Record an error outcome.
    fn record_error(&self, id: u64, kind: OpKind, error: &Error) {
        match error {
            // Status replies are ordinary outcomes, not failures
            Error::NotFound | Error::NotStored | Error::Exists => {
                debug!("Complete #{} {}: {}", id, kind, error);
            }
            _ => warn!("Operation #{} {} failed: {}", id, kind, error),
        }
    }

    /// Fatal-error channel: a completion handler panicked.
    ///
    /// Dispatch continues with the next operation after this returns.
    fn report_handler_panic(&self, id: u64, kind: OpKind, error: &Error) {
        error!("Handler for #{} {} panicked: {}", id, kind, error);
    }
}

/// Default metrics implementation (no-op).
///
/// Handler panics are still logged.
#[derive(Clone, Default)]
pub struct NoOpMetrics;

impl ConnectionMetrics for NoOpMetrics {
    fn record_dispatch(&self, _id: u64, _kind: OpKind) {}
    fn record_completion(&self, _id: u64, _kind: OpKind, _elapsed: Duration) {}
    fn record_error(&self, _id: u64, _kind: OpKind, _error: &Error) {}
}
