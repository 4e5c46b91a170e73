//! Completion dispatcher.
//!
//! A single task on the control runtime drains finished operations in arrival
//! order. For each one it invokes the handler exactly once, reports a panicking
//! handler on the fatal-error channel, emits [`Signal::Ready`], releases
//! removed servers nothing routes to anymore, and finally drops the keep-alive
//! token.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::backend::CacheBackend;
use crate::error::Error;
use crate::executor::Finished;
use crate::signals::Signal;

/// Dispatcher loop. Ends once every sender is gone, which happens after the
/// connection state has been reclaimed.
pub(crate) async fn run<B: CacheBackend>(mut completions: UnboundedReceiver<Finished<B>>) {
    while let Some(finished) = completions.recv().await {
        deliver(finished);
    }
    trace!("Completion dispatcher stopped");
}

/// Hand one outcome to its handler.
pub(crate) fn deliver<B: CacheBackend>(finished: Finished<B>) {
    let Finished { op, outcome, pin } = finished;
    let shared = pin.target();
    let (id, kind) = (op.id(), op.kind());

    match &outcome {
        Ok(_) => shared.metrics.record_completion(id, kind, op.elapsed()),
        Err(e) => shared.metrics.record_error(id, kind, e),
    }

    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| op.complete(outcome))) {
        let error = Error::HandlerPanicked(panic_message(payload.as_ref()));
        shared.metrics.report_handler_panic(id, kind, &error);
    }

    shared.signals.emit(Signal::Ready);
    // The worker has dropped its server snapshot by now
    shared.release_retired();
    drop(pin);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
