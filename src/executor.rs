//! Offload executor.
//!
//! Runs the blocking backend call for one operation on tokio's blocking pool
//! and hands the finished operation, with its outcome and keep-alive token, to
//! the completion dispatcher. The executor never calls a handler itself.

use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;

use crate::backend::CacheBackend;
use crate::connection::Shared;
use crate::dispatcher;
use crate::error::{Error, Result};
use crate::guard::KeepAlive;
use crate::operation::{Command, Operation, Reply};
use crate::server_set::ServerSet;

/// A completed operation on its way to the dispatcher.
pub(crate) struct Finished<B: CacheBackend> {
    pub(crate) op: Operation,
    pub(crate) outcome: Result<Reply>,
    pub(crate) pin: KeepAlive<Shared<B>>,
}

pub(crate) struct OffloadExecutor<B: CacheBackend> {
    backend: Arc<B>,
    runtime: Handle,
    completions: UnboundedSender<Finished<B>>,
    timeout: Option<Duration>,
}

impl<B: CacheBackend> OffloadExecutor<B> {
    pub(crate) fn new(
        backend: Arc<B>,
        runtime: Handle,
        completions: UnboundedSender<Finished<B>>,
        timeout: Option<Duration>,
    ) -> Self {
        OffloadExecutor {
            backend,
            runtime,
            completions,
            timeout,
        }
    }

    /// Offload `op` against the `servers` snapshot taken at dispatch time.
    pub(crate) fn submit(&self, op: Operation, servers: Arc<ServerSet>, pin: KeepAlive<Shared<B>>) {
        let backend = Arc::clone(&self.backend);
        let completions = self.completions.clone();
        let command = op.command_handle();
        let timeout = self.timeout;

        self.runtime.spawn(async move {
            let work = tokio::task::spawn_blocking(move || execute(&*backend, &servers, &command));

            let outcome = match timeout {
                Some(limit) => match tokio::time::timeout(limit, work).await {
                    Ok(joined) => joined.map_err(Error::from).and_then(|outcome| outcome),
                    // The worker keeps running; its result is dropped with the JoinHandle
                    Err(_) => Err(Error::Timeout(format!(
                        "{} #{} exceeded {:?}",
                        op.kind(),
                        op.id(),
                        limit
                    ))),
                },
                None => work.await.map_err(Error::from).and_then(|outcome| outcome),
            };

            if let Err(unsent) = completions.send(Finished { op, outcome, pin }) {
                warn!("Completion dispatcher is gone, delivering inline");
                dispatcher::deliver(unsent.0);
            }
        });
    }
}

/// Resolve the owning endpoint and run the blocking backend call for `command`.
pub(crate) fn execute<B: CacheBackend>(
    backend: &B,
    servers: &ServerSet,
    command: &Command,
) -> Result<Reply> {
    match command {
        Command::Get { key } => {
            let endpoint = servers.resolve(key)?;
            backend
                .get(endpoint, key)?
                .map(|item| Reply::Value(item.value))
                .ok_or(Error::NotFound)
        }
        Command::Gets { key } => {
            let endpoint = servers.resolve(key)?;
            backend
                .get(endpoint, key)?
                .map(Reply::Item)
                .ok_or(Error::NotFound)
        }
        Command::Store {
            mode,
            key,
            value,
            expiration,
        } => {
            let endpoint = servers.resolve(key)?;
            backend.store(endpoint, *mode, key, value, *expiration)?;
            Ok(Reply::Stored)
        }
        Command::Incr { key, offset } => {
            let endpoint = servers.resolve(key)?;
            Ok(Reply::Counter(backend.increment(endpoint, key, *offset)?))
        }
        Command::Decr { key, offset } => {
            let endpoint = servers.resolve(key)?;
            Ok(Reply::Counter(backend.decrement(endpoint, key, *offset)?))
        }
        Command::Delete { key, expiration } => {
            let endpoint = servers.resolve(key)?;
            backend.delete(endpoint, key, *expiration)?;
            Ok(Reply::Stored)
        }
        Command::Flush { expiration } => {
            if servers.is_empty() {
                return Err(Error::NoServers);
            }
            // Every endpoint is visited; the first failure is reported afterwards
            let mut first_error = None;
            for endpoint in servers.endpoints() {
                if let Err(e) = backend.flush(endpoint, *expiration) {
                    warn!("⚠ FLUSH failed on {}: {}", endpoint, e);
                    first_error.get_or_insert(e);
                }
            }
            match first_error {
                Some(e) => Err(e),
                None => Ok(Reply::Stored),
            }
        }
    }
}
