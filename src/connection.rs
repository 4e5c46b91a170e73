//! Connection facade.
//!
//! [`Connection`] is a cheap, cloneable handle (one `Arc` increment) onto the
//! shared connection state. Every verb builds an [`Operation`], pins the state,
//! offloads the blocking backend call and returns immediately; the outcome is
//! delivered later to the completion handler on the control runtime.
//!
//! # Error reporting
//!
//! Each verb reports its failure through exactly one channel:
//! - an invalid key or operand is returned as `Err(ValidationError)` and the
//!   handler is dropped without being called;
//! - on a closed connection the handler is called with `ConnectionClosed`
//!   before the verb returns, and the verb itself returns `Ok(())`;
//! - everything else reaches the handler through the dispatcher.
//!
//! # Example
//!
//! ```no_run
//! use memcache_async::{backend::InMemoryBackend, Connection};
//!
//! # async fn example() -> memcache_async::error::Result<()> {
//! let backend = InMemoryBackend::with_nodes(["127.0.0.1:11211".parse()?]);
//! let conn = Connection::new(backend)?;
//! conn.add_server("127.0.0.1", 11211).await?;
//!
//! conn.set("greeting", "hello", 0, |result| {
//!     println!("stored: {:?}", result);
//! })?;
//! conn.get("greeting", |result| {
//!     println!("value: {:?}", result.map(String::from_utf8));
//! })?;
//! # Ok(())
//! # }
//! ```

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use crate::backend::CacheBackend;
use crate::config::ConnectionConfig;
use crate::dispatcher;
use crate::error::{Error, Result};
use crate::executor::OffloadExecutor;
use crate::guard::{Guarded, KeepAlive, LifetimeGuard};
use crate::observability::{ConnectionMetrics, NoOpMetrics};
use crate::operation::{typed, Command, Handler, Item, Operation, Reply, StoreMode};
use crate::server_set::{parse_server_list, Endpoint, ServerSet};
use crate::signals::{ListenerId, Signal, SignalHub};

/// Observable lifecycle state of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No servers registered.
    Created,
    /// At least one server, nothing in flight.
    Configured,
    /// At least one operation in flight.
    Active,
    /// `close()` was called; new operations are rejected.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Created => write!(f, "created"),
            ConnectionState::Configured => write!(f, "configured"),
            ConnectionState::Active => write!(f, "active"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// State shared by every handle and every in-flight operation.
pub(crate) struct Shared<B: CacheBackend> {
    backend: Arc<B>,
    config: ConnectionConfig,
    servers: RwLock<Arc<ServerSet>>,
    /// Snapshots published so far that in-flight work may still hold.
    published: Mutex<Vec<Weak<ServerSet>>>,
    /// Removed endpoints still reachable through older snapshots.
    retired: Mutex<Vec<Retired>>,
    closed: AtomicBool,
    guard: LifetimeGuard,
    pub(crate) signals: SignalHub,
    pub(crate) metrics: Box<dyn ConnectionMetrics>,
    executor: OffloadExecutor<B>,
    runtime: Handle,
    next_id: AtomicU64,
}

impl<B: CacheBackend> Guarded for Shared<B> {
    fn guard(&self) -> &LifetimeGuard {
        &self.guard
    }
}

/// An endpoint taken out of the server set whose backend connection is kept
/// until no snapshot routing to it is alive.
struct Retired {
    endpoint: Endpoint,
    holders: Vec<Weak<ServerSet>>,
}

impl Retired {
    fn is_held(&self) -> bool {
        self.holders.iter().any(|snapshot| snapshot.strong_count() > 0)
    }
}

impl<B: CacheBackend> Shared<B> {
    /// Replace the server snapshot with `change(current)`; returns the new
    /// server count.
    fn update_servers<F>(&self, change: F) -> Result<usize>
    where
        F: FnOnce(&ServerSet) -> Result<ServerSet>,
    {
        let mut servers = self.servers.write();
        let next = Arc::new(change(&**servers)?);
        let total = next.len();

        let mut published = self.published.lock();
        published.retain(|snapshot| snapshot.strong_count() > 0);
        published.push(Arc::downgrade(&next));
        *servers = next;
        Ok(total)
    }

    /// Defer the disconnect of a removed endpoint until the snapshots that
    /// still route to it are gone.
    fn retire(&self, endpoint: Endpoint) {
        let holders: Vec<Weak<ServerSet>> = self
            .published
            .lock()
            .iter()
            .filter(|snapshot| {
                snapshot
                    .upgrade()
                    .is_some_and(|servers| servers.contains(&endpoint))
            })
            .cloned()
            .collect();

        self.retired.lock().push(Retired { endpoint, holders });
        self.release_retired();
    }

    /// Take back retired entries for an endpoint that is being added again.
    fn unretire(&self, endpoint: &Endpoint) -> Vec<Retired> {
        let mut retired = self.retired.lock();
        let (taken, kept): (Vec<Retired>, Vec<Retired>) = retired
            .drain(..)
            .partition(|entry| &entry.endpoint == endpoint);
        *retired = kept;
        taken
    }

    /// Disconnect retired endpoints no live snapshot refers to.
    pub(crate) fn release_retired(&self) {
        let released: Vec<Endpoint> = {
            let mut retired = self.retired.lock();
            if retired.is_empty() {
                return;
            }
            let mut released = Vec::new();
            retired.retain(|entry| {
                if entry.is_held() {
                    true
                } else {
                    released.push(entry.endpoint.clone());
                    false
                }
            });
            released
        };

        let current = Arc::clone(&*self.servers.read());
        for endpoint in released {
            if current.contains(&endpoint) {
                continue;
            }
            self.backend.disconnect(&endpoint);
            debug!("✓ Server {} released", endpoint);
        }
    }
}

impl<B: CacheBackend> Drop for Shared<B> {
    fn drop(&mut self) {
        let current = Arc::clone(&*self.servers.read());
        for endpoint in current.endpoints() {
            self.backend.disconnect(endpoint);
        }
        for entry in self.retired.get_mut().drain(..) {
            if !current.contains(&entry.endpoint) {
                self.backend.disconnect(&entry.endpoint);
            }
        }
        debug!("✓ Connection state released");
    }
}

/// Handle to a memcached cluster connection.
///
/// Cloning is cheap and every clone drives the same connection. The shared
/// state lives until the last handle is dropped *and* every in-flight operation
/// has delivered its outcome.
pub struct Connection<B: CacheBackend> {
    shared: Arc<Shared<B>>,
}

impl<B: CacheBackend> Clone for Connection<B> {
    fn clone(&self) -> Self {
        Connection {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<B: CacheBackend> Connection<B> {
    /// Create a connection with default configuration and no servers.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` when called outside a tokio runtime.
    pub fn new(backend: B) -> Result<Self> {
        Self::with_config(backend, ConnectionConfig::default())
    }

    /// Create a connection with custom configuration. Servers listed in the
    /// configuration are not added; see [`Connection::connect`].
    ///
    /// # Errors
    /// Returns `Error::ConfigError` when called outside a tokio runtime.
    pub fn with_config(backend: B, config: ConnectionConfig) -> Result<Self> {
        Self::with_metrics(backend, config, Box::new(NoOpMetrics))
    }

    /// Create a connection with custom metrics.
    ///
    /// The completion dispatcher is spawned on the current tokio runtime, which
    /// becomes the connection's control loop: every handler and every signal
    /// listener runs there.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` when called outside a tokio runtime.
    pub fn with_metrics(
        backend: B,
        config: ConnectionConfig,
        metrics: Box<dyn ConnectionMetrics>,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            Error::ConfigError(format!(
                "a connection must be created inside a tokio runtime: {}",
                e
            ))
        })?;

        let backend = Arc::new(backend);
        let (completions, finished) = mpsc::unbounded_channel();
        let executor = OffloadExecutor::new(
            Arc::clone(&backend),
            runtime.clone(),
            completions,
            config.operation_timeout(),
        );

        let shared = Arc::new(Shared {
            servers: RwLock::new(Arc::new(ServerSet::new(config.distribution, config.hash))),
            published: Mutex::new(Vec::new()),
            retired: Mutex::new(Vec::new()),
            backend,
            config,
            closed: AtomicBool::new(false),
            guard: LifetimeGuard::new(),
            signals: SignalHub::new(),
            metrics,
            executor,
            runtime,
            next_id: AtomicU64::new(0),
        });

        shared.runtime.spawn(dispatcher::run(finished));
        debug!(
            "✓ Connection created ({} distribution, {} hash)",
            shared.config.distribution, shared.config.hash
        );
        Ok(Connection { shared })
    }

    /// Create a connection and add every server listed in `config`.
    ///
    /// # Errors
    /// Returns the first server registration error.
    pub async fn connect(backend: B, config: ConnectionConfig) -> Result<Self> {
        let endpoints = config.server_endpoints()?;
        let conn = Self::with_config(backend, config)?;
        for endpoint in endpoints {
            conn.add_endpoint(endpoint).await?;
        }
        Ok(conn)
    }

    // ========================================================================
    // Server management
    // ========================================================================

    /// Register a server after probing it through the backend.
    ///
    /// The probe runs on the blocking pool and is bounded by
    /// `connect_timeout_ms`. On failure nothing changes and no signal is
    /// emitted; on success [`Signal::Connect`] is emitted.
    ///
    /// # Errors
    /// - `Error::ConfigError` for an invalid or already registered endpoint
    /// - `Error::BackendError` / `Error::Timeout` if the probe fails
    /// - `Error::ConnectionClosed` after `close()`
    pub async fn add_server(&self, host: &str, port: u16) -> Result<()> {
        self.add_endpoint(Endpoint::new(host, port)?).await
    }

    async fn add_endpoint(&self, endpoint: Endpoint) -> Result<()> {
        self.ensure_open()?;
        if self.shared.servers.read().contains(&endpoint) {
            return Err(Error::ConfigError(format!(
                "server {} is already registered",
                endpoint
            )));
        }

        // A pending release of this endpoint would tear down the new connection
        let pending = self.shared.unretire(&endpoint);
        if let Err(e) = self.probe(&endpoint).await {
            warn!("Server {} is unreachable: {}", endpoint, e);
            self.shared.retired.lock().extend(pending);
            self.shared.release_retired();
            return Err(e);
        }

        if self.is_closed() {
            self.shared.backend.disconnect(&endpoint);
            return Err(Error::ConnectionClosed);
        }

        let total = self
            .shared
            .update_servers(|servers| servers.with_endpoint(endpoint.clone()))?;

        info!("✓ Server {} added ({} total)", endpoint, total);
        self.shared.signals.emit(Signal::Connect);
        Ok(())
    }

    /// Run `connect` for `endpoint` on the blocking pool, bounded by
    /// `connect_timeout_ms`.
    ///
    /// A probe that outlives the timeout keeps running; if it connects after
    /// all, that connection is released unless the endpoint got registered in
    /// the meantime.
    async fn probe(&self, endpoint: &Endpoint) -> Result<()> {
        let backend = Arc::clone(&self.shared.backend);
        let target = endpoint.clone();
        let mut probe = self
            .shared
            .runtime
            .spawn_blocking(move || backend.connect(&target));

        match tokio::time::timeout(self.shared.config.connect_timeout(), &mut probe).await {
            Ok(joined) => joined.map_err(Error::from).and_then(|outcome| outcome),
            Err(_) => {
                let backend = Arc::clone(&self.shared.backend);
                let shared = Arc::downgrade(&self.shared);
                let late = endpoint.clone();
                self.shared.runtime.spawn(async move {
                    if let Ok(Ok(())) = probe.await {
                        let registered = match shared.upgrade() {
                            Some(shared) => {
                                let servers = shared.servers.read();
                                servers.contains(&late)
                            }
                            None => false,
                        };
                        if !registered {
                            backend.disconnect(&late);
                            debug!("✓ Late connection to {} released", late);
                        }
                    }
                });
                Err(Error::Timeout(format!("connecting to {}", endpoint)))
            }
        }
    }

    /// Unregister a server. Operations already dispatched keep the snapshot
    /// they were issued with, and the backend connection to the server is
    /// released once the last of them has completed.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` if the server is not registered.
    pub fn remove_server(&self, host: &str, port: u16) -> Result<()> {
        let endpoint = Endpoint::new(host, port)?;
        let total = self
            .shared
            .update_servers(|servers| servers.without_endpoint(&endpoint))?;

        info!("✓ Server {} removed ({} left)", endpoint, total);
        self.shared.retire(endpoint);
        Ok(())
    }

    /// Add every server of a comma separated `host:port` list. Servers already
    /// registered are skipped.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` for a malformed list, or the first
    /// registration error.
    pub async fn set_servers(&self, list: &str) -> Result<()> {
        for endpoint in parse_server_list(list)? {
            if self.shared.servers.read().contains(&endpoint) {
                debug!("Server {} already registered", endpoint);
                continue;
            }
            self.add_endpoint(endpoint).await?;
        }
        Ok(())
    }

    /// Registered servers, in registration order.
    pub fn servers(&self) -> Vec<Endpoint> {
        self.shared.servers.read().endpoints().to_vec()
    }

    // ========================================================================
    // Verbs
    // ========================================================================

    /// Fetch a value. A miss completes with `Error::NotFound`.
    ///
    /// # Errors
    /// Returns `Error::ValidationError` for a bad key. After `close()` the
    /// handler receives `Error::ConnectionClosed` before this returns `Ok(())`.
    pub fn get<K, F>(&self, key: K, handler: F) -> Result<()>
    where
        K: AsRef<[u8]>,
        F: FnOnce(Result<Vec<u8>>) + Send + 'static,
    {
        self.dispatch(Ok(Command::get(key)), typed(handler))
    }

    /// Fetch a value with its CAS token.
    pub fn gets<K, F>(&self, key: K, handler: F) -> Result<()>
    where
        K: AsRef<[u8]>,
        F: FnOnce(Result<Item>) + Send + 'static,
    {
        self.dispatch(Ok(Command::gets(key)), typed(handler))
    }

    /// Store a value unconditionally.
    ///
    /// `expiration` is in seconds (0 never expires); values above 30 days are
    /// absolute unix times.
    pub fn set<K, V, F>(&self, key: K, value: V, expiration: i64, handler: F) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.store(StoreMode::Set, key, value, expiration, handler)
    }

    /// Store only if the key is absent, else `Error::NotStored`.
    pub fn add<K, V, F>(&self, key: K, value: V, expiration: i64, handler: F) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.store(StoreMode::Add, key, value, expiration, handler)
    }

    /// Store only if the key is present, else `Error::NotStored`.
    pub fn replace<K, V, F>(&self, key: K, value: V, expiration: i64, handler: F) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.store(StoreMode::Replace, key, value, expiration, handler)
    }

    pub fn append<K, V, F>(&self, key: K, value: V, expiration: i64, handler: F) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.store(StoreMode::Append, key, value, expiration, handler)
    }

    pub fn prepend<K, V, F>(&self, key: K, value: V, expiration: i64, handler: F) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.store(StoreMode::Prepend, key, value, expiration, handler)
    }

    /// Store only if the item still carries `token`.
    ///
    /// Completes with `Error::Exists` for a stale token and `Error::NotFound`
    /// for an absent key.
    pub fn cas<K, V, F>(
        &self,
        key: K,
        value: V,
        expiration: i64,
        token: u64,
        handler: F,
    ) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.store(StoreMode::Cas(token), key, value, expiration, handler)
    }

    fn store<K, V, F>(
        &self,
        mode: StoreMode,
        key: K,
        value: V,
        expiration: i64,
        handler: F,
    ) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.dispatch(
            Command::store(mode, key, value, expiration),
            typed(handler),
        )
    }

    /// Increment a counter; the handler receives the new value.
    pub fn incr<K, F>(&self, key: K, offset: u64, handler: F) -> Result<()>
    where
        K: AsRef<[u8]>,
        F: FnOnce(Result<u64>) + Send + 'static,
    {
        self.dispatch(Ok(Command::incr(key, offset)), typed(handler))
    }

    /// Decrement a counter, flooring at zero.
    pub fn decr<K, F>(&self, key: K, offset: u64, handler: F) -> Result<()>
    where
        K: AsRef<[u8]>,
        F: FnOnce(Result<u64>) + Send + 'static,
    {
        self.dispatch(Ok(Command::decr(key, offset)), typed(handler))
    }

    pub fn delete<K, F>(&self, key: K, expiration: i64, handler: F) -> Result<()>
    where
        K: AsRef<[u8]>,
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.dispatch(Command::delete(key, expiration), typed(handler))
    }

    /// Invalidate every item on every server, now or after `expiration`.
    /// A failing server does not stop the others; the first failure is what
    /// the handler receives.
    pub fn flush<F>(&self, expiration: i64, handler: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.dispatch(Command::flush(expiration), typed(handler))
    }

    /// Issue `command` and get a future for its outcome.
    ///
    /// ```no_run
    /// # use memcache_async::{backend::InMemoryBackend, Command, Connection, Reply};
    /// # async fn example(conn: Connection<InMemoryBackend>) -> memcache_async::error::Result<()> {
    /// let reply = conn.submit(Command::incr("visits", 1))?.await?;
    /// assert!(matches!(reply, Reply::Counter(_)));
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// On a closed connection the returned future resolves to
    /// `Err(ConnectionClosed)`.
    ///
    /// # Errors
    /// Returns `Error::ValidationError` for an invalid command.
    pub fn submit(&self, command: Command) -> Result<Completion> {
        let (tx, rx) = oneshot::channel::<Result<Reply>>();
        self.dispatch(
            Ok(command),
            Box::new(move |outcome: Result<Reply>| {
                // The caller may have dropped the future
                let _ = tx.send(outcome);
            }),
        )?;
        Ok(Completion { rx })
    }

    fn dispatch(&self, command: Result<Command>, handler: Handler) -> Result<()> {
        if self.is_closed() {
            debug!("Rejecting operation on closed connection");
            // The handler is the only report
            handler(Err(Error::ConnectionClosed));
            return Ok(());
        }

        let command = command?;
        command.validate(self.shared.config.verify_key)?;

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let op = Operation::new(id, command, handler);
        let servers = Arc::clone(&*self.shared.servers.read());
        let pin = KeepAlive::pin(Arc::clone(&self.shared));

        self.shared.metrics.record_dispatch(id, op.kind());
        self.shared.executor.submit(op, servers, pin);
        Ok(())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Stop accepting operations. In-flight operations still complete and
    /// their handlers still fire. Emits [`Signal::Close`] once.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(
            "⚠ Connection closed ({} operations still in flight)",
            self.outstanding()
        );
        self.shared.signals.emit(Signal::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_closed() {
            ConnectionState::Closed
        } else if self.shared.servers.read().is_empty() {
            ConnectionState::Created
        } else if self.outstanding() > 0 {
            ConnectionState::Active
        } else {
            ConnectionState::Configured
        }
    }

    /// Operations dispatched whose handlers have not yet returned.
    pub fn outstanding(&self) -> usize {
        self.shared.guard.outstanding()
    }

    /// Register a signal listener. Listeners run on the control runtime.
    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(Signal) + Send + Sync + 'static,
    {
        self.shared.signals.on(listener)
    }

    /// Remove a listener; returns whether it was registered.
    pub fn off(&self, id: ListenerId) -> bool {
        self.shared.signals.off(id)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::ConnectionClosed)
        } else {
            Ok(())
        }
    }
}

impl<B: CacheBackend> fmt::Debug for Connection<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("servers", &self.servers())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// Future returned by [`Connection::submit`].
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Result<Reply>>,
}

impl Future for Completion {
    type Output = Result<Reply>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(Error::Other("operation dropped before completion".to_string()))
            })
        })
    }
}
