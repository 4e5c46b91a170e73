//! # memcache-async
//!
//! Asynchronous client core for a memcached cluster.
//!
//! ## Features
//!
//! - **Non-blocking verbs:** get/gets/set/add/replace/append/prepend/incr/decr/cas/delete/flush
//!   return immediately; the blocking network call runs on tokio's blocking pool
//! - **Exactly-once delivery:** every accepted operation delivers one outcome to
//!   its handler, on the runtime that created the connection
//! - **Pinned lifetime:** dropping every [`Connection`] handle with work in
//!   flight is safe; the state lives until the last outcome is delivered
//! - **Cluster aware:** modula or consistent key distribution over a
//!   copy-on-write server table
//! - **Backend agnostic:** an in-memory simulated cluster and a memcached
//!   backend (feature `memcached`), or your own [`CacheBackend`]
//!
//! ## Quick Start
//!
//! ```no_run
//! use memcache_async::{backend::InMemoryBackend, Command, Connection, ConnectionConfig, Signal};
//!
//! # async fn example() -> memcache_async::Result<()> {
//! let backend = InMemoryBackend::with_nodes(["127.0.0.1:11211".parse()?]);
//! let config = ConnectionConfig::default().with_servers(["127.0.0.1:11211"]);
//! let conn = Connection::connect(backend, config).await?;
//!
//! conn.on(|signal| {
//!     if signal == Signal::Ready {
//!         log::trace!("one operation delivered");
//!     }
//! });
//!
//! // Callback style
//! conn.set("counter", "10", 0, |result| {
//!     if let Err(e) = result {
//!         log::warn!("set failed: {}", e);
//!     }
//! })?;
//!
//! // Future style
//! let reply = conn.submit(Command::incr("counter", 5))?.await?;
//! println!("{:?}", reply);
//!
//! conn.close();
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate log;

pub mod backend;
pub mod config;
pub mod connection;
mod dispatcher;
pub mod error;
mod executor;
mod guard;
pub mod hash;
pub mod key;
pub mod observability;
pub mod operation;
pub mod server_set;
pub mod signals;

// Re-exports for convenience
pub use backend::CacheBackend;
pub use config::ConnectionConfig;
pub use connection::{Completion, Connection, ConnectionState};
pub use error::{Error, ErrorClass, Result};
pub use observability::{ConnectionMetrics, NoOpMetrics};
pub use operation::{Command, Item, OpKind, Reply, StoreMode};
pub use server_set::{Distribution, Endpoint};
pub use signals::{ListenerId, Signal};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
