//! Memcached cache backend implementation.
//!
//! One deadpool connection pool per endpoint. Verbs are called from the
//! blocking worker pool, so each call drives the async client to completion on
//! the runtime captured at construction.

use super::CacheBackend;
use crate::error::{Error, Result};
use crate::operation::{Item, StoreMode};
use crate::server_set::Endpoint;
use async_memcached::AsciiProtocol;
use dashmap::DashMap;
use deadpool_memcached::{Manager, Object, Pool};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

/// Default Memcached connection pool size per endpoint.
/// Formula: (CPU cores × 2) + 1
/// For 8-core systems: 16 connections is optimal
/// Override with MEMCACHED_POOL_SIZE environment variable
const DEFAULT_POOL_SIZE: u32 = 16;

/// Key probed when registering an endpoint.
const HEALTH_CHECK_KEY: &str = "__health_check__";

/// Configuration for Memcached backend.
#[derive(Clone, Debug)]
pub struct MemcachedConfig {
    pub connection_timeout: Duration,
    pub pool_size: u32,
}

impl Default for MemcachedConfig {
    fn default() -> Self {
        MemcachedConfig {
            connection_timeout: Duration::from_secs(5),
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

impl MemcachedConfig {
    /// Defaults, with the pool size taken from `MEMCACHED_POOL_SIZE` if set.
    pub fn from_env() -> Self {
        let pool_size = std::env::var("MEMCACHED_POOL_SIZE")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_POOL_SIZE);

        MemcachedConfig {
            pool_size,
            ..Default::default()
        }
    }
}

/// Memcached backend with per-endpoint connection pooling.
///
/// # Example
///
/// ```no_run
/// # use memcache_async::backend::{MemcachedBackend, MemcachedConfig};
/// # use memcache_async::{Connection, ConnectionConfig};
/// # async fn example() -> memcache_async::error::Result<()> {
/// let backend = MemcachedBackend::new(MemcachedConfig::from_env())?;
/// let config = ConnectionConfig::default().with_servers(["localhost:11211"]);
/// let conn = Connection::connect(backend, config).await?;
/// conn.set("key", "value", 0, |result| println!("{:?}", result))?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MemcachedBackend {
    config: MemcachedConfig,
    pools: Arc<DashMap<Endpoint, Pool>>,
    runtime: Handle,
}

impl MemcachedBackend {
    /// Create a backend bound to the current tokio runtime.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` when called outside a runtime.
    pub fn new(config: MemcachedConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            Error::ConfigError(format!("Memcached backend needs a tokio runtime: {}", e))
        })?;

        info!(
            "✓ Memcached backend initialized (pool size: {})",
            config.pool_size
        );

        Ok(MemcachedBackend {
            config,
            pools: Arc::new(DashMap::new()),
            runtime,
        })
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    fn pool(&self, endpoint: &Endpoint) -> Result<Pool> {
        self.pools
            .get(endpoint)
            .map(|pool| pool.value().clone())
            .ok_or_else(|| Error::BackendError(format!("{} is not connected", endpoint)))
    }

    async fn conn(pool: &Pool, endpoint: &Endpoint) -> Result<Object> {
        pool.get().await.map_err(|e| {
            Error::BackendError(format!(
                "Failed to get Memcached connection to {}: {}",
                endpoint, e
            ))
        })
    }
}

/// Map a client error onto the status codes the connection reports.
fn status_error(verb: &str, key: &[u8], e: impl std::fmt::Display) -> Error {
    let message = e.to_string();
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("not found") {
        Error::NotFound
    } else if lowered.contains("not stored") {
        Error::NotStored
    } else if lowered.contains("exists") {
        Error::Exists
    } else if lowered.contains("non-numeric") || lowered.contains("invalid numeric") {
        Error::NonNumeric
    } else {
        Error::BackendError(format!(
            "Memcached {} failed for key {}: {}",
            verb,
            String::from_utf8_lossy(key),
            message
        ))
    }
}

fn ttl(expiration: u32) -> Option<i64> {
    (expiration != 0).then(|| i64::from(expiration))
}

impl CacheBackend for MemcachedBackend {
    fn connect(&self, endpoint: &Endpoint) -> Result<()> {
        let manager = Manager::new(endpoint.to_string());
        let pool = Pool::builder(manager)
            .max_size(self.config.pool_size as usize)
            .build()
            .map_err(|e| Error::ConfigError(format!("Failed to create connection pool: {}", e)))?;

        let probe = async {
            let mut conn = Self::conn(&pool, endpoint).await?;
            conn.get(HEALTH_CHECK_KEY)
                .await
                .map_err(|e| Error::BackendError(format!("probe of {} failed: {}", endpoint, e)))?;
            Ok::<(), Error>(())
        };
        self.block_on(async {
            tokio::time::timeout(self.config.connection_timeout, probe)
                .await
                .map_err(|_| Error::Timeout(format!("connecting to {}", endpoint)))?
        })?;

        self.pools.insert(endpoint.clone(), pool);
        info!("✓ Memcached connected to {}", endpoint);
        Ok(())
    }

    fn disconnect(&self, endpoint: &Endpoint) {
        if self.pools.remove(endpoint).is_some() {
            debug!("✓ Memcached disconnected from {}", endpoint);
        }
    }

    fn get(&self, endpoint: &Endpoint, key: &[u8]) -> Result<Option<Item>> {
        let pool = self.pool(endpoint)?;
        self.block_on(async {
            let mut conn = Self::conn(&pool, endpoint).await?;
            match conn.get(key).await {
                Ok(Some(value)) => {
                    debug!("✓ Memcached GET {} -> HIT", String::from_utf8_lossy(key));
                    // The ascii client does not surface CAS tokens
                    Ok(value.data.map(|data| Item {
                        value: data,
                        cas: None,
                    }))
                }
                Ok(None) => {
                    debug!("✓ Memcached GET {} -> MISS", String::from_utf8_lossy(key));
                    Ok(None)
                }
                Err(e) => match status_error("GET", key, e) {
                    Error::NotFound => Ok(None),
                    other => Err(other),
                },
            }
        })
    }

    fn store(
        &self,
        endpoint: &Endpoint,
        mode: StoreMode,
        key: &[u8],
        value: &[u8],
        expiration: u32,
    ) -> Result<()> {
        let pool = self.pool(endpoint)?;
        self.block_on(async {
            let mut conn = Self::conn(&pool, endpoint).await?;
            match mode {
                StoreMode::Set => conn
                    .set(key, value, ttl(expiration), None)
                    .await
                    .map_err(|e| status_error("SET", key, e))?,
                StoreMode::Add => conn
                    .add(key, value, ttl(expiration), None)
                    .await
                    .map_err(|e| status_error("ADD", key, e))?,
                StoreMode::Replace
                | StoreMode::Append
                | StoreMode::Prepend
                | StoreMode::Cas(_) => {
                    return Err(Error::NotImplemented(format!(
                        "{} is not supported by the memcached backend",
                        mode.kind()
                    )))
                }
            }
            debug!(
                "✓ Memcached {} {} (exp: {})",
                mode.kind(),
                String::from_utf8_lossy(key),
                expiration
            );
            Ok(())
        })
    }

    fn increment(&self, endpoint: &Endpoint, key: &[u8], offset: u64) -> Result<u64> {
        let pool = self.pool(endpoint)?;
        self.block_on(async {
            let mut conn = Self::conn(&pool, endpoint).await?;
            let value = conn
                .increment(key, offset)
                .await
                .map_err(|e| status_error("INCR", key, e))?;
            debug!("✓ Memcached INCR {} -> {}", String::from_utf8_lossy(key), value);
            Ok(value)
        })
    }

    fn decrement(&self, endpoint: &Endpoint, key: &[u8], offset: u64) -> Result<u64> {
        let pool = self.pool(endpoint)?;
        self.block_on(async {
            let mut conn = Self::conn(&pool, endpoint).await?;
            let value = conn
                .decrement(key, offset)
                .await
                .map_err(|e| status_error("DECR", key, e))?;
            debug!("✓ Memcached DECR {} -> {}", String::from_utf8_lossy(key), value);
            Ok(value)
        })
    }

    fn delete(&self, endpoint: &Endpoint, key: &[u8], _expiration: u32) -> Result<()> {
        let pool = self.pool(endpoint)?;
        self.block_on(async {
            let mut conn = Self::conn(&pool, endpoint).await?;
            conn.delete(key)
                .await
                .map_err(|e| status_error("DELETE", key, e))?;
            debug!("✓ Memcached DELETE {}", String::from_utf8_lossy(key));
            Ok(())
        })
    }

    fn flush(&self, endpoint: &Endpoint, expiration: u32) -> Result<()> {
        if expiration != 0 {
            return Err(Error::NotImplemented(
                "delayed FLUSH is not supported by the memcached backend".to_string(),
            ));
        }
        let pool = self.pool(endpoint)?;
        self.block_on(async {
            let mut conn = Self::conn(&pool, endpoint).await?;
            conn.flush_all()
                .await
                .map_err(|e| Error::BackendError(format!("Memcached FLUSH_ALL failed: {}", e)))?;
            warn!("⚠ Memcached FLUSH_ALL on {} executed - all cache cleared!", endpoint);
            Ok(())
        })
    }

    fn health_check(&self, endpoint: &Endpoint) -> Result<bool> {
        let Ok(pool) = self.pool(endpoint) else {
            return Ok(false);
        };
        self.block_on(async {
            match pool.get().await {
                Ok(mut conn) => Ok(conn.get(HEALTH_CHECK_KEY).await.is_ok()),
                Err(_) => Ok(false),
            }
        })
    }
}
