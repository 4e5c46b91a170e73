//! Cache backend implementations.
//!
//! A backend is the cluster client capability the connection core drives: it
//! knows how to reach one endpoint and run one verb against it. Hashing keys to
//! endpoints is not its concern; the caller passes the resolved endpoint.

use crate::error::Result;
use crate::operation::{Item, StoreMode};
use crate::server_set::Endpoint;

pub mod inmemory;
#[cfg(feature = "memcached")]
pub mod memcached;

pub use inmemory::InMemoryBackend;
#[cfg(feature = "memcached")]
pub use memcached::{MemcachedBackend, MemcachedConfig};

/// Trait for cache backend implementations.
///
/// **BLOCKING:** Every verb may block on network I/O. The connection core only
/// calls verbs from the blocking worker pool, never from the control loop.
///
/// **IMPORTANT:** All methods use `&self`; many verbs run concurrently against
/// one backend. Implementations should use interior mutability or external
/// storage.
pub trait CacheBackend: Send + Sync + 'static {
    /// Register and probe an endpoint.
    ///
    /// # Errors
    /// Returns `Err` if the endpoint cannot be reached.
    fn connect(&self, endpoint: &Endpoint) -> Result<()>;

    /// Forget an endpoint. Must not block.
    fn disconnect(&self, _endpoint: &Endpoint) {}

    /// Retrieve an item.
    ///
    /// # Returns
    /// - `Ok(Some(item))` - Value found
    /// - `Ok(None)` - Cache miss
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs (connection lost, etc.)
    fn get(&self, endpoint: &Endpoint, key: &[u8]) -> Result<Option<Item>>;

    /// Store a value according to `mode`.
    ///
    /// # Errors
    /// - `Error::NotStored` when an ADD/REPLACE/APPEND/PREPEND condition fails
    /// - `Error::Exists` / `Error::NotFound` for a failed CAS
    /// - `Error::BackendError` on network failure
    fn store(
        &self,
        endpoint: &Endpoint,
        mode: StoreMode,
        key: &[u8],
        value: &[u8],
        expiration: u32,
    ) -> Result<()>;

    /// Increment a counter, returning the new value.
    ///
    /// # Errors
    /// Returns `Error::NotFound` for an absent key, `Error::NonNumeric` for a
    /// non-counter value.
    fn increment(&self, endpoint: &Endpoint, key: &[u8], offset: u64) -> Result<u64>;

    /// Decrement a counter, returning the new value.
    ///
    /// # Errors
    /// Same as [`CacheBackend::increment`].
    fn decrement(&self, endpoint: &Endpoint, key: &[u8], offset: u64) -> Result<u64>;

    /// Remove an item.
    ///
    /// # Errors
    /// Returns `Error::NotFound` if nothing was deleted.
    fn delete(&self, endpoint: &Endpoint, key: &[u8], expiration: u32) -> Result<()>;

    /// Invalidate every item on one endpoint, now or after `expiration`.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    fn flush(&self, endpoint: &Endpoint, expiration: u32) -> Result<()>;

    /// Health check - verify an endpoint is accessible.
    ///
    /// # Errors
    /// Returns `Err` if the check itself cannot be performed
    fn health_check(&self, _endpoint: &Endpoint) -> Result<bool> {
        Ok(true)
    }
}

impl<B: CacheBackend> CacheBackend for std::sync::Arc<B> {
    fn connect(&self, endpoint: &Endpoint) -> Result<()> {
        (**self).connect(endpoint)
    }

    fn disconnect(&self, endpoint: &Endpoint) {
        (**self).disconnect(endpoint)
    }

    fn get(&self, endpoint: &Endpoint, key: &[u8]) -> Result<Option<Item>> {
        (**self).get(endpoint, key)
    }

    fn store(
        &self,
        endpoint: &Endpoint,
        mode: StoreMode,
        key: &[u8],
        value: &[u8],
        expiration: u32,
    ) -> Result<()> {
        (**self).store(endpoint, mode, key, value, expiration)
    }

    fn increment(&self, endpoint: &Endpoint, key: &[u8], offset: u64) -> Result<u64> {
        (**self).increment(endpoint, key, offset)
    }

    fn decrement(&self, endpoint: &Endpoint, key: &[u8], offset: u64) -> Result<u64> {
        (**self).decrement(endpoint, key, offset)
    }

    fn delete(&self, endpoint: &Endpoint, key: &[u8], expiration: u32) -> Result<()> {
        (**self).delete(endpoint, key, expiration)
    }

    fn flush(&self, endpoint: &Endpoint, expiration: u32) -> Result<()> {
        (**self).flush(endpoint, expiration)
    }

    fn health_check(&self, endpoint: &Endpoint) -> Result<bool> {
        (**self).health_check(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_backend_through_arc() {
        let endpoint = Endpoint::new("127.0.0.1", 11211).expect("Failed to build endpoint");
        let backend = Arc::new(InMemoryBackend::with_nodes([endpoint.clone()]));

        backend.connect(&endpoint).expect("Failed to connect");
        backend
            .store(&endpoint, StoreMode::Set, b"key", b"value", 0)
            .expect("Failed to set key");
        let item = backend
            .get(&endpoint, b"key")
            .expect("Failed to get")
            .expect("Item missing");
        assert_eq!(item.value, b"value");
        assert!(backend.health_check(&endpoint).expect("Failed to check health"));
    }
}
