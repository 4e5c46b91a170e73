//! In-memory cluster backend (default, thread-safe).
//!
//! Simulates a set of memcached nodes inside the process. Each node is a
//! DashMap with per-key sharding, so verbs from many worker threads run without
//! a global lock. Nodes can be started and stopped to model reachability and
//! network failure, and an artificial latency can be injected to exercise
//! concurrent in-flight operations.

use super::CacheBackend;
use crate::error::{Error, Result};
use crate::operation::{Item, StoreMode};
use crate::server_set::Endpoint;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Expirations up to 30 days are relative seconds; larger values are unix times.
const RELATIVE_EXPIRATION_LIMIT: u32 = 60 * 60 * 24 * 30;

fn deadline(expiration: u32) -> Option<Instant> {
    if expiration == 0 {
        return None;
    }
    let now = Instant::now();
    if expiration <= RELATIVE_EXPIRATION_LIMIT {
        return Some(now + Duration::from_secs(u64::from(expiration)));
    }
    let unix_now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let remaining = u64::from(expiration).saturating_sub(unix_now);
    Some(now + Duration::from_secs(remaining))
}

/// Stored item with its CAS token and optional expiration.
struct CacheEntry {
    data: Vec<u8>,
    cas: u64,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(data: Vec<u8>, cas: u64, expiration: u32) -> Self {
        CacheEntry {
            data,
            cas,
            expires_at: deadline(expiration),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() >= exp)
    }
}

/// One simulated server.
struct Node {
    store: DashMap<Vec<u8>, CacheEntry>,
    flush_at: Mutex<Option<Instant>>,
    up: AtomicBool,
}

impl Node {
    fn new() -> Self {
        Node {
            store: DashMap::new(),
            flush_at: Mutex::new(None),
            up: AtomicBool::new(true),
        }
    }

    fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    /// Apply a delayed flush whose deadline has passed.
    fn apply_pending_flush(&self) {
        let mut flush_at = self.flush_at.lock();
        if flush_at.is_some_and(|at| Instant::now() >= at) {
            self.store.clear();
            *flush_at = None;
        }
    }

    /// Drop `key` if it has expired.
    fn purge(&self, key: &[u8]) {
        self.store.remove_if(key, |_, entry| entry.is_expired());
    }
}

/// Thread-safe in-memory cluster backend.
///
/// # Example
///
/// ```no_run
/// use memcache_async::backend::{CacheBackend, InMemoryBackend};
/// use memcache_async::operation::StoreMode;
/// use memcache_async::server_set::Endpoint;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let node = Endpoint::new("127.0.0.1", 11211)?;
///     let backend = InMemoryBackend::with_nodes([node.clone()]);
///
///     backend.connect(&node)?;
///     backend.store(&node, StoreMode::Set, b"key1", b"value", 0)?;
///     let item = backend.get(&node, b"key1")?;
///     assert!(item.is_some());
///
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct InMemoryBackend {
    nodes: Arc<DashMap<Endpoint, Arc<Node>>>,
    cas_counter: Arc<AtomicU64>,
    calls: Arc<AtomicU64>,
    latency: Option<Duration>,
}

impl InMemoryBackend {
    /// Create a backend with no reachable nodes.
    pub fn new() -> Self {
        InMemoryBackend {
            nodes: Arc::new(DashMap::new()),
            cas_counter: Arc::new(AtomicU64::new(0)),
            calls: Arc::new(AtomicU64::new(0)),
            latency: None,
        }
    }

    /// Create a backend with the given nodes running.
    pub fn with_nodes(endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        let backend = Self::new();
        for endpoint in endpoints {
            backend.start_node(endpoint);
        }
        backend
    }

    /// Sleep this long inside every verb.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make a node reachable, creating it if needed. Existing data is kept.
    pub fn start_node(&self, endpoint: Endpoint) {
        let node = self
            .nodes
            .entry(endpoint.clone())
            .or_insert_with(|| Arc::new(Node::new()))
            .clone();
        node.up.store(true, Ordering::Release);
        debug!("✓ InMemory node {} up", endpoint);
    }

    /// Make a node unreachable; connects and verbs against it fail.
    pub fn stop_node(&self, endpoint: &Endpoint) {
        if let Some(node) = self.nodes.get(endpoint) {
            node.up.store(false, Ordering::Release);
            debug!("✓ InMemory node {} down", endpoint);
        }
    }

    /// Number of verb calls served so far, across all nodes.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Acquire)
    }

    /// Number of live items on one node.
    pub fn len(&self, endpoint: &Endpoint) -> usize {
        self.nodes
            .get(endpoint)
            .map(|node| node.store.iter().filter(|e| !e.is_expired()).count())
            .unwrap_or(0)
    }

    /// Get memory statistics across all nodes.
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            nodes: self.nodes.len(),
            ..CacheStats::default()
        };
        for node in self.nodes.iter() {
            stats.total_entries += node.store.len();
            stats.expired_entries += node.store.iter().filter(|e| e.is_expired()).count();
            stats.total_bytes += node.store.iter().map(|e| e.data.len()).sum::<usize>();
        }
        stats
    }

    /// Print cache statistics to debug log.
    pub fn log_stats(&self) {
        let stats = self.stats();
        debug!(
            "Cache Stats: {} nodes, {} entries ({} expired), {} bytes",
            stats.nodes, stats.total_entries, stats.expired_entries, stats.total_bytes
        );
    }

    fn next_cas(&self) -> u64 {
        self.cas_counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Look up a reachable node for a verb call.
    fn node(&self, endpoint: &Endpoint) -> Result<Arc<Node>> {
        self.calls.fetch_add(1, Ordering::AcqRel);
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }

        let node = self
            .nodes
            .get(endpoint)
            .map(|n| Arc::clone(n.value()))
            .ok_or_else(|| Error::BackendError(format!("no route to {}", endpoint)))?;
        if !node.is_up() {
            return Err(Error::BackendError(format!(
                "connection refused by {}",
                endpoint
            )));
        }
        node.apply_pending_flush();
        Ok(node)
    }

    fn adjust(
        &self,
        endpoint: &Endpoint,
        key: &[u8],
        apply: impl FnOnce(u64) -> u64,
    ) -> Result<u64> {
        let node = self.node(endpoint)?;
        node.purge(key);

        let mut entry = node.store.get_mut(key).ok_or(Error::NotFound)?;
        let next = apply(parse_counter(&entry.data)?);
        entry.data = next.to_string().into_bytes();
        entry.cas = self.next_cas();
        Ok(next)
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_counter(data: &[u8]) -> Result<u64> {
    std::str::from_utf8(data)
        .ok()
        .map(str::trim)
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or(Error::NonNumeric)
}

impl CacheBackend for InMemoryBackend {
    fn connect(&self, endpoint: &Endpoint) -> Result<()> {
        match self.nodes.get(endpoint) {
            Some(node) if node.is_up() => {
                debug!("✓ InMemory CONNECT {}", endpoint);
                Ok(())
            }
            _ => Err(Error::BackendError(format!(
                "connection refused: {}",
                endpoint
            ))),
        }
    }

    fn get(&self, endpoint: &Endpoint, key: &[u8]) -> Result<Option<Item>> {
        let node = self.node(endpoint)?;
        node.purge(key);

        let item = node.store.get(key).map(|entry| Item {
            value: entry.data.clone(),
            cas: Some(entry.cas),
        });
        if item.is_some() {
            debug!("✓ InMemory GET {} -> HIT", String::from_utf8_lossy(key));
        } else {
            debug!("✓ InMemory GET {} -> MISS", String::from_utf8_lossy(key));
        }
        Ok(item)
    }

    fn store(
        &self,
        endpoint: &Endpoint,
        mode: StoreMode,
        key: &[u8],
        value: &[u8],
        expiration: u32,
    ) -> Result<()> {
        let node = self.node(endpoint)?;
        node.purge(key);

        let cas = self.next_cas();
        let fresh = || CacheEntry::new(value.to_vec(), cas, expiration);

        match (mode, node.store.entry(key.to_vec())) {
            (StoreMode::Set, Entry::Occupied(mut slot)) => {
                slot.insert(fresh());
            }
            (StoreMode::Set | StoreMode::Add, Entry::Vacant(slot)) => {
                slot.insert(fresh());
            }
            (StoreMode::Add, Entry::Occupied(_)) => return Err(Error::NotStored),
            (StoreMode::Replace, Entry::Occupied(mut slot)) => {
                slot.insert(fresh());
            }
            (StoreMode::Append, Entry::Occupied(mut slot)) => {
                let entry = slot.get_mut();
                entry.data.extend_from_slice(value);
                entry.cas = cas;
            }
            (StoreMode::Prepend, Entry::Occupied(mut slot)) => {
                let entry = slot.get_mut();
                let mut data = value.to_vec();
                data.extend_from_slice(&entry.data);
                entry.data = data;
                entry.cas = cas;
            }
            (StoreMode::Cas(token), Entry::Occupied(mut slot)) => {
                if slot.get().cas != token {
                    return Err(Error::Exists);
                }
                slot.insert(fresh());
            }
            (StoreMode::Cas(_), Entry::Vacant(_)) => return Err(Error::NotFound),
            (StoreMode::Replace | StoreMode::Append | StoreMode::Prepend, Entry::Vacant(_)) => {
                return Err(Error::NotStored)
            }
        }

        debug!(
            "✓ InMemory {} {} (exp: {})",
            mode.kind(),
            String::from_utf8_lossy(key),
            expiration
        );
        Ok(())
    }

    fn increment(&self, endpoint: &Endpoint, key: &[u8], offset: u64) -> Result<u64> {
        // Counters wrap at 2^64
        let value = self.adjust(endpoint, key, |current| current.wrapping_add(offset))?;
        debug!("✓ InMemory INCR {} -> {}", String::from_utf8_lossy(key), value);
        Ok(value)
    }

    fn decrement(&self, endpoint: &Endpoint, key: &[u8], offset: u64) -> Result<u64> {
        // Counters floor at zero
        let value = self.adjust(endpoint, key, |current| current.saturating_sub(offset))?;
        debug!("✓ InMemory DECR {} -> {}", String::from_utf8_lossy(key), value);
        Ok(value)
    }

    fn delete(&self, endpoint: &Endpoint, key: &[u8], _expiration: u32) -> Result<()> {
        let node = self.node(endpoint)?;
        node.purge(key);

        node.store.remove(key).ok_or(Error::NotFound)?;
        debug!("✓ InMemory DELETE {}", String::from_utf8_lossy(key));
        Ok(())
    }

    fn flush(&self, endpoint: &Endpoint, expiration: u32) -> Result<()> {
        let node = self.node(endpoint)?;

        if expiration == 0 {
            node.store.clear();
            *node.flush_at.lock() = None;
            warn!("⚠ InMemory FLUSH {} executed - all items cleared!", endpoint);
        } else {
            *node.flush_at.lock() = deadline(expiration);
            warn!("⚠ InMemory FLUSH {} scheduled in {}s", endpoint, expiration);
        }
        Ok(())
    }

    fn health_check(&self, endpoint: &Endpoint) -> Result<bool> {
        Ok(self.nodes.get(endpoint).is_some_and(|node| node.is_up()))
    }
}

/// Cache statistics.
#[derive(Clone, Debug, Default)]
pub struct CacheStats {
    pub nodes: usize,
    pub total_entries: usize,
    pub expired_entries: usize,
    pub total_bytes: usize,
}
