//! Connection configuration.
//!
//! Configuration can be built in code with the `with_*` methods, read from the
//! environment, or parsed from JSON:
//!
//! ```
//! use memcache_async::ConnectionConfig;
//! use memcache_async::server_set::Distribution;
//!
//! let config = ConnectionConfig::default()
//!     .with_servers(["cache1:11211", "cache2:11211"])
//!     .with_distribution(Distribution::Consistent)
//!     .with_operation_timeout_ms(250);
//! assert_eq!(config.servers.len(), 2);
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::hash::HashKind;
use crate::server_set::{parse_server_list, Distribution, Endpoint};

/// Default timeout for the reachability probe in `add_server`.
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

fn default_verify_key() -> bool {
    true
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

/// Settings for a [`Connection`](crate::Connection).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Servers added by [`Connection::connect`](crate::Connection::connect),
    /// as `host:port` strings.
    pub servers: Vec<String>,

    /// Key to server mapping.
    pub distribution: Distribution,

    /// Key hash used by the distribution.
    pub hash: HashKind,

    /// Reject keys that the text protocol cannot carry (too long, whitespace,
    /// control bytes). Empty keys are always rejected.
    #[serde(default = "default_verify_key")]
    pub verify_key: bool,

    /// Upper bound on the `add_server` probe.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-operation deadline. `None` waits for the backend indefinitely.
    pub operation_timeout_ms: Option<u64>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            servers: Vec::new(),
            distribution: Distribution::default(),
            hash: HashKind::default(),
            verify_key: default_verify_key(),
            connect_timeout_ms: default_connect_timeout_ms(),
            operation_timeout_ms: None,
        }
    }
}

impl ConnectionConfig {
    pub fn with_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.servers = servers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_distribution(mut self, distribution: Distribution) -> Self {
        self.distribution = distribution;
        self
    }

    pub fn with_hash(mut self, hash: HashKind) -> Self {
        self.hash = hash;
        self
    }

    pub fn with_verify_key(mut self, verify_key: bool) -> Self {
        self.verify_key = verify_key;
        self
    }

    pub fn with_connect_timeout_ms(mut self, millis: u64) -> Self {
        self.connect_timeout_ms = millis;
        self
    }

    pub fn with_operation_timeout_ms(mut self, millis: u64) -> Self {
        self.operation_timeout_ms = Some(millis);
        self
    }

    /// Defaults overridden by environment variables.
    ///
    /// - `MEMCACHE_SERVERS` - comma separated `host:port` list
    /// - `MEMCACHE_DISTRIBUTION` - `modula` or `consistent`
    /// - `MEMCACHE_OP_TIMEOUT_MS` - per-operation timeout in milliseconds
    ///
    /// # Errors
    /// Returns `Error::ConfigError` if a variable is set but malformed.
    pub fn from_env() -> Result<Self> {
        let mut config = ConnectionConfig::default();

        if let Ok(servers) = std::env::var("MEMCACHE_SERVERS") {
            config.servers = parse_server_list(&servers)?
                .iter()
                .map(Endpoint::to_string)
                .collect();
        }

        if let Ok(distribution) = std::env::var("MEMCACHE_DISTRIBUTION") {
            config.distribution = distribution.parse()?;
        }

        if let Ok(timeout) = std::env::var("MEMCACHE_OP_TIMEOUT_MS") {
            let millis = timeout.trim().parse::<u64>().map_err(|e| {
                Error::ConfigError(format!("invalid MEMCACHE_OP_TIMEOUT_MS '{}': {}", timeout, e))
            })?;
            config.operation_timeout_ms = Some(millis);
        }

        Ok(config)
    }

    /// Parse a JSON document; missing fields take their defaults.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` for malformed JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_ms.map(Duration::from_millis)
    }

    /// Parsed [`servers`](Self::servers).
    ///
    /// # Errors
    /// Returns `Error::ConfigError` for a malformed entry.
    pub fn server_endpoints(&self) -> Result<Vec<Endpoint>> {
        self.servers.iter().map(|s| s.parse()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::default();
        assert!(config.servers.is_empty());
        assert!(config.verify_key);
        assert_eq!(config.distribution, Distribution::Modula);
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.operation_timeout(), None);
    }

    #[test]
    fn test_config_builders() {
        let config = ConnectionConfig::default()
            .with_servers(["a:1", "b"])
            .with_hash(HashKind::Fnv1a32)
            .with_verify_key(false)
            .with_connect_timeout_ms(100)
            .with_operation_timeout_ms(50);

        let endpoints = config.server_endpoints().expect("Failed to parse servers");
        assert_eq!(endpoints[1].port, 11211);
        assert_eq!(config.hash, HashKind::Fnv1a32);
        assert!(!config.verify_key);
        assert_eq!(config.connect_timeout(), Duration::from_millis(100));
        assert_eq!(config.operation_timeout(), Some(Duration::from_millis(50)));
    }

    #[test]
    fn test_config_from_json() {
        let config = ConnectionConfig::from_json(
            r#"{"servers": ["cache1:11211"], "distribution": "consistent", "hash": "fnv1a32"}"#,
        )
        .expect("Failed to parse config");

        assert_eq!(config.servers, vec!["cache1:11211".to_string()]);
        assert_eq!(config.distribution, Distribution::Consistent);
        assert_eq!(config.hash, HashKind::Fnv1a32);
        // Omitted fields fall back to defaults
        assert!(config.verify_key);
        assert_eq!(config.connect_timeout_ms, DEFAULT_CONNECT_TIMEOUT_MS);
    }

    #[test]
    fn test_config_from_json_invalid() {
        let result = ConnectionConfig::from_json("{not json");
        assert!(matches!(result, Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_config_roundtrips_through_json() {
        let config = ConnectionConfig::default()
            .with_servers(["cache1:11211"])
            .with_operation_timeout_ms(10);
        let json = serde_json::to_string(&config).expect("Failed to serialize");
        let parsed = ConnectionConfig::from_json(&json).expect("Failed to parse");
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_config_from_env() {
        std::env::set_var("MEMCACHE_SERVERS", "cache1:11211, cache2");
        std::env::set_var("MEMCACHE_DISTRIBUTION", "ketama");
        std::env::set_var("MEMCACHE_OP_TIMEOUT_MS", "75");

        let config = ConnectionConfig::from_env();

        std::env::remove_var("MEMCACHE_SERVERS");
        std::env::remove_var("MEMCACHE_DISTRIBUTION");
        std::env::remove_var("MEMCACHE_OP_TIMEOUT_MS");

        let config = config.expect("Failed to read env config");
        assert_eq!(
            config.servers,
            vec!["cache1:11211".to_string(), "cache2:11211".to_string()]
        );
        assert_eq!(config.distribution, Distribution::Consistent);
        assert_eq!(config.operation_timeout_ms, Some(75));
    }
}
