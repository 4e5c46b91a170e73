//! Endpoint table and key distribution.
//!
//! A [`ServerSet`] is an immutable snapshot. Adding or removing an endpoint
//! produces a new set; in-flight operations keep resolving against the
//! snapshot they were dispatched with, so offloaded workers never observe a
//! table that is being mutated.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::hash::HashKind;

/// Port used when a server string carries no explicit port.
pub const DEFAULT_PORT: u16 = 11211;

/// Virtual points per endpoint on the consistent-hashing continuum.
const POINTS_PER_SERVER: u32 = 100;

/// One remote cache server.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` for an empty host or port 0.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        let host = host.into();
        let host = host.trim();
        if host.is_empty() {
            return Err(Error::ConfigError("server host must not be empty".to_string()));
        }
        if port == 0 {
            return Err(Error::ConfigError(format!("invalid port 0 for {}", host)));
        }
        Ok(Endpoint {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    /// Parse `host:port`, or a bare `host` on [`DEFAULT_PORT`].
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|e| {
                    Error::ConfigError(format!("invalid port in '{}': {}", s, e))
                })?;
                Endpoint::new(host, port)
            }
            None => Endpoint::new(s, DEFAULT_PORT),
        }
    }
}

/// Parse a comma separated server list such as `"cache1:11211, cache2:11212"`.
///
/// # Errors
/// Returns `Error::ConfigError` when the list is empty or an entry is malformed.
pub fn parse_server_list(list: &str) -> Result<Vec<Endpoint>> {
    let endpoints = list
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Endpoint::from_str)
        .collect::<Result<Vec<_>>>()?;

    if endpoints.is_empty() {
        return Err(Error::ConfigError("server list is empty".to_string()));
    }
    Ok(endpoints)
}

/// How keys are mapped onto endpoints.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distribution {
    /// `hash(key) % endpoint_count`.
    #[default]
    Modula,
    /// Hash ring with virtual points; adding or removing a server only moves
    /// the keys that server owned.
    Consistent,
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Distribution::Modula => write!(f, "modula"),
            Distribution::Consistent => write!(f, "consistent"),
        }
    }
}

impl FromStr for Distribution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "modula" => Ok(Distribution::Modula),
            "consistent" | "ketama" => Ok(Distribution::Consistent),
            other => Err(Error::ConfigError(format!(
                "unknown distribution: {}",
                other
            ))),
        }
    }
}

/// Immutable snapshot of the endpoint table.
#[derive(Clone, Debug)]
pub struct ServerSet {
    endpoints: Vec<Endpoint>,
    distribution: Distribution,
    hash: HashKind,
    continuum: Vec<(u32, usize)>,
}

impl ServerSet {
    /// Empty set with the given distribution and hash.
    pub fn new(distribution: Distribution, hash: HashKind) -> Self {
        ServerSet {
            endpoints: Vec::new(),
            distribution,
            hash,
            continuum: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Endpoints in registration order.
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.endpoints.contains(endpoint)
    }

    pub fn distribution(&self) -> Distribution {
        self.distribution
    }

    /// New snapshot with `endpoint` appended.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` if the endpoint is already registered.
    pub fn with_endpoint(&self, endpoint: Endpoint) -> Result<Self> {
        if self.contains(&endpoint) {
            return Err(Error::ConfigError(format!(
                "server {} is already registered",
                endpoint
            )));
        }
        let mut endpoints = self.endpoints.clone();
        endpoints.push(endpoint);
        Ok(self.rebuild(endpoints))
    }

    /// New snapshot without `endpoint`.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` if the endpoint is not registered.
    pub fn without_endpoint(&self, endpoint: &Endpoint) -> Result<Self> {
        if !self.contains(endpoint) {
            return Err(Error::ConfigError(format!(
                "server {} is not registered",
                endpoint
            )));
        }
        let endpoints = self
            .endpoints
            .iter()
            .filter(|e| *e != endpoint)
            .cloned()
            .collect();
        Ok(self.rebuild(endpoints))
    }

    /// Endpoint owning `key`.
    ///
    /// # Errors
    /// Returns `Error::NoServers` when the set is empty.
    pub fn resolve(&self, key: &[u8]) -> Result<&Endpoint> {
        if self.endpoints.is_empty() {
            return Err(Error::NoServers);
        }
        let index = match self.distribution {
            Distribution::Modula => self.hash.hash(key) as usize % self.endpoints.len(),
            Distribution::Consistent => {
                let point = self.hash.hash(key);
                let slot = self.continuum.partition_point(|(p, _)| *p < point);
                // Past the last point wraps to the start of the ring
                self.continuum
                    .get(slot)
                    .or_else(|| self.continuum.first())
                    .map(|(_, idx)| *idx)
                    .ok_or(Error::NoServers)?
            }
        };
        Ok(&self.endpoints[index])
    }

    fn rebuild(&self, endpoints: Vec<Endpoint>) -> Self {
        let continuum = match self.distribution {
            Distribution::Modula => Vec::new(),
            Distribution::Consistent => build_continuum(&endpoints, self.hash),
        };
        ServerSet {
            endpoints,
            distribution: self.distribution,
            hash: self.hash,
            continuum,
        }
    }
}

fn build_continuum(endpoints: &[Endpoint], hash: HashKind) -> Vec<(u32, usize)> {
    let mut points: Vec<(u32, usize)> = endpoints
        .iter()
        .enumerate()
        .flat_map(|(idx, endpoint)| {
            (0..POINTS_PER_SERVER).map(move |n| {
                let label = format!("{}-{}", endpoint, n);
                (hash.hash(label.as_bytes()), idx)
            })
        })
        .collect();
    points.sort_unstable();
    points
}
