//! Key hash functions used by the server distribution.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Hash function applied to keys before distribution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashKind {
    /// Jenkins one-at-a-time (memcached client default).
    #[default]
    OneAtATime,
    /// 32-bit FNV-1a.
    Fnv1a32,
}

impl HashKind {
    /// Hash `key` with this function.
    pub fn hash(&self, key: &[u8]) -> u32 {
        match self {
            HashKind::OneAtATime => one_at_a_time(key),
            HashKind::Fnv1a32 => fnv1a_32(key),
        }
    }
}

impl fmt::Display for HashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashKind::OneAtATime => write!(f, "one_at_a_time"),
            HashKind::Fnv1a32 => write!(f, "fnv1a_32"),
        }
    }
}

impl FromStr for HashKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "one_at_a_time" | "default" => Ok(HashKind::OneAtATime),
            "fnv1a_32" | "fnv1a" => Ok(HashKind::Fnv1a32),
            other => Err(Error::ConfigError(format!("unknown hash: {}", other))),
        }
    }
}

/// Jenkins one-at-a-time hash.
pub fn one_at_a_time(key: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    for &byte in key {
        hash = hash.wrapping_add(u32::from(byte));
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
    }
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash.wrapping_add(hash << 15)
}

const FNV_32_OFFSET: u32 = 2_166_136_261;
const FNV_32_PRIME: u32 = 16_777_619;

/// 32-bit FNV-1a hash.
pub fn fnv1a_32(key: &[u8]) -> u32 {
    key.iter().fold(FNV_32_OFFSET, |hash, &byte| {
        (hash ^ u32::from(byte)).wrapping_mul(FNV_32_PRIME)
    })
}
