//! Key-value store interface.
//!
//! The cluster KV store is an external collaborator; this module defines
//! the capabilities the core consumes, plus an in-memory implementation
//! with full reservation semantics for tests and single-node runs.
//!
//! Reservations are the ownership primitive: `reserve` atomically creates
//! the key with the caller's value and a TTL, or returns the current value
//! when the key is live (refreshing the TTL when the value matches the
//! caller's). A caller holds the lease iff the returned owner equals its
//! own value.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

use crate::error::{Error, Result};

/// Well-known key prefixes.
pub mod paths {
    pub const DEVICES: &str = "devices";
    pub const ADAPTERS: &str = "adapters";
    pub const DEVICE_TYPES: &str = "device_types";

    pub fn device(id: &str) -> String {
        format!("{DEVICES}/{id}")
    }

    pub fn adapter(id: &str) -> String {
        format!("{ADAPTERS}/{id}")
    }

    pub fn device_type(id: &str) -> String {
        format!("{DEVICE_TYPES}/{id}")
    }
}

/// Outcome of a reservation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// Current value of the lease key; the caller owns the lease iff this
    /// equals the value it offered.
    pub owner: String,
    /// The TTL the store honored, which may have been rounded up.
    pub ttl: Duration,
}

/// Capabilities the core requires from the cluster KV store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch a single value.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a value unconditionally.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Write `prefix/id` only when absent. Returns whether the write
    /// happened.
    async fn put_if_absent(&self, prefix: &str, id: &str, value: Vec<u8>) -> Result<bool>;

    /// All `(key, value)` pairs under a prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Atomically create-or-read a lease key with a TTL.
    async fn reserve(&self, key: &str, value: &str, ttl: Duration) -> Result<Reservation>;

    /// Refresh the TTL of a live lease key holding `value`. `NotFound`
    /// when the lease is absent or already expired; `FailedPrecondition`
    /// when another value holds it.
    async fn renew(&self, key: &str, value: &str) -> Result<()>;
}

struct Lease {
    owner: String,
    expires_at: Instant,
    ttl: Duration,
}

impl Lease {
    fn live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// In-memory [`KvStore`] with reservation expiry.
#[derive(Default)]
pub struct MemKvStore {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    leases: Mutex<HashMap<String, Lease>>,
}

impl MemKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current owner of a lease key, if live. Test hook.
    pub async fn lease_owner(&self, key: &str) -> Option<String> {
        let leases = self.leases.lock().await;
        leases.get(key).filter(|l| l.live()).map(|l| l.owner.clone())
    }
}

#[async_trait]
impl KvStore for MemKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let data = self.data.read().await;
        Ok(data.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut data = self.data.write().await;
        data.insert(key.to_string(), value);
        Ok(())
    }

    async fn put_if_absent(&self, prefix: &str, id: &str, value: Vec<u8>) -> Result<bool> {
        let key = format!("{prefix}/{id}");
        let mut data = self.data.write().await;
        if data.contains_key(&key) {
            return Ok(false);
        }
        data.insert(key, value);
        Ok(true)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let needle = format!("{}/", prefix.trim_end_matches('/'));
        let data = self.data.read().await;
        Ok(data
            .range(needle.clone()..)
            .take_while(|(k, _)| k.starts_with(&needle))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn reserve(&self, key: &str, value: &str, ttl: Duration) -> Result<Reservation> {
        let mut leases = self.leases.lock().await;
        match leases.get_mut(key) {
            Some(lease) if lease.live() => {
                if lease.owner == value {
                    lease.expires_at = Instant::now() + lease.ttl;
                }
                Ok(Reservation {
                    owner: lease.owner.clone(),
                    ttl: lease.ttl,
                })
            }
            _ => {
                leases.insert(
                    key.to_string(),
                    Lease {
                        owner: value.to_string(),
                        expires_at: Instant::now() + ttl,
                        ttl,
                    },
                );
                Ok(Reservation {
                    owner: value.to_string(),
                    ttl,
                })
            }
        }
    }

    async fn renew(&self, key: &str, value: &str) -> Result<()> {
        let mut leases = self.leases.lock().await;
        match leases.get_mut(key) {
            Some(lease) if lease.live() => {
                if lease.owner != value {
                    return Err(Error::failed_precondition(format!(
                        "lease {key} held by another owner"
                    )));
                }
                lease.expires_at = Instant::now() + lease.ttl;
                Ok(())
            }
            _ => Err(Error::not_found(format!("lease {key}"))),
        }
    }
}
