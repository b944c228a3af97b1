//! Device ownership arbiter.
//!
//! Each device id is owned by at most one core replica at a time,
//! arbitrated through a TTL-bounded lease key in the KV store. The replica
//! whose instance id sits in the key owns the device; a monitor task per
//! device keeps the decision fresh, renewing the lease while owned and
//! retrying the reservation while not.
//!
//! Abandoning a device does not release the lease; it expires naturally,
//! so a crashed replica and a clean abandonment look identical to peers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tracing::{debug, warn};

use fibron_core::error::{Error, Result};
use fibron_core::kv::KvStore;

struct OwnershipEntry {
    owned: bool,
    /// TTL the store honored for this lease; drives the renewal cadence.
    ttl: Duration,
    stop: watch::Sender<bool>,
}

/// Per-device lease arbiter for one core replica.
#[derive(Clone)]
pub struct DeviceOwnership {
    instance_id: String,
    ownership_prefix: String,
    reservation_ttl: Duration,
    kv: Arc<dyn KvStore>,
    entries: Arc<RwLock<HashMap<String, OwnershipEntry>>>,
    shutdown: watch::Sender<bool>,
}

impl DeviceOwnership {
    pub fn new(
        instance_id: impl Into<String>,
        kv: Arc<dyn KvStore>,
        ownership_prefix: impl Into<String>,
        reservation_ttl: Duration,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            ownership_prefix: ownership_prefix.into(),
            reservation_ttl,
            kv,
            entries: Arc::new(RwLock::new(HashMap::new())),
            shutdown: watch::channel(false).0,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn lease_key(&self, id: &str) -> String {
        format!("{}_{}", self.ownership_prefix, id)
    }

    /// Whether this replica currently owns the device.
    ///
    /// The first query for an id performs a reservation against the KV
    /// store and starts the monitor task; subsequent queries answer from
    /// the tracked entry without any KV round-trip.
    pub async fn owned_by_me(&self, id: &str) -> Result<bool> {
        if id.is_empty() {
            return Err(Error::invalid_argument("empty device id"));
        }
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(id) {
                return Ok(entry.owned);
            }
        }
        debug!(device_id = %id, "setting up new ownership");
        // The reservation is the sole source of truth; no in-memory
        // shortcut before the attempt returns.
        let reservation = self
            .kv
            .reserve(&self.lease_key(id), &self.instance_id, self.reservation_ttl)
            .await?;
        let owned = reservation.owner == self.instance_id;

        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(id) {
            // A concurrent first query won the insert; keep its monitor.
            return Ok(entry.owned);
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        entries.insert(
            id.to_string(),
            OwnershipEntry {
                owned,
                ttl: reservation.ttl,
                stop: stop_tx,
            },
        );
        drop(entries);

        self.spawn_monitor(id.to_string(), stop_rx);
        Ok(owned)
    }

    /// Stop monitoring a device and forget its entry. The lease is left to
    /// expire on its own.
    pub async fn abandon(&self, id: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        match entries.remove(id) {
            Some(entry) => {
                let _ = entry.stop.send(true);
                debug!(device_id = %id, "abandoning device");
                Ok(())
            }
            None => Err(Error::not_found(format!("ownership entry {id}"))),
        }
    }

    /// Signal every monitor task to terminate.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Number of tracked ownership entries. Test hook.
    pub async fn entry_count(&self) -> usize {
        self.entries.read().await.len()
    }

    fn spawn_monitor(&self, id: String, mut stop_rx: watch::Receiver<bool>) {
        let this = self.clone();
        let mut shutdown_rx = this.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                let interval = {
                    let entries = this.entries.read().await;
                    match entries.get(&id) {
                        Some(entry) => entry.ttl / 3,
                        None => break,
                    }
                };
                tokio::select! {
                    _ = stop_rx.changed() => {
                        debug!(device_id = %id, "closing device monitoring");
                        break;
                    }
                    _ = shutdown_rx.changed() => {
                        debug!(device_id = %id, "closing monitoring");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
                this.monitor_tick(&id).await;
            }
        });
    }

    async fn monitor_tick(&self, id: &str) {
        let owned = {
            let entries = self.entries.read().await;
            match entries.get(id) {
                Some(entry) => entry.owned,
                None => return,
            }
        };
        if owned {
            match self.kv.renew(&self.lease_key(id), &self.instance_id).await {
                Ok(()) => debug!(device_id = %id, "renew reservation"),
                Err(e) => {
                    warn!(device_id = %id, error = %e, "reservation renewal failed");
                    // Confirm before flipping: local `owned` drops only
                    // when the store reports a different owner.
                    self.retry_reservation(id).await;
                }
            }
        } else {
            debug!(device_id = %id, "retry reservation");
            self.retry_reservation(id).await;
        }
    }

    async fn retry_reservation(&self, id: &str) {
        match self
            .kv
            .reserve(&self.lease_key(id), &self.instance_id, self.reservation_ttl)
            .await
        {
            Ok(reservation) => {
                let owned = reservation.owner == self.instance_id;
                if let Err(e) = self.set_ownership(id, owned, reservation.ttl).await {
                    warn!(device_id = %id, error = %e, "ownership entry vanished");
                }
            }
            // Transport errors leave local state untouched; the next tick
            // retries.
            Err(e) => warn!(device_id = %id, error = %e, "reservation retry failed"),
        }
    }

    async fn set_ownership(&self, id: &str, owned: bool, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(id) {
            Some(entry) => {
                if entry.owned != owned {
                    debug!(device_id = %id, owned, "ownership changed");
                }
                entry.owned = owned;
                entry.ttl = ttl;
                Ok(())
            }
            None => Err(Error::not_found(format!("ownership entry {id}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fibron_core::kv::MemKvStore;

    fn arbiter(kv: &Arc<MemKvStore>, instance: &str, ttl_ms: u64) -> DeviceOwnership {
        DeviceOwnership::new(
            instance,
            Arc::clone(kv) as Arc<dyn KvStore>,
            "test/ownership",
            Duration::from_millis(ttl_ms),
        )
    }

    #[tokio::test]
    async fn test_first_query_reserves() {
        let kv = Arc::new(MemKvStore::new());
        let own = arbiter(&kv, "core-a", 200);
        assert!(own.owned_by_me("dev-1").await.unwrap());
        assert_eq!(
            kv.lease_owner("test/ownership_dev-1").await.as_deref(),
            Some("core-a")
        );
        own.stop();
    }

    #[tokio::test]
    async fn test_second_replica_sees_holder() {
        let kv = Arc::new(MemKvStore::new());
        let a = arbiter(&kv, "core-a", 200);
        let b = arbiter(&kv, "core-b", 200);
        assert!(a.owned_by_me("dev-1").await.unwrap());
        assert!(!b.owned_by_me("dev-1").await.unwrap());
        a.stop();
        b.stop();
    }

    #[tokio::test]
    async fn test_abandon_unknown_id() {
        let kv = Arc::new(MemKvStore::new());
        let own = arbiter(&kv, "core-a", 200);
        assert!(own.abandon("dev-404").await.is_err());
    }

    #[tokio::test]
    async fn test_abandon_removes_entry() {
        let kv = Arc::new(MemKvStore::new());
        let own = arbiter(&kv, "core-a", 200);
        own.owned_by_me("dev-1").await.unwrap();
        assert_eq!(own.entry_count().await, 1);
        own.abandon("dev-1").await.unwrap();
        assert_eq!(own.entry_count().await, 0);
        // The lease itself is not released.
        assert!(kv.lease_owner("test/ownership_dev-1").await.is_some());
        own.stop();
    }

    #[tokio::test]
    async fn test_empty_id_rejected() {
        let kv = Arc::new(MemKvStore::new());
        let own = arbiter(&kv, "core-a", 200);
        assert!(own.owned_by_me("").await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_first_query_single_entry() {
        let kv = Arc::new(MemKvStore::new());
        let own = arbiter(&kv, "core-a", 200);
        let mut handles = Vec::new();
        for _ in 0..50 {
            let own = own.clone();
            handles.push(tokio::spawn(
                async move { own.owned_by_me("dev-1").await },
            ));
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap());
        }
        assert_eq!(own.entry_count().await, 1);
        own.stop();
    }
}
