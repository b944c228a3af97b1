//! Ownership arbiter integration tests: lease handoff between replicas and
//! single-owner arbitration over the shared in-memory KV store.

mod common;

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use fibron_core::error::{Error, Result};
use fibron_core::kv::{KvStore, MemKvStore, Reservation};
use fibron_devices::ownership::DeviceOwnership;

use common::eventually;

const PREFIX: &str = "test/ownership";
const TTL: Duration = Duration::from_millis(150);

/// KV handle whose lease operations can be cut off, as a replica
/// partitioned from the store would see them. Reads and writes pass
/// through.
struct PartitionedKv {
    inner: Arc<MemKvStore>,
    down: Arc<AtomicBool>,
}

impl PartitionedKv {
    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::unavailable("kv store unreachable"));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for PartitionedKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.inner.put(key, value).await
    }

    async fn put_if_absent(&self, prefix: &str, id: &str, value: Vec<u8>) -> Result<bool> {
        self.inner.put_if_absent(prefix, id, value).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        self.inner.list(prefix).await
    }

    async fn reserve(&self, key: &str, value: &str, ttl: Duration) -> Result<Reservation> {
        self.check()?;
        self.inner.reserve(key, value, ttl).await
    }

    async fn renew(&self, key: &str, value: &str) -> Result<()> {
        self.check()?;
        self.inner.renew(key, value).await
    }
}

fn replica(kv: &Arc<MemKvStore>, instance: &str) -> DeviceOwnership {
    DeviceOwnership::new(
        instance,
        Arc::clone(kv) as Arc<dyn KvStore>,
        PREFIX,
        TTL,
    )
}

#[tokio::test]
async fn test_lease_handoff_after_partition() {
    let kv = Arc::new(MemKvStore::new());
    let down = Arc::new(AtomicBool::new(false));
    let a_kv = Arc::new(PartitionedKv {
        inner: Arc::clone(&kv),
        down: Arc::clone(&down),
    });
    let a = DeviceOwnership::new("core-a", a_kv as Arc<dyn KvStore>, PREFIX, TTL);
    let b = replica(&kv, "core-b");

    assert!(a.owned_by_me("dev-1").await.unwrap());
    assert!(!b.owned_by_me("dev-1").await.unwrap());

    // A loses its path to the store; its renewals stop landing.
    down.store(true, Ordering::SeqCst);

    assert!(
        eventually(|| {
            let b = b.clone();
            async move { b.owned_by_me("dev-1").await.unwrap() }
        })
        .await,
        "peer replica must claim the lapsed lease"
    );

    // Transport errors do not flip A's local view; double ownership is
    // bounded by the partition, not introduced by it.
    assert!(a.owned_by_me("dev-1").await.unwrap());

    // Partition heals: A's next renewal observes the new owner and yields.
    down.store(false, Ordering::SeqCst);
    assert!(
        eventually(|| {
            let a = a.clone();
            async move { !a.owned_by_me("dev-1").await.unwrap() }
        })
        .await,
        "previous owner must observe the handoff"
    );
    assert!(b.owned_by_me("dev-1").await.unwrap());

    a.stop();
    b.stop();
}

#[tokio::test]
async fn test_at_most_one_owner_per_device() {
    let kv = Arc::new(MemKvStore::new());
    let a = replica(&kv, "core-a");
    let b = replica(&kv, "core-b");

    for (i, id) in ["dev-1", "dev-2", "dev-3", "dev-4"].iter().enumerate() {
        // Alternate which replica asks first.
        let (first, second) = if i % 2 == 0 { (&a, &b) } else { (&b, &a) };
        let first_owned = first.owned_by_me(id).await.unwrap();
        let second_owned = second.owned_by_me(id).await.unwrap();
        assert!(first_owned, "first reservation must win");
        assert!(!second_owned, "both replicas claim {id}");
    }

    a.stop();
    b.stop();
}

#[tokio::test]
async fn test_abandoned_lease_expires_naturally() {
    let kv = Arc::new(MemKvStore::new());
    let a = replica(&kv, "core-a");
    let b = replica(&kv, "core-b");

    assert!(a.owned_by_me("dev-1").await.unwrap());
    a.abandon("dev-1").await.unwrap();
    // Monitoring stopped, so nothing renews; the key stays live until its
    // TTL lapses, indistinguishable from a crash.
    assert!(kv.lease_owner(&format!("{PREFIX}_dev-1")).await.is_some());

    assert!(
        eventually(|| {
            let b = b.clone();
            async move { b.owned_by_me("dev-1").await.unwrap() }
        })
        .await,
        "peer replica must claim the device after the abandoned lease lapses"
    );

    a.stop();
    b.stop();
}

#[tokio::test]
async fn test_shutdown_stops_renewal() {
    let kv = Arc::new(MemKvStore::new());
    let a = replica(&kv, "core-a");

    assert!(a.owned_by_me("dev-1").await.unwrap());
    a.stop();

    // With the monitors gone the lease must lapse within a few TTLs.
    assert!(
        eventually(|| {
            let kv = Arc::clone(&kv);
            async move { kv.lease_owner(&format!("{PREFIX}_dev-1")).await.is_none() }
        })
        .await
    );
}
