//! Adapter registry integration tests: bus-fed liveness and the
//! restart-reconcile path.

mod common;

use chrono::Utc;
use std::sync::Arc;

use fibron_core::adapter::Adapter;
use fibron_core::bus::AdapterLiveness;
use fibron_core::device::Device;
use fibron_core::kv::MemKvStore;

use common::{ADAPTER_ID, OLT_TYPE, eventually, harness, harness_with};

#[tokio::test]
async fn test_liveness_flows_from_bus() {
    let h = harness().await;
    let at = Utc::now().timestamp_millis() - 2_000;
    h.bus.publish_metadata(AdapterLiveness {
        adapter_id: ADAPTER_ID.to_string(),
        timestamp_ms: at,
    });

    let registry = Arc::clone(&h.registry);
    assert!(
        eventually(|| {
            let registry = Arc::clone(&registry);
            async move {
                registry
                    .get_adapter(ADAPTER_ID)
                    .await
                    .and_then(|a| a.last_communication)
                    .is_some_and(|t| t.timestamp_millis() == at)
            }
        })
        .await
    );
    h.manager.stop();
}

#[tokio::test]
async fn test_stale_liveness_ignored() {
    let h = harness().await;
    let fresh = Utc::now().timestamp_millis() - 1_000;
    h.registry.update_last_communication(ADAPTER_ID, fresh).await;
    h.registry
        .update_last_communication(ADAPTER_ID, fresh - 60_000)
        .await;
    let adapter = h.registry.get_adapter(ADAPTER_ID).await.unwrap();
    assert_eq!(
        adapter.last_communication.unwrap().timestamp_millis(),
        fresh
    );
    h.manager.stop();
}

#[tokio::test]
async fn test_adapter_restart_reconciles_devices() {
    let kv = Arc::new(MemKvStore::new());
    let h1 = harness_with(Arc::clone(&kv), "core-1").await;
    h1.manager
        .create_device(Device::new("olt-1", OLT_TYPE))
        .await
        .unwrap();

    // A second replica comes up against the same store; its registry is
    // rebuilt from the KV, its agent table is empty.
    let h2 = harness_with(Arc::clone(&kv), "core-2").await;
    assert!(!h2.manager.is_device_in_cache("olt-1").await);

    // The adapter re-registers: restart path, reconcile kicks in.
    let instance = h2
        .registry
        .register_adapter(Adapter::new(ADAPTER_ID), Vec::new())
        .await
        .unwrap();
    assert_eq!(instance, "core-2");

    let manager = Arc::clone(&h2.manager);
    assert!(
        eventually(|| {
            let manager = Arc::clone(&manager);
            async move { manager.is_device_in_cache("olt-1").await }
        })
        .await,
        "restart reconcile must hydrate the adapter's devices"
    );
    h1.manager.stop();
    h2.manager.stop();
}
