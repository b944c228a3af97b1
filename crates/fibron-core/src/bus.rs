//! Message-bus interface.
//!
//! The bus carries adapter liveness metadata into the core and
//! device-discovery announcements out of it. The broker itself is an
//! external collaborator; an in-process broadcast implementation is
//! provided for tests and single-node runs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;

/// Default buffer for the in-process bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Liveness signal published by an adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterLiveness {
    pub adapter_id: String,
    /// Wall-clock milliseconds since the epoch, as stamped by the adapter.
    pub timestamp_ms: i64,
}

/// Announcement that a new device was detected by a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDiscovered {
    pub device_id: String,
    pub device_type: String,
    pub parent_id: String,
    /// Replica that detected the device.
    pub core_instance_id: String,
}

/// Capabilities the core requires from the message-bus client.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Subscribe to adapter liveness metadata. Slow subscribers may drop
    /// signals; liveness is refreshed continuously so that is acceptable.
    fn subscribe_metadata(&self) -> broadcast::Receiver<AdapterLiveness>;

    /// Announce a newly detected device to the cluster.
    async fn device_discovered(&self, event: DeviceDiscovered) -> Result<()>;
}

/// In-process [`MessageBus`] backed by broadcast channels.
#[derive(Clone)]
pub struct InProcBus {
    metadata_tx: broadcast::Sender<AdapterLiveness>,
    discovery_tx: broadcast::Sender<DeviceDiscovered>,
}

impl InProcBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            metadata_tx: broadcast::channel(capacity).0,
            discovery_tx: broadcast::channel(capacity).0,
        }
    }

    /// Publish a liveness signal, as an adapter would. Returns `true` when
    /// at least one subscriber received it.
    pub fn publish_metadata(&self, signal: AdapterLiveness) -> bool {
        self.metadata_tx.send(signal).is_ok()
    }

    /// Subscribe to discovery announcements.
    pub fn subscribe_discovery(&self) -> broadcast::Receiver<DeviceDiscovered> {
        self.discovery_tx.subscribe()
    }
}

impl Default for InProcBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InProcBus {
    fn subscribe_metadata(&self) -> broadcast::Receiver<AdapterLiveness> {
        self.metadata_tx.subscribe()
    }

    async fn device_discovered(&self, event: DeviceDiscovered) -> Result<()> {
        // Nobody listening is not an error; the announcement is advisory.
        let _ = self.discovery_tx.send(event);
        Ok(())
    }
}
