//! Adapter and device-type records.
//!
//! Adapters are external processes implementing protocol-level control for
//! a device family; device types route devices to the adapter that serves
//! them. Both are persisted as JSON under `adapters/<id>` and
//! `device_types/<id>`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved adapter id materializing the `adapters/` prefix when no real
/// adapter has registered yet. Filtered from all outward enumerations.
pub const SENTINEL_ADAPTER_ID: &str = "adapter_sentinel";

/// Reserved device-type id materializing the `device_types/` prefix.
pub const SENTINEL_DEVICE_TYPE_ID: &str = "device_type_sentinel";

/// An adapter process registered with the cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Adapter {
    pub id: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub version: String,
    /// Last time the adapter was heard from on the bus. Only ever moves
    /// forward, and never past the current wall clock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_communication: Option<DateTime<Utc>>,
}

impl Adapter {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.id == SENTINEL_ADAPTER_ID
    }
}

/// A device type served by an adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceType {
    pub id: String,
    /// Id of the adapter serving this device type.
    pub adapter_id: String,
    #[serde(default)]
    pub vendor_ids: Vec<String>,
    #[serde(default)]
    pub accepts_bulk_flow_update: bool,
    #[serde(default)]
    pub accepts_add_remove_flow_updates: bool,
}

impl DeviceType {
    pub fn new(id: impl Into<String>, adapter_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            adapter_id: adapter_id.into(),
            ..Default::default()
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.id == SENTINEL_DEVICE_TYPE_ID
    }
}
