//! Logical-device manager interface.
//!
//! Root devices are mirrored by a logical (OpenFlow-facing) device managed
//! by a separate subsystem. The device manager drives it through this
//! trait and never looks inside.

use async_trait::async_trait;

use fibron_core::device::{Device, Port};
use fibron_core::error::Result;

/// Identifier of a logical port within a logical device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalPortId {
    pub logical_device_id: String,
    pub port_id: String,
}

/// Call surface toward the logical-device subsystem.
#[async_trait]
pub trait LogicalDeviceManager: Send + Sync {
    /// Create the logical device for a root device; returns the logical
    /// device id.
    async fn create(&self, device: &Device) -> Result<String>;

    /// Delete the logical device of a root device.
    async fn delete(&self, device: &Device) -> Result<()>;

    /// Hydrate a logical device by id.
    async fn load(&self, logical_device_id: &str) -> Result<()>;

    /// Mirror an NNI/UNI port onto the logical device.
    async fn add_logical_port(&self, device: &Device, port: &Port) -> Result<()>;

    /// Create the UNI logical ports for a child device.
    async fn setup_uni_logical_ports(&self, device: &Device) -> Result<()>;

    async fn delete_logical_port(&self, id: &LogicalPortId) -> Result<()>;

    /// The logical port mirroring the given device, if any.
    async fn get_logical_port_id(&self, device: &Device) -> Result<LogicalPortId>;

    /// Forward an ingress packet under the owning logical device.
    async fn packet_in(
        &self,
        logical_device_id: &str,
        port: u32,
        transaction_id: &str,
        packet: Vec<u8>,
    ) -> Result<()>;
}
