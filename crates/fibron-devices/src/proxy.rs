//! Adapter proxy interface.
//!
//! Protocol-level work is delegated to per-device-type adapter processes.
//! The transport (inter-container messaging, gRPC, ...) is an external
//! collaborator; this trait is the call surface the core requires, one
//! method per device operation. Every call names the adapter that serves
//! the device, resolved through the adapter registry.

use async_trait::async_trait;

use fibron_core::device::{
    Device, Flow, FlowGroup, ImageDownload, PmConfigs, PortCapability, SwitchCapability,
};
use fibron_core::error::Result;

/// Call surface toward the per-device-type adapters.
#[async_trait]
pub trait AdapterProxy: Send + Sync {
    /// Hand a freshly enabled device to its adapter for activation.
    async fn adopt_device(&self, adapter: &str, device: &Device) -> Result<()>;

    /// Re-enable a previously disabled device.
    async fn reenable_device(&self, adapter: &str, device: &Device) -> Result<()>;

    async fn disable_device(&self, adapter: &str, device: &Device) -> Result<()>;

    async fn reboot_device(&self, adapter: &str, device: &Device) -> Result<()>;

    async fn delete_device(&self, adapter: &str, device: &Device) -> Result<()>;

    async fn download_image(&self, adapter: &str, device: &Device, img: &ImageDownload)
        -> Result<()>;

    async fn cancel_image_download(
        &self,
        adapter: &str,
        device: &Device,
        img: &ImageDownload,
    ) -> Result<()>;

    async fn activate_image(&self, adapter: &str, device: &Device, img: &ImageDownload)
        -> Result<()>;

    async fn revert_image(&self, adapter: &str, device: &Device, img: &ImageDownload)
        -> Result<()>;

    /// Fetch the current download status from the adapter.
    async fn get_image_download_status(
        &self,
        adapter: &str,
        device: &Device,
        img: &ImageDownload,
    ) -> Result<ImageDownload>;

    async fn update_flows(&self, adapter: &str, device: &Device, flows: &[Flow]) -> Result<()>;

    async fn update_groups(&self, adapter: &str, device: &Device, groups: &[FlowGroup])
        -> Result<()>;

    async fn update_pm_configs(
        &self,
        adapter: &str,
        device: &Device,
        configs: &PmConfigs,
    ) -> Result<()>;

    async fn get_switch_capability(&self, adapter: &str, device: &Device)
        -> Result<SwitchCapability>;

    async fn get_port_capability(
        &self,
        adapter: &str,
        device: &Device,
        port_no: u32,
    ) -> Result<PortCapability>;

    /// Fire-and-forget packet egress.
    async fn packet_out(&self, adapter: &str, device_id: &str, port: u32, packet: Vec<u8>)
        -> Result<()>;
}
