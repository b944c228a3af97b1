//! Shared helpers for the integration suites: a mock adapter proxy, a
//! recording logical-device manager, and a full core harness over the
//! in-memory KV store and bus.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use fibron_core::adapter::{Adapter, DeviceType};
use fibron_core::bus::{InProcBus, MessageBus};
use fibron_core::device::{
    Device, Flow, FlowGroup, ImageDownload, PmConfigs, Port, PortCapability, SwitchCapability,
};
use fibron_core::error::{Error, Result};
use fibron_core::kv::{KvStore, MemKvStore};
use fibron_devices::logical::{LogicalDeviceManager, LogicalPortId};
use fibron_devices::manager::DeviceManager;
use fibron_devices::ownership::DeviceOwnership;
use fibron_devices::proxy::AdapterProxy;
use fibron_devices::registry::AdapterRegistry;

pub const ADAPTER_ID: &str = "ponsim";
pub const OLT_TYPE: &str = "ponsim_olt";
pub const ONU_TYPE: &str = "ponsim_onu";
pub const TEST_TTL: Duration = Duration::from_millis(200);

/// Adapter proxy that records calls and can be told to delay or fail.
pub struct MockAdapterProxy {
    calls: Mutex<Vec<String>>,
    download_delay: Mutex<Option<Duration>>,
    fail_ops: Mutex<HashSet<String>>,
}

impl MockAdapterProxy {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            download_delay: Mutex::new(None),
            fail_ops: Mutex::new(HashSet::new()),
        }
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    pub async fn set_download_delay(&self, delay: Option<Duration>) {
        *self.download_delay.lock().await = delay;
    }

    /// Fail an operation, either everywhere (`"disable_device"`) or for one
    /// device (`"disable_device:onu-1"`).
    pub async fn fail_on(&self, op: &str) {
        self.fail_ops.lock().await.insert(op.to_string());
    }

    async fn record(&self, op: &str, device_id: &str) -> Result<()> {
        self.calls.lock().await.push(format!("{op}:{device_id}"));
        let fail_ops = self.fail_ops.lock().await;
        if fail_ops.contains(op) || fail_ops.contains(&format!("{op}:{device_id}")) {
            return Err(Error::unavailable(format!("{op} transport down")));
        }
        Ok(())
    }
}

#[async_trait]
impl AdapterProxy for MockAdapterProxy {
    async fn adopt_device(&self, _adapter: &str, device: &Device) -> Result<()> {
        self.record("adopt_device", &device.id).await
    }

    async fn reenable_device(&self, _adapter: &str, device: &Device) -> Result<()> {
        self.record("reenable_device", &device.id).await
    }

    async fn disable_device(&self, _adapter: &str, device: &Device) -> Result<()> {
        self.record("disable_device", &device.id).await
    }

    async fn reboot_device(&self, _adapter: &str, device: &Device) -> Result<()> {
        self.record("reboot_device", &device.id).await
    }

    async fn delete_device(&self, _adapter: &str, device: &Device) -> Result<()> {
        self.record("delete_device", &device.id).await
    }

    async fn download_image(
        &self,
        _adapter: &str,
        device: &Device,
        _img: &ImageDownload,
    ) -> Result<()> {
        self.record("download_image", &device.id).await?;
        let delay = *self.download_delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn cancel_image_download(
        &self,
        _adapter: &str,
        device: &Device,
        _img: &ImageDownload,
    ) -> Result<()> {
        self.record("cancel_image_download", &device.id).await
    }

    async fn activate_image(
        &self,
        _adapter: &str,
        device: &Device,
        _img: &ImageDownload,
    ) -> Result<()> {
        self.record("activate_image", &device.id).await
    }

    async fn revert_image(
        &self,
        _adapter: &str,
        device: &Device,
        _img: &ImageDownload,
    ) -> Result<()> {
        self.record("revert_image", &device.id).await
    }

    async fn get_image_download_status(
        &self,
        _adapter: &str,
        device: &Device,
        img: &ImageDownload,
    ) -> Result<ImageDownload> {
        self.record("get_image_download_status", &device.id).await?;
        Ok(img.clone())
    }

    async fn update_flows(&self, _adapter: &str, device: &Device, _flows: &[Flow]) -> Result<()> {
        self.record("update_flows", &device.id).await
    }

    async fn update_groups(
        &self,
        _adapter: &str,
        device: &Device,
        _groups: &[FlowGroup],
    ) -> Result<()> {
        self.record("update_groups", &device.id).await
    }

    async fn update_pm_configs(
        &self,
        _adapter: &str,
        device: &Device,
        _configs: &PmConfigs,
    ) -> Result<()> {
        self.record("update_pm_configs", &device.id).await
    }

    async fn get_switch_capability(
        &self,
        _adapter: &str,
        device: &Device,
    ) -> Result<SwitchCapability> {
        self.record("get_switch_capability", &device.id).await?;
        Ok(SwitchCapability {
            desc: "mock switch".to_string(),
            n_buffers: 64,
            n_tables: 2,
            capabilities: 0,
        })
    }

    async fn get_port_capability(
        &self,
        _adapter: &str,
        device: &Device,
        port_no: u32,
    ) -> Result<PortCapability> {
        self.record("get_port_capability", &device.id).await?;
        Ok(PortCapability {
            port_no,
            label: format!("port-{port_no}"),
            max_speed: 10_000,
        })
    }

    async fn packet_out(
        &self,
        _adapter: &str,
        device_id: &str,
        _port: u32,
        _packet: Vec<u8>,
    ) -> Result<()> {
        self.record("packet_out", device_id).await
    }
}

/// Logical-device manager that records calls; logical ids are derived from
/// the device id.
pub struct RecordingLogical {
    calls: Mutex<Vec<String>>,
}

impl RecordingLogical {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    async fn record(&self, op: &str, id: &str) {
        self.calls.lock().await.push(format!("{op}:{id}"));
    }
}

#[async_trait]
impl LogicalDeviceManager for RecordingLogical {
    async fn create(&self, device: &Device) -> Result<String> {
        self.record("create", &device.id).await;
        Ok(format!("ld-{}", device.id))
    }

    async fn delete(&self, device: &Device) -> Result<()> {
        self.record("delete", &device.id).await;
        Ok(())
    }

    async fn load(&self, logical_device_id: &str) -> Result<()> {
        self.record("load", logical_device_id).await;
        Ok(())
    }

    async fn add_logical_port(&self, device: &Device, _port: &Port) -> Result<()> {
        self.record("add_logical_port", &device.id).await;
        Ok(())
    }

    async fn setup_uni_logical_ports(&self, device: &Device) -> Result<()> {
        self.record("setup_uni_logical_ports", &device.id).await;
        Ok(())
    }

    async fn delete_logical_port(&self, id: &LogicalPortId) -> Result<()> {
        self.record("delete_logical_port", &id.port_id).await;
        Ok(())
    }

    async fn get_logical_port_id(&self, device: &Device) -> Result<LogicalPortId> {
        Err(Error::not_found(format!("logical port for {}", device.id)))
    }

    async fn packet_in(
        &self,
        logical_device_id: &str,
        _port: u32,
        _transaction_id: &str,
        _packet: Vec<u8>,
    ) -> Result<()> {
        self.record("packet_in", logical_device_id).await;
        Ok(())
    }
}

pub struct Harness {
    pub kv: Arc<MemKvStore>,
    pub bus: Arc<InProcBus>,
    pub proxy: Arc<MockAdapterProxy>,
    pub logical: Arc<RecordingLogical>,
    pub registry: Arc<AdapterRegistry>,
    pub manager: Arc<DeviceManager>,
}

/// A full single-replica core over a fresh in-memory KV store.
pub async fn harness() -> Harness {
    harness_with(Arc::new(MemKvStore::new()), "core-1").await
}

/// A core replica over a shared KV store; registers the test adapter only
/// when the store does not know it yet.
pub async fn harness_with(kv: Arc<MemKvStore>, instance_id: &str) -> Harness {
    let bus = Arc::new(InProcBus::new());
    let proxy = Arc::new(MockAdapterProxy::new());
    let logical = Arc::new(RecordingLogical::new());

    let registry = AdapterRegistry::new(instance_id, Arc::clone(&kv) as Arc<dyn KvStore>);
    registry.start(bus.as_ref()).await.unwrap();
    if registry.get_adapter(ADAPTER_ID).await.is_none() {
        registry
            .register_adapter(
                Adapter::new(ADAPTER_ID),
                vec![
                    DeviceType::new(OLT_TYPE, ADAPTER_ID),
                    DeviceType::new(ONU_TYPE, ADAPTER_ID),
                ],
            )
            .await
            .unwrap();
    }

    let ownership = DeviceOwnership::new(
        instance_id,
        Arc::clone(&kv) as Arc<dyn KvStore>,
        "test/ownership",
        TEST_TTL,
    );
    let manager = DeviceManager::new(
        instance_id,
        Arc::clone(&kv) as Arc<dyn KvStore>,
        Arc::clone(&proxy) as Arc<dyn AdapterProxy>,
        Arc::clone(&logical) as Arc<dyn LogicalDeviceManager>,
        Arc::clone(&registry),
        ownership,
        Arc::clone(&bus) as Arc<dyn MessageBus>,
    );
    registry.set_device_manager(&manager).await;

    Harness {
        kv,
        bus,
        proxy,
        logical,
        registry,
        manager,
    }
}

/// Poll a condition until it holds or two seconds elapse.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
