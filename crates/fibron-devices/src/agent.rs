//! Per-device agent.
//!
//! One agent exists per resident device; it holds the authoritative
//! in-memory record, serializes every mutation through a per-agent op
//! lock, and brokers device operations to the owning adapter. State
//! changes are persisted first, then handed to the device manager's
//! transition machinery (outside the op lock, since handlers may re-enter
//! the agent).

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use fibron_core::device::{
    AdminState, ConnectStatus, Device, Flow, FlowGroup, ImageActivationState, ImageDownload,
    ImageDownloadState, OperStatus, PeerPort, PmConfigs, Port, PortCapability, PortType,
    SwitchCapability,
};
use fibron_core::error::{Error, Result};
use fibron_core::kv::{KvStore, paths};

use crate::manager::DeviceManager;
use crate::proxy::AdapterProxy;
use crate::registry::AdapterRegistry;

pub struct DeviceAgent {
    device_id: String,
    adapter_proxy: Arc<dyn AdapterProxy>,
    registry: Arc<AdapterRegistry>,
    kv: Arc<dyn KvStore>,
    manager: Weak<DeviceManager>,
    device: RwLock<Device>,
    /// Single-writer discipline: every mutating operation runs under this
    /// lock, including its adapter call.
    op_lock: Mutex<()>,
    active: AtomicBool,
}

impl DeviceAgent {
    pub fn new(
        device: Device,
        adapter_proxy: Arc<dyn AdapterProxy>,
        registry: Arc<AdapterRegistry>,
        kv: Arc<dyn KvStore>,
        manager: Weak<DeviceManager>,
    ) -> Self {
        Self {
            device_id: device.id.clone(),
            adapter_proxy,
            registry,
            kv,
            manager,
            device: RwLock::new(device),
            op_lock: Mutex::new(()),
            active: AtomicBool::new(false),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Load the device from the KV store or persist the in-memory record,
    /// then mark the agent active.
    pub async fn start(&self, from_existing: bool) -> Result<()> {
        if self.device_id.is_empty() {
            return Err(Error::invalid_argument("empty device id"));
        }
        if from_existing {
            let raw = self
                .kv
                .get(&paths::device(&self.device_id))
                .await?
                .ok_or_else(|| Error::not_found(format!("device {}", self.device_id)))?;
            let loaded: Device = serde_json::from_slice(&raw)?;
            *self.device.write().await = loaded;
        } else {
            let snapshot = self.device.read().await.clone();
            let raw = serde_json::to_vec(&snapshot)?;
            if !self
                .kv
                .put_if_absent(paths::DEVICES, &self.device_id, raw)
                .await?
            {
                return Err(Error::already_exists(format!(
                    "device {}",
                    self.device_id
                )));
            }
        }
        self.active.store(true, Ordering::SeqCst);
        debug!(device_id = %self.device_id, from_existing, "device agent started");
        Ok(())
    }

    /// Flush the record and release resources. Idempotent; an agent that
    /// never started does not write anything back.
    pub async fn stop(&self) {
        let _guard = self.op_lock.lock().await;
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let snapshot = self.device.read().await.clone();
        if let Err(e) = self.persist(&snapshot).await {
            warn!(device_id = %self.device_id, error = %e, "flush on stop failed");
        }
        debug!(device_id = %self.device_id, "device agent stopped");
    }

    /// Current snapshot of the device record.
    pub async fn get_device(&self) -> Device {
        self.device.read().await.clone()
    }

    /// Replace the whole device record. Rejected with `FailedPrecondition`
    /// (and nothing persisted) when the state change is not allowed.
    pub async fn update_device(&self, device: Device) -> Result<Device> {
        if device.id != self.device_id {
            return Err(Error::invalid_argument(format!(
                "device id mismatch: {} != {}",
                device.id, self.device_id
            )));
        }
        let manager = self.manager()?;
        let prev = {
            let _guard = self.op_lock.lock().await;
            let prev = self.device.read().await.clone();
            if !manager.transitions().is_allowed(&prev, &device) {
                return Err(Error::failed_precondition(format!(
                    "transition not allowed for device {}",
                    self.device_id
                )));
            }
            self.persist(&device).await?;
            *self.device.write().await = device.clone();
            prev
        };
        manager.process_transition(&prev, &device).await?;
        Ok(device)
    }

    /// Field-level mutation; persists but bypasses the transition map.
    pub async fn update_device_attribute(
        &self,
        name: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let mut device = self.device.read().await.clone();
        match name {
            "parent_id" => device.parent_id = as_string(value)?,
            "serial_number" => device.serial_number = as_string(value)?,
            "vendor_id" => device.vendor_id = as_string(value)?,
            "parent_port_no" => {
                device.parent_port_no = value
                    .as_u64()
                    .ok_or_else(|| Error::invalid_argument("parent_port_no must be a number"))?
                    as u32
            }
            other => {
                return Err(Error::invalid_argument(format!(
                    "unknown device attribute {other}"
                )));
            }
        }
        self.persist(&device).await?;
        *self.device.write().await = device;
        Ok(())
    }

    /// Status callback from the adapter. Unspecified slots keep their
    /// current value; the resulting state change runs the transition
    /// handlers.
    pub async fn update_device_status(
        &self,
        oper_status: Option<OperStatus>,
        connect_status: Option<ConnectStatus>,
    ) -> Result<()> {
        let manager = self.manager()?;
        let (prev, next) = {
            let _guard = self.op_lock.lock().await;
            let prev = self.device.read().await.clone();
            let mut next = prev.clone();
            if let Some(oper) = oper_status {
                next.oper_status = oper;
            }
            if let Some(connect) = connect_status {
                next.connect_status = connect;
            }
            if prev.same_state(&next) {
                return Ok(());
            }
            if !manager.transitions().is_allowed(&prev, &next) {
                return Err(Error::failed_precondition(format!(
                    "transition not allowed for device {}",
                    self.device_id
                )));
            }
            self.persist(&next).await?;
            *self.device.write().await = next.clone();
            (prev, next)
        };
        manager.process_transition(&prev, &next).await
    }

    // Lifecycle -----------------------------------------------------------

    pub async fn enable(&self) -> Result<()> {
        let manager = self.manager()?;
        let (prev, next) = {
            let _guard = self.op_lock.lock().await;
            let prev = self.device.read().await.clone();
            match prev.admin_state {
                AdminState::Preprovisioned | AdminState::Disabled => {}
                AdminState::Enabled => {
                    return Err(Error::failed_precondition(format!(
                        "device {} already enabled",
                        self.device_id
                    )));
                }
                state => {
                    return Err(Error::failed_precondition(format!(
                        "cannot enable device {} in {state:?}",
                        self.device_id
                    )));
                }
            }
            let adapter = self.adapter_for(&prev).await?;
            let mut next = prev.clone();
            next.admin_state = AdminState::Enabled;
            next.oper_status = OperStatus::Activating;
            if prev.admin_state == AdminState::Preprovisioned {
                self.adapter_proxy.adopt_device(&adapter, &next).await?;
            } else {
                self.adapter_proxy.reenable_device(&adapter, &next).await?;
            }
            self.persist(&next).await?;
            *self.device.write().await = next.clone();
            (prev, next)
        };
        manager.process_transition(&prev, &next).await
    }

    pub async fn disable(&self) -> Result<()> {
        let manager = self.manager()?;
        let (prev, next) = {
            let _guard = self.op_lock.lock().await;
            let prev = self.device.read().await.clone();
            match prev.admin_state {
                AdminState::Enabled => {}
                AdminState::Disabled => return Ok(()),
                state => {
                    return Err(Error::failed_precondition(format!(
                        "cannot disable device {} in {state:?}",
                        self.device_id
                    )));
                }
            }
            let adapter = self.adapter_for(&prev).await?;
            let mut next = prev.clone();
            next.admin_state = AdminState::Disabled;
            next.oper_status = OperStatus::Unknown;
            self.adapter_proxy.disable_device(&adapter, &next).await?;
            self.persist(&next).await?;
            *self.device.write().await = next.clone();
            (prev, next)
        };
        manager.process_transition(&prev, &next).await
    }

    pub async fn reboot(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let device = self.device.read().await.clone();
        match device.admin_state {
            AdminState::Enabled | AdminState::Disabled => {}
            state => {
                return Err(Error::failed_precondition(format!(
                    "cannot reboot device {} in {state:?}",
                    self.device_id
                )));
            }
        }
        let adapter = self.adapter_for(&device).await?;
        self.adapter_proxy.reboot_device(&adapter, &device).await
    }

    pub async fn delete(&self) -> Result<()> {
        let manager = self.manager()?;
        let (prev, next) = {
            let _guard = self.op_lock.lock().await;
            let prev = self.device.read().await.clone();
            if prev.admin_state == AdminState::Deleted {
                return Err(Error::failed_precondition(format!(
                    "device {} already deleted",
                    self.device_id
                )));
            }
            // A preprovisioned device was never handed to an adapter, so a
            // missing routing entry is fine there.
            match self.adapter_for(&prev).await {
                Ok(adapter) => {
                    self.adapter_proxy.delete_device(&adapter, &prev).await?;
                }
                Err(e) if e.is_not_found() && prev.admin_state == AdminState::Preprovisioned => {}
                Err(e) => return Err(e),
            }
            let mut next = prev.clone();
            next.admin_state = AdminState::Deleted;
            self.persist(&next).await?;
            *self.device.write().await = next.clone();
            (prev, next)
        };
        manager.process_transition(&prev, &next).await
    }

    // Ports ---------------------------------------------------------------

    /// Add or replace a port; peers of an existing port are merged.
    pub async fn add_port(&self, port: Port) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let mut device = self.device.read().await.clone();
        if let Some(existing) = device.ports.iter_mut().find(|p| p.port_no == port.port_no) {
            let mut merged = port;
            for peer in existing.peers.drain(..) {
                if !merged.peers.contains(&peer) {
                    merged.peers.push(peer);
                }
            }
            *existing = merged;
        } else {
            device.ports.push(port);
        }
        self.persist(&device).await?;
        *self.device.write().await = device;
        Ok(())
    }

    /// Attach the reciprocal edge of a peer's `add_port`. When the target
    /// port does not exist yet a PON port is created to hold the
    /// back-reference.
    pub async fn add_peer_port(&self, port_no: u32, peer: PeerPort) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let mut device = self.device.read().await.clone();
        match device.ports.iter_mut().find(|p| p.port_no == port_no) {
            Some(port) => {
                if !port.peers.contains(&peer) {
                    port.peers.push(peer);
                }
            }
            None => {
                let mut port = Port::new(port_no, PortType::Pon);
                port.peers.push(peer);
                device.ports.push(port);
            }
        }
        self.persist(&device).await?;
        *self.device.write().await = device;
        Ok(())
    }

    pub async fn update_port_state(
        &self,
        port_type: PortType,
        port_no: u32,
        oper_status: OperStatus,
    ) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let mut device = self.device.read().await.clone();
        let port = device
            .ports
            .iter_mut()
            .find(|p| p.port_no == port_no && p.port_type == port_type)
            .ok_or_else(|| {
                Error::not_found(format!("port {port_no} on device {}", self.device_id))
            })?;
        port.oper_status = oper_status;
        self.persist(&device).await?;
        *self.device.write().await = device;
        Ok(())
    }

    pub async fn get_ports(&self, port_type: Option<PortType>) -> Vec<Port> {
        let device = self.device.read().await;
        device
            .ports
            .iter()
            .filter(|p| port_type.is_none_or(|t| p.port_type == t))
            .cloned()
            .collect()
    }

    // Flows, groups, PM ----------------------------------------------------

    pub async fn update_flows(&self, flows: Vec<Flow>) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let mut device = self.device.read().await.clone();
        let adapter = self.adapter_for(&device).await?;
        self.adapter_proxy
            .update_flows(&adapter, &device, &flows)
            .await?;
        device.flows = flows;
        self.persist(&device).await?;
        *self.device.write().await = device;
        Ok(())
    }

    pub async fn update_groups(&self, groups: Vec<FlowGroup>) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let mut device = self.device.read().await.clone();
        let adapter = self.adapter_for(&device).await?;
        self.adapter_proxy
            .update_groups(&adapter, &device, &groups)
            .await?;
        device.groups = groups;
        self.persist(&device).await?;
        *self.device.write().await = device;
        Ok(())
    }

    pub async fn update_pm_configs(&self, configs: PmConfigs) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let mut device = self.device.read().await.clone();
        let adapter = self.adapter_for(&device).await?;
        self.adapter_proxy
            .update_pm_configs(&adapter, &device, &configs)
            .await?;
        device.pm_configs = Some(configs);
        self.persist(&device).await?;
        *self.device.write().await = device;
        Ok(())
    }

    // Capabilities ---------------------------------------------------------

    pub async fn get_switch_capability(&self) -> Result<SwitchCapability> {
        let device = self.device.read().await.clone();
        let adapter = self.adapter_for(&device).await?;
        self.adapter_proxy
            .get_switch_capability(&adapter, &device)
            .await
    }

    pub async fn get_port_capability(&self, port_no: u32) -> Result<PortCapability> {
        let device = self.device.read().await.clone();
        let adapter = self.adapter_for(&device).await?;
        self.adapter_proxy
            .get_port_capability(&adapter, &device, port_no)
            .await
    }

    // Images ---------------------------------------------------------------

    /// Request an image download. Re-issuing the request for the same image
    /// name succeeds and resets the record.
    pub async fn download_image(&self, mut img: ImageDownload) -> Result<ImageDownload> {
        let _guard = self.op_lock.lock().await;
        let mut device = self.device.read().await.clone();
        if device.admin_state != AdminState::Enabled {
            return Err(Error::failed_precondition(format!(
                "cannot download image to device {} in {:?}",
                self.device_id, device.admin_state
            )));
        }
        let adapter = self.adapter_for(&device).await?;
        img.device_id = self.device_id.clone();
        img.download_state = ImageDownloadState::Requested;
        self.adapter_proxy
            .download_image(&adapter, &device, &img)
            .await?;
        upsert_image(&mut device.image_downloads, img.clone());
        self.persist(&device).await?;
        *self.device.write().await = device;
        Ok(img)
    }

    pub async fn cancel_image_download(&self, name: &str) -> Result<ImageDownload> {
        let _guard = self.op_lock.lock().await;
        let mut device = self.device.read().await.clone();
        let mut img = find_image(&device.image_downloads, name)?.clone();
        let adapter = self.adapter_for(&device).await?;
        self.adapter_proxy
            .cancel_image_download(&adapter, &device, &img)
            .await?;
        img.download_state = ImageDownloadState::Cancelled;
        upsert_image(&mut device.image_downloads, img.clone());
        self.persist(&device).await?;
        *self.device.write().await = device;
        Ok(img)
    }

    pub async fn activate_image(&self, name: &str) -> Result<ImageDownload> {
        let _guard = self.op_lock.lock().await;
        let mut device = self.device.read().await.clone();
        let mut img = find_image(&device.image_downloads, name)?.clone();
        if img.download_state != ImageDownloadState::Succeeded {
            return Err(Error::failed_precondition(format!(
                "image {name} not downloaded on device {}",
                self.device_id
            )));
        }
        let adapter = self.adapter_for(&device).await?;
        self.adapter_proxy
            .activate_image(&adapter, &device, &img)
            .await?;
        img.image_state = ImageActivationState::Activating;
        upsert_image(&mut device.image_downloads, img.clone());
        self.persist(&device).await?;
        *self.device.write().await = device;
        Ok(img)
    }

    pub async fn revert_image(&self, name: &str) -> Result<ImageDownload> {
        let _guard = self.op_lock.lock().await;
        let mut device = self.device.read().await.clone();
        let mut img = find_image(&device.image_downloads, name)?.clone();
        let adapter = self.adapter_for(&device).await?;
        self.adapter_proxy
            .revert_image(&adapter, &device, &img)
            .await?;
        img.image_state = ImageActivationState::Reverting;
        upsert_image(&mut device.image_downloads, img.clone());
        self.persist(&device).await?;
        *self.device.write().await = device;
        Ok(img)
    }

    /// Fetch the live status from the adapter and fold it into the stored
    /// record.
    pub async fn get_image_download_status(&self, name: &str) -> Result<ImageDownload> {
        let _guard = self.op_lock.lock().await;
        let mut device = self.device.read().await.clone();
        let stored = find_image(&device.image_downloads, name)?.clone();
        let adapter = self.adapter_for(&device).await?;
        let fresh = self
            .adapter_proxy
            .get_image_download_status(&adapter, &device, &stored)
            .await?;
        upsert_image(&mut device.image_downloads, fresh.clone());
        self.persist(&device).await?;
        *self.device.write().await = device;
        Ok(fresh)
    }

    /// Replace a stored image record (adapter callback path).
    pub async fn update_image_download(&self, img: ImageDownload) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let mut device = self.device.read().await.clone();
        upsert_image(&mut device.image_downloads, img);
        self.persist(&device).await?;
        *self.device.write().await = device;
        Ok(())
    }

    pub async fn get_image_download(&self, name: &str) -> Result<ImageDownload> {
        let device = self.device.read().await;
        find_image(&device.image_downloads, name).cloned()
    }

    pub async fn list_image_downloads(&self) -> Vec<ImageDownload> {
        self.device.read().await.image_downloads.clone()
    }

    // Packets --------------------------------------------------------------

    /// Fire-and-forget packet egress; failures are logged, not surfaced.
    pub async fn packet_out(&self, port: u32, packet: Vec<u8>) -> Result<()> {
        let device = self.device.read().await.clone();
        let adapter = self.adapter_for(&device).await?;
        let proxy = Arc::clone(&self.adapter_proxy);
        let device_id = self.device_id.clone();
        tokio::spawn(async move {
            if let Err(e) = proxy.packet_out(&adapter, &device_id, port, packet).await {
                warn!(device_id = %device_id, port, error = %e, "packet out failed");
            }
        });
        Ok(())
    }

    // Internals ------------------------------------------------------------

    fn manager(&self) -> Result<Arc<DeviceManager>> {
        self.manager
            .upgrade()
            .ok_or_else(|| Error::internal("device manager dropped"))
    }

    async fn adapter_for(&self, device: &Device) -> Result<String> {
        self.registry.get_adapter_name(&device.device_type).await
    }

    async fn persist(&self, device: &Device) -> Result<()> {
        let raw = serde_json::to_vec(device)?;
        self.kv.put(&paths::device(&self.device_id), raw).await
    }
}

fn as_string(value: serde_json::Value) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| Error::invalid_argument("expected a string value"))
}

fn find_image<'a>(images: &'a [ImageDownload], name: &str) -> Result<&'a ImageDownload> {
    images
        .iter()
        .find(|i| i.name == name)
        .ok_or_else(|| Error::not_found(format!("image download {name}")))
}

fn upsert_image(images: &mut Vec<ImageDownload>, img: ImageDownload) {
    match images.iter_mut().find(|i| i.name == img.name) {
        Some(existing) => *existing = img,
        None => images.push(img),
    }
}
