//! Device manager.
//!
//! Owns the table of per-device agents, hydrates devices on demand from
//! the KV store, walks the parent/child tree, and orchestrates lifecycle
//! transitions. The agent-table lock is held only for map access and never
//! across a KV round-trip or an adapter call; a separate hydration lock
//! serializes cold loads so a device is hydrated exactly once, and a
//! detection lock serializes child-device detection's check-and-create.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use fibron_core::adapter::Adapter;
use fibron_core::bus::{DeviceDiscovered, MessageBus};
use fibron_core::device::{
    AdminState, ConnectStatus, Device, Flow, FlowGroup, ImageDownload, OperStatus, PeerPort,
    PmConfigs, Port, PortCapability, PortType, ProxyAddress, SwitchCapability,
};
use fibron_core::error::{Error, Result};
use fibron_core::kv::{KvStore, paths};

use crate::agent::DeviceAgent;
use crate::logical::LogicalDeviceManager;
use crate::ownership::DeviceOwnership;
use crate::proxy::AdapterProxy;
use crate::registry::AdapterRegistry;
use crate::transitions::{TransitionHandler, TransitionMap};

pub struct DeviceManager {
    core_instance_id: String,
    agents: RwLock<HashMap<String, Arc<DeviceAgent>>>,
    /// Serializes cold loads; never the same lock as the agent table.
    hydration_lock: Mutex<()>,
    /// Serializes child-device detection's exists-check and creation.
    detection_lock: Mutex<()>,
    kv: Arc<dyn KvStore>,
    adapter_proxy: Arc<dyn AdapterProxy>,
    logical: Arc<dyn LogicalDeviceManager>,
    registry: Arc<AdapterRegistry>,
    ownership: DeviceOwnership,
    bus: Arc<dyn MessageBus>,
    transitions: TransitionMap,
    self_ref: Weak<DeviceManager>,
}

impl DeviceManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        core_instance_id: impl Into<String>,
        kv: Arc<dyn KvStore>,
        adapter_proxy: Arc<dyn AdapterProxy>,
        logical: Arc<dyn LogicalDeviceManager>,
        registry: Arc<AdapterRegistry>,
        ownership: DeviceOwnership,
        bus: Arc<dyn MessageBus>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            core_instance_id: core_instance_id.into(),
            agents: RwLock::new(HashMap::new()),
            hydration_lock: Mutex::new(()),
            detection_lock: Mutex::new(()),
            kv,
            adapter_proxy,
            logical,
            registry,
            ownership,
            bus,
            transitions: TransitionMap::new(),
            self_ref: self_ref.clone(),
        })
    }

    pub fn core_instance_id(&self) -> &str {
        &self.core_instance_id
    }

    pub fn ownership(&self) -> &DeviceOwnership {
        &self.ownership
    }

    pub(crate) fn transitions(&self) -> &TransitionMap {
        &self.transitions
    }

    /// Whether this replica owns the device. Starts ownership monitoring
    /// as a side effect of the first query.
    pub async fn owned_by_me(&self, device_id: &str) -> Result<bool> {
        self.ownership.owned_by_me(device_id).await
    }

    /// Signal shutdown to the ownership monitors.
    pub fn stop(&self) {
        info!("stopping device manager");
        self.ownership.stop();
    }

    // Creation and lifecycle ----------------------------------------------

    /// Create a new top-level device. The record is stamped as root and an
    /// id is generated when the caller did not provide one.
    pub async fn create_device(&self, mut device: Device) -> Result<Device> {
        if device.id.is_empty() {
            device.id = uuid::Uuid::new_v4().to_string();
        }
        device.root = true;
        debug!(device_id = %device.id, device_type = %device.device_type, "create device");
        let agent = Arc::new(self.new_agent(device));
        agent.start(false).await?;
        self.insert_new_agent(Arc::clone(&agent)).await?;
        Ok(agent.get_device().await)
    }

    pub async fn enable_device(&self, device_id: &str) -> Result<()> {
        let agent = self.agent(device_id).await?;
        agent.enable().await
    }

    pub async fn disable_device(&self, device_id: &str) -> Result<()> {
        let agent = self.agent(device_id).await?;
        agent.disable().await
    }

    pub async fn reboot_device(&self, device_id: &str) -> Result<()> {
        let agent = self.agent(device_id).await?;
        agent.reboot().await
    }

    /// Delete a device: run the agent's delete (adapter call plus
    /// transition chain), then retire the agent and abandon ownership.
    pub async fn delete_device(&self, device_id: &str) -> Result<()> {
        let agent = self.agent(device_id).await?;
        agent.delete().await?;
        agent.stop().await;
        self.remove_agent(device_id).await;
        if let Err(e) = self.ownership.abandon(device_id).await {
            debug!(device_id, error = %e, "no ownership entry to abandon");
        }
        Ok(())
    }

    // Lookup ---------------------------------------------------------------

    /// Fetch a device, hydrating it from the KV store when cold.
    pub async fn get_device(&self, device_id: &str) -> Result<Device> {
        let agent = self.agent(device_id).await?;
        Ok(agent.get_device().await)
    }

    pub async fn is_device_in_cache(&self, device_id: &str) -> bool {
        self.agents.read().await.contains_key(device_id)
    }

    pub async fn is_root_device(&self, device_id: &str) -> Result<bool> {
        Ok(self.get_device(device_id).await?.root)
    }

    pub async fn get_parent_device_id(&self, device_id: &str) -> Option<String> {
        self.get_device(device_id).await.ok().map(|d| d.parent_id)
    }

    /// Find a child of `parent_device_id` by onu id and/or serial number.
    ///
    /// When both an onu id and a serial number are provided, both must
    /// match; otherwise whichever one matches is good enough. An onu-id
    /// match additionally requires the parent port to match.
    pub async fn get_child_device(
        &self,
        parent_device_id: &str,
        serial_number: &str,
        onu_id: u32,
        parent_port_no: u32,
    ) -> Result<Device> {
        let parent = self
            .get_device(parent_device_id)
            .await
            .map_err(|e| Error::aborted(e.to_string()))?;
        let child_ids = self.get_all_child_device_ids(&parent);
        if child_ids.is_empty() {
            debug!(parent_device_id, "no child devices");
            return Err(Error::not_found(format!(
                "child of {parent_device_id}"
            )));
        }
        for child_id in child_ids {
            let Ok(candidate) = self.get_device(&child_id).await else {
                continue;
            };
            let found_onu_id = candidate
                .proxy_address
                .as_ref()
                .is_some_and(|pa| pa.onu_id == onu_id)
                && candidate.parent_port_no == parent_port_no;
            let found_serial =
                !candidate.serial_number.is_empty() && candidate.serial_number == serial_number;
            let found = if onu_id > 0 && !serial_number.is_empty() {
                found_onu_id && found_serial
            } else {
                found_onu_id || found_serial
            };
            if found {
                return Ok(candidate);
            }
        }
        warn!(
            parent_device_id,
            serial_number, onu_id, parent_port_no, "child device not found"
        );
        Err(Error::not_found(format!("child of {parent_device_id}")))
    }

    /// Find a child by exact proxy-address equality.
    pub async fn get_child_device_with_proxy_address(
        &self,
        proxy_address: &ProxyAddress,
    ) -> Result<Device> {
        let parent = self
            .get_device(&proxy_address.device_id)
            .await
            .map_err(|e| Error::aborted(e.to_string()))?;
        let child_ids = self.get_all_child_device_ids(&parent);
        if child_ids.is_empty() {
            return Err(Error::not_found(format!(
                "child at {proxy_address:?}"
            )));
        }
        for child_id in child_ids {
            let Ok(candidate) = self.get_device(&child_id).await else {
                continue;
            };
            if candidate.proxy_address.as_ref() == Some(proxy_address) {
                return Ok(candidate);
            }
        }
        Err(Error::not_found(format!("child at {proxy_address:?}")))
    }

    /// All devices: the union of KV-resident records and in-memory agents.
    /// Cold records are hydrated best-effort; a hydration failure does not
    /// fail the listing.
    pub async fn list_devices(&self) -> Result<Vec<Device>> {
        let mut result = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for (_, raw) in self.kv.list(paths::DEVICES).await? {
            let device: Device = match serde_json::from_slice(&raw) {
                Ok(device) => device,
                Err(e) => {
                    warn!(error = %e, "skipping undecodable device record");
                    continue;
                }
            };
            if !self.is_device_in_cache(&device.id).await {
                let agent = Arc::new(self.new_agent(Device::new(device.id.clone(), "")));
                match agent.start(true).await {
                    Ok(()) => {
                        self.insert_agent_if_absent(agent).await;
                    }
                    Err(e) => {
                        warn!(device_id = %device.id, error = %e, "failure starting agent");
                        agent.stop().await;
                    }
                }
            }
            seen.insert(device.id.clone());
            result.push(device);
        }
        let agents: Vec<Arc<DeviceAgent>> =
            self.agents.read().await.values().cloned().collect();
        for agent in agents {
            if !seen.contains(agent.device_id()) {
                result.push(agent.get_device().await);
            }
        }
        Ok(result)
    }

    /// Ids of the devices resident in memory.
    pub async fn list_device_ids(&self) -> Vec<String> {
        self.agents.read().await.keys().cloned().collect()
    }

    /// Take over management of a list of devices, hydrating the ones this
    /// replica does not hold yet.
    pub async fn reconcile_devices(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Err(Error::invalid_argument("empty list of ids"));
        }
        let to_reconcile = ids.len();
        let mut reconciled = 0;
        for id in ids {
            if self.is_device_in_cache(id).await {
                reconciled += 1;
                continue;
            }
            debug!(device_id = %id, "reconciling device");
            let agent = Arc::new(self.new_agent(Device::new(id.clone(), "")));
            match agent.start(true).await {
                Ok(()) => {
                    self.insert_agent_if_absent(agent).await;
                    reconciled += 1;
                }
                Err(e) => {
                    warn!(device_id = %id, error = %e, "failure loading device");
                    agent.stop().await;
                }
            }
        }
        if reconciled != to_reconcile {
            return Err(Error::data_loss(format!(
                "less devices reconciled: {reconciled}/{to_reconcile}"
            )));
        }
        Ok(())
    }

    /// Hydration driver: load the device itself, then its family. A root
    /// pulls in its logical device and children; a child recurses into its
    /// parent. Preprovisioned and deleted devices stop the walk.
    pub fn load<'a>(&'a self, device_id: &'a str) -> BoxFuture<'a, Result<()>> {
        async move {
            let agent = self.load_device(device_id).await?;
            let device = agent.get_device().await;
            if matches!(
                device.admin_state,
                AdminState::Preprovisioned | AdminState::Deleted
            ) {
                return Ok(());
            }
            if device.root {
                if !device.parent_id.is_empty() {
                    if let Err(e) = self.logical.load(&device.parent_id).await {
                        warn!(
                            logical_device_id = %device.parent_id,
                            error = %e,
                            "failure loading logical device"
                        );
                    }
                }
                for child_id in self.get_all_child_device_ids(&device) {
                    if let Err(e) = self.load_device(&child_id).await {
                        warn!(device_id = %child_id, error = %e, "failure loading child");
                        return Err(e);
                    }
                }
                Ok(())
            } else if !device.parent_id.is_empty() {
                self.load(&device.parent_id).await
            } else {
                Ok(())
            }
        }
        .boxed()
    }

    // Updates --------------------------------------------------------------

    pub async fn update_device(&self, device: Device) -> Result<Device> {
        let agent = self.agent(&device.id).await?;
        agent.update_device(device).await
    }

    pub async fn update_device_status(
        &self,
        device_id: &str,
        oper_status: Option<OperStatus>,
        connect_status: Option<ConnectStatus>,
    ) -> Result<()> {
        let agent = self.agent(device_id).await?;
        agent.update_device_status(oper_status, connect_status).await
    }

    /// Field-level mutation on an in-memory device; no hydration, no
    /// transition processing.
    pub async fn update_device_attribute(
        &self,
        device_id: &str,
        name: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        let agent = {
            let agents = self.agents.read().await;
            agents.get(device_id).cloned()
        }
        .ok_or_else(|| Error::not_found(format!("device {device_id}")))?;
        agent.update_device_attribute(name, value).await
    }

    /// Add a port, fan the reciprocal peer edges out to the peer agents,
    /// and (asynchronously) mirror NNI/UNI ports onto the logical device.
    pub async fn add_port(&self, device_id: &str, port: Port) -> Result<()> {
        let agent = self.agent(device_id).await?;
        agent.add_port(port.clone()).await?;
        let me_as_peer = PeerPort {
            device_id: device_id.to_string(),
            port_no: port.port_no,
        };
        for peer in &port.peers {
            match self.agent(&peer.device_id).await {
                Ok(peer_agent) => {
                    peer_agent
                        .add_peer_port(peer.port_no, me_as_peer.clone())
                        .await?;
                }
                Err(e) => {
                    warn!(
                        peer_device_id = %peer.device_id,
                        error = %e,
                        "peer device not available for reciprocal port"
                    );
                }
            }
        }
        if matches!(
            port.port_type,
            PortType::EthernetNni | PortType::EthernetUni
        ) {
            let device = self.get_device(device_id).await?;
            let logical = Arc::clone(&self.logical);
            tokio::spawn(async move {
                if let Err(e) = logical.add_logical_port(&device, &port).await {
                    warn!(device_id = %device.id, error = %e, "add logical port failed");
                }
            });
        }
        Ok(())
    }

    pub async fn update_port_state(
        &self,
        device_id: &str,
        port_type: PortType,
        port_no: u32,
        oper_status: OperStatus,
    ) -> Result<()> {
        let agent = self.agent(device_id).await?;
        agent.update_port_state(port_type, port_no, oper_status).await
    }

    pub async fn update_flows(&self, device_id: &str, flows: Vec<Flow>) -> Result<()> {
        let agent = self.agent(device_id).await?;
        agent.update_flows(flows).await
    }

    pub async fn update_groups(&self, device_id: &str, groups: Vec<FlowGroup>) -> Result<()> {
        let agent = self.agent(device_id).await?;
        agent.update_groups(groups).await
    }

    pub async fn update_pm_configs(&self, device_id: &str, configs: PmConfigs) -> Result<()> {
        let agent = self.agent(device_id).await?;
        agent.update_pm_configs(configs).await
    }

    pub async fn get_ports(
        &self,
        device_id: &str,
        port_type: Option<PortType>,
    ) -> Result<Vec<Port>> {
        let agent = self.agent(device_id).await?;
        Ok(agent.get_ports(port_type).await)
    }

    pub async fn get_switch_capability(&self, device_id: &str) -> Result<SwitchCapability> {
        let agent = self.agent(device_id).await?;
        agent.get_switch_capability().await
    }

    pub async fn get_port_capability(
        &self,
        device_id: &str,
        port_no: u32,
    ) -> Result<PortCapability> {
        let agent = self.agent(device_id).await?;
        agent.get_port_capability(port_no).await
    }

    // Images ---------------------------------------------------------------

    pub async fn download_image(&self, img: ImageDownload) -> Result<ImageDownload> {
        let agent = self.agent(&img.device_id).await?;
        agent.download_image(img).await
    }

    pub async fn cancel_image_download(
        &self,
        device_id: &str,
        name: &str,
    ) -> Result<ImageDownload> {
        let agent = self.agent(device_id).await?;
        agent.cancel_image_download(name).await
    }

    pub async fn activate_image(&self, device_id: &str, name: &str) -> Result<ImageDownload> {
        let agent = self.agent(device_id).await?;
        agent.activate_image(name).await
    }

    pub async fn revert_image(&self, device_id: &str, name: &str) -> Result<ImageDownload> {
        let agent = self.agent(device_id).await?;
        agent.revert_image(name).await
    }

    pub async fn get_image_download_status(
        &self,
        device_id: &str,
        name: &str,
    ) -> Result<ImageDownload> {
        let agent = self.agent(device_id).await?;
        agent.get_image_download_status(name).await
    }

    pub async fn update_image_download(
        &self,
        device_id: &str,
        img: ImageDownload,
    ) -> Result<()> {
        let agent = self.agent(device_id).await?;
        agent.update_image_download(img).await
    }

    pub async fn get_image_download(&self, device_id: &str, name: &str) -> Result<ImageDownload> {
        let agent = self.agent(device_id).await?;
        agent.get_image_download(name).await
    }

    pub async fn list_image_downloads(&self, device_id: &str) -> Result<Vec<ImageDownload>> {
        let agent = self.agent(device_id).await?;
        Ok(agent.list_image_downloads().await)
    }

    // Child detection and the tree ----------------------------------------

    /// An adapter detected a child device hanging off a parent port.
    ///
    /// Exactly one child wins under concurrent detection of the same
    /// (serial, onu, port); the loser gets `AlreadyExists`. The new child
    /// is enabled and announced on the bus asynchronously.
    #[allow(clippy::too_many_arguments)]
    pub async fn child_device_detected(
        &self,
        parent_device_id: &str,
        parent_port_no: u32,
        device_type: &str,
        channel_id: u32,
        vendor_id: &str,
        serial_number: &str,
        onu_id: u32,
    ) -> Result<Device> {
        debug!(parent_device_id, serial_number, onu_id, "child device detected");
        let parent = self
            .get_device(parent_device_id)
            .await
            .map_err(|_| Error::not_found(format!("parent {parent_device_id}")))?;

        let _guard = self.detection_lock.lock().await;
        match self
            .get_child_device(parent_device_id, serial_number, onu_id, parent_port_no)
            .await
        {
            Ok(_) => {
                warn!(parent_device_id, serial_number, "child device exists");
                return Err(Error::already_exists(serial_number.to_string()));
            }
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let mut child = Device::new(uuid::Uuid::new_v4().to_string(), device_type);
        child.root = false;
        child.parent_id = parent_device_id.to_string();
        child.parent_port_no = parent_port_no;
        child.vendor_id = vendor_id.to_string();
        child.serial_number = serial_number.to_string();
        child.proxy_address = Some(ProxyAddress {
            device_id: parent_device_id.to_string(),
            device_type: parent.device_type.clone(),
            channel_id,
            onu_id,
        });

        let agent = Arc::new(self.new_agent(child));
        agent.start(false).await?;
        self.insert_new_agent(Arc::clone(&agent)).await?;

        // Make the child reachable through the parent's peer graph right
        // away; the adapter's later add_port merges the real port details.
        let parent_agent = self.agent(parent_device_id).await?;
        parent_agent
            .add_peer_port(
                parent_port_no,
                PeerPort {
                    device_id: agent.device_id().to_string(),
                    port_no: parent_port_no,
                },
            )
            .await?;

        // Side effect: begin monitoring ownership of the new child.
        match self.ownership.owned_by_me(agent.device_id()).await {
            Ok(owned) => {
                if !owned {
                    debug!(device_id = %agent.device_id(), "child owned by a peer replica");
                }
            }
            Err(e) => warn!(device_id = %agent.device_id(), error = %e, "ownership query failed"),
        }

        let enable_agent = Arc::clone(&agent);
        tokio::spawn(async move {
            if let Err(e) = enable_agent.enable().await {
                warn!(device_id = %enable_agent.device_id(), error = %e, "child enable failed");
            }
        });

        let bus = Arc::clone(&self.bus);
        let event = DeviceDiscovered {
            device_id: agent.device_id().to_string(),
            device_type: device_type.to_string(),
            parent_id: parent_device_id.to_string(),
            core_instance_id: self.core_instance_id.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = bus.device_discovered(event).await {
                warn!(error = %e, "device discovered publish failed");
            }
        });

        Ok(agent.get_device().await)
    }

    /// Ingress packet from an adapter; forwarded under the root's logical
    /// device.
    pub async fn packet_in(
        &self,
        device_id: &str,
        port: u32,
        transaction_id: &str,
        packet: Vec<u8>,
    ) -> Result<()> {
        let device = self.get_device(device_id).await?;
        if !device.root {
            return Err(Error::failed_precondition(format!(
                "packet in on non-root device {device_id}"
            )));
        }
        self.logical
            .packet_in(&device.parent_id, port, transaction_id, packet)
            .await
    }

    pub async fn packet_out(&self, device_id: &str, port: u32, packet: Vec<u8>) -> Result<()> {
        let agent = self.agent(device_id).await?;
        agent.packet_out(port, packet).await
    }

    /// Flatten a parent's port peers into child ids, multiplicity
    /// preserved.
    pub fn get_all_child_device_ids(&self, parent: &Device) -> Vec<String> {
        let mut child_ids = Vec::new();
        for port in &parent.ports {
            for peer in &port.peers {
                child_ids.push(peer.device_id.clone());
            }
        }
        child_ids
    }

    pub async fn get_all_child_devices(&self, parent_device_id: &str) -> Result<Vec<Device>> {
        let parent = self.get_device(parent_device_id).await?;
        let mut children = Vec::new();
        for child_id in self.get_all_child_device_ids(&parent) {
            if let Ok(child) = self.get_device(&child_id).await {
                children.push(child);
            }
        }
        Ok(children)
    }

    /// Propagate a status change to every child; keeps going on error and
    /// reports the last one.
    pub async fn update_children_status(
        &self,
        parent_device_id: &str,
        oper_status: Option<OperStatus>,
        connect_status: Option<ConnectStatus>,
    ) -> Result<()> {
        let parent = self
            .get_device(parent_device_id)
            .await
            .map_err(|e| Error::aborted(e.to_string()))?;
        let mut last_err = None;
        for child_id in self.get_all_child_device_ids(&parent) {
            if let Ok(agent) = self.agent(&child_id).await {
                if let Err(e) = agent.update_device_status(oper_status, connect_status).await {
                    warn!(device_id = %child_id, error = %e, "child status update failed");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Disable every child of a parent being disabled.
    pub async fn disable_all_child_devices(&self, parent: &Device) -> Result<()> {
        if !parent.root {
            return Ok(());
        }
        let child_ids = self.get_all_child_device_ids(parent);
        if child_ids.is_empty() {
            debug!(parent_device_id = %parent.id, "no child device");
        }
        let mut last_err = None;
        for child_id in child_ids {
            if let Ok(agent) = self.agent(&child_id).await {
                if let Err(e) = agent.disable().await {
                    warn!(device_id = %child_id, error = %e, "failure disabling child");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Delete every child of a parent being deleted, retiring their agents
    /// and abandoning their ownership entries.
    pub async fn delete_all_child_devices(&self, parent: &Device) -> Result<()> {
        if !parent.root {
            return Ok(());
        }
        let child_ids = self.get_all_child_device_ids(parent);
        if child_ids.is_empty() {
            debug!(parent_device_id = %parent.id, "no child device");
        }
        let mut last_err = None;
        for child_id in child_ids {
            if let Ok(agent) = self.agent(&child_id).await {
                match agent.delete().await {
                    Ok(()) => {
                        agent.stop().await;
                        self.remove_agent(&child_id).await;
                        if let Err(e) = self.ownership.abandon(&child_id).await {
                            debug!(device_id = %child_id, error = %e, "no ownership entry");
                        }
                    }
                    Err(e) => {
                        warn!(device_id = %child_id, error = %e, "failure deleting child");
                        last_err = Some(e);
                    }
                }
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // Transitions ----------------------------------------------------------

    /// Run the transition handlers for a state change. `NotAllowed`
    /// surfaces as `FailedPrecondition`; the first handler error aborts the
    /// chain.
    pub fn process_transition<'a>(
        &'a self,
        previous: &'a Device,
        current: &'a Device,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let Some(handlers) = self.transitions.lookup(previous, current) else {
                debug!(device_id = %current.id, "no-op transition");
                return Ok(());
            };
            for handler in handlers {
                debug!(device_id = %current.id, handler = %handler, "running transition handler");
                match handler {
                    TransitionHandler::CreateLogicalDevice => {
                        self.create_logical_device(current).await?
                    }
                    TransitionHandler::SetupUniLogicalPorts => {
                        self.setup_uni_logical_ports(current).await?
                    }
                    TransitionHandler::DeleteLogicalDevice => {
                        self.delete_logical_device(current).await?
                    }
                    TransitionHandler::DeleteLogicalPort => {
                        self.delete_logical_port(current).await?
                    }
                    TransitionHandler::DisableAllChildDevices => {
                        self.disable_all_child_devices(current).await?
                    }
                    TransitionHandler::DeleteAllChildDevices => {
                        self.delete_all_child_devices(current).await?
                    }
                    TransitionHandler::ActivateDevice
                    | TransitionHandler::DisableDevice
                    | TransitionHandler::ReEnableDevice
                    | TransitionHandler::Abandon
                    | TransitionHandler::NoOp => {
                        info!(device_id = %current.id, handler = %handler, "transition");
                    }
                    TransitionHandler::NotAllowed => {
                        return Err(Error::failed_precondition(format!(
                            "transition not allowed for device {}",
                            current.id
                        )));
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// An adapter came back; hydrate the KV-resident devices it serves so
    /// this replica can reconcile their state.
    pub async fn adapter_restarted(&self, adapter: &Adapter) -> Result<()> {
        info!(adapter_id = %adapter.id, "adapter restarted");
        let mut served = 0usize;
        let mut hydrated = 0usize;
        for (_, raw) in self.kv.list(paths::DEVICES).await? {
            let device: Device = match serde_json::from_slice(&raw) {
                Ok(device) => device,
                Err(e) => {
                    warn!(error = %e, "skipping undecodable device record");
                    continue;
                }
            };
            let routed = self
                .registry
                .get_adapter_name(&device.device_type)
                .await
                .map(|a| a == adapter.id)
                .unwrap_or(false);
            if !routed {
                continue;
            }
            served += 1;
            if !self.is_device_in_cache(&device.id).await {
                match self.load_device(&device.id).await {
                    Ok(_) => hydrated += 1,
                    Err(e) => {
                        warn!(device_id = %device.id, error = %e, "failure reloading device")
                    }
                }
            }
        }
        info!(adapter_id = %adapter.id, served, hydrated, "adapter restart reconcile complete");
        Ok(())
    }

    // Transition handler callbacks ----------------------------------------

    async fn create_logical_device(&self, device: &Device) -> Result<()> {
        if !device.root {
            return Ok(());
        }
        let logical_id = self.logical.create(device).await.map_err(|e| {
            warn!(device_id = %device.id, error = %e, "create logical device failed");
            e
        })?;
        // The root is realized: its parent becomes the logical device.
        self.update_device_attribute(&device.id, "parent_id", json!(logical_id))
            .await
    }

    async fn delete_logical_device(&self, device: &Device) -> Result<()> {
        if !device.root {
            return Ok(());
        }
        if device.parent_id.is_empty() {
            return Ok(());
        }
        self.logical.delete(device).await?;
        self.update_device_attribute(&device.id, "parent_id", json!(""))
            .await
    }

    async fn delete_logical_port(&self, device: &Device) -> Result<()> {
        if device.root {
            return Ok(());
        }
        let port_id = match self.logical.get_logical_port_id(device).await {
            Ok(port_id) => port_id,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => {
                warn!(device_id = %device.id, error = %e, "get logical port failed");
                return Err(e);
            }
        };
        self.logical.delete_logical_port(&port_id).await
    }

    async fn setup_uni_logical_ports(&self, device: &Device) -> Result<()> {
        if device.root {
            return Ok(());
        }
        self.logical.setup_uni_logical_ports(device).await
    }

    // Agent table ----------------------------------------------------------

    fn new_agent(&self, device: Device) -> DeviceAgent {
        DeviceAgent::new(
            device,
            Arc::clone(&self.adapter_proxy),
            Arc::clone(&self.registry),
            Arc::clone(&self.kv),
            self.self_ref.clone(),
        )
    }

    /// The agent for a device, hydrating it (and its family) when cold.
    async fn agent(&self, device_id: &str) -> Result<Arc<DeviceAgent>> {
        {
            let agents = self.agents.read().await;
            if let Some(agent) = agents.get(device_id) {
                return Ok(Arc::clone(agent));
            }
        }
        self.load(device_id).await?;
        let agents = self.agents.read().await;
        agents
            .get(device_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("device {device_id}")))
    }

    /// Hydrate one device, creating its agent exactly once.
    async fn load_device(&self, device_id: &str) -> Result<Arc<DeviceAgent>> {
        if device_id.is_empty() {
            return Err(Error::invalid_argument("empty device id"));
        }
        {
            let agents = self.agents.read().await;
            if let Some(agent) = agents.get(device_id) {
                return Ok(Arc::clone(agent));
            }
        }
        let _guard = self.hydration_lock.lock().await;
        {
            let agents = self.agents.read().await;
            if let Some(agent) = agents.get(device_id) {
                return Ok(Arc::clone(agent));
            }
        }
        debug!(device_id, "loading device");
        let agent = Arc::new(self.new_agent(Device::new(device_id.to_string(), "")));
        if let Err(e) = agent.start(true).await {
            agent.stop().await;
            return Err(e);
        }
        // Deleted records are tombstones; they never come back to life.
        if agent.get_device().await.admin_state == AdminState::Deleted {
            return Err(Error::not_found(format!("device {device_id}")));
        }
        Ok(self.insert_agent_if_absent(agent).await)
    }

    async fn insert_new_agent(&self, agent: Arc<DeviceAgent>) -> Result<()> {
        let mut agents = self.agents.write().await;
        if agents.contains_key(agent.device_id()) {
            return Err(Error::already_exists(format!(
                "device {}",
                agent.device_id()
            )));
        }
        agents.insert(agent.device_id().to_string(), agent);
        Ok(())
    }

    async fn insert_agent_if_absent(&self, agent: Arc<DeviceAgent>) -> Arc<DeviceAgent> {
        let mut agents = self.agents.write().await;
        Arc::clone(
            agents
                .entry(agent.device_id().to_string())
                .or_insert(agent),
        )
    }

    async fn remove_agent(&self, device_id: &str) {
        let mut agents = self.agents.write().await;
        agents.remove(device_id);
    }
}
