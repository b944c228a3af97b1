//! Adapter registry.
//!
//! Tracks the adapters present in the cluster and routes device types to
//! the adapter serving them. Both tables are KV-backed and rebuilt at
//! start; sentinel rows materialize the KV prefixes when nothing real has
//! registered yet and are filtered from every outward enumeration.
//!
//! Lock order: callers that take both tables take the adapter table first,
//! then the device-type table.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use fibron_core::adapter::{
    Adapter, DeviceType, SENTINEL_ADAPTER_ID, SENTINEL_DEVICE_TYPE_ID,
};
use fibron_core::bus::MessageBus;
use fibron_core::error::{Error, Result};
use fibron_core::kv::{KvStore, paths};

use crate::manager::DeviceManager;

/// In-memory record of one adapter and the device types it serves.
pub struct AdapterAgent {
    adapter: RwLock<Adapter>,
    device_types: RwLock<HashMap<String, DeviceType>>,
}

impl AdapterAgent {
    fn new(adapter: Adapter, device_types: Vec<DeviceType>) -> Self {
        let device_types = device_types
            .into_iter()
            .map(|dt| (dt.id.clone(), dt))
            .collect();
        Self {
            adapter: RwLock::new(adapter),
            device_types: RwLock::new(device_types),
        }
    }

    async fn adapter(&self) -> Adapter {
        self.adapter.read().await.clone()
    }

    async fn device_type(&self, id: &str) -> Option<DeviceType> {
        self.device_types.read().await.get(id).cloned()
    }

    async fn update_device_type(&self, device_type: DeviceType) {
        let mut device_types = self.device_types.write().await;
        device_types.insert(device_type.id.clone(), device_type);
    }

    /// Move `last_communication` forward. Only past-or-present timestamps
    /// are accepted, and only when strictly after the stored value (or the
    /// stored value is absent).
    async fn update_communication_time(&self, at: DateTime<Utc>) {
        if at > Utc::now() {
            return;
        }
        let mut adapter = self.adapter.write().await;
        match adapter.last_communication {
            Some(last) if at <= last => {}
            _ => adapter.last_communication = Some(at),
        }
    }
}

/// Adapter presence and device-type routing for one core replica.
pub struct AdapterRegistry {
    core_instance_id: String,
    kv: Arc<dyn KvStore>,
    agents: RwLock<HashMap<String, Arc<AdapterAgent>>>,
    device_type_to_adapter: RwLock<HashMap<String, String>>,
    device_manager: RwLock<Weak<DeviceManager>>,
}

impl AdapterRegistry {
    pub fn new(core_instance_id: impl Into<String>, kv: Arc<dyn KvStore>) -> Arc<Self> {
        Arc::new(Self {
            core_instance_id: core_instance_id.into(),
            kv,
            agents: RwLock::new(HashMap::new()),
            device_type_to_adapter: RwLock::new(HashMap::new()),
            device_manager: RwLock::new(Weak::new()),
        })
    }

    /// Wire in the device manager (after construction, to break the
    /// construction cycle). Required for the adapter-restart reconcile
    /// path.
    pub async fn set_device_manager(&self, manager: &Arc<DeviceManager>) {
        *self.device_manager.write().await = Arc::downgrade(manager);
    }

    /// Rebuild the in-memory tables from the KV store and start consuming
    /// adapter liveness metadata from the bus.
    pub async fn start(self: &Arc<Self>, bus: &dyn MessageBus) -> Result<()> {
        info!("starting adapter registry");
        self.load_from_kv().await?;
        let mut rx = bus.subscribe_metadata();
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(signal) => {
                        registry
                            .update_last_communication(&signal.adapter_id, signal.timestamp_ms)
                            .await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "liveness subscriber lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        info!("adapter registry started");
        Ok(())
    }

    /// Load adapters and device types from the KV store, writing a
    /// sentinel row whenever a prefix is empty so later listings see a
    /// well-formed path.
    pub async fn load_from_kv(&self) -> Result<()> {
        let adapter_records = self.kv.list(paths::ADAPTERS).await?;
        if adapter_records.is_empty() {
            debug!("no existing adapter found");
            self.add_adapter(Adapter::new(SENTINEL_ADAPTER_ID), true)
                .await?;
        } else {
            for (key, raw) in adapter_records {
                match serde_json::from_slice::<Adapter>(&raw) {
                    Ok(adapter) => self.add_adapter(adapter, false).await?,
                    Err(e) => warn!(key = %key, error = %e, "skipping undecodable adapter record"),
                }
            }
        }

        let type_records = self.kv.list(paths::DEVICE_TYPES).await?;
        if type_records.is_empty() {
            debug!("no existing device type found");
            self.add_device_types(
                vec![DeviceType::new(SENTINEL_DEVICE_TYPE_ID, SENTINEL_ADAPTER_ID)],
                true,
            )
            .await?;
        } else {
            let mut device_types = Vec::new();
            for (key, raw) in type_records {
                match serde_json::from_slice::<DeviceType>(&raw) {
                    Ok(dt) => device_types.push(dt),
                    Err(e) => warn!(key = %key, error = %e, "skipping undecodable device type record"),
                }
            }
            self.add_device_types(device_types, false).await?;
        }
        Ok(())
    }

    /// Register an adapter together with the device types it serves.
    ///
    /// A second registration of the same adapter id is treated as a
    /// restart: the reconcile path is kicked off asynchronously and the
    /// current core instance id is returned.
    pub async fn register_adapter(
        &self,
        adapter: Adapter,
        device_types: Vec<DeviceType>,
    ) -> Result<String> {
        debug!(adapter_id = %adapter.id, types = device_types.len(), "register adapter");
        if self.has_adapter(&adapter.id).await {
            let manager = self.device_manager.read().await.upgrade();
            match manager {
                Some(manager) => {
                    tokio::spawn(async move {
                        if let Err(e) = manager.adapter_restarted(&adapter).await {
                            warn!(adapter_id = %adapter.id, error = %e, "unable to reconcile restarted adapter");
                        }
                    });
                }
                None => warn!(adapter_id = %adapter.id, "no device manager for restart reconcile"),
            }
            return Ok(self.core_instance_id.clone());
        }
        self.add_adapter(adapter, true).await?;
        self.add_device_types(device_types, true).await?;
        Ok(self.core_instance_id.clone())
    }

    async fn has_adapter(&self, adapter_id: &str) -> bool {
        self.agents.read().await.contains_key(adapter_id)
    }

    async fn add_adapter(&self, adapter: Adapter, save_to_kv: bool) -> Result<()> {
        let mut agents = self.agents.write().await;
        if agents.contains_key(&adapter.id) {
            return Ok(());
        }
        if save_to_kv {
            // Idempotent save: only write when the record is absent.
            if self.kv.get(&paths::adapter(&adapter.id)).await?.is_none() {
                let raw = serde_json::to_vec(&adapter)?;
                self.kv
                    .put_if_absent(paths::ADAPTERS, &adapter.id, raw)
                    .await?;
                debug!(adapter_id = %adapter.id, "adapter saved to kv store");
            }
        }
        agents.insert(
            adapter.id.clone(),
            Arc::new(AdapterAgent::new(adapter, Vec::new())),
        );
        Ok(())
    }

    async fn add_device_types(
        &self,
        device_types: Vec<DeviceType>,
        save_to_kv: bool,
    ) -> Result<()> {
        if device_types.is_empty() {
            return Ok(());
        }
        // Fixed lock order: adapter table, then device-type table.
        let mut agents = self.agents.write().await;
        let mut routing = self.device_type_to_adapter.write().await;

        if save_to_kv {
            for device_type in &device_types {
                if self
                    .kv
                    .get(&paths::device_type(&device_type.id))
                    .await?
                    .is_none()
                {
                    let raw = serde_json::to_vec(device_type)?;
                    self.kv
                        .put_if_absent(paths::DEVICE_TYPES, &device_type.id, raw)
                        .await?;
                    debug!(device_type = %device_type.id, "device type saved to kv store");
                }
            }
        }
        for device_type in device_types {
            match agents.get(&device_type.adapter_id) {
                Some(agent) => agent.update_device_type(device_type.clone()).await,
                None => {
                    debug!(
                        adapter_id = %device_type.adapter_id,
                        device_type = %device_type.id,
                        "device type registered before its adapter"
                    );
                    agents.insert(
                        device_type.adapter_id.clone(),
                        Arc::new(AdapterAgent::new(
                            Adapter::new(device_type.adapter_id.clone()),
                            vec![device_type.clone()],
                        )),
                    );
                }
            }
            routing.insert(device_type.id.clone(), device_type.adapter_id);
        }
        Ok(())
    }

    /// One adapter by id; the sentinel is not reported.
    pub async fn get_adapter(&self, adapter_id: &str) -> Option<Adapter> {
        if adapter_id == SENTINEL_ADAPTER_ID {
            return None;
        }
        let agent = self.agents.read().await.get(adapter_id).cloned()?;
        Some(agent.adapter().await)
    }

    /// All registered adapters, sentinel filtered, cloned so callers
    /// cannot mutate shared state.
    pub async fn list_adapters(&self) -> Vec<Adapter> {
        let agents: Vec<Arc<AdapterAgent>> =
            self.agents.read().await.values().cloned().collect();
        let mut adapters = Vec::with_capacity(agents.len());
        for agent in agents {
            let adapter = agent.adapter().await;
            if !adapter.is_sentinel() {
                adapters.push(adapter);
            }
        }
        adapters
    }

    /// Id of the adapter serving a device type.
    pub async fn get_adapter_name(&self, device_type: &str) -> Result<String> {
        let routing = self.device_type_to_adapter.read().await;
        match routing.get(device_type) {
            Some(adapter_id) if adapter_id != SENTINEL_ADAPTER_ID => Ok(adapter_id.clone()),
            _ => Err(Error::not_found(format!(
                "no adapter registered for device type {device_type}"
            ))),
        }
    }

    pub async fn get_device_type(&self, device_type: &str) -> Option<DeviceType> {
        if device_type == SENTINEL_DEVICE_TYPE_ID {
            return None;
        }
        let adapter_id = {
            let routing = self.device_type_to_adapter.read().await;
            routing.get(device_type).cloned()?
        };
        let agent = self.agents.read().await.get(&adapter_id).cloned()?;
        agent.device_type(device_type).await
    }

    pub async fn list_device_types(&self) -> Vec<DeviceType> {
        let routing: Vec<(String, String)> = {
            let routing = self.device_type_to_adapter.read().await;
            routing
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        let mut device_types = Vec::new();
        for (type_id, adapter_id) in routing {
            if type_id == SENTINEL_DEVICE_TYPE_ID {
                continue;
            }
            let agent = self.agents.read().await.get(&adapter_id).cloned();
            if let Some(agent) = agent
                && let Some(device_type) = agent.device_type(&type_id).await
            {
                device_types.push(device_type);
            }
        }
        device_types
    }

    /// Bus callback: an adapter was heard from at `timestamp_ms` (epoch
    /// milliseconds).
    pub async fn update_last_communication(&self, adapter_id: &str, timestamp_ms: i64) {
        let agent = self.agents.read().await.get(adapter_id).cloned();
        let Some(agent) = agent else {
            debug!(adapter_id, "liveness signal for unknown adapter");
            return;
        };
        let Some(at) = Utc.timestamp_millis_opt(timestamp_ms).single() else {
            warn!(adapter_id, timestamp_ms, "unrepresentable liveness timestamp");
            return;
        };
        agent.update_communication_time(at).await;
    }
}
