//! Device data model.
//!
//! A device is either a root (OLT-like, owning a logical-device
//! representation) or a child (ONU-like) reached through a root's port peer
//! list. Records are persisted as JSON under `devices/<id>`.

use serde::{Deserialize, Serialize};

/// Operator-intended lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdminState {
    #[default]
    Unknown,
    /// Provisioned in the controller but not yet activated.
    Preprovisioned,
    Enabled,
    Disabled,
    DownloadingImage,
    /// Terminal; no further transitions or adapter calls.
    Deleted,
}

/// Observed operational state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperStatus {
    #[default]
    Unknown,
    Discovered,
    Activating,
    Testing,
    Active,
    Failed,
}

/// Connectivity between the adapter and the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectStatus {
    #[default]
    Unknown,
    Unreachable,
    Reachable,
}

/// Port role on a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PortType {
    #[default]
    Unknown,
    EthernetNni,
    EthernetUni,
    Pon,
    VenetOlt,
    VenetOnu,
}

/// Back-reference to a peer (device, port) pair; these edges define the
/// parent/child graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerPort {
    pub device_id: String,
    pub port_no: u32,
}

/// A physical or virtual port on a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub port_no: u32,
    #[serde(default)]
    pub label: String,
    pub port_type: PortType,
    #[serde(default)]
    pub oper_status: OperStatus,
    #[serde(default)]
    pub peers: Vec<PeerPort>,
}

impl Port {
    pub fn new(port_no: u32, port_type: PortType) -> Self {
        Self {
            port_no,
            label: String::new(),
            port_type,
            oper_status: OperStatus::Unknown,
            peers: Vec::new(),
        }
    }

    pub fn with_peer(mut self, device_id: impl Into<String>, port_no: u32) -> Self {
        self.peers.push(PeerPort {
            device_id: device_id.into(),
            port_no,
        });
        self
    }
}

/// Address of a child device through its parent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyAddress {
    /// Parent device id.
    pub device_id: String,
    /// Parent device type.
    pub device_type: String,
    pub channel_id: u32,
    pub onu_id: u32,
}

/// A single flow entry pushed down to a device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub id: u64,
    pub table_id: u32,
    pub priority: u32,
    /// Match and action fields, opaque to this core.
    #[serde(default)]
    pub spec: serde_json::Value,
}

/// A flow group entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowGroup {
    pub group_id: u32,
    #[serde(default)]
    pub spec: serde_json::Value,
}

/// Performance-monitoring configuration for a device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PmConfigs {
    pub default_freq: u32,
    pub grouped: bool,
    pub freq_override: bool,
}

/// State of a software image download.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageDownloadState {
    #[default]
    Unknown,
    Requested,
    Started,
    Succeeded,
    Failed,
    Cancelled,
}

/// Activation state of a downloaded image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageActivationState {
    #[default]
    NotActivated,
    Activating,
    Active,
    Reverting,
}

/// A software image download record kept on the device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageDownload {
    /// Device the image belongs to.
    pub device_id: String,
    /// Image name; unique per device.
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub image_version: String,
    #[serde(default)]
    pub download_state: ImageDownloadState,
    #[serde(default)]
    pub image_state: ImageActivationState,
    #[serde(default)]
    pub reason: String,
}

/// Switch-level capability reported by the adapter for a root device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwitchCapability {
    pub desc: String,
    pub n_buffers: u32,
    pub n_tables: u32,
    pub capabilities: u32,
}

/// Per-port capability reported by the adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortCapability {
    pub port_no: u32,
    pub label: String,
    pub max_speed: u32,
}

/// The central entity managed by the core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub device_type: String,
    /// Root devices own a logical-device representation and parent the
    /// child devices reachable through their port peers.
    pub root: bool,
    /// Empty for an unrealized root; the logical-device id once a root has
    /// been realized; the root's id for a child.
    #[serde(default)]
    pub parent_id: String,
    #[serde(default)]
    pub parent_port_no: u32,
    #[serde(default)]
    pub vendor_id: String,
    #[serde(default)]
    pub serial_number: String,
    #[serde(default)]
    pub admin_state: AdminState,
    #[serde(default)]
    pub oper_status: OperStatus,
    #[serde(default)]
    pub connect_status: ConnectStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_address: Option<ProxyAddress>,
    #[serde(default)]
    pub ports: Vec<Port>,
    #[serde(default)]
    pub flows: Vec<Flow>,
    #[serde(default)]
    pub groups: Vec<FlowGroup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pm_configs: Option<PmConfigs>,
    #[serde(default)]
    pub image_downloads: Vec<ImageDownload>,
}

impl Device {
    pub fn new(id: impl Into<String>, device_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            device_type: device_type.into(),
            admin_state: AdminState::Preprovisioned,
            ..Default::default()
        }
    }

    /// Whether the admin state tuple changed between two snapshots.
    pub fn same_state(&self, other: &Device) -> bool {
        self.admin_state == other.admin_state
            && self.oper_status == other.oper_status
            && self.connect_status == other.connect_status
    }

    /// The port with the given number, if present.
    pub fn port(&self, port_no: u32) -> Option<&Port> {
        self.ports.iter().find(|p| p.port_no == port_no)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_roundtrip() {
        let mut device = Device::new("olt-1", "ponsim_olt");
        device.root = true;
        device.ports.push(
            Port::new(1, PortType::Pon).with_peer("onu-1", 1),
        );
        let json = serde_json::to_string(&device).unwrap();
        let parsed: Device = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, device);
        assert_eq!(parsed.port(1).unwrap().peers[0].device_id, "onu-1");
    }

    #[test]
    fn test_same_state() {
        let a = Device::new("d", "t");
        let mut b = a.clone();
        assert!(a.same_state(&b));
        b.admin_state = AdminState::Enabled;
        assert!(!a.same_state(&b));
    }
}
