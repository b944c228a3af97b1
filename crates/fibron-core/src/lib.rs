//! Shared model and collaborator interfaces for the Fibron core.
//!
//! This crate carries everything the coordination engine and its callers
//! agree on: the device and adapter data model, the unified error type,
//! replica configuration, and the interfaces of the external collaborators
//! (KV store and message bus) together with in-process implementations for
//! tests and single-node runs.

pub mod adapter;
pub mod bus;
pub mod config;
pub mod device;
pub mod error;
pub mod kv;

pub use adapter::{Adapter, DeviceType, SENTINEL_ADAPTER_ID, SENTINEL_DEVICE_TYPE_ID};
pub use bus::{AdapterLiveness, DeviceDiscovered, InProcBus, MessageBus};
pub use config::CoreConfig;
pub use device::{
    AdminState, ConnectStatus, Device, Flow, FlowGroup, ImageActivationState, ImageDownload,
    ImageDownloadState, OperStatus, PeerPort, PmConfigs, Port, PortCapability, PortType,
    ProxyAddress, SwitchCapability,
};
pub use error::{Error, Result};
pub use kv::{KvStore, MemKvStore, Reservation};
