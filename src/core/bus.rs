use chrono::{DateTime, Local};
use flume::Sender;
use serde::Serialize;

use crate::{
    core::{
        device::{Device, DeviceObject},
        master::MasterState,
    },
    protocol::{address::DeviceAddress, error::HbusError},
};

/// One-shot reply slot carried by requests that produce a result.
pub type Responder<T> = oneshot::Sender<Result<T, HbusError>>;

/// Lifecycle notifications emitted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MasterEvent {
    pub timestamp: DateTime<Local>,
    pub kind: EventKind,
}

impl MasterEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            timestamp: Local::now(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    Started,
    /// Discovery, verification and enumeration finished.
    Operational,
    /// A device raised INT; the payload is passed through untouched.
    Interruption {
        address: DeviceAddress,
        params: Vec<u8>,
    },
    DeviceKicked { address: DeviceAddress, uid: u32 },
    DeviceAdded { address: DeviceAddress, uid: u32 },
}

/// Requests sent from front ends to the engine task.
pub enum MasterRequest {
    /// Start a discovery round if the master is idle or operational.
    Discover(oneshot::Sender<bool>),
    ListDevices(oneshot::Sender<Vec<Device>>),
    DeviceInfo {
        address: DeviceAddress,
        respond: oneshot::Sender<Option<Device>>,
    },
    ObjectInfo {
        address: DeviceAddress,
        object: u8,
        respond: oneshot::Sender<Option<DeviceObject>>,
    },
    ReadObject {
        address: DeviceAddress,
        object: u8,
        respond: Responder<Vec<u8>>,
    },
    WriteObject {
        address: DeviceAddress,
        object: u8,
        value: Vec<u8>,
        respond: Responder<()>,
    },
    Ping {
        address: DeviceAddress,
        respond: Responder<bool>,
    },
    SoftReset {
        address: DeviceAddress,
        respond: Responder<()>,
    },
    MasterState(oneshot::Sender<MasterState>),
    Subscribe(Sender<MasterEvent>),
    Shutdown,
}

impl MasterRequest {
    pub fn name(&self) -> &'static str {
        match self {
            MasterRequest::Discover(_) => "discover",
            MasterRequest::ListDevices(_) => "list_devices",
            MasterRequest::DeviceInfo { .. } => "device_info",
            MasterRequest::ObjectInfo { .. } => "object_info",
            MasterRequest::ReadObject { .. } => "read_object",
            MasterRequest::WriteObject { .. } => "write_object",
            MasterRequest::Ping { .. } => "ping",
            MasterRequest::SoftReset { .. } => "soft_reset",
            MasterRequest::MasterState(_) => "master_state",
            MasterRequest::Subscribe(_) => "subscribe",
            MasterRequest::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Debug for MasterRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
