/// Collaborator-facing API
///
/// `MasterHandle` is a cloneable async front for a master engine running in
/// its own task; front ends (CLI, dashboards, RPC bridges) talk to the bus
/// only through it.
pub mod traits;
pub mod utils;

use flume::{Receiver, Sender};
use tokio::task::JoinHandle;

use crate::{
    core::{
        bus::{MasterEvent, MasterRequest},
        device::{Device, DeviceObject},
        master::{Master, MasterState},
        task_manager::spawn_master,
    },
    protocol::{address::DeviceAddress, error::HbusError, transport::Transport},
};

pub use traits::{EventHandler, LoggingHandler, Plugin, Signer};

#[derive(Debug, Clone)]
pub struct MasterHandle {
    requests: Sender<MasterRequest>,
}

impl MasterHandle {
    /// Wrap an existing request channel (the engine side owns the receiver).
    pub fn new(requests: Sender<MasterRequest>) -> Self {
        Self { requests }
    }

    /// Start `master` on the current tokio runtime.
    pub fn spawn<T: Transport + 'static>(
        master: Master<T>,
    ) -> (Self, JoinHandle<anyhow::Result<()>>) {
        let (tx, rx) = flume::unbounded();
        let task = spawn_master(master, rx);
        (Self::new(tx), task)
    }

    async fn call<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> MasterRequest,
    ) -> Result<R, HbusError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send_async(make(tx))
            .await
            .map_err(|_| HbusError::EngineStopped)?;
        rx.await.map_err(|_| HbusError::EngineStopped)
    }

    /// Subscribe to lifecycle events.
    pub async fn subscribe(&self) -> Result<Receiver<MasterEvent>, HbusError> {
        let (tx, rx) = flume::unbounded();
        self.requests
            .send_async(MasterRequest::Subscribe(tx))
            .await
            .map_err(|_| HbusError::EngineStopped)?;
        Ok(rx)
    }

    /// Request a discovery round; false when the master is busy with one.
    pub async fn discover(&self) -> Result<bool, HbusError> {
        self.call(MasterRequest::Discover).await
    }

    pub async fn devices(&self) -> Result<Vec<Device>, HbusError> {
        self.call(MasterRequest::ListDevices).await
    }

    pub async fn device(&self, address: DeviceAddress) -> Result<Option<Device>, HbusError> {
        self.call(|respond| MasterRequest::DeviceInfo { address, respond })
            .await
    }

    pub async fn object(
        &self,
        address: DeviceAddress,
        object: u8,
    ) -> Result<Option<DeviceObject>, HbusError> {
        self.call(|respond| MasterRequest::ObjectInfo {
            address,
            object,
            respond,
        })
        .await
    }

    pub async fn state(&self) -> Result<MasterState, HbusError> {
        self.call(MasterRequest::MasterState).await
    }

    pub async fn read_object(&self, address: DeviceAddress, object: u8) -> Result<Vec<u8>, HbusError> {
        self.call(|respond| MasterRequest::ReadObject {
            address,
            object,
            respond,
        })
        .await?
    }

    /// Read an object and render it with its formatter.
    pub async fn read_formatted(&self, address: DeviceAddress, object: u8) -> Result<String, HbusError> {
        let raw = self.read_object(address, object).await?;
        let info = self
            .object(address, object)
            .await?
            .ok_or(HbusError::UnknownObject { address, object })?;
        Ok(info.format(&raw))
    }

    pub async fn write_object(
        &self,
        address: DeviceAddress,
        object: u8,
        value: Vec<u8>,
    ) -> Result<(), HbusError> {
        self.call(|respond| MasterRequest::WriteObject {
            address,
            object,
            value,
            respond,
        })
        .await?
    }

    /// Decode `text` with the object's formatter and write the result.
    pub async fn write_formatted(
        &self,
        address: DeviceAddress,
        object: u8,
        text: &str,
    ) -> Result<(), HbusError> {
        let info = self
            .object(address, object)
            .await?
            .ok_or(HbusError::UnknownObject { address, object })?;
        let value = info.decode(text)?;
        self.write_object(address, object, value).await
    }

    pub async fn ping(&self, address: DeviceAddress) -> Result<bool, HbusError> {
        self.call(|respond| MasterRequest::Ping { address, respond })
            .await?
    }

    pub async fn soft_reset(&self, address: DeviceAddress) -> Result<(), HbusError> {
        self.call(|respond| MasterRequest::SoftReset { address, respond })
            .await?
    }

    /// Ask the engine task to stop.
    pub fn shutdown(&self) -> Result<(), HbusError> {
        self.requests
            .send(MasterRequest::Shutdown)
            .map_err(|_| HbusError::EngineStopped)
    }
}
