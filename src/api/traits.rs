/// Collaborator traits - the shapes external components plug into the master
/// with.
///
/// None of these depend on a particular channel or front end; the CLI wires
/// `LoggingHandler` to the event stream.
use anyhow::Result;

use crate::{
    core::{bus::MasterEvent, device::Device},
    protocol::{address::DeviceAddress, error::HbusError},
};

/// Opaque signature capability used for authenticated enrollment, crypto
/// object writes and soft reset.
pub trait Signer: Send + Sync {
    /// Key sent to AUTHSUP devices with KEYSET.
    fn public_key(&self) -> Vec<u8>;

    fn sign(&self, message: &[u8]) -> Vec<u8>;

    fn verify(&self, message: &[u8], signature: &[u8]) -> bool;

    /// Length of the signatures produced by `sign`.
    fn signature_len(&self) -> usize;
}

/// Provider of synthetic devices on bus 254.
///
/// Reads and writes addressed to a plugin's devices are answered by the
/// plugin and never reach the wire.
pub trait Plugin: Send {
    fn name(&self) -> &str;

    /// Devices this plugin owns. Addresses must be on the virtual bus.
    fn devices(&self) -> Vec<Device>;

    fn read_object(&mut self, address: DeviceAddress, object: u8) -> Result<Vec<u8>, HbusError>;

    fn write_object(
        &mut self,
        address: DeviceAddress,
        object: u8,
        value: &[u8],
    ) -> Result<(), HbusError>;

    /// Called for every lifecycle event.
    fn on_event(&mut self, _event: &MasterEvent) {}
}

/// Consumer of the master's event stream.
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &MasterEvent) -> Result<()>;

    /// Return false to stop forwarding.
    fn should_continue(&self) -> bool {
        true
    }
}

/// Handler that logs every event
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle_event(&self, event: &MasterEvent) -> Result<()> {
        log::info!(
            "[{}] {:?}",
            event.timestamp.format("%H:%M:%S%.3f"),
            event.kind
        );
        Ok(())
    }
}

/// Drive `handler` with events until the stream closes or the handler asks
/// to stop.
pub async fn forward_events(
    events: flume::Receiver<MasterEvent>,
    handler: impl EventHandler,
) -> Result<()> {
    while handler.should_continue() {
        match events.recv_async().await {
            Ok(event) => handler.handle_event(&event)?,
            Err(_) => break,
        }
    }
    Ok(())
}
