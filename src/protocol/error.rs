use derive_more::{Display, Error};

use super::address::DeviceAddress;

/// Errors raised by the HBUS protocol engine and its collaborator surface.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum HbusError {
    #[display("malformed frame: {reason}")]
    MalformedFrame { reason: String },

    #[display("unknown command id 0x{id:02X}")]
    UnknownCommand { id: u8 },

    #[display("{command} takes {min}..={max} parameters, got {actual}")]
    InstructionLength {
        command: &'static str,
        min: usize,
        max: usize,
        actual: usize,
    },

    #[display("no {expected} from {source_address} before deadline")]
    ResponseTimeout {
        expected: &'static str,
        source_address: DeviceAddress,
    },

    #[display("device {address} stopped answering")]
    DeviceUnresponsive { address: DeviceAddress },

    #[display("object {object} of {address} is write only")]
    WriteOnly { address: DeviceAddress, object: u8 },

    #[display("object {object} of {address} is read only")]
    ReadOnly { address: DeviceAddress, object: u8 },

    #[display("illegal address ({bus}:{dev})")]
    InvalidAddress { bus: u8, dev: u8 },

    #[display("no device at {address}")]
    UnknownDevice { address: DeviceAddress },

    #[display("device {address} has no object {object}")]
    UnknownObject { address: DeviceAddress, object: u8 },

    #[display("cannot convert value: {reason}")]
    ValueFormat { reason: String },

    #[display("signature check failed for {address}")]
    AuthenticationFailed { address: DeviceAddress },

    #[display("transport error: {message}")]
    Transport { message: String },

    #[display("master engine is not running")]
    EngineStopped,

    #[display("unreachable state: {context}")]
    Unreachable { context: String },
}

impl HbusError {
    pub fn value_format(reason: impl Into<String>) -> Self {
        HbusError::ValueFormat {
            reason: reason.into(),
        }
    }
}

impl From<anyhow::Error> for HbusError {
    fn from(err: anyhow::Error) -> Self {
        HbusError::Transport {
            message: format!("{err:#}"),
        }
    }
}
