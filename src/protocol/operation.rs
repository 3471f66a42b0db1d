use std::fmt;

use super::{address::DeviceAddress, command::Command, error::HbusError};

/// Last byte of every frame.
pub const FRAME_TERMINATOR: u8 = 0xFF;

/// A command together with its ordered parameter bytes.
///
/// For commands that carry an object address, `params[0]` is that address and
/// the remaining bytes are the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    command: Command,
    params: Vec<u8>,
}

impl Instruction {
    /// Build an instruction; fails when the parameter count is outside
    /// `[min - 1, max]` for the command.
    pub fn new(command: Command, params: impl Into<Vec<u8>>) -> Result<Self, HbusError> {
        let params = params.into();
        let spec = command.spec();
        let min = spec.min_params.saturating_sub(1);
        if params.len() < min || params.len() > spec.max_params {
            return Err(HbusError::InstructionLength {
                command: command.name(),
                min,
                max: spec.max_params,
                actual: params.len(),
            });
        }
        Ok(Self { command, params })
    }

    /// Instruction without parameters (SEARCH, ACK, BUSLOCK, ...).
    pub fn bare(command: Command) -> Result<Self, HbusError> {
        Self::new(command, Vec::new())
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn params(&self) -> &[u8] {
        &self.params
    }

    pub fn into_params(self) -> Vec<u8> {
        self.params
    }

    /// Object/endpoint/interrupt number for commands that carry one.
    pub fn object(&self) -> Option<u8> {
        if self.command.has_address() {
            self.params.first().copied()
        } else {
            None
        }
    }

    /// Parameter bytes following the object address.
    pub fn payload(&self) -> &[u8] {
        if self.command.has_address() && !self.params.is_empty() {
            &self.params[1..]
        } else {
            &self.params
        }
    }
}

/// An instruction travelling from `source` to `destination`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub source: DeviceAddress,
    pub destination: DeviceAddress,
    pub instruction: Instruction,
}

impl Operation {
    pub fn new(source: DeviceAddress, destination: DeviceAddress, instruction: Instruction) -> Self {
        Self {
            source,
            destination,
            instruction,
        }
    }

    pub fn command(&self) -> Command {
        self.instruction.command()
    }

    pub fn params(&self) -> &[u8] {
        self.instruction.params()
    }

    /// Wire form: `src(2) dst(2) cmd [ADDR] [PSZ params] 0xFF`.
    pub fn encode(&self) -> Vec<u8> {
        let command = self.command();
        let params = self.params();
        let mut frame = Vec::with_capacity(7 + params.len());
        frame.extend_from_slice(&[
            self.source.bus,
            self.source.dev,
            self.destination.bus,
            self.destination.dev,
            command.id(),
        ]);

        if command.is_zero_length() {
            // no parameter section at all
        } else if command.has_address() {
            frame.push(params.first().copied().unwrap_or(0));
            if !command.is_address_only() {
                let payload = params.get(1..).unwrap_or(&[]);
                frame.push(payload.len() as u8);
                frame.extend_from_slice(payload);
            }
        } else {
            frame.push(params.len() as u8);
            frame.extend_from_slice(params);
        }

        frame.push(FRAME_TERMINATOR);
        frame
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} {}",
            self.source,
            self.destination,
            self.command()
        )?;
        if !self.params().is_empty() {
            write!(f, " [{}]", hex_string(self.params()))?;
        }
        Ok(())
    }
}

/// Space separated lowercase hex dump used in traffic logs.
pub fn hex_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}
