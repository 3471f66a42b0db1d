use num_enum::{IntoPrimitive, TryFromPrimitive};
use strum::{EnumIter, IntoStaticStr};

use super::error::HbusError;

/// Parameter count above which `paramSize` is clamped on receive.
pub const MAX_PARAM_SIZE: usize = 64;

/// HBUS command identifiers.
#[repr(u8)]
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    IntoStaticStr,
    IntoPrimitive,
    TryFromPrimitive,
)]
pub enum Command {
    #[strum(serialize = "SETCH")]
    SetCh = 0x01,
    #[strum(serialize = "SEARCH")]
    Search = 0x03,
    #[strum(serialize = "GETCH")]
    GetCh = 0x04,
    #[strum(serialize = "ACK")]
    Ack = 0x06,
    #[strum(serialize = "QUERY")]
    Query = 0x07,
    #[strum(serialize = "QUERY_RESP")]
    QueryResp = 0x08,
    #[strum(serialize = "RESPONSE")]
    Response = 0x10,
    #[strum(serialize = "ERROR")]
    ErrorResp = 0x11,
    #[strum(serialize = "BUSLOCK")]
    BusLock = 0x12,
    #[strum(serialize = "BUSUNLOCK")]
    BusUnlock = 0x13,
    #[strum(serialize = "SOFTRESET")]
    SoftReset = 0x14,
    #[strum(serialize = "QUERY_EP")]
    QueryEp = 0x15,
    #[strum(serialize = "QUERY_INT")]
    QueryInt = 0x16,
    #[strum(serialize = "STREAMW")]
    StreamW = 0x17,
    #[strum(serialize = "STREAMR")]
    StreamR = 0x18,
    #[strum(serialize = "INT")]
    Int = 0x19,
    #[strum(serialize = "KEYSET")]
    KeySet = 0xA0,
    #[strum(serialize = "KEYRESET")]
    KeyReset = 0xA1,
}

/// Static catalog entry for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub command: Command,
    pub min_params: usize,
    pub max_params: usize,
}

/// The command table. Parameter counts include the object address byte for
/// commands that carry one. An instruction may hold one parameter fewer than
/// `min_params`, so every addressed command has `min_params >= 2`.
pub const CATALOG: [CommandSpec; 18] = [
    spec(Command::SetCh, 2, 1 + MAX_PARAM_SIZE),
    spec(Command::Search, 0, 0),
    spec(Command::GetCh, 2, 1),
    spec(Command::Ack, 0, 0),
    spec(Command::Query, 2, 1),
    spec(Command::QueryResp, 2, 1 + MAX_PARAM_SIZE),
    spec(Command::Response, 2, 1 + MAX_PARAM_SIZE),
    spec(Command::ErrorResp, 2, 2),
    spec(Command::BusLock, 0, 0),
    spec(Command::BusUnlock, 0, 0),
    spec(Command::SoftReset, 0, MAX_PARAM_SIZE),
    spec(Command::QueryEp, 2, 1),
    spec(Command::QueryInt, 2, 1),
    spec(Command::StreamW, 2, 1 + 255),
    spec(Command::StreamR, 2, 1 + 255),
    spec(Command::Int, 2, 1 + MAX_PARAM_SIZE),
    spec(Command::KeySet, 2, 1 + MAX_PARAM_SIZE),
    spec(Command::KeyReset, 2, 1),
];

const fn spec(command: Command, min_params: usize, max_params: usize) -> CommandSpec {
    CommandSpec {
        command,
        min_params,
        max_params,
    }
}

impl Command {
    pub fn from_id(id: u8) -> Result<Self, HbusError> {
        Command::try_from(id).map_err(|_| HbusError::UnknownCommand { id })
    }

    pub fn id(self) -> u8 {
        self.into()
    }

    pub fn name(self) -> &'static str {
        self.into()
    }

    pub fn spec(self) -> &'static CommandSpec {
        CATALOG
            .iter()
            .find(|entry| entry.command == self)
            .unwrap_or_else(|| unreachable!("{} missing from catalog", self.name()))
    }

    /// Commands with no parameters at all: `cmd 0xFF`.
    pub fn is_zero_length(self) -> bool {
        self.spec().max_params == 0
    }

    /// Commands whose only parameter is the object address: `cmd ADDR 0xFF`.
    pub fn is_address_only(self) -> bool {
        matches!(
            self,
            Command::GetCh | Command::Query | Command::QueryEp | Command::QueryInt
        )
    }

    /// Whether the frame carries an object address byte after the command.
    ///
    /// SOFTRESET goes straight to the size byte; deployed firmware expects it.
    pub fn has_address(self) -> bool {
        !self.is_zero_length() && self != Command::SoftReset
    }

    /// Stream commands are exempt from the receive-side size clamp.
    pub fn is_stream(self) -> bool {
        matches!(self, Command::StreamW | Command::StreamR)
    }

    /// The reply a peer sends back to this command, if any.
    pub fn expected_reply(self) -> Option<Command> {
        match self {
            Command::GetCh => Some(Command::Response),
            Command::Query | Command::QueryEp | Command::QueryInt => Some(Command::QueryResp),
            Command::Search => Some(Command::Ack),
            _ => None,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn catalog_covers_every_command_once() {
        for command in Command::iter() {
            let count = CATALOG.iter().filter(|e| e.command == command).count();
            assert_eq!(count, 1, "{command} listed {count} times");
        }
        assert_eq!(CATALOG.len(), Command::iter().count());
    }

    #[test]
    fn ids_round_trip() {
        for command in Command::iter() {
            assert_eq!(Command::from_id(command.id()).unwrap(), command);
        }
        assert_eq!(
            Command::from_id(0x02),
            Err(HbusError::UnknownCommand { id: 0x02 })
        );
    }

    #[test]
    fn frame_shape_classification() {
        assert!(Command::Search.is_zero_length());
        assert!(Command::BusUnlock.is_zero_length());
        assert!(!Command::SoftReset.is_zero_length());
        assert!(!Command::SoftReset.has_address());
        assert!(Command::GetCh.is_address_only());
        assert!(Command::SetCh.has_address());
        assert!(!Command::SetCh.is_address_only());
    }

    #[test]
    fn addressed_commands_always_keep_their_address() {
        for entry in CATALOG.iter().filter(|e| e.command.has_address()) {
            assert!(entry.min_params >= 2, "{} may drop its address", entry.command);
        }
    }

    #[test]
    fn reply_map() {
        assert_eq!(Command::GetCh.expected_reply(), Some(Command::Response));
        assert_eq!(Command::QueryInt.expected_reply(), Some(Command::QueryResp));
        assert_eq!(Command::Search.expected_reply(), Some(Command::Ack));
        assert_eq!(Command::SetCh.expected_reply(), None);
    }
}
