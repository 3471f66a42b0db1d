//! Byte-by-byte receive state machine for HBUS frames.
//!
//! ```text
//! SBID -> SDID -> TBID -> TDID -> CMD -+-> STP                     (zero length)
//!                                      +-> PSZ -> [PRM] -> STP     (SOFTRESET)
//!                                      +-> ADDR -+-> STP           (address only)
//!                                                +-> PSZ -> [PRM] -> STP
//! ```
use std::time::{Duration, Instant};

use super::{
    address::{is_legal_dev_number, DeviceAddress},
    command::{Command, MAX_PARAM_SIZE},
    error::HbusError,
    operation::{hex_string, Instruction, Operation, FRAME_TERMINATOR},
};

/// Default inter-byte stall timeout.
pub const DEFAULT_BYTE_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    /// Idle, waiting for the source bus byte.
    Sbid,
    Sdid,
    Tbid,
    Tdid,
    Cmd,
    Addr,
    Psz,
    Prm,
    Stp,
}

#[derive(Debug)]
pub struct FrameDecoder {
    state: RxState,
    raw: Vec<u8>,
    header: [u8; 4],
    command: Option<Command>,
    params: Vec<u8>,
    remaining: usize,
    last_byte_at: Option<Instant>,
    byte_timeout: Duration,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_BYTE_TIMEOUT)
    }
}

impl FrameDecoder {
    pub fn new(byte_timeout: Duration) -> Self {
        Self {
            state: RxState::Sbid,
            raw: Vec::with_capacity(80),
            header: [0; 4],
            command: None,
            params: Vec::with_capacity(MAX_PARAM_SIZE + 1),
            remaining: 0,
            last_byte_at: None,
            byte_timeout,
        }
    }

    pub fn state(&self) -> RxState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == RxState::Sbid
    }

    /// Drop any partial frame and return to idle.
    pub fn reset(&mut self) {
        self.state = RxState::Sbid;
        self.raw.clear();
        self.command = None;
        self.params.clear();
        self.remaining = 0;
        self.last_byte_at = None;
    }

    /// Abort a partial frame whose next byte is overdue. Returns true when a
    /// frame was dropped.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.last_byte_at {
            Some(at) if !self.is_idle() && now.saturating_duration_since(at) > self.byte_timeout => {
                log::debug!(
                    "rx stalled in {:?} after {} bytes, dropping [{}]",
                    self.state,
                    self.raw.len(),
                    hex_string(&self.raw)
                );
                self.reset();
                true
            }
            _ => false,
        }
    }

    /// Feed a chunk of bytes, collecting every frame outcome it completes.
    pub fn feed(&mut self, bytes: &[u8], now: Instant) -> Vec<Result<Operation, HbusError>> {
        bytes
            .iter()
            .filter_map(|&byte| self.push(byte, now))
            .collect()
    }

    /// Advance the state machine by one byte.
    ///
    /// Returns `Some` when the byte completes or aborts a frame.
    pub fn push(&mut self, byte: u8, now: Instant) -> Option<Result<Operation, HbusError>> {
        self.poll(now);
        self.last_byte_at = Some(now);
        self.raw.push(byte);

        match self.state {
            RxState::Sbid => {
                self.header[0] = byte;
                self.state = RxState::Sdid;
            }
            RxState::Sdid | RxState::Tdid => {
                if !is_legal_dev_number(byte) {
                    return Some(Err(self.abort(format!("illegal device number {byte}"))));
                }
                if self.state == RxState::Sdid {
                    self.header[1] = byte;
                    self.state = RxState::Tbid;
                } else {
                    self.header[3] = byte;
                    self.state = RxState::Cmd;
                }
            }
            RxState::Tbid => {
                self.header[2] = byte;
                self.state = RxState::Tdid;
            }
            RxState::Cmd => {
                let command = match Command::from_id(byte) {
                    Ok(command) => command,
                    Err(err) => {
                        self.reset();
                        return Some(Err(err));
                    }
                };
                self.command = Some(command);
                self.state = if command.is_zero_length() {
                    RxState::Stp
                } else if command.has_address() {
                    RxState::Addr
                } else {
                    RxState::Psz
                };
            }
            RxState::Addr => {
                self.params.push(byte);
                self.state = match self.command {
                    Some(command) if command.is_address_only() => RxState::Stp,
                    _ => RxState::Psz,
                };
            }
            RxState::Psz => {
                let streaming = self.command.map(Command::is_stream).unwrap_or(false);
                self.remaining = if streaming {
                    byte as usize
                } else {
                    (byte as usize).min(MAX_PARAM_SIZE)
                };
                self.state = if self.remaining == 0 {
                    RxState::Stp
                } else {
                    RxState::Prm
                };
            }
            RxState::Prm => {
                self.params.push(byte);
                self.remaining -= 1;
                if self.remaining == 0 {
                    self.state = RxState::Stp;
                }
            }
            RxState::Stp => {
                if byte != FRAME_TERMINATOR {
                    return Some(Err(
                        self.abort(format!("expected terminator, got 0x{byte:02x}"))
                    ));
                }
                return Some(self.complete());
            }
        }
        None
    }

    fn abort(&mut self, reason: String) -> HbusError {
        let reason = format!("{reason} in [{}]", hex_string(&self.raw));
        self.reset();
        HbusError::MalformedFrame { reason }
    }

    fn complete(&mut self) -> Result<Operation, HbusError> {
        let [src_bus, src_dev, dst_bus, dst_dev] = self.header;
        let command = self.command.take();
        let params = std::mem::take(&mut self.params);
        let raw_len = self.raw.len();
        self.reset();

        let command = command.ok_or_else(|| HbusError::Unreachable {
            context: format!("terminator accepted without a command after {raw_len} bytes"),
        })?;
        let instruction = Instruction::new(command, params).map_err(|err| {
            HbusError::MalformedFrame {
                reason: err.to_string(),
            }
        })?;
        Ok(Operation::new(
            DeviceAddress {
                bus: src_bus,
                dev: src_dev,
            },
            DeviceAddress {
                bus: dst_bus,
                dev: dst_dev,
            },
            instruction,
        ))
    }
}

/// Decode a single complete frame.
pub fn decode_frame(bytes: &[u8]) -> Result<Operation, HbusError> {
    let mut decoder = FrameDecoder::default();
    let now = Instant::now();
    let mut outcomes = decoder.feed(bytes, now);
    if outcomes.len() != 1 || !decoder.is_idle() {
        return Err(HbusError::MalformedFrame {
            reason: format!(
                "expected exactly one frame in [{}], found {}",
                hex_string(bytes),
                outcomes.len()
            ),
        });
    }
    outcomes.remove(0)
}
