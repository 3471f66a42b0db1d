//! In-process HBUS slaves and a bus that connects them to the master.
//!
//! Each slave runs the device side of the addressing handshake:
//! `Idle -> Addressing1 (wants lock) -> Addressing2 (awaiting GETCH 0) ->
//! Addressing3 (awaiting SEARCH/KEYSET with the new address) -> Enumerated
//! (after BUSUNLOCK)`.
use anyhow::{anyhow, Result};
use bytes::Bytes;
use flume::{Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;

use super::{
    address::DeviceAddress,
    command::{Command, MAX_PARAM_SIZE},
    frame::decode_frame,
    operation::{Instruction, Operation},
    transport::Transport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveStatus {
    Idle,
    Addressing1,
    Addressing2,
    Addressing3,
    Enumerated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedObject {
    /// Flag byte as reported by QUERY (permissions, crypto, hidden, type, level).
    pub flags: u8,
    pub size: u8,
    pub subtype: u8,
    pub description: String,
    pub value: Vec<u8>,
}

impl SimulatedObject {
    pub fn new(flags: u8, size: u8, subtype: u8, description: &str, value: Vec<u8>) -> Self {
        Self {
            flags,
            size,
            subtype,
            description: description.to_string(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedChannel {
    pub flags: u8,
    pub block_size: u8,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct SimulatedSlave {
    pub uid: u32,
    pub capabilities: u8,
    pub description: String,
    /// Objects numbered from 1.
    pub objects: Vec<SimulatedObject>,
    pub endpoints: Vec<SimulatedChannel>,
    pub interrupts: Vec<SimulatedChannel>,
    /// When false the slave ignores all traffic.
    pub online: bool,
    pub master_key: Option<Vec<u8>>,
    bus: u8,
    status: SlaveStatus,
    address: Option<DeviceAddress>,
    offered: Option<DeviceAddress>,
}

impl SimulatedSlave {
    pub fn new(uid: u32, capabilities: u8, description: &str) -> Self {
        Self {
            uid,
            capabilities,
            description: description.to_string(),
            objects: Vec::new(),
            endpoints: Vec::new(),
            interrupts: Vec::new(),
            online: true,
            master_key: None,
            bus: 0,
            status: SlaveStatus::Idle,
            address: None,
            offered: None,
        }
    }

    pub fn with_object(mut self, object: SimulatedObject) -> Self {
        self.objects.push(object);
        self
    }

    pub fn with_endpoint(mut self, flags: u8, block_size: u8, description: &str) -> Self {
        self.endpoints.push(SimulatedChannel {
            flags,
            block_size,
            description: description.to_string(),
        });
        self
    }

    pub fn with_interrupt(mut self, flags: u8, description: &str) -> Self {
        self.interrupts.push(SimulatedChannel {
            flags,
            block_size: 0,
            description: description.to_string(),
        });
        self
    }

    /// Start already addressed, as a pre-configured device would.
    pub fn preaddressed(mut self, address: DeviceAddress) -> Self {
        self.bus = address.bus;
        self.address = Some(address);
        self.status = SlaveStatus::Enumerated;
        self
    }

    pub fn status(&self) -> SlaveStatus {
        self.status
    }

    pub fn address(&self) -> Option<DeviceAddress> {
        self.address
    }

    pub fn object_value(&self, number: u8) -> Option<&[u8]> {
        self.objects
            .get(number.checked_sub(1)? as usize)
            .map(|o| o.value.as_slice())
    }

    fn own_source(&self) -> DeviceAddress {
        self.address
            .unwrap_or_else(|| DeviceAddress::broadcast(self.bus))
    }

    fn reply(&self, to: DeviceAddress, command: Command, params: Vec<u8>) -> Option<Operation> {
        match Instruction::new(command, params) {
            Ok(instruction) => Some(Operation::new(self.own_source(), to, instruction)),
            Err(err) => {
                log::warn!("Simulated slave {:08x} cannot reply: {err}", self.uid);
                None
            }
        }
    }

    /// Handle a frame seen on the bus, returning the slave's replies.
    pub fn handle(&mut self, op: &Operation) -> Vec<Operation> {
        if !self.online {
            return Vec::new();
        }
        let broadcast = DeviceAddress::broadcast(self.bus);
        let object = op.instruction.object().unwrap_or(0);

        match (self.status, op.command()) {
            (SlaveStatus::Idle, Command::Search) if op.destination == broadcast => {
                self.status = SlaveStatus::Addressing1;
                Vec::new()
            }
            (SlaveStatus::Addressing2, Command::GetCh)
                if op.destination == broadcast && object == 0 =>
            {
                self.status = SlaveStatus::Addressing3;
                self.reply(op.source, Command::Response, self.object_zero())
                    .into_iter()
                    .collect()
            }
            (SlaveStatus::Addressing3, Command::Search | Command::KeySet)
                if !op.destination.is_broadcast() && op.destination.bus == self.bus =>
            {
                if op.command() == Command::KeySet {
                    self.master_key = Some(op.instruction.payload().to_vec());
                }
                self.offered = Some(op.destination);
                Vec::new()
            }
            (SlaveStatus::Addressing3, Command::BusUnlock)
                if Some(op.destination) == self.offered =>
            {
                self.address = self.offered.take();
                self.status = SlaveStatus::Enumerated;
                Vec::new()
            }
            (SlaveStatus::Enumerated, _) if Some(op.destination) == self.address => {
                self.handle_addressed(op)
            }
            _ => Vec::new(),
        }
    }

    fn handle_addressed(&mut self, op: &Operation) -> Vec<Operation> {
        let object = op.instruction.object().unwrap_or(0);
        let to = op.source;
        let reply = match op.command() {
            Command::Search => self.reply(to, Command::Ack, Vec::new()),
            Command::GetCh if object == 0 => self.reply(to, Command::Response, self.object_zero()),
            Command::GetCh => match self.objects.get(object as usize - 1) {
                Some(obj) => {
                    let mut params = vec![object];
                    params.extend_from_slice(&obj.value);
                    self.reply(to, Command::Response, params)
                }
                None => self.reply(to, Command::ErrorResp, vec![object, 0x01]),
            },
            Command::Query if object == 0 => {
                let params = describe(0, &[0, 0, 0], &self.description);
                self.reply(to, Command::QueryResp, params)
            }
            Command::Query => match self.objects.get(object as usize - 1) {
                Some(obj) => {
                    let params = describe(object, &[obj.flags, obj.size, obj.subtype], &obj.description);
                    self.reply(to, Command::QueryResp, params)
                }
                None => self.reply(to, Command::ErrorResp, vec![object, 0x01]),
            },
            Command::QueryEp => self.endpoints.get(object as usize).and_then(|ep| {
                let params = describe(object, &[ep.flags, ep.block_size], &ep.description);
                self.reply(to, Command::QueryResp, params)
            }),
            Command::QueryInt => self.interrupts.get(object as usize).and_then(|int| {
                let params = describe(object, &[int.flags], &int.description);
                self.reply(to, Command::QueryResp, params)
            }),
            Command::SetCh => {
                if let Some(obj) = object
                    .checked_sub(1)
                    .and_then(|index| self.objects.get_mut(index as usize))
                {
                    let size = obj.size as usize;
                    let payload = op.instruction.payload();
                    obj.value = payload[..size.min(payload.len())].to_vec();
                }
                None
            }
            Command::KeySet => {
                self.master_key = Some(op.instruction.payload().to_vec());
                None
            }
            Command::KeyReset => {
                self.master_key = None;
                None
            }
            Command::SoftReset => {
                self.address = None;
                self.offered = None;
                self.status = SlaveStatus::Idle;
                None
            }
            _ => None,
        };
        reply.into_iter().collect()
    }

    fn object_zero(&self) -> Vec<u8> {
        let mut params = vec![
            0,
            self.objects.len() as u8,
            self.endpoints.len() as u8,
            self.interrupts.len() as u8,
            self.capabilities,
        ];
        params.extend_from_slice(&self.uid.to_be_bytes());
        params
    }
}

fn describe(number: u8, header: &[u8], description: &str) -> Vec<u8> {
    let mut params = vec![number];
    params.extend_from_slice(header);
    let room = MAX_PARAM_SIZE - header.len();
    params.extend(description.bytes().take(room));
    params
}

#[derive(Debug)]
struct BusInner {
    bus_number: u8,
    slaves: Vec<SimulatedSlave>,
    sent: Vec<Operation>,
    locked: bool,
    inbound: Option<Sender<Bytes>>,
}

impl BusInner {
    fn deliver(&mut self, op: &Operation) {
        match op.command() {
            Command::BusLock => self.locked = true,
            Command::BusUnlock => self.locked = false,
            _ => {}
        }
        let replies: Vec<Operation> = self
            .slaves
            .iter_mut()
            .flat_map(|slave| slave.handle(op))
            .collect();
        for reply in replies {
            self.push_to_master(&reply);
        }
        self.arbitrate();
    }

    /// The first slave waiting in Addressing1 wins the free bus and locks it.
    fn arbitrate(&mut self) {
        if self.locked {
            return;
        }
        let broadcast = DeviceAddress::broadcast(self.bus_number);
        if let Some(winner) = self
            .slaves
            .iter_mut()
            .find(|s| s.online && s.status == SlaveStatus::Addressing1)
        {
            winner.status = SlaveStatus::Addressing2;
            self.locked = true;
            if let Ok(instruction) = Instruction::bare(Command::BusLock) {
                let lock = Operation::new(broadcast, broadcast, instruction);
                self.push_to_master(&lock);
            }
        }
    }

    fn push_to_master(&self, op: &Operation) {
        if let Some(tx) = &self.inbound {
            if tx.send(Bytes::from(op.encode())).is_err() {
                log::debug!("Simulated bus has no listener for {op}");
            }
        }
    }
}

/// Transport that routes master frames to simulated slaves.
///
/// Clones share the same bus, so a test can keep a handle while the master
/// owns another.
#[derive(Debug, Clone)]
pub struct SimulatedBus {
    inner: Arc<Mutex<BusInner>>,
}

impl SimulatedBus {
    pub fn new(bus_number: u8) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                bus_number,
                slaves: Vec::new(),
                sent: Vec::new(),
                locked: false,
                inbound: None,
            })),
        }
    }

    /// Attach a slave; returns its index for `with_slave`.
    pub fn add_slave(&self, mut slave: SimulatedSlave) -> usize {
        let mut inner = self.inner.lock();
        if slave.address.is_none() {
            slave.bus = inner.bus_number;
        }
        inner.slaves.push(slave);
        inner.slaves.len() - 1
    }

    pub fn with_slave<R>(&self, index: usize, f: impl FnOnce(&mut SimulatedSlave) -> R) -> R {
        f(&mut self.inner.lock().slaves[index])
    }

    /// Frames the master has transmitted so far.
    pub fn sent(&self) -> Vec<Operation> {
        self.inner.lock().sent.clone()
    }

    pub fn take_sent(&self) -> Vec<Operation> {
        std::mem::take(&mut self.inner.lock().sent)
    }

    /// Put an arbitrary frame on the wire towards the master.
    pub fn inject(&self, op: &Operation) {
        self.inner.lock().push_to_master(op);
    }

    /// Put raw bytes on the wire towards the master.
    pub fn inject_raw(&self, bytes: &[u8]) {
        if let Some(tx) = &self.inner.lock().inbound {
            let _ = tx.send(Bytes::copy_from_slice(bytes));
        }
    }
}

impl Transport for SimulatedBus {
    fn connect(&mut self) -> Result<Receiver<Bytes>> {
        let (tx, rx) = flume::unbounded();
        self.inner.lock().inbound = Some(tx);
        Ok(rx)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let op = decode_frame(bytes).map_err(|e| anyhow!("simulated bus rejected frame: {e}"))?;
        let mut inner = self.inner.lock();
        inner.sent.push(op.clone());
        inner.deliver(&op);
        Ok(())
    }
}
