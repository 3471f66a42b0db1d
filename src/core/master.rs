//! The HBUS master engine.
//!
//! `Master` is a synchronous state machine: bytes go in through `on_bytes`,
//! time advances through `tick`, and every method takes the current
//! `Instant` so tests can drive it with a manual clock. `core::runtime`
//! wraps it in a tokio task for real use.
use anyhow::Result;
use bytes::Bytes;
use flume::{Receiver, Sender};
use serde::Serialize;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Instant,
};
use strum::Display;

use crate::{
    api::traits::{Plugin, Signer},
    cli::config::MasterConfig,
    core::{
        arbiter::{BusArbiter, BusState},
        bus::{EventKind, MasterEvent, MasterRequest, Responder},
        device::{capability, Device, DeviceObject, DeviceSummary},
        enumeration::EnumerationPhase,
        pending::{PendingAnswer, PendingAnswers},
        registry::DeviceRegistry,
        supervisor::Supervisor,
    },
    protocol::{
        address::{DeviceAddress, MASTER_DEV},
        command::Command,
        error::HbusError,
        frame::FrameDecoder,
        operation::{hex_string, Instruction, Operation},
        transport::Transport,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
pub enum MasterState {
    Starting,
    Idle,
    Searching,
    Addressing,
    Scanning,
    Operational,
    Checking,
    Interrupted,
}

/// What to do with a matched reply or an expired wait.
pub(crate) enum ReplyAction {
    Discard,
    Addressing,
    Enumerate {
        address: DeviceAddress,
        phase: EnumerationPhase,
    },
    Ping {
        address: DeviceAddress,
    },
    Probe(Responder<bool>),
    Read {
        address: DeviceAddress,
        object: u8,
        respond: Responder<Vec<u8>>,
    },
}

struct QueuedSend {
    destination: DeviceAddress,
    instruction: Instruction,
    action: Option<ReplyAction>,
}

pub struct Master<T: Transport> {
    pub(crate) config: MasterConfig,
    address: DeviceAddress,
    transport: T,
    decoder: FrameDecoder,
    outbox: VecDeque<QueuedSend>,
    pending: PendingAnswers<ReplyAction>,
    arbiter: BusArbiter,
    state: MasterState,
    pub(crate) registry: DeviceRegistry,
    pub(crate) supervisor: Supervisor,
    signer: Option<Arc<dyn Signer>>,
    plugins: Vec<Box<dyn Plugin>>,
    virtual_owners: HashMap<DeviceAddress, usize>,
    subscribers: Vec<Sender<MasterEvent>>,
}

impl<T: Transport> Master<T> {
    pub fn new(config: MasterConfig, transport: T) -> Self {
        let address = DeviceAddress::master(config.bus_number);
        let mut registry = DeviceRegistry::new();
        for &device in &config.static_devices {
            registry.reserve(device);
        }
        Self {
            address,
            transport,
            decoder: FrameDecoder::new(config.byte_timeout()),
            outbox: VecDeque::new(),
            pending: PendingAnswers::new(),
            arbiter: BusArbiter::new(address),
            state: MasterState::Starting,
            registry,
            supervisor: Supervisor::new(config.static_devices.clone()),
            signer: None,
            plugins: Vec::new(),
            virtual_owners: HashMap::new(),
            subscribers: Vec::new(),
            config,
        }
    }

    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_plugin(mut self, plugin: Box<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn subscribe(&mut self) -> Receiver<MasterEvent> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.push(tx);
        rx
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn state(&self) -> MasterState {
        self.state
    }

    pub fn bus_state(&self) -> BusState {
        self.arbiter.state()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn devices(&self) -> Vec<Device> {
        self.registry.iter().cloned().collect()
    }

    pub fn device(&self, address: DeviceAddress) -> Option<&Device> {
        self.registry.get(address)
    }

    pub fn object(&self, address: DeviceAddress, object: u8) -> Option<&DeviceObject> {
        self.registry.get(address)?.object(object)
    }

    /// Connect the transport, announce plugin devices and open the first
    /// discovery round.
    pub fn start(&mut self, now: Instant) -> Result<Receiver<Bytes>> {
        let inbound = self.transport.connect()?;
        self.set_state(MasterState::Starting);
        self.emit(EventKind::Started);
        self.register_plugin_devices();
        self.set_state(MasterState::Idle);
        self.supervisor.next_check_at = Some(now + self.config.supervise_interval());
        self.start_round(MasterState::Searching, now);
        Ok(inbound)
    }

    /// Receive entry point for the transport's byte stream.
    pub fn on_bytes(&mut self, bytes: &[u8], now: Instant) {
        for &byte in bytes {
            let Some(outcome) = self.decoder.push(byte, now) else {
                continue;
            };
            match outcome {
                Ok(op) if op.source.dev == MASTER_DEV => {
                    log::trace!("dropping frame from reserved address {}", op.source)
                }
                Ok(op) => self.handle_operation(op, now),
                Err(err @ HbusError::Unreachable { .. }) => log::error!("{err}"),
                Err(err) => log::warn!("rx: {err}"),
            }
            self.release_queued(now);
        }
    }

    /// Advance timers: decoder stall, reply deadlines, supervisor schedule.
    pub fn tick(&mut self, now: Instant) {
        self.decoder.poll(now);
        for expired in self.pending.take_expired(now) {
            self.on_timeout(expired, now);
        }
        self.supervise(now);
        self.release_queued(now);
    }

    /// Dispatch one collaborator request. Returns false on shutdown.
    pub fn handle_request(&mut self, request: MasterRequest, now: Instant) -> bool {
        log::debug!("request {}", request.name());
        match request {
            MasterRequest::Discover(respond) => {
                let _ = respond.send(self.discover(now));
            }
            MasterRequest::ListDevices(respond) => {
                let _ = respond.send(self.devices());
            }
            MasterRequest::DeviceInfo { address, respond } => {
                let _ = respond.send(self.device(address).cloned());
            }
            MasterRequest::ObjectInfo {
                address,
                object,
                respond,
            } => {
                let _ = respond.send(self.object(address, object).cloned());
            }
            MasterRequest::ReadObject {
                address,
                object,
                respond,
            } => self.read_object(address, object, respond, now),
            MasterRequest::WriteObject {
                address,
                object,
                value,
                respond,
            } => {
                let _ = respond.send(self.write_object(address, object, &value, now));
            }
            MasterRequest::Ping { address, respond } => self.ping(address, respond, now),
            MasterRequest::SoftReset { address, respond } => {
                let _ = respond.send(self.soft_reset(address, now));
            }
            MasterRequest::MasterState(respond) => {
                let _ = respond.send(self.state);
            }
            MasterRequest::Subscribe(tx) => self.subscribers.push(tx),
            MasterRequest::Shutdown => return false,
        }
        true
    }

    /// Start an asynchronous object read; the answer arrives on `respond`.
    pub fn read_object(
        &mut self,
        address: DeviceAddress,
        object: u8,
        respond: Responder<Vec<u8>>,
        now: Instant,
    ) {
        if let Err(err) = self.check_readable(address, object) {
            let _ = respond.send(Err(err));
            return;
        }
        if address.is_virtual() {
            let result = self.plugin_read(address, object);
            let _ = respond.send(result);
            return;
        }
        match Instruction::new(Command::GetCh, vec![object]) {
            Ok(instruction) => self.send(
                address,
                instruction,
                Some(ReplyAction::Read {
                    address,
                    object,
                    respond,
                }),
                now,
            ),
            Err(err) => {
                let _ = respond.send(Err(err));
            }
        }
    }

    /// Write raw object bytes. No reply is expected on the wire.
    pub fn write_object(
        &mut self,
        address: DeviceAddress,
        object: u8,
        value: &[u8],
        now: Instant,
    ) -> Result<(), HbusError> {
        let device = self
            .registry
            .get(address)
            .ok_or(HbusError::UnknownDevice { address })?;
        let info = device
            .object(object)
            .ok_or(HbusError::UnknownObject { address, object })?;
        if !info.can_write() {
            return Err(HbusError::ReadOnly { address, object });
        }
        if value.len() != info.size as usize {
            return Err(HbusError::value_format(format!(
                "object {object} of {address} takes {} bytes, got {}",
                info.size,
                value.len()
            )));
        }
        let signed = info.crypto && device.has_capability(capability::AUTHSUP);

        if address.is_virtual() {
            let owner = self.plugin_for(address)?;
            self.plugins[owner].write_object(address, object, value)?;
        } else {
            let mut params = Vec::with_capacity(1 + value.len());
            params.push(object);
            params.extend_from_slice(value);
            if signed {
                let signer = self
                    .signer
                    .as_ref()
                    .ok_or(HbusError::AuthenticationFailed { address })?;
                params.extend(signer.sign(&signed_message(address, object, value)));
            }
            let instruction = Instruction::new(Command::SetCh, params)?;
            self.send(address, instruction, None, now);
        }

        if let Some(info) = self
            .registry
            .get_mut(address)
            .and_then(|d| d.object_mut(object))
        {
            info.last_value = Some(value.to_vec());
        }
        Ok(())
    }

    /// Check whether `address` answers a SEARCH. Does not touch the
    /// supervisor's failure counters.
    pub fn ping(&mut self, address: DeviceAddress, respond: Responder<bool>, now: Instant) {
        if address.is_virtual() {
            let _ = respond.send(Ok(self.registry.contains(address)));
            return;
        }
        match Instruction::bare(Command::Search) {
            Ok(instruction) => {
                self.send(address, instruction, Some(ReplyAction::Probe(respond)), now)
            }
            Err(err) => {
                let _ = respond.send(Err(err));
            }
        }
    }

    /// Send SOFTRESET (with KEYRESET first for authenticated devices) and
    /// forget the device.
    pub fn soft_reset(&mut self, address: DeviceAddress, now: Instant) -> Result<(), HbusError> {
        let device = self
            .registry
            .get(address)
            .ok_or(HbusError::UnknownDevice { address })?;
        let uid = device.uid;

        if !address.is_virtual() {
            let authenticated = device.has_capability(capability::AUTHSUP);
            let params = match (self.signer.clone(), authenticated) {
                (Some(signer), true) => {
                    let signature = signer.sign(&[address.bus, address.dev]);
                    let reset_key = Instruction::new(Command::KeyReset, vec![0])?;
                    self.send(address, reset_key, None, now);
                    signature
                }
                _ => Vec::new(),
            };
            let reset = Instruction::new(Command::SoftReset, params)?;
            self.send(address, reset, None, now);
        }

        self.registry.remove(address);
        self.emit(EventKind::DeviceKicked { address, uid });
        Ok(())
    }

    pub(crate) fn set_state(&mut self, state: MasterState) {
        if self.state != state {
            log::info!("master state {} -> {}", self.state, state);
            self.state = state;
        }
    }

    pub(crate) fn emit(&mut self, kind: EventKind) {
        let event = MasterEvent::new(kind);
        log::info!("event {:?}", event.kind);
        for plugin in &mut self.plugins {
            plugin.on_event(&event);
        }
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Build and send `command` with `params`, logging construction errors.
    pub(crate) fn send_command(
        &mut self,
        destination: DeviceAddress,
        command: Command,
        params: Vec<u8>,
        action: Option<ReplyAction>,
        now: Instant,
    ) {
        match Instruction::new(command, params) {
            Ok(instruction) => self.send(destination, instruction, action, now),
            Err(err) => log::error!("cannot build {command} for {destination}: {err}"),
        }
    }

    /// Queue or transmit an instruction. With an `action`, a pending answer
    /// is registered for the command's catalog reply before the frame leaves.
    pub(crate) fn send(
        &mut self,
        destination: DeviceAddress,
        instruction: Instruction,
        action: Option<ReplyAction>,
        now: Instant,
    ) {
        let queued = QueuedSend {
            destination,
            instruction,
            action,
        };
        if self.decoder.is_idle() && self.outbox.is_empty() {
            self.transmit(queued, now);
        } else {
            log::trace!("rx busy, queueing {} for {destination}", queued.instruction.command());
            self.outbox.push_back(queued);
        }
    }

    fn release_queued(&mut self, now: Instant) {
        if !self.decoder.is_idle() {
            return;
        }
        if let Some(queued) = self.outbox.pop_front() {
            self.transmit(queued, now);
        }
    }

    fn transmit(&mut self, queued: QueuedSend, now: Instant) {
        let QueuedSend {
            destination,
            instruction,
            action,
        } = queued;
        let command = instruction.command();

        if let Some(action) = action {
            match command.expected_reply() {
                Some(expected) => {
                    let deadline = now + self.config.response_timeout();
                    self.pending
                        .register(command, expected, destination, deadline, action);
                }
                None => log::error!(
                    "{}",
                    HbusError::Unreachable {
                        context: format!("{command} expects no reply but a continuation was given"),
                    }
                ),
            }
        }

        let op = Operation::new(self.address, destination, instruction);
        log::debug!("tx {op}");
        let frame = op.encode();
        if let Err(err) = self.transport.write(&frame) {
            log::error!("write of [{}] failed: {err:#}", hex_string(&frame));
        }
        self.arbiter.on_sent(&op);
    }

    fn handle_operation(&mut self, op: Operation, now: Instant) {
        log::debug!("rx {op}");

        if self.arbiter.observe(&op) {
            let broadcast = DeviceAddress::broadcast(self.address.bus);
            if op.command() == Command::BusLock
                && op.destination == broadcast
                && self.supervisor.round.is_some()
                && matches!(self.state, MasterState::Searching | MasterState::Checking)
            {
                self.begin_addressing(now);
            }
            return;
        }
        if self.arbiter.should_ignore(&op) {
            log::trace!("bus held by others, ignoring {op}");
            return;
        }
        if !self.arbiter.is_for_master(op.destination) {
            return;
        }

        match op.command() {
            Command::Int => self.handle_interrupt(op),
            command => match self.pending.take_match(op.source, command) {
                Some(pending) => self.on_reply(pending.action, op, now),
                None if command == Command::ErrorResp => {
                    log::warn!("{} reported error [{}]", op.source, hex_string(op.params()))
                }
                None => log::debug!("unsolicited {op}"),
            },
        }
    }

    fn on_reply(&mut self, action: ReplyAction, op: Operation, now: Instant) {
        match action {
            ReplyAction::Discard => {}
            ReplyAction::Addressing => self.complete_addressing(&op, now),
            ReplyAction::Enumerate { address, phase } => {
                self.enumeration_step(address, phase, op.params(), now)
            }
            ReplyAction::Ping { address } => self.ping_succeeded(address, now),
            ReplyAction::Probe(respond) => {
                let _ = respond.send(Ok(true));
            }
            ReplyAction::Read {
                address,
                object,
                respond,
            } => {
                let _ = respond.send(self.accept_read(address, object, &op));
            }
        }
    }

    fn on_timeout(&mut self, pending: PendingAnswer<ReplyAction>, now: Instant) {
        log::warn!(
            "{}",
            HbusError::ResponseTimeout {
                expected: pending.expected.name(),
                source_address: pending.source,
            }
        );
        if self.arbiter.is_locked_with(pending.source) {
            self.send_command(pending.source, Command::BusUnlock, Vec::new(), None, now);
        }

        match pending.action {
            ReplyAction::Discard => {}
            ReplyAction::Addressing => {
                if self.state == MasterState::Addressing {
                    let resume = self.round_state();
                    self.set_state(resume);
                }
            }
            ReplyAction::Enumerate { address, phase } => {
                self.enumeration_failed(address, phase, now)
            }
            ReplyAction::Ping { address } => self.ping_failed(address, now),
            ReplyAction::Probe(respond) => {
                let _ = respond.send(Ok(false));
            }
            ReplyAction::Read { respond, .. } => {
                let _ = respond.send(Err(HbusError::ResponseTimeout {
                    expected: pending.expected.name(),
                    source_address: pending.source,
                }));
            }
        }
    }

    fn round_state(&self) -> MasterState {
        self.supervisor
            .round
            .as_ref()
            .map(|round| round.kind)
            .unwrap_or(MasterState::Searching)
    }

    fn begin_addressing(&mut self, now: Instant) {
        self.set_state(MasterState::Addressing);
        let broadcast = DeviceAddress::broadcast(self.address.bus);
        self.send_command(
            broadcast,
            Command::GetCh,
            vec![0],
            Some(ReplyAction::Addressing),
            now,
        );
    }

    fn complete_addressing(&mut self, op: &Operation, now: Instant) {
        let resume = self.round_state();
        let summary = match DeviceSummary::parse(op.instruction.payload()) {
            Ok(summary) => summary,
            Err(err) => {
                log::warn!("addressing reply from {} unusable: {err}", op.source);
                self.abort_addressing(op.source, resume, now);
                return;
            }
        };
        let Some(address) = self.registry.next_address(self.address.bus, summary.uid) else {
            log::warn!("bus {} is full, cannot address uid {:08x}", self.address.bus, summary.uid);
            self.abort_addressing(op.source, resume, now);
            return;
        };

        match (self.signer.clone(), summary.capabilities & capability::AUTHSUP != 0) {
            (Some(signer), true) => {
                let mut params = vec![0];
                params.extend(signer.public_key());
                self.send_command(address, Command::KeySet, params, None, now);
            }
            _ => self.send_command(address, Command::Search, Vec::new(), None, now),
        }
        self.send_command(address, Command::BusUnlock, Vec::new(), None, now);

        let device = Device::new(address, summary.uid, summary.capabilities);
        if let Some(previous) = self.registry.register(device) {
            log::debug!("replaced uid {:08x} at {address}", previous.uid);
        }
        log::info!(
            "assigned {address} to uid {:08x} (caps 0x{:02x})",
            summary.uid,
            summary.capabilities
        );
        self.emit(EventKind::DeviceAdded {
            address,
            uid: summary.uid,
        });
        self.set_state(resume);
    }

    fn abort_addressing(&mut self, peer: DeviceAddress, resume: MasterState, now: Instant) {
        if self.arbiter.is_locked_with(peer) {
            self.send_command(peer, Command::BusUnlock, Vec::new(), None, now);
        }
        self.set_state(resume);
    }

    fn handle_interrupt(&mut self, op: Operation) {
        let prior = self.state;
        self.set_state(MasterState::Interrupted);
        self.emit(EventKind::Interruption {
            address: op.source,
            params: op.params().to_vec(),
        });
        self.set_state(prior);
    }

    fn check_readable(&self, address: DeviceAddress, object: u8) -> Result<(), HbusError> {
        let info = self
            .registry
            .get(address)
            .ok_or(HbusError::UnknownDevice { address })?
            .object(object)
            .ok_or(HbusError::UnknownObject { address, object })?;
        if info.can_read() {
            Ok(())
        } else {
            Err(HbusError::WriteOnly { address, object })
        }
    }

    fn accept_read(
        &mut self,
        address: DeviceAddress,
        object: u8,
        op: &Operation,
    ) -> Result<Vec<u8>, HbusError> {
        if op.instruction.object() != Some(object) {
            return Err(HbusError::MalformedFrame {
                reason: format!("read of object {object} answered with {op}"),
            });
        }
        let signer = self.signer.clone();
        let device = self
            .registry
            .get_mut(address)
            .ok_or(HbusError::UnknownDevice { address })?;
        let verify = device.has_capability(capability::REVAUTHSUP);
        let info = device
            .object_mut(object)
            .ok_or(HbusError::UnknownObject { address, object })?;

        let payload = op.instruction.payload();
        let value = if verify && info.crypto {
            let signer = signer.ok_or(HbusError::AuthenticationFailed { address })?;
            let size = info.size as usize;
            if payload.len() < size + signer.signature_len() {
                return Err(HbusError::AuthenticationFailed { address });
            }
            let (value, signature) = payload.split_at(size);
            if !signer.verify(&signed_message(address, object, value), signature) {
                return Err(HbusError::AuthenticationFailed { address });
            }
            value.to_vec()
        } else {
            payload.to_vec()
        };

        info.last_value = Some(value.clone());
        Ok(value)
    }

    fn register_plugin_devices(&mut self) {
        let announced: Vec<(usize, Device)> = self
            .plugins
            .iter()
            .enumerate()
            .flat_map(|(index, plugin)| plugin.devices().into_iter().map(move |d| (index, d)))
            .collect();

        for (index, mut device) in announced {
            if !device.address.is_virtual() {
                log::warn!(
                    "plugin {} announced {} outside the virtual bus",
                    self.plugins[index].name(),
                    device.address
                );
                continue;
            }
            device.is_virtual = true;
            device.basic_retrieved = true;
            device.extended_retrieved = true;
            device.enumeration = EnumerationPhase::Done;
            let address = device.address;
            let uid = device.uid;
            self.virtual_owners.insert(address, index);
            self.registry.register(device);
            self.emit(EventKind::DeviceAdded { address, uid });
        }
    }

    fn plugin_for(&self, address: DeviceAddress) -> Result<usize, HbusError> {
        self.virtual_owners
            .get(&address)
            .copied()
            .ok_or(HbusError::UnknownDevice { address })
    }

    fn plugin_read(&mut self, address: DeviceAddress, object: u8) -> Result<Vec<u8>, HbusError> {
        let owner = self.plugin_for(address)?;
        let value = self.plugins[owner].read_object(address, object)?;
        if let Some(info) = self
            .registry
            .get_mut(address)
            .and_then(|d| d.object_mut(object))
        {
            info.last_value = Some(value.clone());
        }
        Ok(value)
    }
}

/// Bytes covered by a crypto object signature.
fn signed_message(address: DeviceAddress, object: u8, value: &[u8]) -> Vec<u8> {
    let mut message = vec![address.bus, address.dev, object];
    message.extend_from_slice(value);
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::simulator::{SimulatedBus, SimulatedSlave};
    use std::time::Duration;

    fn config() -> MasterConfig {
        MasterConfig {
            search_round_ms: 500,
            ..MasterConfig::default()
        }
    }

    fn pump(master: &mut Master<SimulatedBus>, inbound: &Receiver<Bytes>, now: Instant) {
        while let Ok(chunk) = inbound.try_recv() {
            master.on_bytes(&chunk, now);
        }
    }

    #[test]
    fn start_broadcasts_search() {
        let bus = SimulatedBus::new(0);
        let mut master = Master::new(config(), bus.clone());
        let events = master.subscribe();
        master.start(Instant::now()).unwrap();

        assert_eq!(master.state(), MasterState::Searching);
        let sent = bus.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].command(), Command::Search);
        assert_eq!(sent[0].destination, DeviceAddress::broadcast(0));
        assert_eq!(events.try_recv().unwrap().kind, EventKind::Started);
        assert_eq!(master.pending_count(), 0);
    }

    #[test]
    fn addressing_handshake_assigns_first_address() {
        let bus = SimulatedBus::new(0);
        bus.add_slave(SimulatedSlave::new(0x0102_0304, 0, "node"));
        let mut master = Master::new(config(), bus.clone());
        let now = Instant::now();
        let inbound = master.start(now).unwrap();

        // BUSLOCK from the winning slave
        let chunk = inbound.try_recv().unwrap();
        master.on_bytes(&chunk, now);
        assert_eq!(master.state(), MasterState::Addressing);
        let getch = bus.sent().last().cloned().unwrap();
        assert_eq!(getch.command(), Command::GetCh);
        assert_eq!(getch.destination, DeviceAddress::broadcast(0));
        assert_eq!(getch.params(), &[0]);

        pump(&mut master, &inbound, now);
        let sent = bus.sent();
        let target = DeviceAddress::new(0, 1).unwrap();
        let tail: Vec<_> = sent[sent.len() - 2..]
            .iter()
            .map(|op| (op.command(), op.destination))
            .collect();
        assert_eq!(tail, vec![(Command::Search, target), (Command::BusUnlock, target)]);
        assert_eq!(master.state(), MasterState::Searching);
        assert_eq!(master.device(target).unwrap().uid, 0x0102_0304);
        assert_eq!(master.bus_state(), BusState::Free);
    }

    #[test]
    fn own_echo_is_dropped() {
        let bus = SimulatedBus::new(0);
        let mut master = Master::new(config(), bus.clone());
        let now = Instant::now();
        master.start(now).unwrap();
        let echo = bus.sent()[0].encode();
        master.on_bytes(&echo, now);
        assert_eq!(master.state(), MasterState::Searching);
        assert_eq!(master.pending_count(), 0);

        // a BUSLOCK claiming the master's own address never starts addressing
        let spoofed = Operation::new(
            DeviceAddress::master(0),
            DeviceAddress::broadcast(0),
            Instruction::bare(Command::BusLock).unwrap(),
        );
        master.on_bytes(&spoofed.encode(), now);
        assert_eq!(master.state(), MasterState::Searching);
        assert_eq!(master.bus_state(), BusState::Free);
        assert_eq!(bus.sent().len(), 1);
    }

    #[test]
    fn sends_during_reception_wait_for_the_frame() {
        let bus = SimulatedBus::new(0);
        let mut master = Master::new(config(), bus.clone());
        let now = Instant::now();
        master.start(now).unwrap();
        bus.take_sent();

        // half a frame on the wire
        master.on_bytes(&[0, 5, 0], now);
        let target = DeviceAddress::new(0, 5).unwrap();
        let (tx, _rx) = oneshot::channel();
        master.ping(target, tx, now);
        assert!(bus.sent().is_empty());

        master.on_bytes(&[0, Command::Ack.id(), 0xFF], now);
        let sent = bus.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destination, target);

        // a stalled frame also releases the queue on tick
        master.on_bytes(&[0, 5], now);
        let (tx, _rx) = oneshot::channel();
        master.ping(target, tx, now);
        assert!(bus.sent().is_empty());
        master.tick(now + Duration::from_millis(300));
        assert_eq!(bus.take_sent().len(), 1);
    }
}
