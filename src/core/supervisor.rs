//! Discovery rounds, liveness checks and the enumeration queue.
//!
//! A cycle runs `Searching|Checking (round) -> Checking (pings) -> Scanning
//! -> Operational`; the periodic check restarts it every supervise interval.
use std::{collections::VecDeque, time::Instant};

use crate::{
    core::{
        bus::EventKind,
        device::Device,
        enumeration::{advance, EnumerationPhase},
        master::{Master, MasterState, ReplyAction},
    },
    protocol::{address::DeviceAddress, command::Command, error::HbusError, transport::Transport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DiscoveryRound {
    /// `Searching` for an explicit discovery, `Checking` for the periodic one.
    pub kind: MasterState,
    pub deadline: Instant,
}

#[derive(Debug, Default)]
pub(crate) struct Supervisor {
    pub round: Option<DiscoveryRound>,
    pub verify_queue: VecDeque<DeviceAddress>,
    pub scan_queue: VecDeque<DeviceAddress>,
    pub scanning: Option<DeviceAddress>,
    pub next_scan_at: Option<Instant>,
    pub next_check_at: Option<Instant>,
    pub static_devices: Vec<DeviceAddress>,
}

impl Supervisor {
    pub fn new(static_devices: Vec<DeviceAddress>) -> Self {
        Self {
            static_devices,
            ..Self::default()
        }
    }

    pub fn is_static(&self, address: DeviceAddress) -> bool {
        self.static_devices.contains(&address)
    }
}

enum PingOutcome {
    Retry,
    Keep,
    Evict(u32),
    Absent,
}

impl<T: Transport> Master<T> {
    /// Open a discovery round. Only honoured while idle or operational;
    /// returns whether a round was started.
    pub fn discover(&mut self, now: Instant) -> bool {
        if !matches!(self.state(), MasterState::Idle | MasterState::Operational) {
            log::debug!("discovery request ignored in state {}", self.state());
            return false;
        }
        self.start_round(MasterState::Searching, now);
        true
    }

    pub(crate) fn start_round(&mut self, kind: MasterState, now: Instant) {
        self.supervisor.round = Some(DiscoveryRound {
            kind,
            deadline: now + self.config.search_round(),
        });
        self.set_state(kind);
        let broadcast = DeviceAddress::broadcast(self.address().bus);
        // unaddressed devices answer with BUSLOCK, not ACK
        self.send_command(broadcast, Command::Search, Vec::new(), None, now);
    }

    /// Timer-driven part of the cycle, called from `tick`.
    pub(crate) fn supervise(&mut self, now: Instant) {
        if let Some(round) = self.supervisor.round {
            if round.deadline <= now && self.state() != MasterState::Addressing {
                log::info!("discovery round finished with {} devices", self.registry.len());
                self.supervisor.round = None;
                self.start_verification(now);
            }
        }

        if self.state() == MasterState::Scanning
            && self.supervisor.scanning.is_none()
            && self.supervisor.next_scan_at.is_some_and(|at| at <= now)
        {
            self.supervisor.next_scan_at = None;
            self.scan_next(now);
        }

        if matches!(self.state(), MasterState::Idle | MasterState::Operational)
            && self.supervisor.next_check_at.is_some_and(|at| at <= now)
        {
            self.supervisor.next_check_at = Some(now + self.config.supervise_interval());
            log::info!("periodic bus check");
            self.start_round(MasterState::Checking, now);
        }
    }

    fn start_verification(&mut self, now: Instant) {
        self.set_state(MasterState::Checking);
        let mut queue: VecDeque<DeviceAddress> = self
            .registry
            .iter()
            .filter(|d| !d.is_virtual)
            .map(|d| d.address)
            .collect();
        for &address in &self.supervisor.static_devices {
            if !queue.contains(&address) {
                queue.push_back(address);
            }
        }
        self.supervisor.verify_queue = queue;
        self.ping_next(now);
    }

    fn ping_next(&mut self, now: Instant) {
        match self.supervisor.verify_queue.pop_front() {
            Some(address) => self.send_command(
                address,
                Command::Search,
                Vec::new(),
                Some(ReplyAction::Ping { address }),
                now,
            ),
            None => self.start_scanning(now),
        }
    }

    pub(crate) fn ping_succeeded(&mut self, address: DeviceAddress, now: Instant) {
        match self.registry.get_mut(address) {
            Some(device) => device.ping_retries = 0,
            None if self.supervisor.is_static(address) => {
                log::info!("static device {address} answered");
                self.registry.register(Device::new_static(address));
                self.emit(EventKind::DeviceAdded { address, uid: 0 });
            }
            None => log::debug!("ping answer from {address}, which is no longer registered"),
        }
        self.ping_next(now);
    }

    pub(crate) fn ping_failed(&mut self, address: DeviceAddress, now: Instant) {
        let limit = self.config.ping_retries.max(1);
        let outcome = match self.registry.get_mut(address) {
            Some(device) => {
                device.ping_retries += 1;
                if device.ping_retries < limit {
                    PingOutcome::Retry
                } else if device.is_static {
                    device.ping_retries = 0;
                    PingOutcome::Keep
                } else {
                    PingOutcome::Evict(device.uid)
                }
            }
            None => PingOutcome::Absent,
        };

        match outcome {
            PingOutcome::Retry => self.supervisor.verify_queue.push_front(address),
            PingOutcome::Keep => {
                log::warn!("static device {address} is not answering, keeping it")
            }
            PingOutcome::Evict(uid) => {
                log::warn!("{}", HbusError::DeviceUnresponsive { address });
                self.registry.remove(address);
                self.emit(EventKind::DeviceKicked { address, uid });
            }
            PingOutcome::Absent => log::debug!("static device {address} is absent"),
        }
        self.ping_next(now);
    }

    fn start_scanning(&mut self, now: Instant) {
        self.set_state(MasterState::Scanning);
        self.supervisor.scan_queue = self
            .registry
            .iter()
            .filter(|d| !d.is_virtual && !d.extended_retrieved)
            .map(|d| d.address)
            .collect();
        self.supervisor.next_scan_at = None;
        self.scan_next(now);
    }

    fn scan_next(&mut self, now: Instant) {
        while let Some(address) = self.supervisor.scan_queue.pop_front() {
            let Some(device) = self.registry.get_mut(address) else {
                continue;
            };
            device.scan_retries = 0;
            let phase = device.enumeration;
            log::info!("enumerating {address} from {phase:?}");
            self.supervisor.scanning = Some(address);
            self.request_phase(address, phase, now);
            return;
        }
        self.supervisor.scanning = None;
        self.become_operational();
    }

    fn request_phase(&mut self, address: DeviceAddress, phase: EnumerationPhase, now: Instant) {
        match phase.request() {
            Some(instruction) => self.send(
                address,
                instruction,
                Some(ReplyAction::Enumerate { address, phase }),
                now,
            ),
            None => self.finish_device(now),
        }
    }

    pub(crate) fn enumeration_step(
        &mut self,
        address: DeviceAddress,
        phase: EnumerationPhase,
        params: &[u8],
        now: Instant,
    ) {
        let Some(device) = self.registry.get_mut(address) else {
            log::warn!("{address} left the registry during enumeration");
            self.finish_device(now);
            return;
        };
        match advance(device, phase, params) {
            Ok(next) => {
                device.enumeration = next;
                device.scan_retries = 0;
                if next.is_done() {
                    log::info!(
                        "{address} enumerated: {:?}, {} objects, {} hidden",
                        device.description,
                        device.objects.len(),
                        device.hidden_objects.len()
                    );
                    self.finish_device(now);
                } else {
                    self.request_phase(address, next, now);
                }
            }
            Err(err) => {
                log::warn!("{address} {phase:?}: {err}");
                self.enumeration_failed(address, phase, now);
            }
        }
    }

    pub(crate) fn enumeration_failed(
        &mut self,
        address: DeviceAddress,
        phase: EnumerationPhase,
        now: Instant,
    ) {
        let limit = self.config.scan_retries;
        let retry = match self.registry.get_mut(address) {
            Some(device) if device.scan_retries < limit => {
                device.scan_retries += 1;
                true
            }
            Some(device) => {
                device.scan_retries = 0;
                false
            }
            None => false,
        };

        if retry {
            self.request_phase(address, phase, now);
        } else {
            log::warn!("giving up on {address} at {phase:?}, retrying next round");
            self.finish_device(now);
        }
    }

    fn finish_device(&mut self, now: Instant) {
        self.supervisor.scanning = None;
        if self.supervisor.scan_queue.is_empty() {
            self.become_operational();
        } else {
            self.supervisor.next_scan_at = Some(now + self.config.enumeration_delay());
        }
    }

    fn become_operational(&mut self) {
        if self.state() == MasterState::Scanning {
            self.set_state(MasterState::Operational);
            self.emit(EventKind::Operational);
        }
    }
}
