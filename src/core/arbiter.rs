use serde::Serialize;

use crate::protocol::{address::DeviceAddress, command::Command, operation::Operation};

/// Ownership of the shared bus as seen from the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BusState {
    Free,
    /// The master and `peer` hold the bus.
    LockedByThis { peer: DeviceAddress },
    /// Two other parties hold the bus.
    LockedByOther {
        holder: DeviceAddress,
        peer: DeviceAddress,
    },
}

/// Tracks BUSLOCK/BUSUNLOCK traffic and filters frames that belong to a
/// conversation the master is not part of.
#[derive(Debug)]
pub struct BusArbiter {
    master: DeviceAddress,
    state: BusState,
}

impl BusArbiter {
    pub fn new(master: DeviceAddress) -> Self {
        Self {
            master,
            state: BusState::Free,
        }
    }

    pub fn state(&self) -> BusState {
        self.state
    }

    /// True for frames sent to the master itself or to its bus broadcast.
    pub fn is_for_master(&self, destination: DeviceAddress) -> bool {
        destination == self.master || destination == DeviceAddress::broadcast(self.master.bus)
    }

    /// Update the lock state from a received frame. Returns true when the
    /// frame was a lock command.
    pub fn observe(&mut self, op: &Operation) -> bool {
        match op.command() {
            Command::BusLock => {
                self.state = if self.is_for_master(op.destination) {
                    BusState::LockedByThis { peer: op.source }
                } else {
                    BusState::LockedByOther {
                        holder: op.source,
                        peer: op.destination,
                    }
                };
                log::debug!("bus {:?} after lock from {}", self.state, op.source);
                true
            }
            Command::BusUnlock => {
                self.state = BusState::Free;
                log::debug!("bus released by {}", op.source);
                true
            }
            _ => false,
        }
    }

    /// Update the lock state from a frame the master transmitted.
    pub fn on_sent(&mut self, op: &Operation) {
        match op.command() {
            Command::BusLock => {
                self.state = BusState::LockedByThis {
                    peer: op.destination,
                }
            }
            Command::BusUnlock => self.state = BusState::Free,
            _ => {}
        }
    }

    /// While two other parties hold the bus their traffic is not ours.
    pub fn should_ignore(&self, op: &Operation) -> bool {
        match self.state {
            BusState::LockedByOther { .. } => {
                op.source != self.master && !self.is_for_master(op.destination)
            }
            _ => false,
        }
    }

    pub fn is_locked_with(&self, address: DeviceAddress) -> bool {
        matches!(self.state, BusState::LockedByThis { peer } if peer == address)
    }
}
