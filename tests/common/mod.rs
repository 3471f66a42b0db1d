#![allow(dead_code)]

use bytes::Bytes;
use flume::Receiver;
use std::time::{Duration, Instant};

use hbus::{
    cli::config::MasterConfig,
    core::{
        bus::{EventKind, MasterEvent},
        master::{Master, MasterState},
    },
    protocol::{
        address::DeviceAddress,
        simulator::{SimulatedBus, SimulatedObject, SimulatedSlave},
        value::subtype,
    },
};

pub const STEP: Duration = Duration::from_millis(10);

/// Engine wired to a simulated bus, driven by a manual clock.
pub struct Harness {
    pub master: Master<SimulatedBus>,
    pub bus: SimulatedBus,
    pub inbound: Receiver<Bytes>,
    pub events: Receiver<MasterEvent>,
    pub now: Instant,
}

impl Harness {
    pub fn start(master: Master<SimulatedBus>, bus: SimulatedBus) -> Self {
        let mut master = master;
        let events = master.subscribe();
        let now = Instant::now();
        let inbound = master.start(now).expect("simulated bus connects");
        let mut harness = Self {
            master,
            bus,
            inbound,
            events,
            now,
        };
        harness.pump();
        harness
    }

    pub fn with_slaves(config: MasterConfig, slaves: Vec<SimulatedSlave>) -> Self {
        let bus = SimulatedBus::new(config.bus_number);
        for slave in slaves {
            bus.add_slave(slave);
        }
        Self::start(Master::new(config, bus.clone()), bus)
    }

    /// Feed everything the bus has produced so far.
    pub fn pump(&mut self) {
        while let Ok(chunk) = self.inbound.try_recv() {
            self.master.on_bytes(&chunk, self.now);
        }
    }

    pub fn advance(&mut self, duration: Duration) {
        let end = self.now + duration;
        while self.now < end {
            self.now += STEP;
            self.master.tick(self.now);
            self.pump();
        }
    }

    /// Advance until the master reports `state`, up to `limit`.
    pub fn run_until(&mut self, state: MasterState, limit: Duration) -> bool {
        let end = self.now + limit;
        while self.now < end {
            if self.master.state() == state {
                return true;
            }
            self.advance(STEP);
        }
        self.master.state() == state
    }

    pub fn drain_events(&self) -> Vec<EventKind> {
        self.events.try_iter().map(|event| event.kind).collect()
    }
}

pub fn fast_config() -> MasterConfig {
    MasterConfig {
        search_round_ms: 200,
        response_timeout_ms: 100,
        enumeration_delay_ms: 20,
        supervise_interval_s: 5,
        ..MasterConfig::default()
    }
}

pub fn dev(n: u8) -> DeviceAddress {
    DeviceAddress::new(0, n).unwrap()
}

/// Lamp with a linear-percent brightness bounded by hidden MIN/MAX objects.
pub fn lamp(uid: u32) -> SimulatedSlave {
    SimulatedSlave::new(uid, 0, "Lamp")
        .with_object(SimulatedObject::new(
            0x13,
            2,
            subtype::UINT_LIN_PERCENT,
            "Brightness",
            vec![0, 60],
        ))
        .with_object(SimulatedObject::new(0x19, 2, 0, "1:MIN", vec![0, 10]))
        .with_object(SimulatedObject::new(0x19, 2, 0, "1:MAX", vec![0, 110]))
}

/// Relay board with a write-only pulse object, an endpoint and an interrupt.
pub fn relay_board(uid: u32) -> SimulatedSlave {
    SimulatedSlave::new(uid, 0x06, "Relays")
        .with_object(SimulatedObject::new(
            0x33,
            1,
            subtype::BYTE_BOOL,
            "Relay",
            vec![1],
        ))
        .with_object(SimulatedObject::new(0x32, 1, subtype::BYTE_HEX, "Pulse", vec![0]))
        .with_endpoint(0x01, 16, "Log")
        .with_interrupt(0x00, "Contact")
}
