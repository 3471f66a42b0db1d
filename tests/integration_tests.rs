mod common;

use std::{sync::Arc, time::Duration};

use common::{dev, fast_config, lamp, relay_board, Harness};
use hbus::{
    api::traits::{Plugin, Signer},
    cli::config::MasterConfig,
    core::{
        arbiter::BusState,
        bus::EventKind,
        device::{capability, Device, DeviceObject},
        enumeration::EnumerationPhase,
        master::{Master, MasterState},
    },
    protocol::{
        address::DeviceAddress,
        command::Command,
        error::HbusError,
        operation::{Instruction, Operation},
        simulator::{SimulatedBus, SimulatedObject, SimulatedSlave},
    },
};

#[test]
fn test_discovery_and_enumeration_reach_operational() {
    let mut h = Harness::with_slaves(fast_config(), vec![lamp(0xA1), relay_board(0xB2)]);

    // both devices are addressed inside the first round
    assert_eq!(h.master.state(), MasterState::Searching);
    assert_eq!(h.master.device(dev(1)).unwrap().uid, 0xA1);
    assert_eq!(h.master.device(dev(2)).unwrap().uid, 0xB2);

    assert!(h.run_until(MasterState::Operational, Duration::from_secs(3)));

    let lamp = h.master.device(dev(1)).unwrap();
    assert!(lamp.basic_retrieved && lamp.extended_retrieved);
    assert_eq!(lamp.description, "Lamp");
    assert_eq!(lamp.objects.len(), 1);
    assert_eq!(lamp.hidden_objects.len(), 2);
    let brightness = &lamp.objects[&1];
    assert_eq!(brightness.extended.min, Some(10));
    assert_eq!(brightness.extended.max, Some(110));

    let relays = h.master.device(dev(2)).unwrap();
    assert_eq!(relays.endpoints[&0].block_size, 16);
    assert_eq!(relays.interrupts[&0].description, "Contact");
    assert!(relays.has_capability(capability::EPSUP));

    let events = h.drain_events();
    assert_eq!(events.first(), Some(&EventKind::Started));
    assert_eq!(events.last(), Some(&EventKind::Operational));
    let added: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            EventKind::DeviceAdded { address, .. } => Some(*address),
            _ => None,
        })
        .collect();
    assert_eq!(added, vec![dev(1), dev(2)]);
    assert_eq!(h.bus.with_slave(1, |s| s.address()), Some(dev(2)));
}

#[test]
fn test_addressing_sends_getch_then_search_and_unlock() {
    let mut h = Harness::with_slaves(fast_config(), vec![lamp(0x77)]);
    let sent: Vec<_> = h
        .bus
        .sent()
        .into_iter()
        .map(|op| (op.command(), op.destination))
        .collect();
    let broadcast = DeviceAddress::broadcast(0);
    assert_eq!(
        sent,
        vec![
            (Command::Search, broadcast),
            (Command::GetCh, broadcast),
            (Command::Search, dev(1)),
            (Command::BusUnlock, dev(1)),
        ]
    );
    assert_eq!(h.master.bus_state(), BusState::Free);
    // addressing frames register no pending answers
    assert_eq!(h.master.pending_count(), 0);
    h.advance(Duration::from_millis(50));
    assert_eq!(h.master.state(), MasterState::Searching);
}

#[test]
fn test_addressing_timeout_releases_the_bus() {
    let bus = SimulatedBus::new(0);
    let mut h = Harness::start(Master::new(fast_config(), bus.clone()), bus);
    let broadcast = DeviceAddress::broadcast(0);

    // a device locks the bus and then goes silent
    h.bus.inject(&Operation::new(
        broadcast,
        broadcast,
        Instruction::bare(Command::BusLock).unwrap(),
    ));
    h.pump();
    assert_eq!(h.master.state(), MasterState::Addressing);
    assert_eq!(h.master.bus_state(), BusState::LockedByThis { peer: broadcast });

    // the round deadline passes while addressing; the round waits for it
    h.advance(Duration::from_millis(150));
    let last = h.bus.sent().last().cloned().unwrap();
    assert_eq!(last.command(), Command::BusUnlock);
    assert_eq!(last.destination, broadcast);
    assert_eq!(h.master.bus_state(), BusState::Free);
    assert_eq!(h.master.state(), MasterState::Searching);

    assert!(h.run_until(MasterState::Operational, Duration::from_secs(1)));
    assert!(h.master.devices().is_empty());
}

#[test]
fn test_foreign_lock_hides_unrelated_traffic() {
    let mut h = Harness::with_slaves(fast_config(), vec![lamp(1)]);
    assert!(h.run_until(MasterState::Operational, Duration::from_secs(2)));
    h.drain_events();

    let a = dev(1);
    let b = dev(9);
    h.bus
        .inject(&Operation::new(a, b, Instruction::bare(Command::BusLock).unwrap()));
    h.pump();
    assert_eq!(
        h.master.bus_state(),
        BusState::LockedByOther { holder: a, peer: b }
    );

    // INT meant for b is ignored while the two hold the bus
    h.bus.inject(&Operation::new(
        a,
        b,
        Instruction::new(Command::Int, vec![0]).unwrap(),
    ));
    h.pump();
    assert!(h.drain_events().is_empty());

    h.bus
        .inject(&Operation::new(a, b, Instruction::bare(Command::BusUnlock).unwrap()));
    h.pump();
    assert_eq!(h.master.bus_state(), BusState::Free);
}

#[test]
fn test_percent_linear_read_and_write() {
    let mut h = Harness::with_slaves(fast_config(), vec![lamp(0x10)]);
    assert!(h.run_until(MasterState::Operational, Duration::from_secs(2)));

    let (tx, rx) = oneshot::channel();
    h.master.read_object(dev(1), 1, tx, h.now);
    h.pump();
    assert_eq!(rx.try_recv().unwrap().unwrap(), vec![0, 60]);

    let object = h.master.object(dev(1), 1).unwrap().clone();
    assert_eq!(object.formatted_value().as_deref(), Some("50.00%"));

    let raw = object.decode("75%").unwrap();
    assert_eq!(raw, vec![0, 85]);
    h.master.write_object(dev(1), 1, &raw, h.now).unwrap();
    let setch = h.bus.sent().last().cloned().unwrap();
    assert_eq!(setch.command(), Command::SetCh);
    assert_eq!(setch.params(), &[1, 0, 85]);
    assert_eq!(h.bus.with_slave(0, |s| s.object_value(1).map(<[u8]>::to_vec)), Some(vec![0, 85]));
}

#[test]
fn test_permission_violations_stay_local() {
    let mut h = Harness::with_slaves(fast_config(), vec![relay_board(0x20)]);
    assert!(h.run_until(MasterState::Operational, Duration::from_secs(2)));
    let before = h.bus.sent().len();

    let (tx, rx) = oneshot::channel();
    h.master.read_object(dev(1), 2, tx, h.now);
    assert_eq!(
        rx.try_recv().unwrap(),
        Err(HbusError::WriteOnly {
            address: dev(1),
            object: 2
        })
    );

    let mut dimmer = Harness::with_slaves(fast_config(), vec![lamp(0x21)]);
    assert!(dimmer.run_until(MasterState::Operational, Duration::from_secs(2)));
    let dimmer_before = dimmer.bus.sent().len();
    // hidden MIN object is read only
    let err = dimmer.master.write_object(dev(1), 2, &[0, 1], dimmer.now);
    assert_eq!(
        err,
        Err(HbusError::ReadOnly {
            address: dev(1),
            object: 2
        })
    );
    assert_eq!(dimmer.bus.sent().len(), dimmer_before);

    assert_eq!(
        h.master.write_object(dev(7), 1, &[1], h.now),
        Err(HbusError::UnknownDevice { address: dev(7) })
    );
    assert_eq!(h.bus.sent().len(), before);
}

#[test]
fn test_pending_answers_match_fifo_and_expire() {
    let mut h = Harness::with_slaves(fast_config(), vec![lamp(0x30)]);
    assert!(h.run_until(MasterState::Operational, Duration::from_secs(2)));
    h.bus.with_slave(0, |s| s.online = false);

    let (first_tx, first) = oneshot::channel();
    let (second_tx, second) = oneshot::channel();
    h.master.read_object(dev(1), 1, first_tx, h.now);
    h.master.read_object(dev(1), 1, second_tx, h.now);
    assert_eq!(h.master.pending_count(), 2);

    let reply = |value: u8| {
        Operation::new(
            dev(1),
            DeviceAddress::master(0),
            Instruction::new(Command::Response, vec![1, 0, value]).unwrap(),
        )
    };
    h.bus.inject(&reply(7));
    h.pump();
    assert_eq!(first.try_recv().unwrap().unwrap(), vec![0, 7]);
    assert!(second.try_recv().is_err());
    assert_eq!(h.master.pending_count(), 1);

    // no reply for the second read: it times out and is removed
    h.advance(Duration::from_millis(120));
    assert!(matches!(
        second.try_recv().unwrap(),
        Err(HbusError::ResponseTimeout { .. })
    ));
    assert_eq!(h.master.pending_count(), 0);

    // a late reply matches nothing and changes nothing
    h.bus.inject(&reply(9));
    h.pump();
    assert_eq!(
        h.master.object(dev(1), 1).unwrap().last_value,
        Some(vec![0, 7])
    );
    assert_eq!(h.master.state(), MasterState::Operational);
}

#[test]
fn test_unresponsive_device_is_evicted_but_static_device_kept() {
    let config = MasterConfig {
        static_devices: vec![dev(5)],
        ..fast_config()
    };
    let mut h = Harness::with_slaves(
        config,
        vec![
            lamp(0x40),
            relay_board(0x41).preaddressed(dev(5)),
        ],
    );
    assert!(h.run_until(MasterState::Operational, Duration::from_secs(3)));
    assert!(h.master.device(dev(1)).is_some());
    let static_device = h.master.device(dev(5)).unwrap();
    assert!(static_device.is_static);
    assert_eq!(static_device.uid, 0x41);
    h.drain_events();

    h.bus.with_slave(0, |s| s.online = false);
    h.bus.with_slave(1, |s| s.online = false);
    h.bus.take_sent();

    // next periodic check: round, then three failed pings per device
    assert!(h.run_until(MasterState::Checking, Duration::from_secs(6)));
    assert!(h.run_until(MasterState::Operational, Duration::from_secs(3)));

    let pings = |address| {
        h.bus
            .sent()
            .iter()
            .filter(|op| op.command() == Command::Search && op.destination == address)
            .count()
    };
    assert_eq!(pings(dev(1)), 3);
    assert_eq!(pings(dev(5)), 3);
    assert!(h.master.device(dev(1)).is_none());
    assert!(h.master.device(dev(5)).is_some());
    assert_eq!(
        h.drain_events(),
        vec![
            EventKind::DeviceKicked {
                address: dev(1),
                uid: 0x40
            },
            EventKind::Operational
        ]
    );
}

#[test]
fn test_missed_pings_below_the_limit_do_not_evict() {
    let mut h = Harness::with_slaves(fast_config(), vec![lamp(0x50)]);
    assert!(h.run_until(MasterState::Operational, Duration::from_secs(2)));
    assert!(h.master.discover(h.now));

    // misses the first ping and its immediate retry, answers the third
    h.bus.with_slave(0, |s| s.online = false);
    assert!(h.run_until(MasterState::Checking, Duration::from_secs(1)));
    h.advance(Duration::from_millis(110));
    h.bus.with_slave(0, |s| s.online = true);

    assert!(h.run_until(MasterState::Operational, Duration::from_secs(2)));
    let device = h.master.device(dev(1)).unwrap();
    assert_eq!(device.ping_retries, 0);
}

#[test]
fn test_interrupt_emits_event_and_restores_state() {
    let mut h = Harness::with_slaves(fast_config(), vec![relay_board(0x60)]);
    assert!(h.run_until(MasterState::Operational, Duration::from_secs(2)));
    h.drain_events();

    h.bus.inject(&Operation::new(
        dev(1),
        DeviceAddress::master(0),
        Instruction::new(Command::Int, vec![0, 0xAB]).unwrap(),
    ));
    h.pump();
    assert_eq!(
        h.drain_events(),
        vec![EventKind::Interruption {
            address: dev(1),
            params: vec![0, 0xAB]
        }]
    );
    assert_eq!(h.master.state(), MasterState::Operational);
}

#[test]
fn test_enumeration_retries_then_leaves_device_for_next_round() {
    // object 1 reports a size no object can have, so its QUERY step always fails
    let broken = SimulatedSlave::new(0x70, 0, "Broken")
        .with_object(SimulatedObject::new(0x13, 9, 0, "Oversized", vec![0; 9]));
    let mut h = Harness::with_slaves(fast_config(), vec![broken]);
    assert!(h.run_until(MasterState::Operational, Duration::from_secs(2)));

    let queries = h
        .bus
        .sent()
        .iter()
        .filter(|op| {
            op.command() == Command::Query && op.destination == dev(1) && op.params() == [1]
        })
        .count();
    // one attempt plus three retries of the same step
    assert_eq!(queries, 4);

    let device = h.master.device(dev(1)).unwrap();
    assert!(device.basic_retrieved);
    assert!(!device.extended_retrieved);
    assert_eq!(device.description, "Broken");
    assert_eq!(device.enumeration, EnumerationPhase::Objects(1));
    assert_eq!(device.scan_retries, 0);
}

#[test]
fn test_soft_reset_and_address_reuse() {
    let mut h = Harness::with_slaves(fast_config(), vec![lamp(0x80), lamp(0x81)]);
    assert!(h.run_until(MasterState::Operational, Duration::from_secs(3)));

    h.master.soft_reset(dev(1), h.now).unwrap();
    assert!(h.master.device(dev(1)).is_none());
    let reset = h.bus.sent().last().cloned().unwrap();
    assert_eq!(reset.command(), Command::SoftReset);
    assert_eq!(reset.destination, dev(1));
    assert!(reset.params().is_empty());
    assert_eq!(h.bus.with_slave(0, |s| s.address()), None);

    // a newcomer must not take the remembered address of the reset device
    h.bus.with_slave(0, |s| s.online = false);
    h.bus.add_slave(lamp(0x82));
    assert!(h.master.discover(h.now));
    h.pump();
    assert_eq!(h.master.device(dev(3)).unwrap().uid, 0x82);
    assert!(h.run_until(MasterState::Operational, Duration::from_secs(3)));

    h.bus.with_slave(0, |s| s.online = true);
    assert!(h.master.discover(h.now));
    h.pump();
    assert_eq!(h.master.device(dev(1)).unwrap().uid, 0x80);
}

struct TestSigner;

impl Signer for TestSigner {
    fn public_key(&self) -> Vec<u8> {
        vec![0xC0, 0xFF, 0xEE]
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        let sum = message.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        vec![sum, !sum]
    }

    fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        self.sign(message) == signature
    }

    fn signature_len(&self) -> usize {
        2
    }
}

#[test]
fn test_authenticated_enrollment_and_crypto_objects() {
    let bus = SimulatedBus::new(0);
    let caps = capability::AUTHSUP | capability::REVAUTHSUP | capability::CRYPTOSUP;
    bus.add_slave(
        SimulatedSlave::new(0x90, caps, "Lock")
            .with_object(SimulatedObject::new(0x17, 1, 0, "Code", vec![3])),
    );
    let master = Master::new(fast_config(), bus.clone()).with_signer(Arc::new(TestSigner));
    let mut h = Harness::start(master, bus);

    assert!(h.bus.sent().iter().any(|op| op.command() == Command::KeySet));
    assert_eq!(
        h.bus.with_slave(0, |s| s.master_key.clone()),
        Some(vec![0xC0, 0xFF, 0xEE])
    );
    assert!(h.run_until(MasterState::Operational, Duration::from_secs(2)));

    h.master.write_object(dev(1), 1, &[9], h.now).unwrap();
    let setch = h.bus.sent().last().cloned().unwrap();
    let sum = 0u8.wrapping_add(1).wrapping_add(1).wrapping_add(9);
    assert_eq!(setch.params(), &[1, 9, sum, !sum]);
    assert_eq!(h.bus.with_slave(0, |s| s.object_value(1).map(<[u8]>::to_vec)), Some(vec![9]));

    // the simulated device does not sign its answers
    let (tx, rx) = oneshot::channel();
    h.master.read_object(dev(1), 1, tx, h.now);
    h.pump();
    assert_eq!(
        rx.try_recv().unwrap(),
        Err(HbusError::AuthenticationFailed { address: dev(1) })
    );
}

struct Thermostat {
    setpoint: u8,
}

impl Plugin for Thermostat {
    fn name(&self) -> &str {
        "thermostat"
    }

    fn devices(&self) -> Vec<Device> {
        let address = DeviceAddress::new(254, 1).unwrap();
        let mut device = Device::new(address, 0xFEED, 0);
        device.description = "Virtual thermostat".to_string();
        device
            .objects
            .insert(1, DeviceObject::from_query(1, &[0x13, 1, 0, b'S']).unwrap());
        vec![device]
    }

    fn read_object(&mut self, _address: DeviceAddress, _object: u8) -> Result<Vec<u8>, HbusError> {
        Ok(vec![self.setpoint])
    }

    fn write_object(
        &mut self,
        _address: DeviceAddress,
        _object: u8,
        value: &[u8],
    ) -> Result<(), HbusError> {
        self.setpoint = value[0];
        Ok(())
    }
}

#[test]
fn test_virtual_devices_are_served_by_plugins() {
    let bus = SimulatedBus::new(0);
    let master = Master::new(fast_config(), bus.clone()).with_plugin(Box::new(Thermostat { setpoint: 21 }));
    let mut h = Harness::start(master, bus);
    let address = DeviceAddress::new(254, 1).unwrap();
    assert!(h.master.device(address).unwrap().is_virtual);

    assert!(h.run_until(MasterState::Operational, Duration::from_secs(1)));
    let before = h.bus.sent().len();

    h.master.write_object(address, 1, &[23], h.now).unwrap();
    let (tx, rx) = oneshot::channel();
    h.master.read_object(address, 1, tx, h.now);
    assert_eq!(rx.try_recv().unwrap().unwrap(), vec![23]);
    assert_eq!(h.bus.sent().len(), before);

    let events = h.drain_events();
    assert!(events.contains(&EventKind::DeviceAdded {
        address,
        uid: 0xFEED
    }));
}
