use anyhow::{anyhow, Result};
use clap::ArgMatches;
use serde::Serialize;

use crate::{
    api::{
        traits::{forward_events, LoggingHandler},
        utils::available_ports,
        MasterHandle,
    },
    cli::build_config,
    core::{bus::EventKind, device::Device, master::Master},
    protocol::{
        simulator::{SimulatedBus, SimulatedObject, SimulatedSlave},
        transport::{SerialTransport, Transport},
        value::subtype,
    },
};

#[derive(Serialize)]
struct PortList {
    ports: Vec<String>,
}

/// Print the serial ports of this machine as JSON.
pub fn list_ports() -> Result<()> {
    let list = PortList {
        ports: available_ports()?,
    };
    println!("{}", serde_json::to_string_pretty(&list)?);
    Ok(())
}

/// Run the master described by the command line until interrupted.
pub async fn run(matches: &ArgMatches) -> Result<()> {
    let config = build_config(matches)?;
    let list_devices = matches.get_flag("list-devices");

    match matches.get_one::<u8>("simulate") {
        Some(&count) => {
            log::info!("Running against {count} simulated devices");
            let bus = demo_bus(config.bus_number, count);
            drive(Master::new(config, bus), list_devices).await
        }
        None => {
            if config.port_name.is_empty() {
                return Err(anyhow!("Either --port or --simulate is required"));
            }
            let transport = SerialTransport::new(config.port_name.clone(), config.serial());
            drive(Master::new(config, transport), list_devices).await
        }
    }
}

async fn drive<T: Transport + 'static>(master: Master<T>, list_devices: bool) -> Result<()> {
    let (handle, task) = MasterHandle::spawn(master);
    let events = handle.subscribe().await?;

    if list_devices {
        while let Ok(event) = events.recv_async().await {
            if event.kind == EventKind::Operational {
                let devices = handle.devices().await?;
                println!("{}", devices_json(&devices)?);
                break;
            }
        }
    } else {
        let forwarder = tokio::spawn(forward_events(events, LoggingHandler));
        tokio::signal::ctrl_c().await?;
        log::info!("Interrupted, shutting down");
        forwarder.abort();
    }

    // the engine may already have stopped on its own
    let _ = handle.shutdown();
    task.await.map_err(|err| anyhow!("Master task panicked: {err}"))?
}

pub fn devices_json(devices: &[Device]) -> Result<String> {
    Ok(serde_json::to_string_pretty(devices)?)
}

/// A bus of `count` demo devices cycling through a lamp, a thermometer and a
/// relay board.
pub fn demo_bus(bus_number: u8, count: u8) -> SimulatedBus {
    let bus = SimulatedBus::new(bus_number);
    for index in 0..count {
        let uid = 0x4842_0000 | index as u32;
        let slave = match index % 3 {
            0 => SimulatedSlave::new(uid, 0, "Dimmable lamp")
                .with_object(SimulatedObject::new(0x13, 2, subtype::UINT_LIN_PERCENT, "Brightness", vec![0, 60]))
                .with_object(SimulatedObject::new(0x19, 2, 0, "1:MIN", vec![0, 10]))
                .with_object(SimulatedObject::new(0x19, 2, 0, "1:MAX", vec![0, 110])),
            1 => SimulatedSlave::new(uid, 0x04, "Thermometer")
                .with_object(SimulatedObject::new(0x21, 2, 0x02, "Temperature", vec![0x09, 0x1A]))
                .with_object(SimulatedObject::new(0x39, 4, 0, "1:UNIT", b"C\0\0\0".to_vec()))
                .with_interrupt(0x01, "Over temperature"),
            _ => SimulatedSlave::new(uid, 0x02, "Relay board")
                .with_object(SimulatedObject::new(0x33, 1, subtype::BYTE_BOOL, "Relay 1", vec![0]))
                .with_object(SimulatedObject::new(0x33, 1, subtype::BYTE_BOOL, "Relay 2", vec![1]))
                .with_endpoint(0x01, 32, "Event log"),
        };
        bus.add_slave(slave);
    }
    bus
}
