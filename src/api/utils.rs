use anyhow::{anyhow, Result};
use std::time::Duration;

use crate::protocol::{address::VIRTUAL_BUS, transport::SerialConfig};

/// Open a serial port with the requested timeout, enabling exclusive access on Unix systems.
pub fn open_serial_port(
    port: &str,
    config: &SerialConfig,
    timeout: Duration,
) -> Result<Box<dyn serialport::SerialPort>> {
    if port.is_empty() {
        return Err(anyhow!("No serial port given"));
    }

    let builder = config.apply_builder(serialport::new(port, config.baud).timeout(timeout));

    #[cfg(unix)]
    {
        let mut handle = builder
            .open_native()
            .map_err(|err| anyhow!("Failed to open port {port}: {err}"))?;
        handle
            .set_exclusive(true)
            .map_err(|err| anyhow!("Failed to acquire exclusive access to {port}: {err}"))?;
        Ok(Box::new(handle))
    }

    #[cfg(not(unix))]
    {
        builder
            .open()
            .map_err(|err| anyhow!("Failed to open port {port}: {err}"))
    }
}

/// Serial ports present on this machine, sorted by name.
pub fn available_ports() -> Result<Vec<String>> {
    let mut names: Vec<String> = serialport::available_ports()
        .map_err(|err| anyhow!("Failed to enumerate serial ports: {err}"))?
        .into_iter()
        .map(|info| info.port_name)
        .collect();
    names.sort();
    Ok(names)
}

/// Parse a bus number for real hardware; the virtual bus is not addressable
/// from the wire.
pub fn parse_bus_number(text: &str) -> Result<u8> {
    let bus: u8 = text
        .trim()
        .parse()
        .map_err(|err| anyhow!("Invalid bus number {text:?}: {err}"))?;
    if bus == VIRTUAL_BUS {
        return Err(anyhow!("Bus {VIRTUAL_BUS} is reserved for virtual devices"));
    }
    Ok(bus)
}
