use anyhow::{anyhow, Result};
use bytes::Bytes;
use flume::{Receiver, Sender};
use std::{
    io::{Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use serialport::{DataBits, SerialPort, StopBits};

/// Byte-level link between the master engine and the bus.
///
/// The engine consumes the receiver returned by `connect` and feeds every
/// chunk into `Master::on_bytes`.
pub trait Transport: Send {
    /// Open the link and return the stream of received byte chunks.
    fn connect(&mut self) -> Result<Receiver<Bytes>>;

    /// Transmit one encoded frame.
    fn write(&mut self, bytes: &[u8]) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    pub baud: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: serialport::Parity,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud: 100_000,
            data_bits: 8,
            stop_bits: 1,
            parity: serialport::Parity::None,
        }
    }
}

impl SerialConfig {
    pub fn apply_builder(&self, b: serialport::SerialPortBuilder) -> serialport::SerialPortBuilder {
        let b = b.data_bits(match self.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        });
        let b = b.stop_bits(match self.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        });
        b.parity(self.parity)
    }
}

type SharedPort = Arc<Mutex<Box<dyn SerialPort>>>;

/// Serial port adapter: a reader thread forwards received chunks, writes go
/// straight to the port.
pub struct SerialTransport {
    port_name: String,
    config: SerialConfig,
    port: Option<SharedPort>,
    running: Arc<AtomicBool>,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("port_name", &self.port_name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SerialTransport {
    pub fn new(port_name: impl Into<String>, config: SerialConfig) -> Self {
        Self {
            port_name: port_name.into(),
            config,
            port: None,
            running: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Transport for SerialTransport {
    fn connect(&mut self) -> Result<Receiver<Bytes>> {
        let handle = crate::api::utils::open_serial_port(
            &self.port_name,
            &self.config,
            Duration::from_millis(5),
        )?;
        let port: SharedPort = Arc::new(Mutex::new(handle));
        let (tx, rx) = flume::unbounded();

        self.running.store(true, Ordering::Release);
        let reader_port = Arc::clone(&port);
        let running = Arc::clone(&self.running);
        let port_name = self.port_name.clone();
        thread::spawn(move || read_loop(reader_port, port_name, running, tx));

        self.port = Some(port);
        log::info!("Opened {} at {} baud", self.port_name, self.config.baud);
        Ok(rx)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let port = self
            .port
            .as_ref()
            .ok_or_else(|| anyhow!("{} is not connected", self.port_name))?;
        let mut guard = port
            .lock()
            .map_err(|e| anyhow!("Failed to lock {}: {e}", self.port_name))?;
        guard.write_all(bytes)?;
        guard.flush()?;
        Ok(())
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

fn read_loop(port: SharedPort, port_name: String, running: Arc<AtomicBool>, tx: Sender<Bytes>) {
    let mut buf = [0u8; 256];
    while running.load(Ordering::Acquire) {
        let read = match port.lock() {
            Ok(mut g) => g.read(&mut buf),
            Err(_) => {
                log::error!("Serial port mutex for {port_name} poisoned, stopping reader");
                return;
            }
        };
        match read {
            Ok(n) if n > 0 => {
                if tx.send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    return;
                }
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                log::warn!("Read error on {port_name}: {e}");
                thread::sleep(Duration::from_millis(50));
            }
        }
        thread::sleep(Duration::from_millis(1));
    }
    log::debug!("Reader for {port_name} stopped");
}
