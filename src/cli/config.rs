use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::{address::DeviceAddress, transport::SerialConfig};

/// Root configuration of a bus master
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Serial device path
    pub port_name: String,
    /// Port speed
    pub baud_rate: u32,
    /// Bus number the master lives on
    pub bus_number: u8,
    /// Length of a discovery round in milliseconds
    pub search_round_ms: u64,
    /// Seconds between supervisor passes
    pub supervise_interval_s: u64,
    /// Consecutive failed pings before a device is evicted
    pub ping_retries: u8,
    /// Retries per enumeration step
    pub scan_retries: u8,
    /// Reply deadline in milliseconds
    pub response_timeout_ms: u64,
    /// Inter-byte stall timeout of the frame decoder in milliseconds
    pub byte_timeout_ms: u64,
    /// Pause between enumerating two devices in milliseconds
    pub enumeration_delay_ms: u64,
    /// Pre-configured devices that are never evicted
    pub static_devices: Vec<DeviceAddress>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 100_000,
            bus_number: 0,
            search_round_ms: 5000,
            supervise_interval_s: 300,
            ping_retries: 3,
            scan_retries: 3,
            response_timeout_ms: 1000,
            byte_timeout_ms: 200,
            enumeration_delay_ms: 100,
            static_devices: Vec::new(),
        }
    }
}

impl MasterConfig {
    /// Parse configuration from a JSON string
    pub fn from_json(json_str: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json_str)
    }

    /// Read configuration from a file
    pub fn from_file(file_path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(file_path)?;
        Self::from_json(&content).map_err(|e| e.into())
    }

    /// Convert to a JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn serial(&self) -> SerialConfig {
        SerialConfig {
            baud: self.baud_rate,
            ..SerialConfig::default()
        }
    }

    pub fn search_round(&self) -> Duration {
        Duration::from_millis(self.search_round_ms)
    }

    pub fn supervise_interval(&self) -> Duration {
        Duration::from_secs(self.supervise_interval_s)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn byte_timeout(&self) -> Duration {
        Duration::from_millis(self.byte_timeout_ms)
    }

    pub fn enumeration_delay(&self) -> Duration {
        Duration::from_millis(self.enumeration_delay_ms)
    }
}
