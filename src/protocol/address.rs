use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::HbusError;

/// Highest device number a bus can hold.
pub const MAX_DEV_NUMBER: u8 = 32;
/// Device number used for broadcasts and by devices that have no address yet.
pub const BROADCAST_DEV: u8 = 255;
/// Device number reserved for the master itself.
pub const MASTER_DEV: u8 = 0;
/// Bus number reserved for synthetic devices provided by plugins.
pub const VIRTUAL_BUS: u8 = 254;

/// Whether a device number byte may appear on the wire.
pub fn is_legal_dev_number(dev: u8) -> bool {
    dev <= MAX_DEV_NUMBER || dev == BROADCAST_DEV
}

/// `(bus, dev)` pair identifying a node on the HBUS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawAddress")]
pub struct DeviceAddress {
    pub bus: u8,
    pub dev: u8,
}

/// Unchecked wire/config form, validated through `DeviceAddress::new`.
#[derive(Deserialize)]
struct RawAddress {
    bus: u8,
    dev: u8,
}

impl TryFrom<RawAddress> for DeviceAddress {
    type Error = HbusError;

    fn try_from(raw: RawAddress) -> Result<Self, Self::Error> {
        DeviceAddress::new(raw.bus, raw.dev)
    }
}

impl DeviceAddress {
    /// Build an address, rejecting device numbers outside `[0, 32] ∪ {255}`.
    pub fn new(bus: u8, dev: u8) -> Result<Self, HbusError> {
        if !is_legal_dev_number(dev) {
            return Err(HbusError::InvalidAddress { bus, dev });
        }
        Ok(Self { bus, dev })
    }

    pub const fn master(bus: u8) -> Self {
        Self {
            bus,
            dev: MASTER_DEV,
        }
    }

    pub const fn broadcast(bus: u8) -> Self {
        Self {
            bus,
            dev: BROADCAST_DEV,
        }
    }

    /// Registry key: `bus * 32 + dev`.
    ///
    /// Device numbers are bounded to 32 for registered devices, so the key is
    /// unique per address (`dev == 32` of one bus and `dev == 0` of the next
    /// never coexist in the registry because device 0 is the master).
    pub fn global_id(&self) -> u32 {
        self.bus as u32 * 32 + self.dev as u32
    }

    pub fn is_broadcast(&self) -> bool {
        self.dev == BROADCAST_DEV
    }

    pub fn is_virtual(&self) -> bool {
        self.bus == VIRTUAL_BUS
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}:{})", self.bus, self.dev)
    }
}

impl std::str::FromStr for DeviceAddress {
    type Err = HbusError;

    /// Parses the human form `(bus:dev)`; the parentheses are optional.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let inner = s.trim().trim_start_matches('(').trim_end_matches(')');
        let (bus, dev) = inner.split_once(':').ok_or_else(|| HbusError::ValueFormat {
            reason: format!("address '{s}' is not in (bus:dev) form"),
        })?;
        let parse = |part: &str| {
            part.trim().parse::<u8>().map_err(|_| HbusError::ValueFormat {
                reason: format!("address '{s}' has a non numeric component"),
            })
        };
        DeviceAddress::new(parse(bus)?, parse(dev)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn global_id_is_injective_for_device_addresses() {
        let mut seen = HashSet::new();
        for bus in 0..=255u8 {
            for dev in 1..=MAX_DEV_NUMBER {
                let addr = DeviceAddress::new(bus, dev).unwrap();
                // dev 32 of bus n and dev 0 of bus n+1 share a key, but dev 0 is
                // never a registered device, so registered keys stay unique
                assert!(seen.insert(addr.global_id()), "collision for {addr}");
            }
        }
    }

    #[test]
    fn rejects_illegal_device_numbers() {
        assert!(DeviceAddress::new(0, 33).is_err());
        assert!(DeviceAddress::new(0, 254).is_err());
        assert!(DeviceAddress::new(0, 255).is_ok());
        assert!(DeviceAddress::new(3, 0).is_ok());
    }

    #[test]
    fn deserializing_checks_the_device_number() {
        let addr: DeviceAddress = serde_json::from_str(r#"{"bus":0,"dev":7}"#).unwrap();
        assert_eq!(addr, DeviceAddress::new(0, 7).unwrap());
        let err = serde_json::from_str::<DeviceAddress>(r#"{"bus":0,"dev":40}"#).unwrap_err();
        assert!(err.to_string().contains("illegal address (0:40)"));
    }

    #[test]
    fn human_form_round_trips() {
        let addr = DeviceAddress::new(1, 12).unwrap();
        assert_eq!(addr.to_string(), "(1:12)");
        assert_eq!("(1:12)".parse::<DeviceAddress>().unwrap(), addr);
        assert_eq!("1:12".parse::<DeviceAddress>().unwrap(), addr);
        assert!("(1-12)".parse::<DeviceAddress>().is_err());
        assert!("(1:40)".parse::<DeviceAddress>().is_err());
    }
}
