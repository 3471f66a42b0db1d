use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{
    core::enumeration::EnumerationPhase,
    protocol::{
        address::DeviceAddress,
        error::HbusError,
        value::{DataType, ExtendedInfo, Formatter},
    },
};

/// Device capability bits from GETCH object 0.
pub mod capability {
    pub const CRYPTOSUP: u8 = 0x01;
    pub const EPSUP: u8 = 0x02;
    pub const INTSUP: u8 = 0x04;
    pub const AUTHSUP: u8 = 0x08;
    pub const UCODESUP: u8 = 0x10;
    pub const REVAUTHSUP: u8 = 0x20;
}

/// Object permission bits.
pub mod permission {
    pub const READ: u8 = 0x01;
    pub const WRITE: u8 = 0x02;
}

const FLAG_CRYPTO: u8 = 0x04;
const FLAG_HIDDEN: u8 = 0x08;

/// Parsed GETCH object 0 reply: `[objCount, epCount, intCount, caps, uid(4, BE)]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSummary {
    pub object_count: u8,
    pub endpoint_count: u8,
    pub interrupt_count: u8,
    pub capabilities: u8,
    pub uid: u32,
}

impl DeviceSummary {
    pub fn parse(payload: &[u8]) -> Result<Self, HbusError> {
        if payload.len() < 8 {
            return Err(HbusError::MalformedFrame {
                reason: format!("device summary needs 8 bytes, got {}", payload.len()),
            });
        }
        Ok(Self {
            object_count: payload[0],
            endpoint_count: payload[1],
            interrupt_count: payload[2],
            capabilities: payload[3],
            uid: u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceObject {
    pub number: u8,
    pub permissions: u8,
    pub crypto: bool,
    pub hidden: bool,
    pub level: u8,
    pub data_type: DataType,
    pub subtype: u8,
    pub size: u8,
    pub description: String,
    pub last_value: Option<Vec<u8>>,
    pub extended: ExtendedInfo,
}

impl DeviceObject {
    /// Build from a QUERY_RESP payload `[flags, size, subtype, description...]`.
    pub fn from_query(number: u8, payload: &[u8]) -> Result<Self, HbusError> {
        let [flags, size, subtype, description @ ..] = payload else {
            return Err(HbusError::MalformedFrame {
                reason: format!("object {number} info too short ({} bytes)", payload.len()),
            });
        };
        if !(1..=4).contains(size) {
            return Err(HbusError::MalformedFrame {
                reason: format!("object {number} has size {size}, expected 1..=4"),
            });
        }
        Ok(Self {
            number,
            permissions: flags & 0x03,
            crypto: flags & FLAG_CRYPTO != 0,
            hidden: flags & FLAG_HIDDEN != 0,
            level: flags >> 6,
            data_type: DataType::from_bits(flags >> 4),
            subtype: *subtype,
            size: *size,
            description: String::from_utf8_lossy(description).into_owned(),
            last_value: None,
            extended: ExtendedInfo::default(),
        })
    }

    pub fn can_read(&self) -> bool {
        self.permissions & permission::READ != 0
    }

    pub fn can_write(&self) -> bool {
        self.permissions & permission::WRITE != 0
    }

    pub fn formatter(&self) -> Formatter {
        Formatter::for_type(self.data_type, self.subtype)
    }

    pub fn format(&self, raw: &[u8]) -> String {
        self.formatter().format(raw, &self.extended)
    }

    pub fn decode(&self, text: &str) -> Result<Vec<u8>, HbusError> {
        self.formatter()
            .decode(text, self.size as usize, &self.extended)
    }

    pub fn formatted_value(&self) -> Option<String> {
        self.last_value.as_deref().map(|raw| self.format(raw))
    }
}

/// A block-transfer channel declared by a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub number: u8,
    pub flags: u8,
    pub block_size: u8,
    pub description: String,
}

impl Endpoint {
    /// From a QUERY_RESP payload `[flags, blockSize, description...]`.
    pub fn from_query(number: u8, payload: &[u8]) -> Result<Self, HbusError> {
        let [flags, block_size, description @ ..] = payload else {
            return Err(HbusError::MalformedFrame {
                reason: format!("endpoint {number} info too short"),
            });
        };
        Ok(Self {
            number,
            flags: *flags,
            block_size: *block_size,
            description: String::from_utf8_lossy(description).into_owned(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interrupt {
    pub number: u8,
    pub flags: u8,
    pub description: String,
}

impl Interrupt {
    /// From a QUERY_RESP payload `[flags, description...]`.
    pub fn from_query(number: u8, payload: &[u8]) -> Result<Self, HbusError> {
        let [flags, description @ ..] = payload else {
            return Err(HbusError::MalformedFrame {
                reason: format!("interrupt {number} info too short"),
            });
        };
        Ok(Self {
            number,
            flags: *flags,
            description: String::from_utf8_lossy(description).into_owned(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub address: DeviceAddress,
    pub uid: u32,
    pub description: String,
    pub object_count: u8,
    pub endpoint_count: u8,
    pub interrupt_count: u8,
    pub capabilities: u8,
    pub basic_retrieved: bool,
    pub extended_retrieved: bool,
    pub objects: BTreeMap<u8, DeviceObject>,
    pub hidden_objects: BTreeMap<u8, DeviceObject>,
    pub endpoints: BTreeMap<u8, Endpoint>,
    pub interrupts: BTreeMap<u8, Interrupt>,
    #[serde(skip)]
    pub scan_retries: u8,
    #[serde(skip)]
    pub ping_retries: u8,
    pub is_virtual: bool,
    pub is_static: bool,
    #[serde(skip)]
    pub enumeration: EnumerationPhase,
}

impl Device {
    pub fn new(address: DeviceAddress, uid: u32, capabilities: u8) -> Self {
        Self {
            address,
            uid,
            description: String::new(),
            object_count: 0,
            endpoint_count: 0,
            interrupt_count: 0,
            capabilities,
            basic_retrieved: false,
            extended_retrieved: false,
            objects: BTreeMap::new(),
            hidden_objects: BTreeMap::new(),
            endpoints: BTreeMap::new(),
            interrupts: BTreeMap::new(),
            scan_retries: 0,
            ping_retries: 0,
            is_virtual: address.is_virtual(),
            is_static: false,
            enumeration: EnumerationPhase::default(),
        }
    }

    /// Pre-configured device known only by its address until it answers.
    pub fn new_static(address: DeviceAddress) -> Self {
        Self {
            is_static: true,
            ..Self::new(address, 0, 0)
        }
    }

    pub fn has_capability(&self, bit: u8) -> bool {
        self.capabilities & bit != 0
    }

    pub fn apply_summary(&mut self, summary: &DeviceSummary) {
        self.object_count = summary.object_count;
        self.endpoint_count = summary.endpoint_count;
        self.interrupt_count = summary.interrupt_count;
        self.capabilities = summary.capabilities;
        self.uid = summary.uid;
        self.basic_retrieved = true;
    }

    pub fn object(&self, number: u8) -> Option<&DeviceObject> {
        self.objects
            .get(&number)
            .or_else(|| self.hidden_objects.get(&number))
    }

    pub fn object_mut(&mut self, number: u8) -> Option<&mut DeviceObject> {
        match self.objects.get_mut(&number) {
            Some(object) => Some(object),
            None => self.hidden_objects.get_mut(&number),
        }
    }

    /// Move hidden objects out of the visible map.
    pub fn partition_hidden(&mut self) {
        let hidden: Vec<u8> = self
            .objects
            .values()
            .filter(|o| o.hidden)
            .map(|o| o.number)
            .collect();
        for number in hidden {
            if let Some(object) = self.objects.remove(&number) {
                self.hidden_objects.insert(number, object);
            }
        }
    }

    /// Apply a hidden object's value to the visible objects its description
    /// names.
    pub fn inject_extended(&mut self, hidden: u8) {
        let Some(object) = self.hidden_objects.get(&hidden) else {
            return;
        };
        let Some(raw) = object.last_value.clone() else {
            return;
        };
        let Some((targets, key)) = parse_hidden_reference(&object.description) else {
            log::debug!(
                "{} hidden object {hidden} has no reference in {:?}",
                self.address,
                object.description
            );
            return;
        };

        for target in targets {
            let Some(visible) = self.objects.get_mut(&target) else {
                continue;
            };
            match key {
                ExtendedKey::Min => visible.extended.min = Some(be_value(&raw)),
                ExtendedKey::Max => visible.extended.max = Some(be_value(&raw)),
                ExtendedKey::Unit => {
                    let unit = String::from_utf8_lossy(&raw)
                        .trim_end_matches('\0')
                        .trim()
                        .to_string();
                    visible.extended.unit = Some(unit);
                }
            }
        }
    }
}

fn be_value(raw: &[u8]) -> u64 {
    crate::protocol::value::be_unsigned(raw)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedKey {
    Min,
    Max,
    Unit,
}

/// Parse `"n[-m][,...]:KEY"` into the referenced object numbers and key.
pub fn parse_hidden_reference(description: &str) -> Option<(Vec<u8>, ExtendedKey)> {
    let (targets, key) = description.trim().rsplit_once(':')?;
    let key = match key.trim().to_ascii_uppercase().as_str() {
        "MIN" => ExtendedKey::Min,
        "MAX" => ExtendedKey::Max,
        "UNIT" => ExtendedKey::Unit,
        _ => return None,
    };

    let mut numbers = Vec::new();
    for part in targets.split(',') {
        let part = part.trim();
        match part.split_once('-') {
            Some((from, to)) => {
                let from: u8 = from.trim().parse().ok()?;
                let to: u8 = to.trim().parse().ok()?;
                if from > to {
                    return None;
                }
                numbers.extend(from..=to);
            }
            None => numbers.push(part.parse().ok()?),
        }
    }
    Some((numbers, key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_object_info_flags() {
        // read+write, crypto, unsigned int, level 1
        let flags = 0x03 | FLAG_CRYPTO | (1 << 4) | (1 << 6);
        let mut payload = vec![flags, 2, 0x02];
        payload.extend_from_slice(b"Brightness");
        let object = DeviceObject::from_query(3, &payload).unwrap();
        assert!(object.can_read() && object.can_write());
        assert!(object.crypto);
        assert!(!object.hidden);
        assert_eq!(object.level, 1);
        assert_eq!(object.data_type, DataType::UnsignedInt);
        assert_eq!(object.size, 2);
        assert_eq!(object.description, "Brightness");
        assert_eq!(object.formatter(), Formatter::PercentLinear);
    }

    #[test]
    fn rejects_bad_object_size() {
        assert!(DeviceObject::from_query(1, &[0x01, 9, 0]).is_err());
        assert!(DeviceObject::from_query(1, &[0x01]).is_err());
    }

    #[test]
    fn parses_hidden_references() {
        assert_eq!(
            parse_hidden_reference("1-3,5:MAX"),
            Some((vec![1, 2, 3, 5], ExtendedKey::Max))
        );
        assert_eq!(parse_hidden_reference("2:unit"), Some((vec![2], ExtendedKey::Unit)));
        assert_eq!(parse_hidden_reference("Temperature"), None);
        assert_eq!(parse_hidden_reference("4-2:MIN"), None);
        assert_eq!(parse_hidden_reference("1:SPEED"), None);
    }

    #[test]
    fn hidden_values_land_in_visible_objects() {
        let address = DeviceAddress::new(0, 1).unwrap();
        let mut device = Device::new(address, 7, 0);
        let visible = DeviceObject::from_query(1, &[0x03 | (1 << 4), 2, 0x02, b'L']).unwrap();
        let mut min = DeviceObject::from_query(2, &[0x01 | FLAG_HIDDEN | (1 << 4), 2, 0, b'1', b':', b'M', b'I', b'N']).unwrap();
        min.last_value = Some(vec![0, 10]);
        let mut unit = DeviceObject::from_query(3, &[0x01 | FLAG_HIDDEN | (3 << 4), 4, 0, b'1', b':', b'U', b'N', b'I', b'T']).unwrap();
        unit.last_value = Some(b"lx\0\0".to_vec());
        device.objects.insert(1, visible);
        device.objects.insert(2, min);
        device.objects.insert(3, unit);

        device.partition_hidden();
        assert_eq!(device.objects.len(), 1);
        assert_eq!(device.hidden_objects.len(), 2);

        device.inject_extended(2);
        device.inject_extended(3);
        let extended = &device.objects[&1].extended;
        assert_eq!(extended.min, Some(10));
        assert_eq!(extended.max, None);
        assert_eq!(extended.unit.as_deref(), Some("lx"));
    }

    #[test]
    fn summary_needs_eight_bytes() {
        let summary = DeviceSummary::parse(&[2, 1, 0, 0x08, 0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
        assert_eq!(summary.uid, 0xDEAD_BEEF);
        assert_eq!(summary.capabilities, capability::AUTHSUP);
        assert!(DeviceSummary::parse(&[1, 2, 3]).is_err());
    }
}
