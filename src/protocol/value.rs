//! Object value codec: raw big-endian bytes <-> display strings.
use serde::{Deserialize, Serialize};

use super::error::HbusError;

/// Data type carried in bits 4-5 of an object's flag byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Int = 0,
    UnsignedInt = 1,
    FixedPoint = 2,
    Byte = 3,
}

impl DataType {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => DataType::Int,
            1 => DataType::UnsignedInt,
            2 => DataType::FixedPoint,
            _ => DataType::Byte,
        }
    }
}

pub mod subtype {
    pub const UINT_NONE: u8 = 0x00;
    pub const UINT_PERCENT: u8 = 0x01;
    pub const UINT_LIN_PERCENT: u8 = 0x02;
    pub const UINT_LOG_PERCENT: u8 = 0x03;
    pub const UINT_TIME: u8 = 0x04;

    pub const BYTE_HEX: u8 = 0x01;
    pub const BYTE_DEC: u8 = 0x02;
    pub const BYTE_OCT: u8 = 0x03;
    pub const BYTE_BIN: u8 = 0x04;
    pub const BYTE_BOOL: u8 = 0x05;
}

/// MIN/MAX/UNIT values injected from hidden objects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedInfo {
    pub min: Option<u64>,
    pub max: Option<u64>,
    pub unit: Option<String>,
}

/// Formatter kinds, selected from `(data type, subtype)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Formatter {
    RawUnsigned,
    RawSigned,
    PercentAbsolute,
    PercentLinear,
    PercentLog,
    Time,
    FixedPoint { point: u8 },
    Bool,
    Hex,
    Dec,
    Oct,
    Bin,
}

impl Formatter {
    pub fn for_type(data_type: DataType, subtype: u8) -> Self {
        match data_type {
            DataType::Int => Formatter::RawSigned,
            DataType::UnsignedInt => match subtype {
                subtype::UINT_PERCENT => Formatter::PercentAbsolute,
                subtype::UINT_LIN_PERCENT => Formatter::PercentLinear,
                subtype::UINT_LOG_PERCENT => Formatter::PercentLog,
                subtype::UINT_TIME => Formatter::Time,
                _ => Formatter::RawUnsigned,
            },
            DataType::FixedPoint => Formatter::FixedPoint {
                point: subtype & 0x0F,
            },
            DataType::Byte => match subtype {
                subtype::BYTE_DEC => Formatter::Dec,
                subtype::BYTE_OCT => Formatter::Oct,
                subtype::BYTE_BIN => Formatter::Bin,
                subtype::BYTE_BOOL => Formatter::Bool,
                _ => Formatter::Hex,
            },
        }
    }

    /// Render raw object bytes for display.
    pub fn format(&self, raw: &[u8], ext: &ExtendedInfo) -> String {
        match *self {
            Formatter::RawUnsigned => with_unit(be_unsigned(raw).to_string(), ext),
            Formatter::RawSigned => with_unit(be_signed(raw).to_string(), ext),
            Formatter::PercentAbsolute => format!("{}%", be_unsigned(raw).min(100)),
            Formatter::PercentLinear => {
                let (min, max) = bounds(raw.len(), ext);
                let value = be_unsigned(raw) as f64;
                let pct = if max > min {
                    (value - min) / (max - min) * 100.0
                } else {
                    0.0
                };
                format!("{:.2}%", pct)
            }
            Formatter::PercentLog => {
                let (min, max) = bounds(raw.len(), ext);
                let value = be_unsigned(raw) as f64;
                let pct = (value - min).log10() / (max - min).log10() * 100.0;
                format!("{:.2}%", if pct.is_finite() { pct.max(0.0) } else { 0.0 })
            }
            Formatter::Time => {
                let mut bcd = [0u8; 4];
                for (slot, byte) in bcd.iter_mut().zip(raw) {
                    *slot = *byte;
                }
                format!(
                    "{:02x}:{:02x}:{:02x},{:02x}",
                    bcd[0], bcd[1], bcd[2], bcd[3]
                )
            }
            Formatter::FixedPoint { point } => {
                let scaled = be_signed(raw) as f64 / 10f64.powi(point as i32);
                with_unit(format!("{:.*}", point as usize, scaled), ext)
            }
            Formatter::Bool => {
                if raw.iter().any(|b| *b != 0) {
                    "ON".to_string()
                } else {
                    "OFF".to_string()
                }
            }
            Formatter::Hex => join_bytes(raw, |b| format!("0x{b:02x}")),
            Formatter::Dec => join_bytes(raw, |b| b.to_string()),
            Formatter::Oct => join_bytes(raw, |b| format!("0o{b:o}")),
            Formatter::Bin => join_bytes(raw, |b| format!("0b{b:08b}")),
        }
    }

    /// Convert a display string into `size` raw bytes for writing.
    pub fn decode(&self, text: &str, size: usize, ext: &ExtendedInfo) -> Result<Vec<u8>, HbusError> {
        let text = text.trim();
        match *self {
            Formatter::RawUnsigned => {
                let value = first_token(text)
                    .parse::<u64>()
                    .map_err(|_| HbusError::value_format(format!("'{text}' is not an unsigned integer")))?;
                unsigned_bytes(value, size)
            }
            Formatter::RawSigned => {
                let value = first_token(text)
                    .parse::<i64>()
                    .map_err(|_| HbusError::value_format(format!("'{text}' is not an integer")))?;
                signed_bytes(value, size)
            }
            Formatter::PercentAbsolute => {
                let pct = parse_percent(text)?.clamp(0.0, 100.0);
                unsigned_bytes(pct.round() as u64, size)
            }
            Formatter::PercentLinear => {
                let (min, max) = bounds(size, ext);
                let pct = parse_percent(text)?.clamp(0.0, 100.0);
                let raw = (pct / 100.0 * (max - min) + min).round();
                unsigned_bytes(raw.max(0.0) as u64, size)
            }
            Formatter::PercentLog => {
                let (min, max) = bounds(size, ext);
                let pct = parse_percent(text)?.clamp(0.0, 100.0);
                let raw = 10f64.powf(pct / 100.0 * (max - min).log10()) + min;
                let raw = if raw.is_finite() { raw.round().max(0.0) } else { 0.0 };
                unsigned_bytes(raw as u64, size)
            }
            Formatter::Time => encode_time(text, size),
            Formatter::FixedPoint { point } => {
                let value = first_token(text)
                    .parse::<f64>()
                    .map_err(|_| HbusError::value_format(format!("'{text}' is not a number")))?;
                let scaled = (value * 10f64.powi(point as i32)).round();
                signed_bytes(scaled as i64, size)
            }
            Formatter::Bool => {
                let on = match text.to_ascii_uppercase().as_str() {
                    "ON" | "TRUE" | "1" => true,
                    "OFF" | "FALSE" | "0" => false,
                    _ => return Err(HbusError::value_format(format!("'{text}' is not ON/OFF"))),
                };
                unsigned_bytes(on as u64, size)
            }
            Formatter::Hex => split_bytes(text, size, 16, "0x"),
            Formatter::Dec => split_bytes(text, size, 10, ""),
            Formatter::Oct => split_bytes(text, size, 8, "0o"),
            Formatter::Bin => split_bytes(text, size, 2, "0b"),
        }
    }
}

pub fn be_unsigned(raw: &[u8]) -> u64 {
    raw.iter().take(8).fold(0u64, |acc, b| (acc << 8) | *b as u64)
}

pub fn be_signed(raw: &[u8]) -> i64 {
    let len = raw.len().min(8);
    if len == 0 {
        return 0;
    }
    let value = be_unsigned(raw);
    let shift = 64 - 8 * len as u32;
    ((value << shift) as i64) >> shift
}

fn max_for(size: usize) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (8 * size)) - 1
    }
}

fn bounds(size: usize, ext: &ExtendedInfo) -> (f64, f64) {
    let min = ext.min.unwrap_or(0) as f64;
    let max = ext.max.unwrap_or_else(|| max_for(size)) as f64;
    (min, max)
}

fn unsigned_bytes(value: u64, size: usize) -> Result<Vec<u8>, HbusError> {
    if size == 0 || size > 8 || value > max_for(size) {
        return Err(HbusError::value_format(format!(
            "{value} does not fit in {size} bytes"
        )));
    }
    Ok(value.to_be_bytes()[8 - size..].to_vec())
}

fn signed_bytes(value: i64, size: usize) -> Result<Vec<u8>, HbusError> {
    if size == 0 || size > 8 {
        return Err(HbusError::value_format(format!("invalid size {size}")));
    }
    let bits = 8 * size as u32;
    if bits < 64 {
        let limit = 1i64 << (bits - 1);
        if value < -limit || value >= limit {
            return Err(HbusError::value_format(format!(
                "{value} does not fit in {size} bytes"
            )));
        }
    }
    Ok(value.to_be_bytes()[8 - size..].to_vec())
}

fn with_unit(value: String, ext: &ExtendedInfo) -> String {
    match &ext.unit {
        Some(unit) if !unit.is_empty() => format!("{value} {unit}"),
        _ => value,
    }
}

fn first_token(text: &str) -> &str {
    text.split_whitespace().next().unwrap_or("")
}

fn parse_percent(text: &str) -> Result<f64, HbusError> {
    text.trim_end_matches('%')
        .trim()
        .parse::<f64>()
        .map_err(|_| HbusError::value_format(format!("'{text}' is not a percentage")))
}

fn join_bytes(raw: &[u8], render: impl Fn(u8) -> String) -> String {
    raw.iter()
        .map(|b| render(*b))
        .collect::<Vec<_>>()
        .join(", ")
}

fn split_bytes(text: &str, size: usize, radix: u32, prefix: &str) -> Result<Vec<u8>, HbusError> {
    let bytes = text
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(|part| {
            let digits = if prefix.is_empty() {
                part
            } else {
                part.strip_prefix(prefix).unwrap_or(part)
            };
            u8::from_str_radix(digits, radix)
                .map_err(|_| HbusError::value_format(format!("'{part}' is not a base {radix} byte")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if bytes.len() != size {
        return Err(HbusError::value_format(format!(
            "expected {size} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

fn encode_time(text: &str, size: usize) -> Result<Vec<u8>, HbusError> {
    let bad = || HbusError::value_format(format!("'{text}' is not HH:MM:SS,cc"));
    let (clock, fraction) = text.split_once(',').unwrap_or((text, "0"));
    let mut fields = clock
        .split(':')
        .map(|part| part.trim().parse::<u8>().map_err(|_| bad()))
        .collect::<Result<Vec<_>, _>>()?;
    if fields.len() != 3 {
        return Err(bad());
    }
    fields.push(fraction.trim().parse::<u8>().map_err(|_| bad())?);
    let limits = [24u8, 60, 60, 100];
    if fields.iter().zip(limits).any(|(value, limit)| *value >= limit) {
        return Err(bad());
    }
    let mut bcd: Vec<u8> = fields.iter().map(|v| ((v / 10) << 4) | (v % 10)).collect();
    bcd.resize(size, 0);
    Ok(bcd)
}
