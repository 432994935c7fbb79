//! Numbered telemetry slots
//!
//! Index 0 resets the serial frame decoder. Indices 1..=14 carry typed
//! values; numeric slots receive big-endian hex so the sender never has to
//! format floating point.

use super::TelemetryError;
use bytes::Bytes;
use serde_json::{Map, Value};

pub const RESET_DECODER_INDEX: u8 = 0;
pub const MAX_SLOT_INDEX: u8 = 14;
pub const MAX_STRING_LEN: usize = 67;

const SLOT_NAMES: [&str; 15] = [
    "",
    "telemetry_Int_1",
    "telemetry_Int_2",
    "telemetry_Int_3",
    "telemetry_Int_4",
    "telemetry_Dbl_1",
    "telemetry_Dbl_2",
    "telemetry_Flt_1",
    "telemetry_Flt_2",
    "telemetry_Lng_1",
    "telemetry_Bool_1",
    "telemetry_Str_1",
    "telemetry_Str_2",
    "telemetry_Str_3",
    "telemetry_Str_4",
];

pub fn slot_name(index: u8) -> Option<&'static str> {
    match index {
        1..=MAX_SLOT_INDEX => Some(SLOT_NAMES[usize::from(index)]),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryValue {
    Int(i32),
    Double(f64),
    Float(f32),
    Long(i64),
    Bool(bool),
    Str(String),
}

impl TelemetryValue {
    pub fn to_json(&self) -> Value {
        match self {
            TelemetryValue::Int(v) => Value::from(*v),
            TelemetryValue::Double(v) => Value::from(*v),
            TelemetryValue::Float(v) => Value::from(f64::from(*v)),
            TelemetryValue::Long(v) => Value::from(*v),
            TelemetryValue::Bool(v) => Value::from(*v),
            TelemetryValue::Str(v) => Value::from(v.as_str()),
        }
    }
}

/// One slot value ready for publishing
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryUpdate {
    pub index: u8,
    pub value: TelemetryValue,
}

impl TelemetryUpdate {
    pub fn name(&self) -> &'static str {
        slot_name(self.index).unwrap_or("telemetry_unknown")
    }

    pub fn to_payload(&self) -> Bytes {
        let mut body = Map::new();
        body.insert(self.name().to_string(), self.value.to_json());
        Bytes::from(Value::Object(body).to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SlotCommand {
    ResetDecoder,
    Update(TelemetryUpdate),
}

impl SlotCommand {
    /// Interpret a slot write coming from a frame or the shell
    pub fn parse(index: u8, data: &str) -> Result<Self, TelemetryError> {
        let data = data.trim();
        let value = match index {
            RESET_DECODER_INDEX => return Ok(SlotCommand::ResetDecoder),
            1..=4 => TelemetryValue::Int(parse_hex(index, data, 8)? as u32 as i32),
            5 | 6 => {
                let value = f64::from_bits(parse_hex(index, data, 16)?);
                ensure_finite(index, value)?;
                TelemetryValue::Double(value)
            }
            7 | 8 => {
                let value = f32::from_bits(parse_hex(index, data, 8)? as u32);
                ensure_finite(index, f64::from(value))?;
                TelemetryValue::Float(value)
            }
            9 => TelemetryValue::Long(parse_hex(index, data, 16)? as i64),
            10 => match data {
                "true" => TelemetryValue::Bool(true),
                "false" => TelemetryValue::Bool(false),
                other => {
                    return Err(TelemetryError::InvalidBool {
                        value: other.to_string(),
                    })
                }
            },
            11..=MAX_SLOT_INDEX => {
                if data.is_empty() || data.contains(char::is_whitespace) {
                    return Err(TelemetryError::InvalidString { index });
                }
                if data.len() > MAX_STRING_LEN {
                    return Err(TelemetryError::StringTooLong {
                        index,
                        len: data.len(),
                        max: MAX_STRING_LEN,
                    });
                }
                TelemetryValue::Str(data.to_string())
            }
            _ => return Err(TelemetryError::UnknownSlot { index }),
        };

        Ok(SlotCommand::Update(TelemetryUpdate { index, value }))
    }
}

fn parse_hex(index: u8, data: &str, max_digits: usize) -> Result<u64, TelemetryError> {
    let digits = data
        .strip_prefix("0x")
        .or_else(|| data.strip_prefix("0X"))
        .unwrap_or(data);
    if digits.is_empty() || digits.len() > max_digits {
        return Err(TelemetryError::InvalidHex {
            index,
            value: data.to_string(),
        });
    }
    u64::from_str_radix(digits, 16).map_err(|_| TelemetryError::InvalidHex {
        index,
        value: data.to_string(),
    })
}

fn ensure_finite(index: u8, value: f64) -> Result<(), TelemetryError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(TelemetryError::NonFinite { index })
    }
}
