//! Telemetry payloads
//!
//! Everything the device publishes on its telemetry topic: periodic sensor
//! readings, button events and numbered slot values. Direct-method handling
//! lives in `commands`.

pub mod commands;
pub mod slots;

pub use commands::{handle_command, CommandError, CommandResponse, DeviceAction};
pub use slots::{slot_name, SlotCommand, TelemetryUpdate, TelemetryValue};

use crate::session::TopicBuilder;
use crate::transport::{OutboundMessage, QoS};
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Unknown telemetry slot {index}")]
    UnknownSlot { index: u8 },
    #[error("Slot {index}: '{value}' is not a valid hex value")]
    InvalidHex { index: u8, value: String },
    #[error("Slot {index}: value is not a finite number")]
    NonFinite { index: u8 },
    #[error("Boolean slot expects 'true' or 'false', got '{value}'")]
    InvalidBool { value: String },
    #[error("Slot {index}: string must be non-empty and contain no spaces")]
    InvalidString { index: u8 },
    #[error("Slot {index}: string of {len} chars exceeds {max}")]
    StringTooLong { index: u8, len: usize, max: usize },
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Periodic sensor sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SensorReading {
    pub temperature: i32,
    pub light: i32,
}

impl SensorReading {
    pub fn to_payload(&self) -> Result<Bytes, TelemetryError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Button {
    Sw0,
    Sw1,
}

impl Button {
    pub fn name(self) -> &'static str {
        match self {
            Button::Sw0 => "SW0",
            Button::Sw1 => "SW1",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonPress {
    pub button: Button,
    pub press_count: u32,
}

#[derive(Serialize)]
struct ButtonEvent<'a> {
    button_name: &'a str,
    press_count: u32,
}

/// `{"button_event":{...}}` with one entry per pressed button
///
/// Two presses produce two `button_event` members in the same object, the
/// shape the hub-side rules expect.
pub fn button_payload(presses: &[ButtonPress]) -> Result<Option<Bytes>, TelemetryError> {
    if presses.is_empty() {
        return Ok(None);
    }

    let mut out = String::from("{");
    for (i, press) in presses.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str("\"button_event\":");
        out.push_str(&serde_json::to_string(&ButtonEvent {
            button_name: press.button.name(),
            press_count: press.press_count,
        })?);
    }
    out.push('}');

    Ok(Some(Bytes::from(out)))
}

/// Whether `telemetryDisable` masks slot `index`
pub fn is_suppressed(disable_mask: u16, index: u8) -> bool {
    index < 16 && disable_mask & (1 << index) != 0
}

/// Wrap a payload for the device telemetry topic
pub fn telemetry_message(device_id: &str, payload: Bytes) -> OutboundMessage {
    OutboundMessage::new(
        TopicBuilder::telemetry_topic(device_id),
        payload,
        QoS::AtLeastOnce,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensor_payload() {
        let payload = SensorReading {
            temperature: 23,
            light: 410,
        }
        .to_payload()
        .unwrap();
        assert_eq!(payload, Bytes::from_static(br#"{"temperature":23,"light":410}"#));
    }

    #[test]
    fn test_single_button_payload() {
        let payload = button_payload(&[ButtonPress {
            button: Button::Sw0,
            press_count: 1,
        }])
        .unwrap()
        .unwrap();
        assert_eq!(
            payload,
            Bytes::from_static(br#"{"button_event":{"button_name":"SW0","press_count":1}}"#)
        );
    }

    #[test]
    fn test_both_buttons_in_one_message() {
        let payload = button_payload(&[
            ButtonPress {
                button: Button::Sw0,
                press_count: 2,
            },
            ButtonPress {
                button: Button::Sw1,
                press_count: 5,
            },
        ])
        .unwrap()
        .unwrap();
        assert_eq!(
            std::str::from_utf8(&payload).unwrap(),
            r#"{"button_event":{"button_name":"SW0","press_count":2},"button_event":{"button_name":"SW1","press_count":5}}"#
        );
    }

    #[test]
    fn test_no_presses_no_payload() {
        assert!(button_payload(&[]).unwrap().is_none());
    }

    #[test]
    fn test_suppression_mask() {
        assert!(is_suppressed(0b10, 1));
        assert!(!is_suppressed(0b10, 2));
        assert!(!is_suppressed(u16::MAX, 16));
    }

    #[test]
    fn test_telemetry_message_qos() {
        let message = telemetry_message("sensor-1", Bytes::from_static(b"{}"));
        assert_eq!(message.topic, "devices/sensor-1/messages/events/");
        assert_eq!(message.qos, QoS::AtLeastOnce);
    }
}
