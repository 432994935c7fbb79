//! Direct methods invoked by the cloud
//!
//! `reboot` and `sendMsg` are supported. Every invocation gets exactly one
//! response; failures are answered with 400 and a human-readable status.

use crate::session::TopicBuilder;
use crate::transport::{OutboundMessage, QoS};
use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

pub const STATUS_ACCEPTED: u16 = 202;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const MAX_MESSAGE_LEN: usize = 1024;

static PERIOD_SECONDS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^PT(\d+)S$").expect("period pattern is valid"));

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Delay time is empty. Specify 'delay' in period format (PT5S for 5 sec)")]
    EmptyDelay,
    #[error("Delay time in wrong format. Specify 'delay' in period format (PT5S for 5 sec)")]
    InvalidDelay { value: String },
    #[error("Message string is empty. Specify string.")]
    EmptyMessage,
    #[error("Failed to allocate memory for the message.")]
    MessageTooLong { len: usize, max: usize },
    #[error("{{\"Status\":\"Unsupported Command\"}}")]
    Unsupported { name: String },
    #[error("Error processing command")]
    MalformedPayload { message: String },
}

/// Action the application must carry out after answering
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceAction {
    Reboot { delay: Duration },
    /// Message text to show on the console
    Message(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub status: u16,
    pub payload: Bytes,
}

impl CommandResponse {
    fn accepted<T: Serialize>(body: &T) -> Self {
        let payload = serde_json::to_vec(body)
            .map(Bytes::from)
            .unwrap_or_else(|_| Bytes::from_static(br#"{"status":"Success"}"#));
        Self {
            status: STATUS_ACCEPTED,
            payload,
        }
    }

    fn rejected(error: &CommandError) -> Self {
        let body = serde_json::json!({ "status": error.to_string() });
        Self {
            status: STATUS_BAD_REQUEST,
            payload: Bytes::from(body.to_string()),
        }
    }

    pub fn into_message(self, request_id: &str) -> OutboundMessage {
        OutboundMessage::new(
            TopicBuilder::method_response_topic(self.status, request_id),
            self.payload,
            QoS::AtMostOnce,
        )
    }
}

#[derive(Serialize)]
struct Success {
    status: &'static str,
}

#[derive(Serialize)]
struct RebootScheduled {
    status: &'static str,
    delay: u64,
}

/// Run a direct method and build its response
pub fn handle_command(name: &str, payload: &[u8]) -> (CommandResponse, Option<DeviceAction>) {
    info!(command = %name, "Processing direct method");

    let result = match name {
        "reboot" => reboot(payload),
        "sendMsg" => send_message(payload),
        other => Err(CommandError::Unsupported {
            name: other.to_string(),
        }),
    };

    match result {
        Ok((response, action)) => (response, Some(action)),
        Err(e) => {
            error!(command = %name, error = ?e, "Direct method rejected");
            (CommandResponse::rejected(&e), None)
        }
    }
}

/// String member `key` of a JSON object payload; None when absent or empty
fn string_field(payload: &[u8], key: &str) -> Result<Option<String>, CommandError> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    let doc: Value = serde_json::from_slice(payload).map_err(|e| CommandError::MalformedPayload {
        message: e.to_string(),
    })?;
    match doc.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(CommandError::MalformedPayload {
            message: format!("'{key}' must be a string, got {other}"),
        }),
    }
}

fn reboot(payload: &[u8]) -> Result<(CommandResponse, DeviceAction), CommandError> {
    let delay = string_field(payload, "delay")?.ok_or(CommandError::EmptyDelay)?;

    let seconds = PERIOD_SECONDS
        .captures(&delay)
        .and_then(|caps| caps[1].parse::<u64>().ok())
        .ok_or_else(|| CommandError::InvalidDelay {
            value: delay.clone(),
        })?;

    warn!(seconds, "Reboot scheduled");
    Ok((
        CommandResponse::accepted(&RebootScheduled {
            status: "Success",
            delay: seconds,
        }),
        DeviceAction::Reboot {
            delay: Duration::from_secs(seconds),
        },
    ))
}

fn send_message(payload: &[u8]) -> Result<(CommandResponse, DeviceAction), CommandError> {
    let message = string_field(payload, "sendMsgString")?.ok_or(CommandError::EmptyMessage)?;

    if message.len() > MAX_MESSAGE_LEN {
        return Err(CommandError::MessageTooLong {
            len: message.len(),
            max: MAX_MESSAGE_LEN,
        });
    }

    Ok((
        CommandResponse::accepted(&Success { status: "Success" }),
        DeviceAction::Message(message),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(response: &CommandResponse) -> Value {
        serde_json::from_slice(&response.payload).unwrap()
    }

    #[test]
    fn test_reboot_accepted() {
        let (response, action) = handle_command("reboot", br#"{"delay":"PT5S"}"#);
        assert_eq!(response.status, 202);
        assert_eq!(
            response.payload,
            Bytes::from_static(br#"{"status":"Success","delay":5}"#)
        );
        assert_eq!(
            action,
            Some(DeviceAction::Reboot {
                delay: Duration::from_secs(5)
            })
        );
    }

    #[test]
    fn test_reboot_missing_delay() {
        let payloads: [&[u8]; 3] = [b"", b"{}", br#"{"delay":""}"#];
        for payload in payloads {
            let (response, action) = handle_command("reboot", payload);
            assert_eq!(response.status, 400);
            assert_eq!(
                body(&response),
                json!({"status": "Delay time is empty. Specify 'delay' in period format (PT5S for 5 sec)"})
            );
            assert!(action.is_none());
        }
    }

    #[test]
    fn test_reboot_bad_format() {
        let (response, action) = handle_command("reboot", br#"{"delay":"5 seconds"}"#);
        assert_eq!(response.status, 400);
        assert_eq!(
            body(&response),
            json!({"status": "Delay time in wrong format. Specify 'delay' in period format (PT5S for 5 sec)"})
        );
        assert!(action.is_none());
    }

    #[test]
    fn test_send_message() {
        let (response, action) = handle_command("sendMsg", br#"{"sendMsgString":"hello device"}"#);
        assert_eq!(response.status, 202);
        assert_eq!(body(&response), json!({"status": "Success"}));
        assert_eq!(action, Some(DeviceAction::Message("hello device".to_string())));
    }

    #[test]
    fn test_send_message_errors() {
        let (empty, _) = handle_command("sendMsg", br#"{"other":1}"#);
        assert_eq!(
            body(&empty),
            json!({"status": "Message string is empty. Specify string."})
        );

        let long = json!({ "sendMsgString": "x".repeat(MAX_MESSAGE_LEN + 1) }).to_string();
        let (too_long, action) = handle_command("sendMsg", long.as_bytes());
        assert_eq!(too_long.status, 400);
        assert_eq!(
            body(&too_long),
            json!({"status": "Failed to allocate memory for the message."})
        );
        assert!(action.is_none());
    }

    #[test]
    fn test_unsupported_command() {
        let (response, action) = handle_command("selfDestruct", b"{}");
        assert_eq!(response.status, 400);
        assert_eq!(
            body(&response),
            json!({"status": "{\"Status\":\"Unsupported Command\"}"})
        );
        assert!(action.is_none());
    }

    #[test]
    fn test_malformed_payload() {
        let (response, _) = handle_command("reboot", b"{not json");
        assert_eq!(body(&response), json!({"status": "Error processing command"}));
    }

    #[test]
    fn test_response_topic() {
        let (response, _) = handle_command("reboot", br#"{"delay":"PT1S"}"#);
        let message = response.into_message("17");
        assert_eq!(message.topic, "$iothub/methods/res/202/?$rid=17");
    }
}
