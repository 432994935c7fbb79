//! Reported-property conventions
//!
//! Plug-and-play devices acknowledge writable properties with an
//! `{value, ac, av, ad}` envelope; plain hub devices report bare values.

use serde_json::{json, Value};
use std::fmt;

/// Acknowledgement code for an accepted writable property
pub const ACK_SUCCESS: u16 = 200;

pub trait TwinProtocol: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Model identifier announced on connect and registration, if any
    fn model_id(&self) -> Option<&str>;

    /// Shape a writable property value for the reported document
    fn writable_ack(&self, value: Value, version: i64) -> Value;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlugAndPlay {
    model_id: String,
}

impl PlugAndPlay {
    pub fn new<S: Into<String>>(model_id: S) -> Self {
        Self {
            model_id: model_id.into(),
        }
    }
}

impl TwinProtocol for PlugAndPlay {
    fn name(&self) -> &'static str {
        "plug_and_play"
    }

    fn model_id(&self) -> Option<&str> {
        Some(&self.model_id)
    }

    fn writable_ack(&self, value: Value, version: i64) -> Value {
        json!({
            "value": value,
            "ac": ACK_SUCCESS,
            "av": version,
            "ad": "Success",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlainHub;

impl TwinProtocol for PlainHub {
    fn name(&self) -> &'static str {
        "plain_hub"
    }

    fn model_id(&self) -> Option<&str> {
        None
    }

    fn writable_ack(&self, value: Value, _version: i64) -> Value {
        value
    }
}
