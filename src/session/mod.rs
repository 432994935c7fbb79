//! Broker session flavours
//!
//! A session decides how the device identifies itself on CONNECT, what it
//! subscribes to, and how inbound publishes are routed. The device either
//! talks to its hub directly or first registers through the provisioning
//! service, which hands back the hub to use.

pub mod hub;
pub mod provisioning;
pub mod topics;

use crate::transport::{ConnectRequest, OutboundMessage, Subscription};
use bytes::Bytes;
use std::fmt;
use std::vec::Drain;
use thiserror::Error;

pub use hub::HubSession;
pub use provisioning::ProvisioningSession;
pub use topics::{TopicBuilder, TwinTopic, INITIAL_GET_REQUEST_ID};

pub const DEFAULT_MQTTS_PORT: u16 = 8883;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Registration failed with status '{status}'")]
    RegistrationFailed { status: String },
    #[error("Malformed provisioning response: {message}")]
    MalformedResponse { message: String },
    #[error("Provisioning service returned HTTP-style status {status}")]
    UnexpectedStatus { status: u16 },
}

/// Host and port of a broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
}

impl BrokerEndpoint {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Publishes queued by a session, flushed by the engine
#[derive(Debug, Default)]
pub struct Outbox {
    messages: Vec<OutboundMessage>,
}

impl Outbox {
    pub fn push(&mut self, message: OutboundMessage) {
        self.messages.push(message);
    }

    pub fn drain(&mut self) -> Drain<'_, OutboundMessage> {
        self.messages.drain(..)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// What an inbound publish means to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    /// Handled inside the session or not addressed to us
    Idle,
    /// Twin response or desired-property push
    Twin { topic: String, payload: Bytes },
    /// Direct method invocation
    Method {
        name: String,
        request_id: String,
        payload: Bytes,
    },
    CloudToDevice { payload: Bytes },
    /// Provisioning finished; connect to this hub as this device
    Assigned { hub_host: String, device_id: String },
    Failed(SessionError),
}

pub trait BrokerSession: fmt::Debug + Send {
    fn name(&self) -> &'static str;

    fn endpoint(&self) -> &BrokerEndpoint;

    fn connect_request(&self) -> ConnectRequest;

    fn subscriptions(&self) -> Vec<Subscription>;

    /// Called once the broker accepted the session and subscriptions are out
    fn on_connected(&mut self, outbox: &mut Outbox);

    fn on_message(&mut self, topic: &str, payload: &Bytes, outbox: &mut Outbox) -> SessionSignal;

    /// Called every tick while the session is up
    fn on_tick(&mut self, _outbox: &mut Outbox) {}
}
