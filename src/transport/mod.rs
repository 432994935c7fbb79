//! Transport port consumed by the connection engine
//!
//! The TCP/TLS socket, name resolver, WiFi association and broker packet
//! framing live outside this crate. The engine drives them through the
//! narrow traits below, all of which are non-blocking: operations start work
//! and completion is observed by polling on a later tick.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use thiserror::Error;

pub use rumqttc::QoS;

/// Socket lifecycle as reported by the underlying stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransportState {
    /// No descriptor allocated
    NotASocket,
    /// Descriptor allocated, not connected
    Closed,
    /// Connect (including the TLS handshake) in progress
    Connecting,
    Connected,
    /// Tearing down, will return to `NotASocket`
    Closing,
}

impl TransportState {
    pub fn is_connected(self) -> bool {
        matches!(self, TransportState::Connected)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Association with access point failed: {0}")]
    Association(String),
    #[error("Name resolution failed for {host}")]
    Resolve { host: String },
    #[error("Socket operation failed: {0}")]
    Socket(String),
    #[error("Broker operation failed: {0}")]
    Broker(String),
    #[error("Transport not connected (state: {state:?})")]
    NotConnected { state: TransportState },
}

/// WiFi security mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WifiAuth {
    Open,
    #[default]
    Wpa,
    Wep,
}

impl WifiAuth {
    /// Numeric form used by the serial shell (`0` open, `1` WPA, `2` WEP)
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(WifiAuth::Open),
            1 => Some(WifiAuth::Wpa),
            2 => Some(WifiAuth::Wep),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WifiCredentials {
    pub ssid: String,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub auth: WifiAuth,
}

impl WifiCredentials {
    /// Parse the shell form `<ssid>[,<passphrase>[,<auth>]]`
    pub fn parse(input: &str) -> Result<Self, TransportError> {
        let mut parts = input.split(',');
        let ssid = parts
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| TransportError::Association("missing SSID".to_string()))?;
        let passphrase = parts
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let auth = match parts.next() {
            Some(code) => code
                .trim()
                .parse::<u8>()
                .ok()
                .and_then(WifiAuth::from_code)
                .ok_or_else(|| {
                    TransportError::Association(format!("unknown auth type '{code}'"))
                })?,
            None if passphrase.is_some() => WifiAuth::Wpa,
            None => WifiAuth::Open,
        };

        Ok(Self {
            ssid: ssid.to_string(),
            passphrase,
            auth,
        })
    }
}

/// Network-layer notifications delivered by the WiFi stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    ApConnected,
    ApLost,
    IpAssigned(Ipv4Addr),
    IpLost,
}

/// Broker CONNECT parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub client_id: String,
    pub username: String,
    pub keep_alive_secs: u16,
    pub clean_session: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub filter: String,
    pub qos: QoS,
}

impl Subscription {
    pub fn new<S: Into<String>>(filter: S, qos: QoS) -> Self {
        Self {
            filter: filter.into(),
            qos,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
}

impl OutboundMessage {
    pub fn new<S: Into<String>>(topic: S, payload: Bytes, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload,
            qos,
        }
    }
}

/// Broker traffic surfaced by the reception handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    ConnAck { accepted: bool, code: u8 },
    SubAck { granted: usize },
    Message { topic: String, payload: Bytes },
    Disconnected,
}

/// WiFi association
pub trait Link {
    fn associate(&mut self, credentials: &WifiCredentials) -> Result<(), TransportError>;

    /// Next pending link notification, if any
    fn poll_link_event(&mut self) -> Option<LinkEvent>;
}

/// Asynchronous hostname resolution
pub trait Resolver {
    /// Start resolving `host`; the answer shows up in `take_resolved`
    fn resolve(&mut self, host: &str) -> Result<(), TransportError>;

    fn take_resolved(&mut self) -> Option<IpAddr>;
}

pub trait Socket {
    fn state(&mut self) -> TransportState;

    /// Allocate a descriptor, moving `NotASocket` to `Closed`
    fn open(&mut self) -> Result<(), TransportError>;

    /// Start a TLS connect with `server_name` as SNI, moving to `Connecting`
    fn connect(&mut self, addr: SocketAddr, server_name: &str) -> Result<(), TransportError>;

    /// Release the descriptor; a no-op when none is allocated
    fn close(&mut self);
}

/// Broker packet exchange over a connected socket
pub trait BrokerLink {
    fn send_connect(&mut self, request: &ConnectRequest) -> Result<(), TransportError>;

    fn send_subscribe(&mut self, subscriptions: &[Subscription]) -> Result<(), TransportError>;

    fn publish(&mut self, message: &OutboundMessage) -> Result<(), TransportError>;

    /// Run the transmit/receive handlers and return the next inbound event
    fn poll_event(&mut self) -> Result<Option<BrokerEvent>, TransportError>;
}

/// Everything the engine needs from the outside world
pub trait TransportPort: Link + Resolver + Socket + BrokerLink {}

impl<T: Link + Resolver + Socket + BrokerLink> TransportPort for T {}
