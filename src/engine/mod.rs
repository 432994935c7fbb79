//! Connection lifecycle engine
//!
//! Drives WiFi association, DNS resolution, socket connect and the broker
//! session handshake from a fixed-interval `poll()`. Every timeout ends in
//! the same full `reset()`.

pub mod budget;
pub mod flags;
pub mod lifecycle;
pub mod timers;

pub use budget::RetryBudget;
pub use flags::NetworkingFlags;
pub use lifecycle::{ConnectionEngine, EngineEvent, EngineStatus};
pub use timers::{TimeoutKind, TimerHandle, Timers};

use crate::transport::TransportError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Broker session not connected (state: {state:?})")]
    NotConnected { state: SessionState },
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}
