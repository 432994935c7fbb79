//! Length-prefixed binary frames received over the serial peripheral
//!
//! Wire layout: `[command, index, len_hi, len_lo, payload...]`. The length is
//! big-endian and does not count the NUL the decoder appends after the payload.

pub mod decoder;

pub use decoder::{DecoderStats, FrameDecoder};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Command, index and two length bytes
pub const HEADER_LEN: usize = 4;

/// Largest payload the accumulation buffer can hold
pub const MAX_PAYLOAD: usize = 1024;

/// Frame command byte interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `T` or `t`: telemetry slot update
    TelemetryPush,
    /// Anything else is consumed but never dispatched
    Other(u8),
}

impl Command {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            b'T' | b't' => Command::TelemetryPush,
            other => Command::Other(other),
        }
    }

    pub fn is_recognized(self) -> bool {
        matches!(self, Command::TelemetryPush)
    }
}

/// A completed frame borrowed from the decoder's buffer
///
/// The payload slice points into decoder-owned storage, so a frame cannot
/// outlive the borrow it was produced under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub command: u8,
    pub index: u8,
    pub length: u16,
    pub payload: &'a [u8],
}

impl<'a> Frame<'a> {
    pub fn command_kind(&self) -> Command {
        Command::from_byte(self.command)
    }

    /// Payload as text, stopping at an embedded NUL if the sender added one
    pub fn payload_str(&self) -> Result<&'a str, FrameError> {
        let end = self
            .payload
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.payload.len());
        std::str::from_utf8(&self.payload[..end]).map_err(|_| FrameError::InvalidUtf8)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("payload of {len} bytes exceeds the {max} byte frame limit")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("frame payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Encode a frame the way the serial master sends it
pub fn encode_frame(command: u8, index: u8, payload: &[u8]) -> Result<Bytes, FrameError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD,
        });
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(command);
    buf.put_u8(index);
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    Ok(buf.freeze())
}
