//! Byte-at-a-time frame reassembly
//!
//! The decoder runs in the receive interrupt path: no allocation, no locking,
//! bounded work per byte. It owns two accumulation buffers. Bytes are written
//! into the active one; when a frame completes the buffers swap, so the
//! finished frame stays readable through [`FrameDecoder::completed`] while the
//! next one accumulates.

use super::{Command, Frame, HEADER_LEN, MAX_PAYLOAD};
use tracing::{debug, error, trace};

/// Header, maximum payload and the appended NUL terminator
const BUFFER_LEN: usize = HEADER_LEN + MAX_PAYLOAD + 1;

/// Counters exposed for status reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    /// Frames emitted to the caller
    pub frames: u64,
    /// Complete frames skipped because the command was not recognized
    pub unrecognized: u64,
    /// Frames whose declared length exceeded the buffer
    pub overflows: u64,
}

#[derive(Debug, Clone, Copy)]
struct Completed {
    buffer: usize,
    length: usize,
}

pub struct FrameDecoder {
    buffers: [[u8; BUFFER_LEN]; 2],
    active: usize,
    cursor: usize,
    /// Total frame size once the header is known, zero before that
    expected: usize,
    /// Set when the length field is larger than the buffer; the rest of the
    /// frame is counted but not stored
    discarding: bool,
    completed: Option<Completed>,
    stats: DecoderStats,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffers: [[0; BUFFER_LEN]; 2],
            active: 0,
            cursor: 0,
            expected: 0,
            discarding: false,
            completed: None,
            stats: DecoderStats::default(),
        }
    }

    /// Consume one byte; returns the frame it completes, if any
    pub fn feed(&mut self, byte: u8) -> Option<Frame<'_>> {
        if !self.discarding {
            match self.buffers[self.active].get_mut(self.cursor) {
                Some(slot) => *slot = byte,
                None => {
                    // Unreachable while `expected` is bounded, kept as a hard clamp
                    error!(cursor = self.cursor, "frame cursor ran past buffer, resetting");
                    self.stats.overflows += 1;
                    self.reset();
                    return None;
                }
            }
        }
        self.cursor += 1;

        if self.cursor == HEADER_LEN {
            let header = &self.buffers[self.active];
            let length = u16::from_be_bytes([header[2], header[3]]) as usize;
            self.expected = HEADER_LEN + length;

            if length > MAX_PAYLOAD {
                error!(
                    command = header[0],
                    length,
                    max = MAX_PAYLOAD,
                    "frame length exceeds buffer, discarding frame"
                );
                self.stats.overflows += 1;
                self.discarding = true;
            } else {
                trace!(command = header[0], index = header[1], length, "frame header");
            }
        }

        if self.cursor < HEADER_LEN || self.cursor < self.expected {
            return None;
        }

        self.finish()
    }

    fn finish(&mut self) -> Option<Frame<'_>> {
        let length = self.expected - HEADER_LEN;
        let discarded = self.discarding;
        self.cursor = 0;
        self.expected = 0;
        self.discarding = false;

        if discarded {
            return None;
        }

        let done = self.active;
        let command = self.buffers[done][0];
        if !Command::from_byte(command).is_recognized() {
            self.stats.unrecognized += 1;
            debug!(command, length, "skipping frame with unrecognized command");
            return None;
        }

        self.buffers[done][HEADER_LEN + length] = 0;
        self.active ^= 1;
        self.completed = Some(Completed {
            buffer: done,
            length,
        });
        self.stats.frames += 1;

        self.completed()
    }

    /// The most recently emitted frame
    ///
    /// Stays valid while the next frame accumulates in the other buffer and is
    /// replaced when that one completes.
    pub fn completed(&self) -> Option<Frame<'_>> {
        let Completed { buffer, length } = self.completed?;
        let buf = &self.buffers[buffer];
        Some(Frame {
            command: buf[0],
            index: buf[1],
            length: length as u16,
            payload: &buf[HEADER_LEN..HEADER_LEN + length],
        })
    }

    /// Drop any partial frame and wait for a fresh header
    pub fn reset(&mut self) {
        if self.cursor != 0 {
            debug!(cursor = self.cursor, "frame decoder reset mid-frame");
        }
        self.cursor = 0;
        self.expected = 0;
        self.discarding = false;
    }

    /// Bytes consumed of the frame in progress
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_frame;
    use proptest::prelude::*;

    /// Feed every byte and collect owned copies of emitted frames
    fn feed_all(decoder: &mut FrameDecoder, bytes: &[u8]) -> Vec<(u8, u8, u16, Vec<u8>)> {
        let mut out = Vec::new();
        for &b in bytes {
            if let Some(frame) = decoder.feed(b) {
                out.push((frame.command, frame.index, frame.length, frame.payload.to_vec()));
            }
        }
        out
    }

    #[test]
    fn test_decodes_single_frame() {
        let mut decoder = FrameDecoder::new();
        let bytes = encode_frame(b'T', 2, b"CAFEBEEF").unwrap();
        let frames = feed_all(&mut decoder, &bytes);

        assert_eq!(frames, vec![(b'T', 2, 8, b"CAFEBEEF".to_vec())]);
        assert_eq!(decoder.cursor(), 0);
        assert_eq!(decoder.stats().frames, 1);
    }

    #[test]
    fn test_payload_is_nul_terminated_in_buffer() {
        let mut decoder = FrameDecoder::new();
        let bytes = encode_frame(b'T', 13, b"Hello").unwrap();
        feed_all(&mut decoder, &bytes);

        let frame = decoder.completed().unwrap();
        assert_eq!(frame.payload_str().unwrap(), "Hello");
        let buf = &decoder.buffers[0];
        assert_eq!(buf[HEADER_LEN + 5], 0);
    }

    #[test]
    fn test_zero_length_frame_completes_on_header() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(b't').is_none());
        assert!(decoder.feed(0).is_none());
        assert!(decoder.feed(0).is_none());
        let frame = decoder.feed(0).unwrap();
        assert_eq!(frame.length, 0);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_unrecognized_command_consumed_not_emitted() {
        let mut decoder = FrameDecoder::new();
        let mut stream = encode_frame(b'X', 1, b"ignored").unwrap().to_vec();
        stream.extend_from_slice(&encode_frame(b'T', 4, b"01").unwrap());

        let frames = feed_all(&mut decoder, &stream);
        assert_eq!(frames, vec![(b'T', 4, 2, b"01".to_vec())]);
        assert_eq!(decoder.stats().unrecognized, 1);
    }

    #[test]
    fn test_oversized_length_is_discarded_and_resyncs() {
        let mut decoder = FrameDecoder::new();
        let declared = MAX_PAYLOAD + 500;
        let mut stream = vec![b'T', 1, (declared >> 8) as u8, (declared & 0xFF) as u8];
        stream.extend(std::iter::repeat(0xAA).take(declared));
        stream.extend_from_slice(&encode_frame(b'T', 9, b"FF").unwrap());

        let frames = feed_all(&mut decoder, &stream);
        assert_eq!(frames, vec![(b'T', 9, 2, b"FF".to_vec())]);
        assert_eq!(decoder.stats().overflows, 1);
    }

    #[test]
    fn test_completed_frame_survives_next_partial_frame() {
        let mut decoder = FrameDecoder::new();
        feed_all(&mut decoder, &encode_frame(b'T', 1, b"AB").unwrap());
        // Start the next frame without finishing it
        decoder.feed(b'T');
        decoder.feed(7);
        decoder.feed(0);

        let frame = decoder.completed().unwrap();
        assert_eq!(frame.index, 1);
        assert_eq!(frame.payload, b"AB");
    }

    #[test]
    fn test_reset_discards_partial_frame() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(b'T');
        decoder.feed(1);
        decoder.reset();
        assert_eq!(decoder.cursor(), 0);

        let frames = feed_all(&mut decoder, &encode_frame(b'T', 5, b"00").unwrap());
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_max_payload_frame() {
        let mut decoder = FrameDecoder::new();
        let payload = vec![b'a'; MAX_PAYLOAD];
        let frames = feed_all(&mut decoder, &encode_frame(b'T', 11, &payload).unwrap());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].3.len(), MAX_PAYLOAD);
    }

    proptest! {
        #[test]
        fn frame_round_trip(
            command in prop_oneof![Just(b'T'), Just(b't')],
            index in any::<u8>(),
            payload in proptest::collection::vec(any::<u8>(), 0..=MAX_PAYLOAD),
        ) {
            let mut decoder = FrameDecoder::new();
            let bytes = encode_frame(command, index, &payload).unwrap();
            let frames = feed_all(&mut decoder, &bytes);

            prop_assert_eq!(frames.len(), 1);
            let (c, i, l, p) = &frames[0];
            prop_assert_eq!(*c, command);
            prop_assert_eq!(*i, index);
            prop_assert_eq!(*l as usize, payload.len());
            prop_assert_eq!(p, &payload);
        }

        #[test]
        fn unrecognized_frame_keeps_stream_in_sync(
            command in any::<u8>().prop_filter("unrecognized", |c| *c != b'T' && *c != b't'),
            junk in proptest::collection::vec(any::<u8>(), 0..64),
            payload in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let mut decoder = FrameDecoder::new();
            let first = encode_frame(command, 0, &junk).unwrap();
            for &b in first.iter() {
                prop_assert!(decoder.feed(b).is_none());
            }
            prop_assert_eq!(decoder.cursor(), 0);

            let frames = feed_all(&mut decoder, &encode_frame(b'T', 1, &payload).unwrap());
            prop_assert_eq!(frames.len(), 1);
            prop_assert_eq!(&frames[0].3, &payload);
        }
    }
}
