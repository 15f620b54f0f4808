//! Byte-stream framing on the `0x04` terminator.
//!
//! Transport callbacks push raw bytes into a bounded ring; the control loop
//! drains complete frames once per iteration. A frame that outgrows
//! [`MAX_FRAME_LEN`] is discarded up to its terminator so one corrupt frame
//! never desynchronizes the stream.

use core::fmt;

use heapless::{Deque, Vec};

/// Frame terminator (ASCII EOT).
pub const EOT: u8 = 0x04;
/// Inbound ring capacity.
pub const RX_RING_CAPACITY: usize = 256;
/// Longest frame body accepted, terminator excluded.
pub const MAX_FRAME_LEN: usize = 128;

/// Frame body without its terminator.
pub type Frame = Vec<u8, MAX_FRAME_LEN>;

/// Problems detected while splitting the byte stream.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FramingError {
    /// Body exceeded [`MAX_FRAME_LEN`]; it was dropped up to its terminator.
    FrameTooLong,
    /// Bytes arrived while the ring was full and were dropped.
    RingOverflow { dropped: usize },
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramingError::FrameTooLong => write!(f, "frame longer than {MAX_FRAME_LEN} bytes"),
            FramingError::RingOverflow { dropped } => {
                write!(f, "receive ring full, dropped {dropped} bytes")
            }
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Discard {
    Off,
    /// Current body overflowed; report it at the terminator.
    TooLong,
    /// Bytes were lost; skip silently to the next terminator.
    Resync,
}

/// Reassembles terminator-delimited frames from arbitrary byte chunks.
pub struct FrameAssembler {
    ring: Deque<u8, RX_RING_CAPACITY>,
    partial: Frame,
    discard: Discard,
    dropped: usize,
}

impl FrameAssembler {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: Deque::new(),
            partial: Vec::new(),
            discard: Discard::Off,
            dropped: 0,
        }
    }

    /// Queues received bytes. Returns how many were accepted.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> usize {
        let mut accepted = 0;
        for &byte in bytes {
            if self.ring.push_back(byte).is_err() {
                self.dropped += bytes.len() - accepted;
                break;
            }
            accepted += 1;
        }
        accepted
    }

    /// Bytes waiting in the ring.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.ring.len() + self.partial.len()
    }

    /// Drops everything buffered, e.g. after the link went down.
    pub fn clear(&mut self) {
        self.ring.clear();
        self.partial.clear();
        self.discard = Discard::Off;
        self.dropped = 0;
    }

    /// Returns the next complete frame, or `None` once the ring holds no
    /// terminator.
    pub fn next_frame(&mut self) -> Option<Result<Frame, FramingError>> {
        if self.dropped > 0 {
            let dropped = core::mem::take(&mut self.dropped);
            // The stream is now missing bytes; resynchronize on the next terminator.
            self.partial.clear();
            self.discard = Discard::Resync;
            return Some(Err(FramingError::RingOverflow { dropped }));
        }

        while let Some(byte) = self.ring.pop_front() {
            if byte == EOT {
                match core::mem::replace(&mut self.discard, Discard::Off) {
                    Discard::TooLong => return Some(Err(FramingError::FrameTooLong)),
                    Discard::Resync => continue,
                    Discard::Off => {}
                }
                if self.partial.is_empty() {
                    continue;
                }
                return Some(Ok(core::mem::take(&mut self.partial)));
            }

            if self.discard != Discard::Off {
                continue;
            }
            if self.partial.push(byte).is_err() {
                self.partial.clear();
                self.discard = Discard::TooLong;
            }
        }

        None
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_frames_across_chunks() {
        let mut assembler = FrameAssembler::new();
        assembler.push_bytes(b"PING:1|");
        assert!(assembler.next_frame().is_none());

        assembler.push_bytes(b"500\x04READY\x04");
        let first = assembler.next_frame().expect("frame").expect("valid");
        assert_eq!(first.as_slice(), b"PING:1|500");
        let second = assembler.next_frame().expect("frame").expect("valid");
        assert_eq!(second.as_slice(), b"READY");
        assert!(assembler.next_frame().is_none());
    }

    #[test]
    fn empty_frames_are_skipped() {
        let mut assembler = FrameAssembler::new();
        assembler.push_bytes(b"\x04\x04SEED_ACK\x04");
        let frame = assembler.next_frame().expect("frame").expect("valid");
        assert_eq!(frame.as_slice(), b"SEED_ACK");
    }

    #[test]
    fn oversized_frame_is_dropped_up_to_terminator() {
        let mut assembler = FrameAssembler::new();
        let long = [b'A'; MAX_FRAME_LEN + 10];
        assembler.push_bytes(&long);
        assembler.push_bytes(b"\x04READY\x04");

        assert_eq!(
            assembler.next_frame(),
            Some(Err(FramingError::FrameTooLong))
        );
        let frame = assembler.next_frame().expect("frame").expect("valid");
        assert_eq!(frame.as_slice(), b"READY");
    }

    #[test]
    fn ring_overflow_resynchronizes() {
        let mut assembler = FrameAssembler::new();
        let filler = [b'x'; RX_RING_CAPACITY];
        assert_eq!(assembler.push_bytes(&filler), RX_RING_CAPACITY);
        assert_eq!(assembler.push_bytes(b"tail"), 0);

        assert_eq!(
            assembler.next_frame(),
            Some(Err(FramingError::RingOverflow { dropped: 4 }))
        );
        // The damaged run of filler is discarded without a frame.
        assert!(assembler.next_frame().is_none());

        assembler.push_bytes(b"\x04GET_BATTERY\x04");
        let frame = assembler.next_frame().expect("frame").expect("valid");
        assert_eq!(frame.as_slice(), b"GET_BATTERY");
    }
}
