//! Queues between the radio UART task and the control task.
//!
//! The radio module streams raw bytes; framing happens inside the core's
//! assembler, so the UART side only forwards whatever chunk the driver
//! returned. Status pins and the session button share the same inbound queue
//! so the control loop sees every event in arrival order.

#![cfg_attr(not(target_os = "none"), allow(dead_code))]

use bilateral_core::codec::WireFrame;
use bilateral_core::controller::{Transport, TransportError};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Receiver, Sender, TrySendError};
use heapless::Vec;

use crate::inputs::ButtonAction;

/// Largest chunk forwarded from the UART in one event.
pub const LINK_CHUNK_SIZE: usize = 64;
/// Depth of the inbound event queue.
pub const INBOUND_QUEUE_DEPTH: usize = 8;
/// Depth of the outbound frame queue.
pub const OUTBOUND_QUEUE_DEPTH: usize = 8;

/// Bytes read from the UART in one go.
pub type LinkChunk = Vec<u8, LINK_CHUNK_SIZE>;
/// One encoded frame waiting for the UART.
pub type OutboundFrame = WireFrame;

/// Everything the control task reacts to besides its own deadlines.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlEvent {
    /// Bytes received from the peer.
    Bytes(LinkChunk),
    /// The radio reports a connection to the peer.
    PeerUp,
    /// The radio reports the peer connection dropped.
    PeerDown,
    /// The phone app connected to this device.
    PhoneUp,
    /// The phone app disconnected.
    PhoneDown,
    /// Debounced gesture on the session button.
    Button(ButtonAction),
}

pub type InboundQueue = Channel<CriticalSectionRawMutex, ControlEvent, INBOUND_QUEUE_DEPTH>;
pub type InboundSender<'a> = Sender<'a, CriticalSectionRawMutex, ControlEvent, INBOUND_QUEUE_DEPTH>;
pub type InboundReceiver<'a> =
    Receiver<'a, CriticalSectionRawMutex, ControlEvent, INBOUND_QUEUE_DEPTH>;

pub type OutboundQueue = Channel<CriticalSectionRawMutex, OutboundFrame, OUTBOUND_QUEUE_DEPTH>;
pub type OutboundSender<'a> =
    Sender<'a, CriticalSectionRawMutex, OutboundFrame, OUTBOUND_QUEUE_DEPTH>;
pub type OutboundReceiver<'a> =
    Receiver<'a, CriticalSectionRawMutex, OutboundFrame, OUTBOUND_QUEUE_DEPTH>;

/// [`Transport`] that hands frames to the UART task without blocking.
pub struct QueueTransport<'a> {
    sender: OutboundSender<'a>,
    connected: bool,
}

impl<'a> QueueTransport<'a> {
    pub fn new(sender: OutboundSender<'a>) -> Self {
        Self {
            sender,
            connected: false,
        }
    }

    /// Mirrors the radio's connection pin.
    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }
}

impl Transport for QueueTransport<'_> {
    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }
        let frame = OutboundFrame::from_slice(frame).map_err(|_| TransportError::QueueFull)?;
        match self.sender.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TransportError::QueueFull),
        }
    }
}

/// Splits a received buffer into queue-sized chunks.
pub fn chunks(bytes: &[u8]) -> impl Iterator<Item = LinkChunk> + '_ {
    bytes
        .chunks(LINK_CHUNK_SIZE)
        .filter_map(|chunk| LinkChunk::from_slice(chunk).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_refused_while_the_radio_is_down() {
        let queue = OutboundQueue::new();
        let mut transport = QueueTransport::new(queue.sender());

        assert_eq!(transport.send(b"READY\x04"), Err(TransportError::Disconnected));
        assert!(queue.try_receive().is_err());
    }

    #[test]
    fn full_queue_reports_back_pressure() {
        let queue = OutboundQueue::new();
        let mut transport = QueueTransport::new(queue.sender());
        transport.set_connected(true);

        for _ in 0..OUTBOUND_QUEUE_DEPTH {
            transport.send(b"PING:1|0\x04").expect("queue has room");
        }
        assert_eq!(transport.send(b"PING:2|0\x04"), Err(TransportError::QueueFull));

        let first = queue.try_receive().expect("queued frame");
        assert_eq!(first.as_slice(), b"PING:1|0\x04");
    }

    #[test]
    fn long_reads_are_split_into_chunks() {
        let bytes = [b'x'; LINK_CHUNK_SIZE * 2 + 3];
        let lens: std::vec::Vec<usize> = chunks(&bytes).map(|chunk| chunk.len()).collect();
        assert_eq!(lens, [LINK_CHUNK_SIZE, LINK_CHUNK_SIZE, 3]);
    }
}
