//! Event queue between the device threads and the JACK process callback
//!
//! A bounded multi-producer, single-consumer channel. Producers never
//! block: when the queue is full the new event is dropped and counted.
//! The consumer only ever makes non-blocking pop attempts.

use crate::midi::MidiMessage;
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Default queue capacity
pub const DEFAULT_CAPACITY: usize = 1024;

/// Identifies one output port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(pub u32);

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port#{}", self.0)
    }
}

/// A MIDI message on its way to an output port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedEvent {
    /// Destination port
    pub port: PortId,
    /// The message
    pub message: MidiMessage,
}

/// Create a queue with the given capacity
pub fn event_queue(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = bounded(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        EventSender { tx, dropped },
        EventReceiver { rx },
    )
}

/// Producer side, one clone per device thread
#[derive(Clone)]
pub struct EventSender {
    tx: Sender<QueuedEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    /// Queue an event without blocking
    ///
    /// Returns false if the event was dropped (queue full or consumer gone).
    pub fn push(&self, event: QueuedEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Queue several messages for one port
    pub fn push_all(&self, port: PortId, messages: impl IntoIterator<Item = MidiMessage>) {
        for message in messages {
            self.push(QueuedEvent { port, message });
        }
    }

    /// Number of events dropped so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Number of events waiting
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    /// Whether the consumer has taken every event
    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

/// Consumer side, owned by the process callback
pub struct EventReceiver {
    rx: Receiver<QueuedEvent>,
}

impl EventReceiver {
    /// Take the oldest event if there is one; never blocks
    pub fn pop(&self) -> Option<QueuedEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}
