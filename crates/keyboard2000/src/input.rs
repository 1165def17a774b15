//! Kernel input event decoding
//!
//! Reads `struct input_event` records from an evdev node
//! (`/dev/input/eventN`) and turns them into key press/release events.
//!
//! The kernel delivers records in groups terminated by a `SYN_REPORT`
//! record. Only `EV_KEY` records with value 0 (release) or 1 (press) are
//! kept; auto-repeat (value 2), scan codes (`EV_MSC`), LED state and the
//! rest are skipped.

use crate::error::{Error, Result};
use byteorder::{ByteOrder, NativeEndian};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Synchronization record type
pub const EV_SYN: u16 = 0x00;
/// Key/button record type
pub const EV_KEY: u16 = 0x01;
/// End of a group of records
pub const SYN_REPORT: u16 = 0;
/// The kernel's event buffer overflowed and records were lost
pub const SYN_DROPPED: u16 = 3;

/// Size of the largest record layout
const MAX_RECORD_SIZE: usize = 24;

/// Byte layout of `struct input_event`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordLayout {
    /// 64-bit `timeval`: 24 byte records
    Wide,
    /// 32-bit `timeval`: 16 byte records
    Compact,
}

impl RecordLayout {
    /// Layout used by the kernel of the platform we were built for
    pub fn native() -> Self {
        #[cfg(target_pointer_width = "64")]
        {
            RecordLayout::Wide
        }

        #[cfg(not(target_pointer_width = "64"))]
        {
            RecordLayout::Compact
        }
    }

    /// Size of one record in bytes
    pub fn record_size(self) -> usize {
        match self {
            RecordLayout::Wide => 24,
            RecordLayout::Compact => 16,
        }
    }
}

/// One decoded `struct input_event`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRecord {
    /// Timestamp seconds
    pub seconds: i64,
    /// Timestamp microseconds
    pub microseconds: i64,
    /// Event type (`EV_*`)
    pub kind: u16,
    /// Event code (keycode for `EV_KEY`)
    pub code: u16,
    /// Event value (0 release, 1 press, 2 repeat for `EV_KEY`)
    pub value: i32,
}

impl RawRecord {
    /// Read one record in the given layout
    ///
    /// The whole record is read with a single call: evdev rejects reads
    /// shorter than one `struct input_event` with `EINVAL`.
    pub fn read_from<R: Read>(reader: &mut R, layout: RecordLayout) -> io::Result<Self> {
        let mut buf = [0u8; MAX_RECORD_SIZE];
        let buf = &mut buf[..layout.record_size()];
        reader.read_exact(buf)?;
        Ok(Self::decode(buf, layout))
    }

    /// Decode one record from exactly `layout.record_size()` bytes
    fn decode(buf: &[u8], layout: RecordLayout) -> Self {
        let (seconds, microseconds, rest) = match layout {
            RecordLayout::Wide => (
                NativeEndian::read_i64(&buf[0..8]),
                NativeEndian::read_i64(&buf[8..16]),
                &buf[16..],
            ),
            RecordLayout::Compact => (
                NativeEndian::read_i32(&buf[0..4]) as i64,
                NativeEndian::read_i32(&buf[4..8]) as i64,
                &buf[8..],
            ),
        };
        Self {
            seconds,
            microseconds,
            kind: NativeEndian::read_u16(&rest[0..2]),
            code: NativeEndian::read_u16(&rest[2..4]),
            value: NativeEndian::read_i32(&rest[4..8]),
        }
    }

    /// True for the record that closes a group
    ///
    /// Accepts the all-zero payload as well as `SYN_REPORT` with value 1.
    pub fn is_sync(&self) -> bool {
        self.kind == EV_SYN && self.code == SYN_REPORT && (self.value == 0 || self.value == 1)
    }

    /// True when the kernel reports lost records
    pub fn is_dropped(&self) -> bool {
        self.kind == EV_SYN && self.code == SYN_DROPPED
    }

    /// The key event carried by this record, if it is a press or release
    pub fn key_event(&self) -> Option<KeyEvent> {
        if self.kind != EV_KEY {
            return None;
        }
        match self.value {
            0 => Some(KeyEvent { keycode: self.code, pressed: false }),
            1 => Some(KeyEvent { keycode: self.code, pressed: true }),
            _ => None,
        }
    }
}

/// A key press or release
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyEvent {
    /// Kernel keycode (`KEY_*`)
    pub keycode: u16,
    /// true on press, false on release
    pub pressed: bool,
}

/// Decodes key events from a kernel input stream
///
/// Once a read fails (device unplugged, EOF) the reader is finished and
/// yields nothing more.
pub struct KeyEventReader<R> {
    source: R,
    layout: RecordLayout,
    pending: VecDeque<KeyEvent>,
    finished: bool,
}

impl KeyEventReader<File> {
    /// Open an evdev node for reading
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| Error::Device(format!("Failed to open {}: {}", path.display(), e)))?;
        Ok(Self::new(file, RecordLayout::native()))
    }
}

impl<R: Read> KeyEventReader<R> {
    /// Wrap a byte source
    pub fn new(source: R, layout: RecordLayout) -> Self {
        Self {
            source,
            layout,
            pending: VecDeque::new(),
            finished: false,
        }
    }

    /// Whether the underlying stream has ended
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Read records up to the next sync record and return the key events
    /// of that group in arrival order
    ///
    /// Returns `None` once the stream has ended. A group cut short by the
    /// end of the stream is discarded.
    pub fn next_batch(&mut self) -> Option<Vec<KeyEvent>> {
        if self.finished {
            return None;
        }

        let mut batch = Vec::new();
        loop {
            let record = match RawRecord::read_from(&mut self.source, self.layout) {
                Ok(record) => record,
                Err(e) => {
                    if e.kind() == io::ErrorKind::UnexpectedEof {
                        log::debug!("Input stream ended");
                    } else {
                        log::debug!("Input stream read failed: {}", e);
                    }
                    self.finished = true;
                    return None;
                }
            };

            if record.is_sync() {
                return Some(batch);
            }
            if record.is_dropped() {
                log::warn!("Kernel dropped input records, discarding {} pending key events", batch.len());
                batch.clear();
                continue;
            }
            if let Some(event) = record.key_event() {
                batch.push(event);
            }
        }
    }
}

impl<R: Read> Iterator for KeyEventReader<R> {
    type Item = KeyEvent;

    fn next(&mut self) -> Option<KeyEvent> {
        while self.pending.is_empty() {
            let batch = self.next_batch()?;
            self.pending.extend(batch);
        }
        self.pending.pop_front()
    }
}
