//! keyboard2000 - Computer keyboards as JACK MIDI instruments
//!
//! Reads key events straight from the kernel input devices, so several
//! keyboards can be played at once and each shows up as its own MIDI
//! output port. Features include:
//!
//! - Hot-plug: keyboards are picked up and released while running
//! - Per-keyboard TOML maps (keycode → note or control action)
//! - Transposition, octave layering, channel and program switching
//! - JACK MIDI output with a non-blocking queue into the realtime callback
//!
//! # Usage as a Library
//!
//! ```no_run
//! use keyboard2000::{Instrument, KeyboardMap, DEFAULT_MAP};
//!
//! let map = KeyboardMap::from_toml(DEFAULT_MAP).unwrap();
//! let mut instrument = Instrument::new("demo");
//!
//! // KEY_Z pressed
//! if let Some(event) = map.convert(44, true) {
//!     for message in instrument.handle(event) {
//!         println!("{:02x?}", message.encode().as_slice());
//!     }
//! }
//! ```

pub mod audio;
pub mod bridge;
pub mod config;
pub mod error;
pub mod input;
pub mod instrument;
pub mod keymap;
pub mod midi;
pub mod registry;
pub mod router;
pub mod supervisor;

// Re-export main types
pub use bridge::{event_queue, EventReceiver, EventSender, PortId, QueuedEvent};
pub use config::Config;
pub use error::{Error, Result};
pub use input::{KeyEvent, KeyEventReader, RecordLayout};
pub use instrument::{Instrument, InstrumentState};
pub use keymap::{ControlAction, KeyboardMap, MappedEvent, DEFAULT_MAP};
pub use midi::MidiMessage;
pub use registry::{DeviceInfo, DeviceRegistry, ProcRegistry};
pub use supervisor::{OutputPorts, Supervisor, SupervisorSettings};
