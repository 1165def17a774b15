//! MIDI messages
//!
//! Every message is range-checked when it is built, so anything that exists
//! as a [`MidiMessage`] encodes to valid wire bytes. Encoding never allocates
//! because it runs inside the JACK process callback.

use crate::error::{Error, Result};

/// Controller number of the "All Notes Off" channel mode message
pub const ALL_NOTES_OFF: u8 = 123;

/// Lowest MIDI channel (user-facing numbering)
pub const MIN_CHANNEL: u8 = 1;

/// Highest MIDI channel (user-facing numbering)
pub const MAX_CHANNEL: u8 = 16;

/// Highest value of a MIDI data byte
pub const MAX_DATA: u8 = 127;

/// MIDI message types
///
/// Channels use the musician's numbering 1-16; the status nibble is derived
/// when encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiMessage {
    /// Note on: channel, note, velocity
    NoteOn { channel: u8, note: u8, velocity: u8 },
    /// Note off: channel, note
    NoteOff { channel: u8, note: u8 },
    /// Control change: channel, controller, value
    ControlChange { channel: u8, controller: u8, value: u8 },
    /// Program change: channel, program
    ProgramChange { channel: u8, program: u8 },
}

fn check_channel(channel: u8) -> Result<u8> {
    if (MIN_CHANNEL..=MAX_CHANNEL).contains(&channel) {
        Ok(channel)
    } else {
        Err(Error::OutOfRange { what: "channel", value: channel as i32 })
    }
}

fn check_data(what: &'static str, value: i32) -> Result<u8> {
    if (0..=MAX_DATA as i32).contains(&value) {
        Ok(value as u8)
    } else {
        Err(Error::OutOfRange { what, value })
    }
}

impl MidiMessage {
    /// Build a note-on message
    ///
    /// The note is taken as `i32` so transposed values can be validated
    /// without wrapping first.
    pub fn note_on(channel: u8, note: i32, velocity: u8) -> Result<Self> {
        Ok(MidiMessage::NoteOn {
            channel: check_channel(channel)?,
            note: check_data("note", note)?,
            velocity: check_data("velocity", velocity as i32)?,
        })
    }

    /// Build a note-off message (release velocity 0)
    pub fn note_off(channel: u8, note: i32) -> Result<Self> {
        Ok(MidiMessage::NoteOff {
            channel: check_channel(channel)?,
            note: check_data("note", note)?,
        })
    }

    /// Build a control change message
    pub fn control_change(channel: u8, controller: u8, value: u8) -> Result<Self> {
        Ok(MidiMessage::ControlChange {
            channel: check_channel(channel)?,
            controller: check_data("controller", controller as i32)?,
            value: check_data("value", value as i32)?,
        })
    }

    /// Build an "All Notes Off" (CC 123) message
    pub fn all_notes_off(channel: u8) -> Result<Self> {
        Self::control_change(channel, ALL_NOTES_OFF, 0)
    }

    /// Build a program change message
    pub fn program_change(channel: u8, program: u8) -> Result<Self> {
        Ok(MidiMessage::ProgramChange {
            channel: check_channel(channel)?,
            program: check_data("program", program as i32)?,
        })
    }

    /// Channel this message is addressed to (1-16)
    pub fn channel(&self) -> u8 {
        match *self {
            MidiMessage::NoteOn { channel, .. }
            | MidiMessage::NoteOff { channel, .. }
            | MidiMessage::ControlChange { channel, .. }
            | MidiMessage::ProgramChange { channel, .. } => channel,
        }
    }

    /// Encode to raw MIDI bytes
    pub fn encode(&self) -> MidiBytes {
        let status = |kind: u8, channel: u8| kind | ((channel - 1) & 0x0F);
        match *self {
            MidiMessage::NoteOn { channel, note, velocity } => {
                MidiBytes::three(status(0x90, channel), note, velocity)
            }
            MidiMessage::NoteOff { channel, note } => {
                MidiBytes::three(status(0x80, channel), note, 0)
            }
            MidiMessage::ControlChange { channel, controller, value } => {
                MidiBytes::three(status(0xB0, channel), controller, value)
            }
            MidiMessage::ProgramChange { channel, program } => {
                MidiBytes::two(status(0xC0, channel), program)
            }
        }
    }
}

/// Encoded MIDI message kept on the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiBytes {
    bytes: [u8; 3],
    len: usize,
}

impl MidiBytes {
    fn two(status: u8, data: u8) -> Self {
        Self { bytes: [status, data, 0], len: 2 }
    }

    fn three(status: u8, data1: u8, data2: u8) -> Self {
        Self { bytes: [status, data1, data2], len: 3 }
    }

    /// The wire bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_midi_message_bytes() {
        let note_on = MidiMessage::note_on(1, 60, 100).unwrap();
        assert_eq!(note_on.encode().as_slice(), &[0x90, 60, 100]);

        let note_off = MidiMessage::note_off(2, 48).unwrap();
        assert_eq!(note_off.encode().as_slice(), &[0x81, 48, 0]);

        let cc = MidiMessage::all_notes_off(16).unwrap();
        assert_eq!(cc.encode().as_slice(), &[0xBF, 123, 0]);

        let program = MidiMessage::program_change(1, 5).unwrap();
        assert_eq!(program.encode().as_slice(), &[0xC0, 5]);
    }

    #[test]
    fn test_out_of_range_is_rejected() {
        assert!(MidiMessage::note_on(1, 128, 100).is_err());
        assert!(MidiMessage::note_on(1, -1, 100).is_err());
        assert!(MidiMessage::note_on(1, 60, 128).is_err());
        assert!(MidiMessage::note_off(0, 60).is_err());
        assert!(MidiMessage::note_off(17, 60).is_err());
        assert!(MidiMessage::program_change(1, 200).is_err());
    }

    #[test]
    fn test_channel_accessor() {
        let msg = MidiMessage::note_off(9, 40).unwrap();
        assert_eq!(msg.channel(), 9);
    }
}
