//! Per-keyboard instrument state
//!
//! Every attached keyboard owns one [`Instrument`]. It turns mapped key
//! events into MIDI messages and keeps the performance state: transposition,
//! octave layers, channel and program.
//!
//! The instrument remembers which notes it switched on, per octave layer,
//! and only ever sends a note-off for a note it has seen a note-on for.
//! State changes that would make a later note-off miss its note-on
//! (transposing, adding layers, switching channel) send "All Notes Off"
//! first.

use crate::keymap::{ControlAction, ControlEvent, MappedEvent, NoteEvent};
use crate::midi::{MidiMessage, MAX_CHANNEL, MAX_DATA, MIN_CHANNEL};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;

/// Semitones per octave
pub const OCTAVE: i32 = 12;

/// Most extra octave layers; beyond this every layer note is above 127
pub const MAX_OCTAVE_LAYERS: usize = 10;

/// Default lowest note-on velocity
pub const DEFAULT_VELOCITY_MIN: u8 = 64;

/// Default highest note-on velocity
pub const DEFAULT_VELOCITY_MAX: u8 = 127;

/// Mutable performance state of one keyboard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentState {
    /// Octave transposition in semitones (multiple of 12)
    pub octave_transpose: i32,
    /// Semitone transposition
    pub semitone_transpose: i32,
    /// Number of extra octave layers
    pub octave_layers: usize,
    /// MIDI channel (1-16)
    pub channel: u8,
    /// MIDI program (0-127)
    pub program: u8,
    /// Sounding notes; index 0 is the base layer
    sounding: Vec<HashSet<u8>>,
}

impl Default for InstrumentState {
    fn default() -> Self {
        Self {
            octave_transpose: 0,
            semitone_transpose: 0,
            octave_layers: 0,
            channel: MIN_CHANNEL,
            program: 0,
            sounding: vec![HashSet::new()],
        }
    }
}

impl InstrumentState {
    /// Total transposition applied to incoming notes
    pub fn transpose(&self) -> i32 {
        self.octave_transpose.saturating_add(self.semitone_transpose)
    }

    /// Whether a note is sounding in the given layer
    pub fn is_sounding(&self, layer: usize, note: u8) -> bool {
        self.sounding.get(layer).is_some_and(|notes| notes.contains(&note))
    }

    /// Number of sounding notes over all layers
    pub fn sounding_count(&self) -> usize {
        self.sounding.iter().map(HashSet::len).sum()
    }

    fn layer_mut(&mut self, layer: usize) -> &mut HashSet<u8> {
        if self.sounding.len() <= layer {
            self.sounding.resize_with(layer + 1, HashSet::new);
        }
        &mut self.sounding[layer]
    }

    fn clear_sounding(&mut self) {
        self.sounding.truncate(1);
        for notes in &mut self.sounding {
            notes.clear();
        }
    }
}

/// The keyboard-to-MIDI state machine
pub struct Instrument {
    name: String,
    state: InstrumentState,
    velocity_min: u8,
    velocity_max: u8,
    rng: StdRng,
}

impl Instrument {
    /// Create an instrument with the default velocity range
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_rng(name, StdRng::from_os_rng())
    }

    /// Create an instrument with a fixed random seed
    pub fn with_seed(name: impl Into<String>, seed: u64) -> Self {
        Self::with_rng(name, StdRng::seed_from_u64(seed))
    }

    fn with_rng(name: impl Into<String>, rng: StdRng) -> Self {
        Self {
            name: name.into(),
            state: InstrumentState::default(),
            velocity_min: DEFAULT_VELOCITY_MIN,
            velocity_max: DEFAULT_VELOCITY_MAX,
            rng,
        }
    }

    /// Set the note-on velocity range
    ///
    /// Both bounds are clamped to 1-127 and swapped if inverted.
    pub fn with_velocity_range(mut self, min: u8, max: u8) -> Self {
        let min = min.clamp(1, MAX_DATA);
        let max = max.clamp(1, MAX_DATA);
        self.velocity_min = min.min(max);
        self.velocity_max = min.max(max);
        self
    }

    /// Name used in log messages
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state
    pub fn state(&self) -> &InstrumentState {
        &self.state
    }

    /// Handle one mapped key event
    pub fn handle(&mut self, event: MappedEvent) -> Vec<MidiMessage> {
        match event {
            MappedEvent::Note(note) => self.handle_note(note),
            MappedEvent::Control(control) => self.handle_control(control),
        }
    }

    /// Silence everything (panic press followed by its release)
    ///
    /// Used when the keyboard goes away or the program shuts down.
    pub fn flush(&mut self) -> Vec<MidiMessage> {
        let mut messages = self.handle_control(ControlEvent { action: ControlAction::Panic, pressed: true });
        messages.extend(self.handle_control(ControlEvent { action: ControlAction::Panic, pressed: false }));
        messages
    }

    fn velocity(&mut self) -> u8 {
        self.rng.random_range(self.velocity_min..=self.velocity_max)
    }

    fn handle_note(&mut self, event: NoteEvent) -> Vec<MidiMessage> {
        let channel = self.state.channel;
        let effective = (event.note as i32).saturating_add(self.state.transpose());
        let mut messages = Vec::with_capacity(self.state.octave_layers + 1);

        for layer in 0..=self.state.octave_layers {
            let layer_note = effective.saturating_add(OCTAVE * layer as i32);

            if event.pressed {
                let velocity = self.velocity();
                match MidiMessage::note_on(channel, layer_note, velocity) {
                    Ok(msg) => {
                        self.state.layer_mut(layer).insert(layer_note as u8);
                        messages.push(msg);
                    }
                    Err(e) => log::warn!("{}: dropping note-on: {}", self.name, e),
                }
            } else {
                if !(0..=MAX_DATA as i32).contains(&layer_note) {
                    log::warn!("{}: dropping note-off: note out of range: {}", self.name, layer_note);
                    continue;
                }
                if !self.state.layer_mut(layer).remove(&(layer_note as u8)) {
                    continue;
                }
                match MidiMessage::note_off(channel, layer_note) {
                    Ok(msg) => messages.push(msg),
                    Err(e) => log::warn!("{}: dropping note-off: {}", self.name, e),
                }
            }
        }

        messages
    }

    /// All Notes Off on the current channel, forgetting the sounding notes
    fn silence(&mut self) -> Vec<MidiMessage> {
        let messages = self.all_notes_off();
        self.state.clear_sounding();
        messages
    }

    fn all_notes_off(&self) -> Vec<MidiMessage> {
        match MidiMessage::all_notes_off(self.state.channel) {
            Ok(msg) => vec![msg],
            Err(e) => {
                log::warn!("{}: dropping all-notes-off: {}", self.name, e);
                Vec::new()
            }
        }
    }

    fn program_change(&self) -> Vec<MidiMessage> {
        match MidiMessage::program_change(self.state.channel, self.state.program) {
            Ok(msg) => vec![msg],
            Err(e) => {
                log::warn!("{}: dropping program change: {}", self.name, e);
                Vec::new()
            }
        }
    }

    fn handle_control(&mut self, event: ControlEvent) -> Vec<MidiMessage> {
        if !event.pressed {
            return Vec::new();
        }

        let state = &mut self.state;
        match event.action {
            ControlAction::OctaveUp | ControlAction::OctaveDown => {
                let step = if event.action == ControlAction::OctaveUp { OCTAVE } else { -OCTAVE };
                state.octave_transpose = state.octave_transpose.saturating_add(step);
                log::info!("{}: octave transpose {:+} semitones", self.name, state.octave_transpose);
                self.silence()
            }
            ControlAction::SemitoneUp | ControlAction::SemitoneDown => {
                let step = if event.action == ControlAction::SemitoneUp { 1 } else { -1 };
                state.semitone_transpose = state.semitone_transpose.saturating_add(step);
                log::info!("{}: semitone transpose {:+}", self.name, state.semitone_transpose);
                self.silence()
            }
            ControlAction::OctaveLayerAdd => {
                if state.octave_layers >= MAX_OCTAVE_LAYERS {
                    log::warn!("{}: already {} octave layers, not adding more", self.name, MAX_OCTAVE_LAYERS);
                    return Vec::new();
                }
                state.octave_layers += 1;
                log::info!("{}: {} extra octave layers", self.name, state.octave_layers);
                self.silence()
            }
            ControlAction::OctaveLayerRemove => {
                state.octave_layers = state.octave_layers.saturating_sub(1);
                log::info!("{}: {} extra octave layers", self.name, state.octave_layers);
                self.silence()
            }
            ControlAction::ChannelUp | ControlAction::ChannelDown => {
                let target = if event.action == ControlAction::ChannelUp {
                    state.channel as i32 + 1
                } else {
                    state.channel as i32 - 1
                };
                if !(MIN_CHANNEL as i32..=MAX_CHANNEL as i32).contains(&target) {
                    log::warn!("{}: channel {} is the limit, staying there", self.name, state.channel);
                    return Vec::new();
                }
                // Silence the channel the sounding notes are on before leaving it
                let messages = self.silence();
                self.state.channel = target as u8;
                log::info!("{}: channel {}", self.name, self.state.channel);
                messages
            }
            ControlAction::ProgramUp => {
                if state.program >= MAX_DATA {
                    log::info!("{}: program is {}, no higher is possible", self.name, MAX_DATA);
                    return Vec::new();
                }
                state.program += 1;
                log::info!("{}: program {}", self.name, state.program);
                self.program_change()
            }
            ControlAction::ProgramDown => {
                if state.program == 0 {
                    log::info!("{}: program is 0, no lower is possible", self.name);
                    return Vec::new();
                }
                state.program -= 1;
                log::info!("{}: program {}", self.name, state.program);
                self.program_change()
            }
            ControlAction::Panic => {
                log::info!("{}: panic", self.name);
                self.silence()
            }
            ControlAction::Reset => {
                log::info!("{}: reset", self.name);
                // Held notes keep their note-off unless reset moves them
                let moved = state.transpose() != 0 || state.octave_layers != 0 || state.channel != MIN_CHANNEL;
                let messages = if moved && state.sounding_count() > 0 {
                    self.silence()
                } else {
                    Vec::new()
                };
                self.state.octave_transpose = 0;
                self.state.semitone_transpose = 0;
                self.state.octave_layers = 0;
                self.state.channel = MIN_CHANNEL;
                self.state.program = 0;
                messages
            }
        }
    }
}
