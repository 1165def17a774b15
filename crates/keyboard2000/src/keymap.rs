//! Keyboard maps
//!
//! A keyboard map belongs to one physical keyboard model (matched by the
//! name the kernel reports) and says which keys play notes and which keys
//! change the instrument state. Maps are TOML files:
//!
//! ```toml
//! device_name = "AT Translated Set 2 keyboard"
//! port_name = "laptop"
//! auto_connect = ["fluidsynth:midi_00"]
//!
//! [notes]
//! 44 = 48   # KEY_Z plays C3
//!
//! [control]
//! 1 = "panic"         # KEY_ESC
//! 59 = "octave_down"  # KEY_F1
//! ```

use crate::error::{Error, Result};
use crate::input::KeyEvent;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Instrument control actions a key can be bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlAction {
    /// Transpose up by an octave
    OctaveUp,
    /// Transpose down by an octave
    OctaveDown,
    /// Transpose up by a semitone
    SemitoneUp,
    /// Transpose down by a semitone
    SemitoneDown,
    /// Next MIDI channel
    ChannelUp,
    /// Previous MIDI channel
    ChannelDown,
    /// Next program
    ProgramUp,
    /// Previous program
    ProgramDown,
    /// Double every note one more octave up
    OctaveLayerAdd,
    /// Drop the topmost octave layer
    OctaveLayerRemove,
    /// Silence everything
    Panic,
    /// Back to the initial state
    Reset,
}

impl ControlAction {
    /// All actions, in declaration order
    pub const ALL: [ControlAction; 12] = [
        ControlAction::OctaveUp,
        ControlAction::OctaveDown,
        ControlAction::SemitoneUp,
        ControlAction::SemitoneDown,
        ControlAction::ChannelUp,
        ControlAction::ChannelDown,
        ControlAction::ProgramUp,
        ControlAction::ProgramDown,
        ControlAction::OctaveLayerAdd,
        ControlAction::OctaveLayerRemove,
        ControlAction::Panic,
        ControlAction::Reset,
    ];

    /// Name used in map files
    pub fn name(&self) -> &'static str {
        match self {
            ControlAction::OctaveUp => "octave_up",
            ControlAction::OctaveDown => "octave_down",
            ControlAction::SemitoneUp => "semitone_up",
            ControlAction::SemitoneDown => "semitone_down",
            ControlAction::ChannelUp => "channel_up",
            ControlAction::ChannelDown => "channel_down",
            ControlAction::ProgramUp => "program_up",
            ControlAction::ProgramDown => "program_down",
            ControlAction::OctaveLayerAdd => "octave_layer_add",
            ControlAction::OctaveLayerRemove => "octave_layer_remove",
            ControlAction::Panic => "panic",
            ControlAction::Reset => "reset",
        }
    }
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ControlAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "octave_add" => return Ok(ControlAction::OctaveLayerAdd),
            "octave_del" => return Ok(ControlAction::OctaveLayerRemove),
            _ => {}
        }
        ControlAction::ALL
            .into_iter()
            .find(|action| action.name() == normalized)
            .ok_or_else(|| Error::Map(format!("Unknown control action '{}'", s)))
    }
}

/// A key bound to a note
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoteEvent {
    /// Untransposed note number (0-127)
    pub note: u8,
    /// true on press
    pub pressed: bool,
}

/// A key bound to a control action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlEvent {
    /// The bound action
    pub action: ControlAction,
    /// true on press
    pub pressed: bool,
}

/// Result of looking a key up in a map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappedEvent {
    /// Play or release a note
    Note(NoteEvent),
    /// Change instrument state
    Control(ControlEvent),
}

/// What a single key is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyBinding {
    /// A note number
    Note(u8),
    /// A control action
    Control(ControlAction),
}

/// Map file as written on disk
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MapFile {
    /// Name reported by the kernel for the keyboard this map is for
    pub device_name: String,
    /// Name of the MIDI output port created for the keyboard
    pub port_name: String,
    /// JACK ports to connect the output port to
    #[serde(default)]
    pub auto_connect: Vec<String>,
    /// keycode -> note number
    #[serde(default)]
    pub notes: BTreeMap<String, i64>,
    /// keycode -> action name
    #[serde(default)]
    pub control: BTreeMap<String, String>,
}

/// Immutable, validated keyboard map
#[derive(Debug, Clone, PartialEq)]
pub struct KeyboardMap {
    device_name: String,
    port_name: String,
    auto_connect: Vec<String>,
    bindings: HashMap<u16, KeyBinding>,
}

fn parse_keycode(key: &str) -> Result<u16> {
    key.trim()
        .parse::<u16>()
        .map_err(|_| Error::Map(format!("Invalid keycode '{}'", key)))
}

impl KeyboardMap {
    /// Validate a parsed map file
    pub fn from_file_contents(file: MapFile) -> Result<Self> {
        if file.port_name.trim().is_empty() {
            return Err(Error::Map("port_name must not be empty".to_string()));
        }

        let mut bindings = HashMap::new();
        for (key, note) in &file.notes {
            let keycode = parse_keycode(key)?;
            if !(0..=127).contains(note) {
                return Err(Error::Map(format!(
                    "Note {} for keycode {} is outside 0-127",
                    note, keycode
                )));
            }
            bindings.insert(keycode, KeyBinding::Note(*note as u8));
        }
        for (key, name) in &file.control {
            let keycode = parse_keycode(key)?;
            let action: ControlAction = name.parse()?;
            if bindings.insert(keycode, KeyBinding::Control(action)).is_some() {
                return Err(Error::Map(format!(
                    "Keycode {} is bound to both a note and an action",
                    keycode
                )));
            }
        }

        Ok(Self {
            device_name: file.device_name,
            port_name: file.port_name,
            auto_connect: file.auto_connect,
            bindings,
        })
    }

    /// Parse a map from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let file: MapFile = toml::from_str(content)?;
        Self::from_file_contents(file)
    }

    /// Load a map file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Map(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
            .map_err(|e| Error::Map(format!("{}: {}", path.display(), e)))
    }

    /// Device name this map is meant for
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Display name of the output port
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Ports the output port gets connected to
    pub fn auto_connect(&self) -> &[String] {
        &self.auto_connect
    }

    /// Binding of a keycode, if any
    pub fn binding(&self, keycode: u16) -> Option<KeyBinding> {
        self.bindings.get(&keycode).copied()
    }

    /// Number of bound keys
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether no key is bound
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Translate a key event; unbound keys yield nothing
    pub fn convert(&self, keycode: u16, pressed: bool) -> Option<MappedEvent> {
        self.binding(keycode).map(|binding| match binding {
            KeyBinding::Note(note) => MappedEvent::Note(NoteEvent { note, pressed }),
            KeyBinding::Control(action) => MappedEvent::Control(ControlEvent { action, pressed }),
        })
    }

    /// Translate a decoded key event
    pub fn convert_event(&self, event: KeyEvent) -> Option<MappedEvent> {
        self.convert(event.keycode, event.pressed)
    }
}

/// Load every `*.toml` map in a directory
///
/// Files that fail to parse are logged and left out.
pub fn load_dir(dir: &Path) -> Result<Vec<(String, KeyboardMap)>> {
    let entries = fs::read_dir(dir)
        .map_err(|e| Error::Map(format!("Failed to read map directory {}: {}", dir.display(), e)))?;

    let mut paths: Vec<_> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    paths.sort();

    let mut maps = Vec::new();
    for path in paths {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match KeyboardMap::load(&path) {
            Ok(map) => maps.push((file_name, map)),
            Err(e) => log::error!("Skipping keyboard map: {}", e),
        }
    }
    Ok(maps)
}

/// Pick the map for a device
///
/// The first map (in file name order) whose `device_name` equals the
/// reported name wins; otherwise the designated default map is used.
pub fn select_map(dir: &Path, default_map: &str, device_name: &str) -> Result<KeyboardMap> {
    let maps = load_dir(dir)?;

    if let Some((file_name, map)) = maps.iter().find(|(_, map)| map.device_name() == device_name) {
        log::debug!("Using map {} for '{}'", file_name, device_name);
        return Ok(map.clone());
    }

    maps.into_iter()
        .find(|(file_name, _)| file_name == default_map)
        .map(|(_, map)| map)
        .ok_or_else(|| {
            Error::Map(format!(
                "No map for '{}' and default map {} is missing or invalid",
                device_name,
                dir.join(default_map).display()
            ))
        })
}

/// Map written by `keyboard2000 init`
///
/// Two octaves on the letter rows of a US layout (Z row + home row from C3,
/// Q row + number row from C4), controls on Escape and the function keys.
pub const DEFAULT_MAP: &str = r#"# keyboard2000 default keyboard map
#
# Used for every keyboard that no other map in this directory claims.
# Keys are Linux keycodes (see `evtest` or linux/input-event-codes.h).

device_name = "default"
port_name = "keyboard"

# JACK MIDI inputs to connect to automatically
auto_connect = []

[notes]
# Z row: C3 .. E4
44 = 48
45 = 50
46 = 52
47 = 53
48 = 55
49 = 57
50 = 59
51 = 60
52 = 62
53 = 64
# home row: sharps
31 = 49
32 = 51
34 = 54
35 = 56
36 = 58
38 = 61
39 = 63
# Q row: C4 .. E5
16 = 60
17 = 62
18 = 64
19 = 65
20 = 67
21 = 69
22 = 71
23 = 72
24 = 74
25 = 76
# number row: sharps
3 = 61
4 = 63
6 = 66
7 = 68
8 = 70
10 = 73
11 = 75

[control]
1 = "panic"                 # Esc
59 = "octave_down"          # F1
60 = "octave_up"            # F2
61 = "semitone_down"        # F3
62 = "semitone_up"          # F4
63 = "octave_layer_remove"  # F5
64 = "octave_layer_add"     # F6
65 = "channel_down"         # F7
66 = "channel_up"           # F8
67 = "program_down"         # F9
68 = "program_up"           # F10
88 = "reset"                # F12
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const PIANO: &str = r#"
device_name = "Cherry USB keyboard"
port_name = "cherry"
auto_connect = ["fluidsynth:midi_00"]

[notes]
30 = 60

[control]
59 = "octave_down"
60 = "octave-up"
64 = "octave_add"
"#;

    #[test]
    fn test_convert_note_and_control() {
        let map = KeyboardMap::from_toml(PIANO).unwrap();
        assert_eq!(map.device_name(), "Cherry USB keyboard");
        assert_eq!(map.port_name(), "cherry");
        assert_eq!(map.auto_connect(), &["fluidsynth:midi_00".to_string()]);

        assert_eq!(
            map.convert(30, true),
            Some(MappedEvent::Note(NoteEvent { note: 60, pressed: true }))
        );
        assert_eq!(
            map.convert(60, false),
            Some(MappedEvent::Control(ControlEvent { action: ControlAction::OctaveUp, pressed: false }))
        );
        assert_eq!(
            map.convert(64, true),
            Some(MappedEvent::Control(ControlEvent { action: ControlAction::OctaveLayerAdd, pressed: true }))
        );
    }

    #[test]
    fn test_unmapped_key_is_ignored() {
        let map = KeyboardMap::from_toml(PIANO).unwrap();
        assert_eq!(map.convert(31, true), None);
        assert_eq!(map.convert_event(KeyEvent { keycode: 200, pressed: false }), None);
    }

    #[test]
    fn test_malformed_maps_are_rejected() {
        let bad_note = "device_name = \"x\"\nport_name = \"x\"\n[notes]\n30 = 128\n";
        assert!(matches!(KeyboardMap::from_toml(bad_note), Err(Error::Map(_))));

        let bad_key = "device_name = \"x\"\nport_name = \"x\"\n[notes]\nspace = 60\n";
        assert!(KeyboardMap::from_toml(bad_key).is_err());

        let bad_action = "device_name = \"x\"\nport_name = \"x\"\n[control]\n1 = \"explode\"\n";
        assert!(KeyboardMap::from_toml(bad_action).is_err());

        let clash = "device_name = \"x\"\nport_name = \"x\"\n[notes]\n1 = 60\n[control]\n1 = \"panic\"\n";
        assert!(KeyboardMap::from_toml(clash).is_err());

        let no_port = "device_name = \"x\"\nport_name = \"\"\n";
        assert!(KeyboardMap::from_toml(no_port).is_err());

        assert!(KeyboardMap::from_toml("this is not toml =").is_err());
    }

    #[test]
    fn test_action_names() {
        for action in ControlAction::ALL {
            assert_eq!(action.name().parse::<ControlAction>().unwrap(), action);
        }
        assert_eq!("Octave-Layer-Remove".parse::<ControlAction>().unwrap(), ControlAction::OctaveLayerRemove);
        assert_eq!("octave_del".parse::<ControlAction>().unwrap(), ControlAction::OctaveLayerRemove);
        assert!("warp".parse::<ControlAction>().is_err());
    }

    #[test]
    fn test_default_map_parses() {
        let map = KeyboardMap::from_toml(DEFAULT_MAP).unwrap();
        assert_eq!(map.binding(44), Some(KeyBinding::Note(48)));
        assert_eq!(map.binding(1), Some(KeyBinding::Control(ControlAction::Panic)));
        assert_eq!(map.binding(88), Some(KeyBinding::Control(ControlAction::Reset)));
    }

    #[test]
    fn test_select_map_by_device_name() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cherry.toml"), PIANO).unwrap();
        fs::write(dir.path().join("default.toml"), DEFAULT_MAP).unwrap();

        let map = select_map(dir.path(), "default.toml", "Cherry USB keyboard").unwrap();
        assert_eq!(map.port_name(), "cherry");

        let fallback = select_map(dir.path(), "default.toml", "Some other keyboard").unwrap();
        assert_eq!(fallback.port_name(), "keyboard");
    }

    #[test]
    fn test_malformed_map_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let broken = PIANO.replace("30 = 60", "30 = 400");
        fs::write(dir.path().join("cherry.toml"), broken).unwrap();
        fs::write(dir.path().join("default.toml"), DEFAULT_MAP).unwrap();
        fs::write(dir.path().join("notes.txt"), "not a map").unwrap();

        let maps = load_dir(dir.path()).unwrap();
        assert_eq!(maps.len(), 1);

        let map = select_map(dir.path(), "default.toml", "Cherry USB keyboard").unwrap();
        assert_eq!(map.port_name(), "keyboard");
    }

    #[test]
    fn test_missing_default_fails() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cherry.toml"), PIANO).unwrap();

        let result = select_map(dir.path(), "default.toml", "Unknown keyboard");
        assert!(matches!(result, Err(Error::Map(_))));
        assert!(select_map(&dir.path().join("missing"), "default.toml", "x").is_err());
    }
}
