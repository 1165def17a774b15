//! Configuration file support for keyboard2000
//!
//! Configuration is stored in TOML format at:
//! - Linux: `~/.config/keyboard2000/config.toml`
//!
//! Keyboard maps live next to it in `~/.config/keyboard2000/maps/` unless
//! `[maps] directory` points elsewhere.

use crate::bridge::DEFAULT_CAPACITY;
use crate::error::{Error, Result};
use crate::instrument::{DEFAULT_VELOCITY_MAX, DEFAULT_VELOCITY_MIN};
use crate::keymap::DEFAULT_MAP;
use crate::midi::MAX_DATA;
use crate::registry::{ProcRegistry, DEFAULT_INPUT_DIR, DEFAULT_REGISTRY_PATH, KEYBOARD_CAPABILITIES};
use crate::supervisor::{
    SupervisorSettings, DEFAULT_ATTACH_DELAY_MS, DEFAULT_POLL_INTERVAL_MS, DEFAULT_SHUTDOWN_GRACE_MS,
};
use directories::ProjectDirs;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// JACK configuration
    pub jack: JackSettings,
    /// Device discovery
    pub devices: DeviceSettings,
    /// Keyboard maps
    pub maps: MapSettings,
    /// Event queue
    pub queue: QueueSettings,
    /// Note generation
    pub instrument: InstrumentSettings,
    /// Lifecycle timing
    pub supervisor: SupervisorTiming,
}

impl Config {
    /// Load configuration from the default config file location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            Err(Error::Config(format!("Config file not found at {:?}", path)))
        }
    }

    /// Load configuration or return default if not found
    pub fn load_or_default() -> Self {
        match Self::config_path() {
            Ok(path) => Self::load_or_default_from(&path),
            Err(_) => Self::default(),
        }
    }

    /// Load a config file, falling back to defaults
    ///
    /// A missing file is normal; an unreadable or malformed one is logged.
    pub fn load_or_default_from(path: &Path) -> Self {
        match Self::load_from(path) {
            Ok(config) => config,
            Err(Error::Config(_)) => Self::default(),
            Err(e) => {
                log::warn!("Ignoring config file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("", "", "keyboard2000")
            .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))
    }

    /// Get the default configuration file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.config_dir().join("config.toml"))
    }

    /// Get the default keyboard map directory
    pub fn default_map_dir() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.config_dir().join("maps"))
    }

    /// The keyboard map directory in effect
    pub fn map_dir(&self) -> Result<PathBuf> {
        match &self.maps.directory {
            Some(dir) => Ok(dir.clone()),
            None => Self::default_map_dir(),
        }
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.queue.capacity == 0 {
            return Err(Error::Config("queue.capacity must be at least 1".to_string()));
        }
        if self.queue.events_per_cycle == 0 {
            return Err(Error::Config("queue.events_per_cycle must be at least 1".to_string()));
        }
        if self.devices.poll_interval_ms == 0 {
            return Err(Error::Config("devices.poll_interval_ms must be at least 1".to_string()));
        }
        let (min, max) = (self.instrument.velocity_min, self.instrument.velocity_max);
        if !(1..=MAX_DATA).contains(&min) || !(1..=MAX_DATA).contains(&max) {
            return Err(Error::Config(format!(
                "velocity bounds must be within 1..={}, got {}..={}",
                MAX_DATA, min, max
            )));
        }
        if min > max {
            return Err(Error::Config(format!(
                "velocity_min ({}) is above velocity_max ({})",
                min, max
            )));
        }
        if self.maps.default_map.is_empty() {
            return Err(Error::Config("maps.default_map must not be empty".to_string()));
        }
        Ok(())
    }

    /// Registry described by the `[devices]` section
    pub fn registry(&self) -> ProcRegistry {
        ProcRegistry::new(
            &self.devices.registry_path,
            &self.devices.input_dir,
            self.devices.capabilities.clone(),
        )
    }

    /// Supervisor settings described by this configuration
    pub fn supervisor_settings(&self) -> Result<SupervisorSettings> {
        Ok(SupervisorSettings {
            map_dir: self.map_dir()?,
            default_map: self.maps.default_map.clone(),
            poll_interval: Duration::from_millis(self.devices.poll_interval_ms),
            attach_delay: Duration::from_millis(self.devices.attach_delay_ms),
            shutdown_grace: Duration::from_millis(self.supervisor.shutdown_grace_ms),
            velocity_min: self.instrument.velocity_min,
            velocity_max: self.instrument.velocity_max,
        })
    }

    /// Create a default config file with comments, plus the default map
    ///
    /// Existing files are left alone. Returns the config file path.
    pub fn create_default_config_file() -> Result<PathBuf> {
        let path = Self::config_path()?;
        Self::write_default_files(&path, &Self::default_map_dir()?)?;
        Ok(path)
    }

    fn write_default_files(config_path: &Path, map_dir: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if !config_path.exists() {
            fs::write(config_path, DEFAULT_CONFIG)?;
        }

        fs::create_dir_all(map_dir)?;
        let default_map = map_dir.join("default.toml");
        if !default_map.exists() {
            fs::write(&default_map, DEFAULT_MAP)?;
        }
        Ok(())
    }
}

const DEFAULT_CONFIG: &str = r#"# keyboard2000 configuration file

[jack]
# JACK client name; each keyboard gets a MIDI output port on this client
client_name = "keyboard2000"

[devices]
# Kernel list of input devices
registry_path = "/proc/bus/input/devices"

# Directory with the evdev nodes (needs read permission, e.g. the "input" group)
input_dir = "/dev/input"

# EV bitmask that marks a device as a keyboard
capabilities = "120013"

# How often to look for new or removed keyboards
poll_interval_ms = 100

# Wait this long after a keyboard appears before opening it
attach_delay_ms = 10

[maps]
# Directory with the keyboard maps (defaults to the "maps" directory next to this file)
# directory = "/home/me/.config/keyboard2000/maps"

# Map used for keyboards no other map claims
default_map = "default.toml"

[queue]
# Events waiting for the JACK callback; newer events are dropped when full
capacity = 1024

# Events written per JACK cycle
events_per_cycle = 1

[instrument]
# Note-on velocity is picked at random from this range (1-127)
velocity_min = 64
velocity_max = 127

[supervisor]
# How long shutdown waits for keyboards to let go
shutdown_grace_ms = 1000
"#;

/// JACK settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JackSettings {
    /// JACK client name
    pub client_name: String,
}

impl Default for JackSettings {
    fn default() -> Self {
        Self {
            client_name: "keyboard2000".to_string(),
        }
    }
}

/// Device discovery settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Kernel list of input devices
    pub registry_path: PathBuf,
    /// Directory with the evdev nodes
    pub input_dir: PathBuf,
    /// EV bitmask of a keyboard
    pub capabilities: String,
    /// Registry poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Settle delay before opening a new node in milliseconds
    pub attach_delay_ms: u64,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            registry_path: PathBuf::from(DEFAULT_REGISTRY_PATH),
            input_dir: PathBuf::from(DEFAULT_INPUT_DIR),
            capabilities: KEYBOARD_CAPABILITIES.to_string(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            attach_delay_ms: DEFAULT_ATTACH_DELAY_MS,
        }
    }
}

/// Keyboard map settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MapSettings {
    /// Map directory, `None` for the default location
    pub directory: Option<PathBuf>,
    /// File name of the fallback map
    pub default_map: String,
}

impl Default for MapSettings {
    fn default() -> Self {
        Self {
            directory: None,
            default_map: "default.toml".to_string(),
        }
    }
}

/// Event queue settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Queue capacity
    pub capacity: usize,
    /// Events written per JACK cycle
    pub events_per_cycle: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            events_per_cycle: 1,
        }
    }
}

/// Note generation settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InstrumentSettings {
    /// Lowest note-on velocity
    pub velocity_min: u8,
    /// Highest note-on velocity
    pub velocity_max: u8,
}

impl Default for InstrumentSettings {
    fn default() -> Self {
        Self {
            velocity_min: DEFAULT_VELOCITY_MIN,
            velocity_max: DEFAULT_VELOCITY_MAX,
        }
    }
}

/// Lifecycle timing
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorTiming {
    /// Shutdown grace period in milliseconds
    pub shutdown_grace_ms: u64,
}

impl Default for SupervisorTiming {
    fn default() -> Self {
        Self {
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keymap::KeyboardMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.jack.client_name, "keyboard2000");
        assert_eq!(config.devices.capabilities, "120013");
        assert_eq!(config.devices.poll_interval_ms, 100);
        assert_eq!(config.queue.capacity, 1024);
        assert_eq!(config.instrument.velocity_min, 64);
        assert_eq!(config.instrument.velocity_max, 127);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_commented_default_matches_defaults() {
        let parsed: Config = toml::from_str(DEFAULT_CONFIG).unwrap();
        let defaults = Config::default();
        assert_eq!(parsed.jack.client_name, defaults.jack.client_name);
        assert_eq!(parsed.devices.registry_path, defaults.devices.registry_path);
        assert_eq!(parsed.devices.attach_delay_ms, defaults.devices.attach_delay_ms);
        assert_eq!(parsed.maps.directory, None);
        assert_eq!(parsed.queue.events_per_cycle, defaults.queue.events_per_cycle);
        assert_eq!(parsed.supervisor.shutdown_grace_ms, defaults.supervisor.shutdown_grace_ms);
    }

    #[test]
    fn test_partial_file() {
        let config: Config = toml::from_str("[queue]\ncapacity = 16\n").unwrap();
        assert_eq!(config.queue.capacity, 16);
        assert_eq!(config.queue.events_per_cycle, 1);
        assert_eq!(config.jack.client_name, "keyboard2000");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.queue.capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.devices.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.instrument.velocity_min = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.instrument.velocity_max = 128;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.instrument.velocity_min = 100;
        config.instrument.velocity_max = 90;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        config.maps.directory = Some(PathBuf::from("/tmp/maps"));
        config.devices.poll_interval_ms = 250;

        let settings = config.supervisor_settings().unwrap();
        assert_eq!(settings.map_dir, PathBuf::from("/tmp/maps"));
        assert_eq!(settings.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.shutdown_grace, Duration::from_millis(1000));
        assert_eq!(settings.default_map, "default.toml");
    }

    #[test]
    fn test_write_default_files() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        let map_dir = dir.path().join("maps");

        Config::write_default_files(&config_path, &map_dir).unwrap();
        assert!(Config::load_from(&config_path).unwrap().validate().is_ok());
        let map = KeyboardMap::load(&map_dir.join("default.toml")).unwrap();
        assert!(!map.is_empty());

        // A second run keeps edits
        fs::write(&config_path, "[jack]\nclient_name = \"mine\"\n").unwrap();
        Config::write_default_files(&config_path, &map_dir).unwrap();
        assert_eq!(Config::load_from(&config_path).unwrap().jack.client_name, "mine");
    }

    #[test]
    fn test_malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[queue]\ncapacity = \"lots\"\n").unwrap();

        assert!(matches!(Config::load_from(&path), Err(Error::TomlParse(_))));
        let config = Config::load_or_default_from(&path);
        assert_eq!(config.queue.capacity, DEFAULT_CAPACITY);

        let missing = Config::load_or_default_from(&dir.path().join("nope.toml"));
        assert_eq!(missing.jack.client_name, "keyboard2000");

        fs::write(&path, "[queue]\ncapacity = 8\n").unwrap();
        assert_eq!(Config::load_or_default_from(&path).queue.capacity, 8);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Config::load_from(&dir.path().join("nope.toml")),
            Err(Error::Config(_))
        ));
    }
}
