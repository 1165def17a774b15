//! Input device discovery
//!
//! Keyboards are found by reading `/proc/bus/input/devices`, which lists one
//! block per input device:
//!
//! ```text
//! I: Bus=0011 Vendor=0001 Product=0001 Version=ab41
//! N: Name="AT Translated Set 2 keyboard"
//! P: Phys=isa0060/serio0/input0
//! S: Sysfs=/devices/platform/i8042/serio0/input/input3
//! U: Uniq=
//! H: Handlers=sysrq kbd leds event3
//! B: PROP=0
//! B: EV=120013
//! ```
//!
//! A block whose `EV` bitmask equals the configured signature is a keyboard.

use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Default location of the kernel device list
pub const DEFAULT_REGISTRY_PATH: &str = "/proc/bus/input/devices";

/// Default directory of the evdev nodes
pub const DEFAULT_INPUT_DIR: &str = "/dev/input";

/// EV_SYN | EV_KEY | EV_MSC | EV_LED | EV_REP: a full keyboard
pub const KEYBOARD_CAPABILITIES: &str = "120013";

/// A discovered keyboard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Name reported by the kernel
    pub name: String,
    /// Event node name, e.g. `event3`
    pub event: String,
    /// Path of the event node
    pub path: PathBuf,
}

/// Something that can list the keyboards currently connected
pub trait DeviceRegistry {
    /// Scan for keyboards
    fn scan(&self) -> Result<Vec<DeviceInfo>>;
}

/// Registry backed by `/proc/bus/input/devices`
#[derive(Debug, Clone)]
pub struct ProcRegistry {
    registry_path: PathBuf,
    input_dir: PathBuf,
    capabilities: String,
}

impl Default for ProcRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_REGISTRY_PATH, DEFAULT_INPUT_DIR, KEYBOARD_CAPABILITIES)
    }
}

impl ProcRegistry {
    /// Create a registry reading `registry_path` and resolving event nodes
    /// in `input_dir`
    pub fn new(
        registry_path: impl Into<PathBuf>,
        input_dir: impl Into<PathBuf>,
        capabilities: impl Into<String>,
    ) -> Self {
        Self {
            registry_path: registry_path.into(),
            input_dir: input_dir.into(),
            capabilities: capabilities.into(),
        }
    }
}

impl DeviceRegistry for ProcRegistry {
    fn scan(&self) -> Result<Vec<DeviceInfo>> {
        let content = fs::read_to_string(&self.registry_path).map_err(|e| {
            Error::Device(format!("Failed to read {}: {}", self.registry_path.display(), e))
        })?;
        Ok(parse_devices(&content, &self.capabilities, &self.input_dir))
    }
}

/// Parse the device list and keep the blocks matching `capabilities`
pub fn parse_devices(content: &str, capabilities: &str, input_dir: &Path) -> Vec<DeviceInfo> {
    let mut devices = Vec::new();

    for block in content.split("\n\n") {
        let mut name = None;
        let mut event = None;
        let mut matches = false;

        for line in block.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("N: Name=") {
                name = Some(rest.trim_matches('"').to_string());
            } else if let Some(rest) = line.strip_prefix("H: Handlers=") {
                event = rest
                    .split_whitespace()
                    .find(|handler| {
                        handler
                            .strip_prefix("event")
                            .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
                    })
                    .map(str::to_string);
            } else if let Some(rest) = line.strip_prefix("B: EV=") {
                matches = rest.trim().eq_ignore_ascii_case(capabilities);
            }
        }

        if !matches {
            continue;
        }
        match (name, event) {
            (Some(name), Some(event)) => devices.push(DeviceInfo {
                path: input_dir.join(&event),
                name,
                event,
            }),
            (name, _) => log::debug!("Ignoring keyboard block without event handler: {:?}", name),
        }
    }

    devices
}
