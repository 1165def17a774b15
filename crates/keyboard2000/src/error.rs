//! Error types for keyboard2000

use thiserror::Error;

/// Result type alias for keyboard2000 operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in keyboard2000
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration file error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Keyboard map error (malformed or missing map file)
    #[error("Keyboard map error: {0}")]
    Map(String),

    /// Input device error (open failure, registry scan failure)
    #[error("Device error: {0}")]
    Device(String),

    /// JACK connection error
    #[error("JACK error: {0}")]
    Jack(#[from] jack::Error),

    /// A MIDI data value outside its wire range
    #[error("{what} out of range: {value}")]
    OutOfRange {
        /// Which field was out of range
        what: &'static str,
        /// The rejected value
        value: i32,
    },

    /// The realtime router cannot take another output port
    #[error("Output port limit reached ({0} ports)")]
    PortCapacity(usize),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}
