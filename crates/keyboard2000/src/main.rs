//! keyboard2000 - Turn computer keyboards into JACK MIDI instruments
//!
//! Watches for keyboards, gives each one a MIDI output port and plays notes
//! from its key presses until SIGINT or SIGTERM.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use keyboard2000::{
    audio::{is_jack_running, list_jack_midi_ports, JackOutput},
    bridge::event_queue,
    config::Config,
    keymap::{select_map, KeyboardMap},
    registry::DeviceRegistry,
    supervisor::Supervisor,
};

#[derive(Parser)]
#[command(name = "keyboard2000")]
#[command(author, version, about = "Turn computer keyboards into JACK MIDI instruments", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path (default: ~/.config/keyboard2000/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Keyboard map directory
    #[arg(short, long)]
    maps: Option<PathBuf>,

    /// JACK client name
    #[arg(long)]
    client_name: Option<String>,

    /// Device poll interval in milliseconds
    #[arg(long)]
    poll_interval: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a default configuration file and keyboard map
    Init,
    /// Show the configuration file path
    ConfigPath,
    /// List connected keyboards and the map each would use
    ListDevices,
    /// List available JACK MIDI ports
    ListPorts,
    /// Validate a keyboard map file
    CheckMap {
        /// Map file to check
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Init) => {
            let path = Config::create_default_config_file()?;
            println!("Created default config at: {}", path.display());
            println!("Keyboard maps go in: {}", Config::default_map_dir()?.display());
            return Ok(());
        }
        Some(Commands::ConfigPath) => {
            let path = Config::config_path()?;
            println!("{}", path.display());
            return Ok(());
        }
        Some(Commands::ListPorts) => {
            if !is_jack_running() {
                println!("JACK is not running");
                return Ok(());
            }
            let ports = list_jack_midi_ports()?;
            if ports.is_empty() {
                println!("No JACK MIDI input ports found");
            } else {
                println!("Available JACK MIDI input ports:");
                for port in ports {
                    println!("  {}", port);
                }
            }
            return Ok(());
        }
        Some(Commands::CheckMap { file }) => {
            let map = KeyboardMap::load(&file)?;
            println!("{}: ok", file.display());
            println!("  device_name: {}", map.device_name());
            println!("  port_name:   {}", map.port_name());
            println!("  bindings:    {}", map.len());
            if !map.auto_connect().is_empty() {
                println!("  auto_connect: {}", map.auto_connect().join(", "));
            }
            return Ok(());
        }
        Some(Commands::ListDevices) => {
            let config = load_config(&cli.config, &cli.maps)?;
            let settings = config.supervisor_settings()?;
            let devices = config.registry().scan()?;
            if devices.is_empty() {
                println!("No keyboards found");
            }
            for device in devices {
                let map = match select_map(&settings.map_dir, &settings.default_map, &device.name) {
                    Ok(map) => map.port_name().to_string(),
                    Err(e) => format!("no map ({})", e),
                };
                println!("{}  {:<40} -> {}", device.path.display(), device.name, map);
            }
            return Ok(());
        }
        None => {}
    }

    let mut config = load_config(&cli.config, &cli.maps)?;
    if let Some(name) = cli.client_name {
        config.jack.client_name = name;
    }
    if let Some(interval) = cli.poll_interval {
        config.devices.poll_interval_ms = interval;
    }
    config.validate()?;

    run(config)
}

/// Load the config file (or defaults) and apply the map directory override
fn load_config(path: &Option<PathBuf>, maps: &Option<PathBuf>) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::load_or_default(),
    };
    if let Some(maps) = maps {
        config.maps.directory = Some(maps.clone());
    }
    Ok(config)
}

fn run(config: Config) -> Result<()> {
    // Shutdown signal shared between threads
    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown.clone())?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, shutdown.clone())?;

    let (events_tx, events_rx) = event_queue(config.queue.capacity);
    let output = JackOutput::new(
        &config.jack.client_name,
        events_rx,
        config.queue.events_per_cycle,
        shutdown.clone(),
    )
    .context("Failed to start JACK client (is the JACK server running?)")?;

    let mut supervisor = Supervisor::new(
        config.registry(),
        output,
        events_tx,
        shutdown,
        config.supervisor_settings()?,
    );
    supervisor.run()?;

    supervisor.into_ports().close()?;
    log::info!("Bye");
    Ok(())
}
