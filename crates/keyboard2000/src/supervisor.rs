//! Keyboard hot-plug supervision
//!
//! The supervisor polls the device registry at a fixed interval. Every new
//! keyboard gets a map, an output port, an [`Instrument`] and a thread
//! running decoder → map → instrument → queue. When a keyboard's thread
//! ends (the device was unplugged) the supervisor closes its port.
//!
//! Lifecycle of one device node:
//!
//! ```text
//! Undiscovered --scan--> Attached --thread ended--> Terminating --queue drained--> Removed
//! ```
//!
//! Shutdown is cooperative: the shared flag is checked by every device
//! thread once per batch of input, and each thread silences its instrument
//! before leaving.

use crate::bridge::{EventSender, PortId};
use crate::error::{Error, Result};
use crate::input::KeyEventReader;
use crate::instrument::{Instrument, DEFAULT_VELOCITY_MAX, DEFAULT_VELOCITY_MIN};
use crate::keymap::{select_map, KeyboardMap};
use crate::midi::{MidiMessage, MAX_CHANNEL, MIN_CHANNEL};
use crate::registry::{DeviceInfo, DeviceRegistry};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default registry poll interval in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Default settle delay before opening a new device node in milliseconds
pub const DEFAULT_ATTACH_DELAY_MS: u64 = 10;

/// Default shutdown grace period in milliseconds
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 1000;

/// Where MIDI output ports come from
pub trait OutputPorts {
    /// Open an output port and connect it; returns the full port name
    fn open_port(&mut self, id: PortId, name: &str, auto_connect: &[String]) -> Result<String>;

    /// Stop using a port
    fn close_port(&mut self, id: PortId);

    /// Release ports that are no longer in use
    fn reclaim(&mut self);
}

/// Supervisor tuning
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Directory holding the keyboard maps
    pub map_dir: PathBuf,
    /// File name of the fallback map inside `map_dir`
    pub default_map: String,
    /// Registry poll interval
    pub poll_interval: Duration,
    /// Settle delay before opening a new device node
    pub attach_delay: Duration,
    /// How long shutdown and detach wait for threads and the queue
    pub shutdown_grace: Duration,
    /// Lowest note-on velocity
    pub velocity_min: u8,
    /// Highest note-on velocity
    pub velocity_max: u8,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            map_dir: PathBuf::from("maps"),
            default_map: "default.toml".to_string(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            attach_delay: Duration::from_millis(DEFAULT_ATTACH_DELAY_MS),
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
            velocity_min: DEFAULT_VELOCITY_MIN,
            velocity_max: DEFAULT_VELOCITY_MAX,
        }
    }
}

/// Lifecycle state of an attached device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Thread running, port open
    Attached,
    /// Thread ended, waiting for its queued events to drain
    Terminating,
}

/// Book-keeping for one attached device
struct AttachedDevice {
    info: DeviceInfo,
    port: PortId,
    port_name: String,
    thread: Option<JoinHandle<()>>,
    state: DeviceState,
    terminating_since: Option<Instant>,
}

/// Device thread body: decode, map, play, queue
///
/// Returns when the input stream ends or `shutdown` is raised. Either way
/// the instrument is silenced on the way out.
pub fn run_device<R: Read>(
    mut reader: KeyEventReader<R>,
    map: KeyboardMap,
    mut instrument: Instrument,
    events: EventSender,
    port: PortId,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            log::info!("{}: shutting down", instrument.name());
            events.push_all(port, instrument.flush());
            return;
        }

        let Some(batch) = reader.next_batch() else {
            log::info!("{}: input stream ended", instrument.name());
            events.push_all(port, instrument.flush());
            return;
        };

        for key in batch {
            log::debug!("{}: key {} {}", instrument.name(), key.keycode, if key.pressed { "down" } else { "up" });
            if let Some(mapped) = map.convert_event(key) {
                events.push_all(port, instrument.handle(mapped));
            }
        }
    }
}

/// Watches the registry and manages one thread per keyboard
pub struct Supervisor<R, O> {
    registry: R,
    ports: O,
    events: EventSender,
    shutdown: Arc<AtomicBool>,
    settings: SupervisorSettings,
    /// Attached devices keyed by event node name
    devices: BTreeMap<String, AttachedDevice>,
    next_port: u32,
    last_dropped: u64,
}

impl<R: DeviceRegistry, O: OutputPorts> Supervisor<R, O> {
    /// Create a supervisor
    pub fn new(
        registry: R,
        ports: O,
        events: EventSender,
        shutdown: Arc<AtomicBool>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            registry,
            ports,
            events,
            shutdown,
            settings,
            devices: BTreeMap::new(),
            next_port: 0,
            last_dropped: 0,
        }
    }

    /// The output port backend
    pub fn ports(&self) -> &O {
        &self.ports
    }

    /// Give back the output port backend
    pub fn into_ports(self) -> O {
        self.ports
    }

    /// Number of devices not yet removed
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// State of a device by event node name
    pub fn device_state(&self, event: &str) -> Option<DeviceState> {
        self.devices.get(event).map(|device| device.state)
    }

    /// Poll until the shutdown flag is raised, then shut down
    pub fn run(&mut self) -> Result<()> {
        log::info!(
            "Watching for keyboards every {} ms (maps in {})",
            self.settings.poll_interval.as_millis(),
            self.settings.map_dir.display()
        );

        while !self.shutdown.load(Ordering::Relaxed) {
            self.poll();
            thread::sleep(self.settings.poll_interval);
        }

        self.shutdown();
        Ok(())
    }

    /// One supervision round: discover, check liveness, report drops
    pub fn poll(&mut self) {
        self.ports.reclaim();
        self.discover();
        self.check_liveness();
        self.report_drops();
    }

    fn discover(&mut self) {
        let found = match self.registry.scan() {
            Ok(found) => found,
            Err(e) => {
                log::warn!("Device scan failed: {}", e);
                return;
            }
        };

        for info in found {
            if self.devices.contains_key(&info.event) {
                continue;
            }
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            let event = info.event.clone();
            let name = info.name.clone();
            if let Err(e) = self.attach(info) {
                log::error!("Skipping {} (\"{}\"): {}", event, name, e);
            }
        }
    }

    fn unique_port_name(&self, base: &str, event: &str) -> String {
        if self.devices.values().any(|device| device.port_name == base) {
            format!("{} ({})", base, event)
        } else {
            base.to_string()
        }
    }

    fn attach(&mut self, info: DeviceInfo) -> Result<()> {
        let map = select_map(&self.settings.map_dir, &self.settings.default_map, &info.name)?;

        thread::sleep(self.settings.attach_delay);
        let reader = KeyEventReader::open(&info.path)?;

        let port = PortId(self.next_port);
        self.next_port = self.next_port.wrapping_add(1);
        let port_name = self.unique_port_name(map.port_name(), &info.event);
        let full_name = self.ports.open_port(port, &port_name, map.auto_connect())?;

        let instrument = Instrument::new(format!("{} ({})", info.name, info.event))
            .with_velocity_range(self.settings.velocity_min, self.settings.velocity_max);
        let events = self.events.clone();
        let shutdown = self.shutdown.clone();

        let spawned = thread::Builder::new()
            .name(format!("keyboard-{}", info.event))
            .spawn(move || run_device(reader, map, instrument, events, port, shutdown));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.ports.close_port(port);
                return Err(Error::Io(e));
            }
        };

        log::info!("Opened MIDI port {} for {} (\"{}\")", full_name, info.event, info.name);
        self.devices.insert(
            info.event.clone(),
            AttachedDevice {
                info,
                port,
                port_name,
                thread: Some(handle),
                state: DeviceState::Attached,
                terminating_since: None,
            },
        );
        Ok(())
    }

    fn check_liveness(&mut self) {
        let now = Instant::now();
        let queue_drained = self.events.is_empty();
        let grace = self.settings.shutdown_grace;
        let mut removed = Vec::new();

        for (event, device) in &mut self.devices {
            if device.state == DeviceState::Attached {
                let finished = device.thread.as_ref().map_or(true, JoinHandle::is_finished);
                if !finished {
                    continue;
                }
                if let Some(handle) = device.thread.take() {
                    if handle.join().is_err() {
                        log::error!("Thread for {} panicked", event);
                    }
                }
                device.state = DeviceState::Terminating;
                device.terminating_since = Some(now);
            }

            let waited = device.terminating_since.map_or(Duration::ZERO, |since| now - since);
            if queue_drained || waited >= grace {
                removed.push(event.clone());
            }
        }

        for event in removed {
            if let Some(device) = self.devices.remove(&event) {
                self.ports.close_port(device.port);
                log::info!("Closed MIDI port {} ({} removed)", device.port_name, device.info.event);
            }
        }
    }

    fn report_drops(&mut self) {
        let dropped = self.events.dropped();
        if dropped > self.last_dropped {
            log::warn!(
                "{} MIDI events dropped because the queue was full ({} total)",
                dropped - self.last_dropped,
                dropped
            );
            self.last_dropped = dropped;
        }
    }

    /// Stop every device thread and close every port
    ///
    /// Raises the shutdown flag, waits for the threads to silence their
    /// instruments and exit, then waits for the queue to drain. Threads still
    /// blocked in a device read after the grace period are left behind and
    /// their ports get "All Notes Off" on every channel instead.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let deadline = Instant::now() + self.settings.shutdown_grace;

        loop {
            let running = self
                .devices
                .values()
                .filter(|device| device.thread.as_ref().is_some_and(|t| !t.is_finished()))
                .count();
            if running == 0 || Instant::now() >= deadline {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        for (event, device) in &mut self.devices {
            let Some(handle) = device.thread.take() else {
                continue;
            };
            if handle.is_finished() {
                log::info!("Waiting to join {}", event);
                if handle.join().is_err() {
                    log::error!("Thread for {} panicked", event);
                }
                log::info!("Joined {}", event);
            } else {
                log::warn!("{} is still blocked reading, silencing its port", event);
                for channel in MIN_CHANNEL..=MAX_CHANNEL {
                    if let Ok(msg) = MidiMessage::all_notes_off(channel) {
                        self.events.push_all(device.port, [msg]);
                    }
                }
            }
        }

        while !self.events.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        for (_, device) in std::mem::take(&mut self.devices) {
            self.ports.close_port(device.port);
            log::info!("Closed MIDI port {}", device.port_name);
        }
        self.ports.reclaim();
        self.report_drops();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{event_queue, EventReceiver};
    use crate::input::tests::key_group;
    use crate::input::{RecordLayout, EV_SYN, SYN_REPORT};
    use crate::keymap::DEFAULT_MAP;
    use std::fs;
    use std::io;
    use std::path::Path;
    use std::sync::Mutex;

    const PIANO: &str = "device_name = \"Test keyboard\"\nport_name = \"piano\"\n\n[notes]\n30 = 60\n\n[control]\n1 = \"panic\"\n";

    /// Registry whose device list the test edits
    #[derive(Clone, Default)]
    struct FixtureRegistry {
        devices: Arc<Mutex<Vec<DeviceInfo>>>,
    }

    impl FixtureRegistry {
        fn set(&self, devices: Vec<DeviceInfo>) {
            *self.devices.lock().unwrap() = devices;
        }
    }

    impl DeviceRegistry for FixtureRegistry {
        fn scan(&self) -> Result<Vec<DeviceInfo>> {
            Ok(self.devices.lock().unwrap().clone())
        }
    }

    /// Port backend that records what happened
    #[derive(Default)]
    struct RecordingPorts {
        opened: Vec<(PortId, String)>,
        closed: Vec<PortId>,
        fail_open: bool,
    }

    impl OutputPorts for RecordingPorts {
        fn open_port(&mut self, id: PortId, name: &str, _auto_connect: &[String]) -> Result<String> {
            if self.fail_open {
                return Err(Error::PortCapacity(0));
            }
            self.opened.push((id, name.to_string()));
            Ok(format!("keyboard2000:{}", name))
        }

        fn close_port(&mut self, id: PortId) {
            self.closed.push(id);
        }

        fn reclaim(&mut self) {}
    }

    fn device(name: &str, event: &str, path: &Path) -> DeviceInfo {
        DeviceInfo {
            name: name.to_string(),
            event: event.to_string(),
            path: path.to_path_buf(),
        }
    }

    fn settings(map_dir: &Path) -> SupervisorSettings {
        SupervisorSettings {
            map_dir: map_dir.to_path_buf(),
            poll_interval: Duration::from_millis(5),
            attach_delay: Duration::ZERO,
            shutdown_grace: Duration::from_millis(500),
            ..SupervisorSettings::default()
        }
    }

    fn map_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("default.toml"), DEFAULT_MAP).unwrap();
        fs::write(dir.path().join("piano.toml"), PIANO).unwrap();
        dir
    }

    fn drain(rx: &EventReceiver, into: &mut Vec<(PortId, Vec<u8>)>) {
        while let Some(event) = rx.pop() {
            into.push((event.port, event.message.encode().as_slice().to_vec()));
        }
    }

    #[test]
    fn test_device_removed_mid_session() {
        let maps = map_dir();
        let layout = RecordLayout::native();
        let device_file = maps.path().join("event7");
        let mut bytes = key_group(layout, 30, 1);
        bytes.extend(key_group(layout, 30, 0));
        fs::write(&device_file, bytes).unwrap();

        let registry = FixtureRegistry::default();
        registry.set(vec![device("Test keyboard", "event7", &device_file)]);
        let (tx, rx) = event_queue(64);
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut supervisor = Supervisor::new(
            registry.clone(),
            RecordingPorts::default(),
            tx,
            shutdown,
            settings(maps.path()),
        );

        supervisor.poll();
        assert_eq!(supervisor.ports().opened, vec![(PortId(0), "piano".to_string())]);
        assert!(supervisor.device_state("event7").is_some());

        // The file ends after two groups, like a keyboard being unplugged
        registry.set(Vec::new());
        let mut received = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while supervisor.device_count() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
            drain(&rx, &mut received);
            supervisor.poll();
        }

        assert_eq!(supervisor.device_count(), 0);
        assert_eq!(supervisor.ports().closed, vec![PortId(0)]);

        assert_eq!(received.len(), 3);
        assert_eq!(&received[0].1[..2], &[0x90, 60]);
        assert_eq!(received[1].1, vec![0x80, 60, 0]);
        assert_eq!(received[2].1, vec![0xB0, 123, 0]);
        assert!(received.iter().all(|(port, _)| *port == PortId(0)));
    }

    #[test]
    fn test_open_failure_skips_device() {
        let maps = map_dir();
        let registry = FixtureRegistry::default();
        registry.set(vec![device("Test keyboard", "event9", &maps.path().join("missing"))]);
        let (tx, _rx) = event_queue(8);
        let mut supervisor = Supervisor::new(
            registry,
            RecordingPorts::default(),
            tx,
            Arc::new(AtomicBool::new(false)),
            settings(maps.path()),
        );

        supervisor.poll();
        supervisor.poll();
        assert_eq!(supervisor.device_count(), 0);
        assert!(supervisor.ports().opened.is_empty());
    }

    #[test]
    fn test_port_failure_skips_device() {
        let maps = map_dir();
        let registry = FixtureRegistry::default();
        registry.set(vec![device("Test keyboard", "event1", Path::new("/dev/zero"))]);
        let (tx, _rx) = event_queue(8);
        let ports = RecordingPorts { fail_open: true, ..RecordingPorts::default() };
        let mut supervisor = Supervisor::new(
            registry,
            ports,
            tx,
            Arc::new(AtomicBool::new(false)),
            settings(maps.path()),
        );

        supervisor.poll();
        assert_eq!(supervisor.device_count(), 0);
    }

    #[test]
    fn test_missing_map_skips_device() {
        let maps = tempfile::tempdir().unwrap();
        let registry = FixtureRegistry::default();
        registry.set(vec![device("Unknown keyboard", "event1", Path::new("/dev/zero"))]);
        let (tx, _rx) = event_queue(8);
        let mut supervisor = Supervisor::new(
            registry,
            RecordingPorts::default(),
            tx,
            Arc::new(AtomicBool::new(false)),
            settings(maps.path()),
        );

        supervisor.poll();
        assert_eq!(supervisor.device_count(), 0);
        assert!(supervisor.ports().opened.is_empty());
    }

    #[test]
    fn test_shutdown_flushes_and_joins() {
        let maps = map_dir();
        let registry = FixtureRegistry::default();
        // /dev/zero reads as an endless run of empty groups
        registry.set(vec![
            device("Test keyboard", "event1", Path::new("/dev/zero")),
            device("Test keyboard", "event2", Path::new("/dev/zero")),
        ]);
        let (tx, rx) = event_queue(64);
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut supervisor = Supervisor::new(
            registry,
            RecordingPorts::default(),
            tx,
            shutdown.clone(),
            settings(maps.path()),
        );

        supervisor.poll();
        assert_eq!(supervisor.device_count(), 2);
        assert_eq!(
            supervisor.ports().opened,
            vec![
                (PortId(0), "piano".to_string()),
                (PortId(1), "piano (event2)".to_string()),
            ]
        );

        // Drain from another thread so shutdown sees an empty queue
        let consumer = thread::spawn(move || {
            let mut received = Vec::new();
            let deadline = Instant::now() + Duration::from_secs(2);
            while received.len() < 2 && Instant::now() < deadline {
                drain(&rx, &mut received);
                thread::sleep(Duration::from_millis(1));
            }
            received
        });

        supervisor.shutdown();
        assert!(shutdown.load(Ordering::Relaxed));
        assert_eq!(supervisor.device_count(), 0);

        let mut closed = supervisor.ports().closed.clone();
        closed.sort();
        assert_eq!(closed, vec![PortId(0), PortId(1)]);

        let mut received = consumer.join().unwrap();
        received.sort();
        assert_eq!(
            received,
            vec![(PortId(0), vec![0xB0, 123, 0]), (PortId(1), vec![0xB0, 123, 0])]
        );
    }

    #[test]
    fn test_run_returns_on_shutdown() {
        let maps = map_dir();
        let (tx, _rx) = event_queue(8);
        let shutdown = Arc::new(AtomicBool::new(true));
        let mut supervisor = Supervisor::new(
            FixtureRegistry::default(),
            RecordingPorts::default(),
            tx,
            shutdown,
            settings(maps.path()),
        );
        supervisor.run().unwrap();
        assert_eq!(supervisor.device_count(), 0);
    }

    /// Endless stream of empty groups, like an idle keyboard
    struct IdleKeyboard {
        record: Vec<u8>,
        offset: usize,
    }

    impl Read for IdleKeyboard {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.record.len() - self.offset);
            buf[..n].copy_from_slice(&self.record[self.offset..self.offset + n]);
            self.offset = (self.offset + n) % self.record.len();
            Ok(n)
        }
    }

    #[test]
    fn test_device_thread_stops_on_flag() {
        let layout = RecordLayout::Wide;
        let reader = KeyEventReader::new(
            IdleKeyboard {
                record: crate::input::tests::record(layout, EV_SYN, SYN_REPORT, 0),
                offset: 0,
            },
            layout,
        );
        let map = KeyboardMap::from_toml(PIANO).unwrap();
        let (tx, rx) = event_queue(8);
        let shutdown = Arc::new(AtomicBool::new(false));

        let flag = shutdown.clone();
        let handle = thread::spawn(move || {
            run_device(reader, map, Instrument::with_seed("idle", 3), tx, PortId(4), flag)
        });
        thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());

        shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap();

        let mut received = Vec::new();
        drain(&rx, &mut received);
        assert_eq!(received, vec![(PortId(4), vec![0xB0, 123, 0])]);
    }

    #[test]
    fn test_device_thread_plays_mapped_keys() {
        let layout = RecordLayout::Compact;
        let mut bytes = key_group(layout, 30, 1);
        bytes.extend(key_group(layout, 31, 1)); // unmapped
        bytes.extend(key_group(layout, 1, 1)); // panic
        bytes.extend(key_group(layout, 30, 0)); // already silenced
        let reader = KeyEventReader::new(io::Cursor::new(bytes), layout);
        let map = KeyboardMap::from_toml(PIANO).unwrap();
        let (tx, rx) = event_queue(16);

        run_device(reader, map, Instrument::with_seed("cursor", 3), tx, PortId(0), Arc::new(AtomicBool::new(false)));

        let mut received = Vec::new();
        drain(&rx, &mut received);
        let bytes: Vec<_> = received.into_iter().map(|(_, b)| b).collect();
        assert_eq!(bytes.len(), 3);
        assert_eq!(&bytes[0][..2], &[0x90, 60]);
        assert_eq!(bytes[1], vec![0xB0, 123, 0]);
        assert_eq!(bytes[2], vec![0xB0, 123, 0]);
    }
}
