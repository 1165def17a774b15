//! JACK MIDI output
//!
//! One JACK client for the whole process; every attached keyboard gets its
//! own MIDI output port on it. The process callback drives a
//! [`Router`](crate::router::Router) that writes queued events at frame 0.

use crate::bridge::{EventReceiver, PortId, QueuedEvent};
use crate::error::{Error, Result};
use crate::router::{router, PortControl, Router};
use crate::supervisor::OutputPorts;
use jack::{Client, ClientOptions, MidiOut, Port, ProcessScope};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// JACK notification handler
struct JackNotifications {
    /// Raised when the server goes away so the supervisor stops
    shutdown: Arc<AtomicBool>,
}

impl jack::NotificationHandler for JackNotifications {
    unsafe fn shutdown(&mut self, status: jack::ClientStatus, reason: &str) {
        log::error!("JACK server shut down: {:?} - {}", status, reason);
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

/// JACK process handler - runs in the JACK realtime thread
struct MidiOutProcessor {
    router: Router<Port<MidiOut>>,
}

impl jack::ProcessHandler for MidiOutProcessor {
    fn process(&mut self, _client: &Client, ps: &ProcessScope) -> jack::Control {
        self.router.process(|id, port, pending: &[QueuedEvent]| {
            // Creating the writer clears the port buffer for this cycle
            let mut writer = port.writer(ps);
            for event in pending.iter().filter(|event| event.port == id) {
                let bytes = event.message.encode();
                let raw = jack::RawMidi {
                    time: 0, // Immediate
                    bytes: bytes.as_slice(),
                };
                let _ = writer.write(&raw);
            }
        });

        jack::Control::Continue
    }
}

/// The process-wide JACK client with its per-keyboard output ports
pub struct JackOutput {
    /// The active JACK client
    client: jack::AsyncClient<JackNotifications, MidiOutProcessor>,
    /// Moves ports in and out of the process callback
    control: PortControl<Port<MidiOut>>,
    /// Full names of the open ports
    names: HashMap<PortId, String>,
}

impl JackOutput {
    /// Connect to the JACK server and start the process callback
    ///
    /// `shutdown` is raised if the server shuts the client down.
    pub fn new(
        client_name: &str,
        events: EventReceiver,
        events_per_cycle: usize,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let (client, _status) = Client::new(client_name, ClientOptions::NO_START_SERVER)?;

        let (control, router) = router(events, events_per_cycle);
        let processor = MidiOutProcessor { router };
        let notifications = JackNotifications { shutdown };

        let client = client.activate_async(notifications, processor)?;
        log::info!("JACK client '{}' active", client.as_client().name());

        Ok(Self {
            client,
            control,
            names: HashMap::new(),
        })
    }

    /// Deactivate the client and close the connection
    pub fn close(self) -> Result<()> {
        let (client, _notifications, _processor) = self.client.deactivate()?;
        log::info!("JACK client '{}' deactivated", client.name());
        Ok(())
    }

    fn release(&self, port: Port<MidiOut>) {
        let name = port.name().unwrap_or_default();
        match self.client.as_client().unregister_port(port) {
            Ok(()) => log::info!("Closed MIDI port {}", name),
            Err(e) => log::warn!("Failed to unregister MIDI port {}: {}", name, e),
        }
    }
}

impl OutputPorts for JackOutput {
    fn open_port(&mut self, id: PortId, name: &str, auto_connect: &[String]) -> Result<String> {
        let client = self.client.as_client();
        let port = client.register_port(name, MidiOut::default())?;
        let full_name = port.name()?;

        for destination in auto_connect {
            match client.connect_ports_by_name(&full_name, destination) {
                Ok(()) => log::info!("Connected {} -> {}", full_name, destination),
                Err(e) => log::warn!("Failed to auto-connect {} to {}: {}", full_name, destination, e),
            }
        }

        if let Err((e, port)) = self.control.install(id, port) {
            self.release(port);
            return Err(e);
        }
        self.names.insert(id, full_name.clone());
        Ok(full_name)
    }

    fn close_port(&mut self, id: PortId) {
        if self.names.remove(&id).is_none() {
            return;
        }
        if let Err(e) = self.control.remove(id) {
            log::warn!("Failed to remove {}: {}", id, e);
        }
    }

    fn reclaim(&mut self) {
        for port in self.control.take_retired() {
            self.release(port);
        }
    }
}

/// Check if JACK is running
pub fn is_jack_running() -> bool {
    Client::new("keyboard2000-probe", ClientOptions::NO_START_SERVER).is_ok()
}

/// List JACK MIDI input ports (possible auto-connect targets)
pub fn list_jack_midi_ports() -> Result<Vec<String>> {
    let (client, _status) = Client::new("keyboard2000-list", ClientOptions::NO_START_SERVER)
        .map_err(Error::Jack)?;
    Ok(client.ports(None, Some("midi"), jack::PortFlags::IS_INPUT))
}
