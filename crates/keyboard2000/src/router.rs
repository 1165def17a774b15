//! Realtime side of the MIDI output
//!
//! The [`Router`] runs inside the audio server's process callback. Once per
//! cycle it applies pending port changes, pops queued events and hands each
//! port the events addressed to it. It never blocks and never allocates:
//! the port table and the per-cycle event buffer are sized up front.
//!
//! Ports are opened on the supervisor thread and moved in through a
//! [`PortControl`]; removed ports travel back the same way so they can be
//! released outside the realtime thread.

use crate::bridge::{EventReceiver, PortId, QueuedEvent};
use crate::error::{Error, Result};
use crossbeam_channel::{bounded, Receiver, Sender};

/// Most output ports the router can hold
pub const MAX_PORTS: usize = 64;

/// Port table change, applied at the start of a cycle
pub enum PortCommand<P> {
    /// Start routing events for this port
    Install(PortId, P),
    /// Stop routing and hand the port back
    Remove(PortId),
}

/// Create a router and the handle that feeds it ports
pub fn router<P>(events: EventReceiver, events_per_cycle: usize) -> (PortControl<P>, Router<P>) {
    let (command_tx, command_rx) = bounded(MAX_PORTS * 2);
    let (retired_tx, retired_rx) = bounded(MAX_PORTS * 2);
    let events_per_cycle = events_per_cycle.max(1);

    let control = PortControl {
        commands: command_tx,
        retired: retired_rx,
        installed: 0,
    };
    let router = Router {
        events,
        commands: command_rx,
        retired: retired_tx,
        ports: Vec::with_capacity(MAX_PORTS),
        pending: Vec::with_capacity(events_per_cycle),
        events_per_cycle,
    };
    (control, router)
}

/// Supervisor-side handle for installing and removing ports
pub struct PortControl<P> {
    commands: Sender<PortCommand<P>>,
    retired: Receiver<P>,
    installed: usize,
}

impl<P> PortControl<P> {
    /// Hand a freshly opened port to the router
    ///
    /// On failure the port is given back so the caller can release it.
    pub fn install(&mut self, id: PortId, port: P) -> std::result::Result<(), (Error, P)> {
        if self.installed >= MAX_PORTS {
            return Err((Error::PortCapacity(MAX_PORTS), port));
        }
        match self.commands.try_send(PortCommand::Install(id, port)) {
            Ok(()) => {
                self.installed += 1;
                Ok(())
            }
            Err(e) => match e.into_inner() {
                PortCommand::Install(_, port) => Err((Error::PortCapacity(MAX_PORTS), port)),
                PortCommand::Remove(_) => unreachable!("sent an install command"),
            },
        }
    }

    /// Ask the router to stop using a port
    ///
    /// The port shows up in [`PortControl::take_retired`] once the router
    /// has let go of it.
    pub fn remove(&mut self, id: PortId) -> Result<()> {
        self.commands
            .try_send(PortCommand::Remove(id))
            .map_err(|_| Error::PortCapacity(MAX_PORTS))?;
        self.installed = self.installed.saturating_sub(1);
        Ok(())
    }

    /// Ports the router has released
    pub fn take_retired(&self) -> Vec<P> {
        self.retired.try_iter().collect()
    }
}

/// Realtime event router
pub struct Router<P> {
    events: EventReceiver,
    commands: Receiver<PortCommand<P>>,
    retired: Sender<P>,
    ports: Vec<(PortId, P)>,
    pending: Vec<QueuedEvent>,
    events_per_cycle: usize,
}

impl<P> Router<P> {
    /// Number of installed ports
    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    /// Run one cycle
    ///
    /// `emit` is called once for every installed port, with the events of
    /// this cycle. Ports not addressed by an event still get a call so
    /// their buffers can be cleared.
    pub fn process<F>(&mut self, mut emit: F)
    where
        F: FnMut(PortId, &mut P, &[QueuedEvent]),
    {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                PortCommand::Install(id, port) => {
                    if self.ports.len() < MAX_PORTS {
                        self.ports.push((id, port));
                    } else {
                        let _ = self.retired.try_send(port);
                    }
                }
                PortCommand::Remove(id) => {
                    if let Some(index) = self.ports.iter().position(|(port_id, _)| *port_id == id) {
                        let (_, port) = self.ports.swap_remove(index);
                        let _ = self.retired.try_send(port);
                    }
                }
            }
        }

        self.pending.clear();
        while self.pending.len() < self.events_per_cycle {
            match self.events.pop() {
                Some(event) => self.pending.push(event),
                None => break,
            }
        }

        for (id, port) in &mut self.ports {
            emit(*id, port, &self.pending);
        }
    }
}
