//! Operator command queue: parse, enqueue, execute.
//!
//! All operator actions funnel through one FIFO queue with a single
//! consumer thread. Serial consumption is what makes pilot replacement and
//! registry mutation safe without extra locking: two `Start` commands can
//! never interleave, a `Stop` always sees the pilot the preceding commands
//! saw.
//!
//! Unknown command names are a boundary concern: [`ActionCommand::parse`]
//! turns text into the closed enum, and anything unrecognized is dropped
//! with a warning before it ever reaches the queue.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, trace, warn};

use crate::autopilot::AutoPilot;
use crate::config::PilotConfig;
use crate::layout::Locomotive;
use crate::traits::{CommandStation, LayoutStore};

// ============================================================================
// ActionCommand
// ============================================================================

/// An operator action, already validated.
#[derive(Clone, Debug, PartialEq)]
pub enum ActionCommand {
    /// Build and start a fresh autopilot, carrying listeners over.
    Start,
    /// Stop the autopilot and wind the layout down to a known state.
    Stop,
    /// Start automatic operation for one locomotive.
    StartLocomotive(Locomotive),
    /// Deactivate automatic operation for one locomotive.
    StopLocomotive(Locomotive),
    /// Start automatic operation for every on-track locomotive.
    StartAllLocomotives,
    /// Register a locomotive for automation without starting it.
    AddLocomotive(Locomotive),
    /// Discard a locomotive's dispatcher.
    RemoveLocomotive(Locomotive),
    /// Force the reset sweep without stopping.
    Reset,
}

impl ActionCommand {
    /// Parse a command name and optional locomotive argument.
    ///
    /// Returns `None` for unknown names and for locomotive commands missing
    /// their argument; callers drop those with a warning.
    pub fn parse(name: &str, loco: Option<Locomotive>) -> Option<Self> {
        match name {
            "start" => Some(ActionCommand::Start),
            "stop" => Some(ActionCommand::Stop),
            "start-locomotive" => loco.map(ActionCommand::StartLocomotive),
            "stop-locomotive" => loco.map(ActionCommand::StopLocomotive),
            "start-all-locomotives" => Some(ActionCommand::StartAllLocomotives),
            "add-locomotive" => loco.map(ActionCommand::AddLocomotive),
            "remove-locomotive" => loco.map(ActionCommand::RemoveLocomotive),
            "reset" => Some(ActionCommand::Reset),
            _ => None,
        }
    }

    /// Returns the command name as a string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActionCommand::Start => "start",
            ActionCommand::Stop => "stop",
            ActionCommand::StartLocomotive(_) => "start-locomotive",
            ActionCommand::StopLocomotive(_) => "stop-locomotive",
            ActionCommand::StartAllLocomotives => "start-all-locomotives",
            ActionCommand::AddLocomotive(_) => "add-locomotive",
            ActionCommand::RemoveLocomotive(_) => "remove-locomotive",
            ActionCommand::Reset => "reset",
        }
    }
}

// ============================================================================
// ActionCommandHandler
// ============================================================================

enum QueueItem {
    Command(ActionCommand),
    Quit,
}

/// The single consumer behind the operator command queue.
///
/// Owns the current [`AutoPilot`]; `Start` replaces it with a fresh
/// instance, carrying the registered listeners over so observers survive a
/// restart.
pub struct ActionCommandHandler<S: LayoutStore + 'static, C: CommandStation + 'static> {
    tx: Sender<QueueItem>,
    pilot: Arc<Mutex<Arc<AutoPilot<S, C>>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl<S: LayoutStore + 'static, C: CommandStation + 'static> ActionCommandHandler<S, C> {
    /// Build the handler with an initial, not-yet-started pilot and spawn
    /// the consumer thread.
    pub fn new(store: Arc<S>, station: Arc<C>, config: PilotConfig) -> Self {
        let pilot = Arc::new(Mutex::new(Arc::new(AutoPilot::new(
            Arc::clone(&store),
            Arc::clone(&station),
            config.clone(),
        ))));
        let (tx, rx) = mpsc::channel::<QueueItem>();

        let consumer = {
            let pilot = Arc::clone(&pilot);
            thread::spawn(move || loop {
                match rx.recv_timeout(config.timing.queue_wait()) {
                    Ok(QueueItem::Command(command)) => {
                        debug!(command = command.as_str(), "executing command");
                        execute(&pilot, &store, &station, &config, command);
                    }
                    Ok(QueueItem::Quit) => break,
                    Err(RecvTimeoutError::Timeout) => {
                        trace!("command queue idle");
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            })
        };

        Self {
            tx,
            pilot,
            consumer: Mutex::new(Some(consumer)),
        }
    }

    /// Enqueue a command; returns immediately, execution is asynchronous
    /// and strictly in submission order.
    pub fn submit(&self, command: ActionCommand) {
        if self.tx.send(QueueItem::Command(command)).is_err() {
            warn!("command dropped, consumer is gone");
        }
    }

    /// Parse and enqueue a named command; unknown names are dropped with a
    /// warning.
    pub fn submit_named(&self, name: &str, loco: Option<Locomotive>) {
        match ActionCommand::parse(name, loco) {
            Some(command) => self.submit(command),
            None => warn!(command = name, "unknown command dropped"),
        }
    }

    /// The pilot currently in charge. `Start` replaces it, so hold the
    /// returned handle only for observation.
    pub fn pilot(&self) -> Arc<AutoPilot<S, C>> {
        Arc::clone(&self.pilot.lock().unwrap())
    }

    /// Drain-free shutdown: stop consuming, join the consumer thread, and
    /// stop the pilot if it is still running.
    pub fn quit(&self) {
        let _ = self.tx.send(QueueItem::Quit);
        let consumer = self.consumer.lock().unwrap().take();
        if let Some(consumer) = consumer {
            if consumer.join().is_err() {
                warn!("command consumer thread panicked");
            }
        }
        let pilot = self.pilot();
        if pilot.is_running() {
            pilot.stop();
        }
    }
}

fn execute<S: LayoutStore + 'static, C: CommandStation + 'static>(
    slot: &Arc<Mutex<Arc<AutoPilot<S, C>>>>,
    store: &Arc<S>,
    station: &Arc<C>,
    config: &PilotConfig,
    command: ActionCommand,
) {
    let pilot = Arc::clone(&slot.lock().unwrap());
    match command {
        ActionCommand::Start => {
            // Each run gets a fresh pilot with fresh registries; only the
            // listeners carry over.
            if pilot.is_running() {
                pilot.stop();
            }
            let fresh = Arc::new(AutoPilot::new(
                Arc::clone(store),
                Arc::clone(station),
                config.clone(),
            ));
            for listener in pilot.status_listeners() {
                fresh.add_status_listener(listener);
            }
            for listener in pilot.state_listeners() {
                fresh.add_state_listener(listener);
            }
            for listener in pilot.layout_listeners() {
                fresh.add_layout_listener(listener);
            }
            if let Err(err) = fresh.start() {
                warn!(error = %err, "autopilot start failed");
            }
            *slot.lock().unwrap() = fresh;
        }
        ActionCommand::Stop => pilot.stop(),
        ActionCommand::StartLocomotive(loco) => pilot.start_stop_locomotive(&loco, true),
        ActionCommand::StopLocomotive(loco) => pilot.start_stop_locomotive(&loco, false),
        ActionCommand::StartAllLocomotives => {
            if let Err(err) = pilot.start_all_locomotives() {
                warn!(error = %err, "start-all failed");
            }
        }
        ActionCommand::AddLocomotive(loco) => pilot.add_locomotive(&loco),
        ActionCommand::RemoveLocomotive(loco) => pilot.remove_locomotive(&loco),
        ActionCommand::Reset => pilot.reset_sweep(),
    }
}

// ============================================================================
// Tests
// ============================================================================
