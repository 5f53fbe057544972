//! Per-locomotive dispatcher: the automatic-operation state machine.
//!
//! One [`TrainDispatcher`] runs per automated locomotive, on its own
//! thread, so trains never block each other; they only contend on shared
//! Block/Route rows through the store. The state machine:
//!
//! ```text
//! Idle -> Preparing -> Prepared -> Driving -> Braking -> Stopped -> Waiting
//!           |  ^                                                      |
//!           |  +------------------------- retry ---------------------+
//!           +--(no lockable route)--> Waiting --(deactivate)--> Idle
//! ```
//!
//! Every scheduling tick the loop executes the current state's side effect
//! and then asks [`can_advance`](TrainDispatcher::can_advance) whether the
//! successor may be installed. "Work done" and "safe to advance" are
//! deliberately decoupled: Preparing and Prepared can hold position without
//! busy-looping, backing off instead.
//!
//! Route acquisition in Preparing is the system's one true mutual-exclusion
//! point: eligibility is decided by the store's `lock_route` compare-and-
//! swap alone, never by dispatcher-side locking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::PilotConfig;
use crate::error::PilotError;
use crate::layout::{BlockState, Direction, Locomotive, Route, SensorEvent};
use crate::sensors::SensorEventRouter;
use crate::traits::{
    CommandStation, LayoutEvent, LayoutEventListener, LayoutStore, StateEventListener,
};

// ============================================================================
// DispatcherState
// ============================================================================

/// The dispatcher's position in the automatic-operation cycle.
///
/// Payload-free by design: per-run data (route, blocks, pending sensor
/// claims) lives in the drive session, so state comparisons and the
/// successor match stay exhaustive and trivial.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatcherState {
    /// Not automated; waiting for `start_running`.
    Idle,
    /// Searching for and locking a route out of the current block.
    Preparing,
    /// Route locked and set; about to issue the move.
    Prepared,
    /// Under way, waiting for the destination's enter sensor.
    Driving,
    /// Enter sensor hit; slowed down, waiting for the exit sensor.
    Braking,
    /// Arrived; block bookkeeping done, dwelling.
    Stopped,
    /// Between runs: retry a new route, or deactivate to Idle.
    Waiting,
}

impl DispatcherState {
    /// Returns the state name as a lowercase string.
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            DispatcherState::Idle => "idle",
            DispatcherState::Preparing => "preparing",
            DispatcherState::Prepared => "prepared",
            DispatcherState::Driving => "driving",
            DispatcherState::Braking => "braking",
            DispatcherState::Stopped => "stopped",
            DispatcherState::Waiting => "waiting",
        }
    }
}

/// Result of the Preparing search-and-lock pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PrepareOutcome {
    /// Won the compare-and-swap on a route.
    RouteLocked,
    /// No candidate, or every candidate's CAS was lost.
    NoRoute,
}

/// The exhaustive successor table.
///
/// Only called when `can_advance` said yes, so `outcome` is present for
/// Preparing and `active` decides the Waiting exit.
fn successor(
    current: DispatcherState,
    outcome: Option<PrepareOutcome>,
    active: bool,
) -> DispatcherState {
    match current {
        DispatcherState::Idle => DispatcherState::Preparing,
        DispatcherState::Preparing => match outcome {
            Some(PrepareOutcome::RouteLocked) => DispatcherState::Prepared,
            _ => DispatcherState::Waiting,
        },
        DispatcherState::Prepared => DispatcherState::Driving,
        DispatcherState::Driving => DispatcherState::Braking,
        DispatcherState::Braking => DispatcherState::Stopped,
        DispatcherState::Stopped => DispatcherState::Waiting,
        DispatcherState::Waiting => {
            if active {
                DispatcherState::Preparing
            } else {
                DispatcherState::Idle
            }
        }
    }
}

// ============================================================================
// Drive session
// ============================================================================

/// Mutable per-run data beside the state tag.
#[derive(Default)]
struct DriveSession {
    departure_block: Option<String>,
    destination_block: Option<String>,
    route: Option<Route>,
    outcome: Option<PrepareOutcome>,
    move_issued: bool,
    braked: bool,
    arrival_done: bool,
    enter_rx: Option<Receiver<SensorEvent>>,
    exit_rx: Option<Receiver<SensorEvent>>,
    dwell_until: Option<Instant>,
    retry_at: Option<Instant>,
}

impl DriveSession {
    /// Roll the session into the next run: the previous destination
    /// becomes the new departure, everything else is cleared.
    fn roll(&mut self) {
        let next_departure = self.destination_block.take().or(self.departure_block.take());
        *self = DriveSession::default();
        self.departure_block = next_departure;
    }
}

// ============================================================================
// TrainDispatcher
// ============================================================================

/// One independent state-machine actor per locomotive.
pub struct TrainDispatcher<S: LayoutStore, C: CommandStation> {
    loco: Locomotive,
    store: Arc<S>,
    station: Arc<C>,
    router: Arc<SensorEventRouter>,
    config: PilotConfig,
    state: Mutex<DispatcherState>,
    previous: Mutex<Option<DispatcherState>>,
    session: Mutex<DriveSession>,
    /// Automation requested for this locomotive (`start_running`).
    active: AtomicBool,
    /// Cooperative thread-loop cancellation; latency is bounded by the
    /// current sleep, never a forced interrupt.
    quit: AtomicBool,
    state_listeners: Mutex<Vec<Arc<dyn StateEventListener>>>,
    layout_listeners: Mutex<Vec<Arc<dyn LayoutEventListener>>>,
}

impl<S: LayoutStore + 'static, C: CommandStation + 'static> TrainDispatcher<S, C> {
    /// Create a dispatcher in `Idle` for the given locomotive.
    pub fn new(
        loco: Locomotive,
        store: Arc<S>,
        station: Arc<C>,
        router: Arc<SensorEventRouter>,
        config: PilotConfig,
    ) -> Self {
        Self {
            loco,
            store,
            station,
            router,
            config,
            state: Mutex::new(DispatcherState::Idle),
            previous: Mutex::new(None),
            session: Mutex::new(DriveSession::default()),
            active: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            state_listeners: Mutex::new(Vec::new()),
            layout_listeners: Mutex::new(Vec::new()),
        }
    }

    /// The locomotive's display name (the dispatcher registry key).
    pub fn loco_name(&self) -> &str {
        &self.loco.name
    }

    /// The locomotive's id.
    pub fn loco_id(&self) -> &str {
        &self.loco.id
    }

    /// Register a state-change listener.
    pub fn add_state_listener(&self, listener: Arc<dyn StateEventListener>) {
        self.state_listeners.lock().unwrap().push(listener);
    }

    /// Register a layout-event listener.
    pub fn add_layout_listener(&self, listener: Arc<dyn LayoutEventListener>) {
        self.layout_listeners.lock().unwrap().push(listener);
    }

    /// Current state.
    pub fn state(&self) -> DispatcherState {
        *self.state.lock().unwrap()
    }

    /// State before the last transition, if any.
    pub fn previous_state(&self) -> Option<DispatcherState> {
        *self.previous.lock().unwrap()
    }

    /// Id of the route locked for the current run, if any.
    pub fn current_route_id(&self) -> Option<String> {
        self.session
            .lock()
            .unwrap()
            .route
            .as_ref()
            .map(|r| r.id.clone())
    }

    /// Request automatic operation; Idle advances to Preparing on the next
    /// tick.
    pub fn start_running(&self) {
        info!(loco = %self.loco.name, "automation requested");
        self.active.store(true, Ordering::SeqCst);
    }

    /// Cooperatively deactivate: the current run completes, then Waiting
    /// exits to Idle instead of retrying.
    pub fn stop_running(&self) {
        info!(loco = %self.loco.name, "automation deactivation requested");
        self.active.store(false, Ordering::SeqCst);
    }

    /// True while automation is requested.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Ask the thread loop to exit after its current sleep.
    pub fn shutdown(&self) {
        self.quit.store(true, Ordering::SeqCst);
    }

    /// Spawn the dispatcher thread running the tick loop.
    pub fn spawn(self: &Arc<Self>) -> thread::JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        thread::spawn(move || dispatcher.run_loop())
    }

    fn run_loop(&self) {
        debug!(loco = %self.loco.name, "dispatcher loop started");
        while !self.quit.load(Ordering::SeqCst) {
            thread::sleep(self.config.timing.dispatcher_tick());

            if let Err(err) = self.execute_state() {
                // Isolated failure domain: this dispatcher stops, the
                // rest of the layout keeps running.
                warn!(loco = %self.loco.name, error = %err, "dispatcher fault, stopping");
                self.active.store(false, Ordering::SeqCst);
                break;
            }

            if self.can_advance() {
                self.advance();
            } else {
                thread::sleep(self.config.timing.blocked_backoff());
            }
        }
        debug!(loco = %self.loco.name, "dispatcher loop exited");
    }

    // ------------------------------------------------------------------
    // State side effects
    // ------------------------------------------------------------------

    fn execute_state(&self) -> Result<(), PilotError> {
        match self.state() {
            DispatcherState::Idle | DispatcherState::Driving => Ok(()),
            DispatcherState::Preparing => self.search_and_lock_route(),
            DispatcherState::Prepared => self.issue_move(),
            DispatcherState::Braking => self.begin_braking(),
            DispatcherState::Stopped => self.complete_arrival(),
            DispatcherState::Waiting => {
                let mut session = self.session.lock().unwrap();
                if session.retry_at.is_none() {
                    session.retry_at =
                        Some(Instant::now() + self.config.timing.blocked_backoff());
                }
                Ok(())
            }
        }
    }

    /// Preparing: find the departure block, then race for a route.
    ///
    /// Exactly one concurrent dispatcher can win `lock_route` for a given
    /// route; losing every candidate is a normal outcome (Waiting), not an
    /// error.
    fn search_and_lock_route(&self) -> Result<(), PilotError> {
        let mut session = self.session.lock().unwrap();
        if session.outcome.is_some() {
            return Ok(());
        }

        let departure = match session.departure_block.clone() {
            Some(id) => id,
            None => {
                let found = self
                    .store
                    .blocks()?
                    .into_iter()
                    .find(|b| b.locomotive_id.as_deref() == Some(self.loco.id.as_str()));
                match found {
                    Some(block) => {
                        session.departure_block = Some(block.id.clone());
                        block.id
                    }
                    None => {
                        warn!(loco = %self.loco.name, "no departure block; locomotive is not on track");
                        session.outcome = Some(PrepareOutcome::NoRoute);
                        return Ok(());
                    }
                }
            }
        };

        for route in self.store.routes()? {
            if route.locked {
                continue;
            }
            let Some((dest, arrival_side)) = route.destination_from(&departure) else {
                continue;
            };
            let dest = dest.to_string();
            let arrival_side = arrival_side.to_string();

            if !self.store.lock_route(&route.id, &self.loco.name)? {
                debug!(loco = %self.loco.name, route = %route.id, "lost route lock race");
                continue;
            }

            for element in &route.elements {
                self.station.set_turnout(&element.tile_id, element.setting)?;
            }

            // Reserve the destination when it is free; an occupied far end
            // is left untouched (one locomotive id per block).
            if let Some(mut block) = self.store.block(&dest)? {
                if block.state == BlockState::Free {
                    block.state = BlockState::Locked;
                    block.locomotive_id = Some(self.loco.id.clone());
                    block.arrival_suffix = Some(arrival_side);
                    self.store.persist_block(&block)?;
                    self.notify_layout(&LayoutEvent::BlockChanged {
                        block_id: block.id.clone(),
                    });
                }
            }

            info!(loco = %self.loco.name, route = %route.id, destination = %dest, "route locked");
            self.notify_layout(&LayoutEvent::RouteSelected {
                route_id: route.id.clone(),
            });

            let mut locked = route.clone();
            locked.locked = true;
            locked.locked_by = Some(self.loco.name.clone());
            session.destination_block = Some(dest);
            session.route = Some(locked);
            session.outcome = Some(PrepareOutcome::RouteLocked);
            return Ok(());
        }

        debug!(loco = %self.loco.name, block = %departure, "no lockable route");
        session.outcome = Some(PrepareOutcome::NoRoute);
        Ok(())
    }

    /// Prepared: claim the destination's enter sensor, mark the departure
    /// block, and issue the move.
    fn issue_move(&self) -> Result<(), PilotError> {
        let mut session = self.session.lock().unwrap();
        if session.move_issued {
            return Ok(());
        }

        if let Some(dest_id) = session.destination_block.clone() {
            if let Some(dest) = self.store.block(&dest_id)? {
                if let Some(sensor_id) = dest.enter_sensor_id {
                    let (tx, rx) = mpsc::channel();
                    self.router.register_default(sensor_id, tx);
                    session.enter_rx = Some(rx);
                }
            }
        }

        if let Some(dep_id) = session.departure_block.clone() {
            if let Some(mut dep) = self.store.block(&dep_id)? {
                dep.state = BlockState::Departing;
                self.store.persist_block(&dep)?;
                self.notify_layout(&LayoutEvent::BlockChanged { block_id: dep_id });
            }
        }

        let direction = match self.loco.direction {
            Direction::Stopped => Direction::Forward,
            other => other,
        };
        self.station.set_direction(&self.loco.id, direction)?;
        self.station
            .set_velocity(&self.loco.id, self.config.drive.cruise_velocity)?;
        info!(loco = %self.loco.name, velocity = self.config.drive.cruise_velocity, "move issued");
        session.move_issued = true;
        Ok(())
    }

    /// Braking: shift block states to Leaving/Arriving, slow down, and
    /// claim the exit sensor as preferred (it may be the same physical
    /// contact the enter claim used on short blocks).
    fn begin_braking(&self) -> Result<(), PilotError> {
        let mut session = self.session.lock().unwrap();
        if session.braked {
            return Ok(());
        }

        if let Some(dep_id) = session.departure_block.clone() {
            if let Some(mut dep) = self.store.block(&dep_id)? {
                dep.state = BlockState::Leaving;
                self.store.persist_block(&dep)?;
                self.notify_layout(&LayoutEvent::BlockChanged { block_id: dep_id });
            }
        }
        if let Some(dest_id) = session.destination_block.clone() {
            if let Some(mut dest) = self.store.block(&dest_id)? {
                dest.state = BlockState::Arriving;
                self.store.persist_block(&dest)?;
                self.notify_layout(&LayoutEvent::BlockChanged {
                    block_id: dest_id.clone(),
                });
                if let Some(sensor_id) = dest.exit_sensor_id {
                    let (tx, rx) = mpsc::channel();
                    self.router.register_preferred(sensor_id, tx);
                    session.exit_rx = Some(rx);
                }
            }
        }

        self.station
            .set_velocity(&self.loco.id, self.config.drive.brake_velocity)?;
        info!(loco = %self.loco.name, "braking");
        session.braked = true;
        Ok(())
    }

    /// Stopped: halt, settle block bookkeeping, release the route, dwell.
    fn complete_arrival(&self) -> Result<(), PilotError> {
        let mut session = self.session.lock().unwrap();
        if session.arrival_done {
            return Ok(());
        }

        self.station.set_velocity(&self.loco.id, 0)?;

        if let Some(dep_id) = session.departure_block.clone() {
            if let Some(mut dep) = self.store.block(&dep_id)? {
                dep.state = BlockState::Free;
                dep.locomotive_id = None;
                dep.arrival_suffix = None;
                self.store.persist_block(&dep)?;
                self.notify_layout(&LayoutEvent::BlockChanged { block_id: dep_id });
            }
        }
        if let Some(dest_id) = session.destination_block.clone() {
            if let Some(mut dest) = self.store.block(&dest_id)? {
                dest.state = BlockState::Occupied;
                dest.locomotive_id = Some(self.loco.id.clone());
                dest.arrival_suffix = None;
                self.store.persist_block(&dest)?;
                self.notify_layout(&LayoutEvent::BlockChanged { block_id: dest_id });
            }
        }
        if let Some(route) = session.route.take() {
            self.store.unlock_route(&route.id)?;
            self.notify_layout(&LayoutEvent::RouteReleased { route_id: route.id });
        }

        info!(loco = %self.loco.name, "arrived");
        session.dwell_until = Some(Instant::now() + self.config.timing.dwell());
        session.arrival_done = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Advancement
    // ------------------------------------------------------------------

    /// Whether the current state may install its successor.
    fn can_advance(&self) -> bool {
        let state = self.state();
        let mut session = self.session.lock().unwrap();
        match state {
            DispatcherState::Idle => self.active.load(Ordering::SeqCst),
            DispatcherState::Preparing => session.outcome.is_some(),
            DispatcherState::Prepared => session.move_issued,
            DispatcherState::Driving => Self::claim_satisfied(&mut session.enter_rx),
            DispatcherState::Braking => Self::claim_satisfied(&mut session.exit_rx),
            DispatcherState::Stopped => session
                .dwell_until
                .map(|t| Instant::now() >= t)
                .unwrap_or(false),
            DispatcherState::Waiting => {
                if !self.active.load(Ordering::SeqCst) {
                    true
                } else {
                    session
                        .retry_at
                        .map(|t| Instant::now() >= t)
                        .unwrap_or(false)
                }
            }
        }
    }

    /// A claim is satisfied once its event arrived; a block without the
    /// relevant sensor has nothing to wait for.
    fn claim_satisfied(rx: &mut Option<Receiver<SensorEvent>>) -> bool {
        match rx {
            None => true,
            Some(receiver) => match receiver.try_recv() {
                Ok(_) => {
                    *rx = None;
                    true
                }
                Err(_) => false,
            },
        }
    }

    fn advance(&self) {
        let current = self.state();
        let outcome = self.session.lock().unwrap().outcome;
        let next = successor(current, outcome, self.active.load(Ordering::SeqCst));

        {
            let mut session = self.session.lock().unwrap();
            match next {
                DispatcherState::Preparing => session.roll(),
                DispatcherState::Waiting => {
                    session.retry_at =
                        Some(Instant::now() + self.config.timing.blocked_backoff());
                }
                DispatcherState::Idle => *session = DriveSession::default(),
                _ => {}
            }
        }

        self.set_state(next);
    }

    /// Install a new state, record the previous one, and fire the state
    /// listeners, the only externally observable per-train signal.
    fn set_state(&self, next: DispatcherState) {
        let prev = {
            let mut state = self.state.lock().unwrap();
            let prev = *state;
            *state = next;
            prev
        };
        *self.previous.lock().unwrap() = Some(prev);
        info!(
            loco = %self.loco.name,
            from = prev.as_str(),
            to = next.as_str(),
            "dispatcher state change"
        );

        let listeners: Vec<Arc<dyn StateEventListener>> =
            self.state_listeners.lock().unwrap().clone();
        for listener in listeners {
            listener.on_state_change(&self.loco.name, next.as_str());
        }
    }

    fn notify_layout(&self, event: &LayoutEvent) {
        let listeners: Vec<Arc<dyn LayoutEventListener>> =
            self.layout_listeners.lock().unwrap().clone();
        for listener in listeners {
            listener.layout_changed(event);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{MemoryStore, MockStation};
    use crate::layout::{Block, Route};

    fn dispatcher() -> Arc<TrainDispatcher<MemoryStore, MockStation>> {
        let store = Arc::new(MemoryStore::new());
        store.put_block(Block::new("bk-1").with_locomotive("v-81"));
        store.put_block(Block::new("bk-2"));
        store.put_route(Route::new("rt-1", "bk-1", "bk-2"));
        Arc::new(TrainDispatcher::new(
            Locomotive::new("v-81", "BR 81"),
            store,
            Arc::new(MockStation::new()),
            Arc::new(SensorEventRouter::new()),
            PilotConfig::fast(),
        ))
    }

    // === Successor table ===
    #[test]
    fn successor_table_is_exhaustive() {
        use DispatcherState::*;
        assert_eq!(successor(Idle, None, true), Preparing);
        assert_eq!(
            successor(Preparing, Some(PrepareOutcome::RouteLocked), true),
            Prepared
        );
        assert_eq!(
            successor(Preparing, Some(PrepareOutcome::NoRoute), true),
            Waiting
        );
        assert_eq!(successor(Prepared, None, true), Driving);
        assert_eq!(successor(Driving, None, true), Braking);
        assert_eq!(successor(Braking, None, true), Stopped);
        assert_eq!(successor(Stopped, None, true), Waiting);
        assert_eq!(successor(Waiting, None, true), Preparing);
        assert_eq!(successor(Waiting, None, false), Idle);
    }

    // === State names ===
    #[test]
    fn state_names_are_lowercase() {
        assert_eq!(DispatcherState::Idle.as_str(), "idle");
        assert_eq!(DispatcherState::Preparing.as_str(), "preparing");
        assert_eq!(DispatcherState::Waiting.as_str(), "waiting");
    }

    // === set_state ===
    #[test]
    fn set_state_records_previous_and_notifies() {
        struct Recorder(Mutex<Vec<(String, String)>>);
        impl StateEventListener for Recorder {
            fn on_state_change(&self, loco: &str, state: &str) {
                self.0
                    .lock()
                    .unwrap()
                    .push((loco.to_string(), state.to_string()));
            }
        }

        let d = dispatcher();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        d.add_state_listener(recorder.clone());

        d.set_state(DispatcherState::Preparing);

        assert_eq!(d.state(), DispatcherState::Preparing);
        assert_eq!(d.previous_state(), Some(DispatcherState::Idle));
        let seen = recorder.0.lock().unwrap();
        assert_eq!(seen.as_slice(), &[("BR 81".to_string(), "preparing".to_string())]);
    }

    // === Preparing ===
    #[test]
    fn preparing_locks_route_and_reserves_destination() {
        let d = dispatcher();
        d.set_state(DispatcherState::Preparing);
        d.search_and_lock_route().unwrap();

        assert_eq!(d.current_route_id().as_deref(), Some("rt-1"));
        let route = d.store.route("rt-1").unwrap().unwrap();
        assert!(route.locked);
        assert_eq!(route.locked_by.as_deref(), Some("BR 81"));

        let dest = d.store.block("bk-2").unwrap().unwrap();
        assert_eq!(dest.state, BlockState::Locked);
        assert_eq!(dest.locomotive_id.as_deref(), Some("v-81"));
        assert!(dest.arrival_suffix.is_some());
    }

    #[test]
    fn preparing_with_no_route_reports_no_route() {
        let store = Arc::new(MemoryStore::new());
        store.put_block(Block::new("bk-1").with_locomotive("v-81"));
        let d = Arc::new(TrainDispatcher::new(
            Locomotive::new("v-81", "BR 81"),
            store,
            Arc::new(MockStation::new()),
            Arc::new(SensorEventRouter::new()),
            PilotConfig::fast(),
        ));

        d.search_and_lock_route().unwrap();
        assert_eq!(
            d.session.lock().unwrap().outcome,
            Some(PrepareOutcome::NoRoute)
        );
    }

    #[test]
    fn preparing_skips_locked_routes() {
        let d = dispatcher();
        assert!(d.store.lock_route("rt-1", "someone else").unwrap());

        d.search_and_lock_route().unwrap();
        assert_eq!(
            d.session.lock().unwrap().outcome,
            Some(PrepareOutcome::NoRoute)
        );
    }

    // === Session roll ===
    #[test]
    fn session_roll_moves_destination_to_departure() {
        let mut session = DriveSession {
            departure_block: Some("bk-1".to_string()),
            destination_block: Some("bk-2".to_string()),
            move_issued: true,
            ..DriveSession::default()
        };
        session.roll();
        assert_eq!(session.departure_block.as_deref(), Some("bk-2"));
        assert!(session.destination_block.is_none());
        assert!(!session.move_issued);
    }
}
