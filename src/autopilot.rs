//! Process-wide orchestrator for automatic train operation.
//!
//! The [`AutoPilot`] owns the dispatcher registry and the sensor-claim
//! router, runs the lifecycle loop, and implements the two safety
//! behaviors that are not per-train: ghost handling for unclaimed sensor
//! events and the fail-safe reset sweep on every stop.
//!
//! A pilot instance is built fresh per run by the command handler:
//! registries are never reused across runs, only listeners are carried
//! over. Registry mutation is not internally atomic as a whole; the
//! single-consumer command queue ([`crate::commands`]) is what serializes
//! callers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, trace, warn};

use crate::config::PilotConfig;
use crate::dispatcher::TrainDispatcher;
use crate::error::PilotError;
use crate::layout::{Block, BlockState, Locomotive, SensorEvent};
use crate::sensors::{RouteOutcome, SensorEventRouter};
use crate::traits::{
    CommandStation, LayoutEvent, LayoutEventListener, LayoutStore, StateEventListener,
    StatusListener,
};

// ============================================================================
// Reset sweep table
// ============================================================================

/// Collapse a block's in-flight state to the most conservative known truth.
///
/// Destination-side states (`Locked`, `Arriving`) never materialized, so the
/// block goes back to `Free` with the expected locomotive cleared; departure-
/// side states (`Departing`, `Leaving`) mean the train is still physically
/// there, so the block is `Occupied`. Idempotent.
fn swept(block: &Block) -> Block {
    let mut out = block.clone();
    match (&block.locomotive_id, block.state) {
        (None, _) => {
            out.state = BlockState::Free;
            out.arrival_suffix = None;
        }
        (Some(_), BlockState::Locked | BlockState::Arriving) => {
            out.state = BlockState::Free;
            out.locomotive_id = None;
            out.arrival_suffix = None;
        }
        (Some(_), BlockState::Departing | BlockState::Leaving) => {
            out.state = BlockState::Occupied;
            out.arrival_suffix = None;
        }
        (Some(_), _) => {
            out.state = BlockState::Occupied;
        }
    }
    out
}

// ============================================================================
// AutoPilot
// ============================================================================

struct DispatcherEntry<S: LayoutStore, C: CommandStation> {
    dispatcher: Arc<TrainDispatcher<S, C>>,
    thread: Option<JoinHandle<()>>,
}

/// Orchestrator for one automation run.
pub struct AutoPilot<S: LayoutStore + 'static, C: CommandStation + 'static> {
    store: Arc<S>,
    station: Arc<C>,
    config: PilotConfig,
    router: Arc<SensorEventRouter>,
    dispatchers: Mutex<HashMap<String, DispatcherEntry<S, C>>>,
    status_listeners: Mutex<Vec<Arc<dyn StatusListener>>>,
    state_listeners: Mutex<Vec<Arc<dyn StateEventListener>>>,
    layout_listeners: Mutex<Vec<Arc<dyn LayoutEventListener>>>,
    running: AtomicBool,
    stop_requested: AtomicBool,
    lifecycle: Mutex<Option<JoinHandle<()>>>,
}

impl<S: LayoutStore + 'static, C: CommandStation + 'static> AutoPilot<S, C> {
    /// Create a pilot with fresh, empty registries.
    pub fn new(store: Arc<S>, station: Arc<C>, config: PilotConfig) -> Self {
        Self {
            store,
            station,
            config,
            router: Arc::new(SensorEventRouter::new()),
            dispatchers: Mutex::new(HashMap::new()),
            status_listeners: Mutex::new(Vec::new()),
            state_listeners: Mutex::new(Vec::new()),
            layout_listeners: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            lifecycle: Mutex::new(None),
        }
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    /// Register a running-state observer.
    pub fn add_status_listener(&self, listener: Arc<dyn StatusListener>) {
        self.status_listeners.lock().unwrap().push(listener);
    }

    /// Register a per-dispatcher state observer, attached to every
    /// dispatcher built from now on.
    pub fn add_state_listener(&self, listener: Arc<dyn StateEventListener>) {
        self.state_listeners.lock().unwrap().push(listener);
    }

    /// Register a presentation-layer observer.
    pub fn add_layout_listener(&self, listener: Arc<dyn LayoutEventListener>) {
        self.layout_listeners.lock().unwrap().push(listener);
    }

    /// Snapshot of the registered status listeners, for carry-over into a
    /// replacement pilot.
    pub fn status_listeners(&self) -> Vec<Arc<dyn StatusListener>> {
        self.status_listeners.lock().unwrap().clone()
    }

    /// Snapshot of the registered state listeners.
    pub fn state_listeners(&self) -> Vec<Arc<dyn StateEventListener>> {
        self.state_listeners.lock().unwrap().clone()
    }

    /// Snapshot of the registered layout listeners.
    pub fn layout_listeners(&self) -> Vec<Arc<dyn LayoutEventListener>> {
        self.layout_listeners.lock().unwrap().clone()
    }

    /// True between a completed start and the end of the stop wind-down.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The sensor router (claims are registered by dispatchers).
    pub fn router(&self) -> &Arc<SensorEventRouter> {
        &self.router
    }

    fn notify_status(&self, running: bool) {
        let listeners = self.status_listeners();
        for listener in listeners {
            listener.status_changed(running);
        }
    }

    fn notify_layout(&self, event: &LayoutEvent) {
        let listeners = self.layout_listeners();
        for listener in listeners {
            listener.layout_changed(event);
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start the run: wire up sensors, build dispatchers for every
    /// on-track locomotive, and spawn the lifecycle loop.
    pub fn start(self: &Arc<Self>) -> Result<(), PilotError> {
        if self.is_running() {
            debug!("autopilot already running");
            return Ok(());
        }
        info!("autopilot starting");
        self.stop_requested.store(false, Ordering::SeqCst);

        for sensor in self.store.sensors()? {
            self.router.seed(sensor.id);
        }
        self.prepare_dispatchers()?;

        // Only hook into the station once every fallible step is done; a
        // failed start must leave no listener behind to ghost-handle events
        // meant for a later pilot.
        let pilot = Arc::clone(self);
        self.station
            .add_sensor_listener(Arc::new(move |event| pilot.handle_sensor_event(event)));

        self.running.store(true, Ordering::SeqCst);
        self.notify_status(true);

        let pilot = Arc::clone(self);
        let handle = thread::spawn(move || {
            while !pilot.stop_requested.load(Ordering::SeqCst) {
                thread::sleep(pilot.config.timing.lifecycle_idle());
            }
            pilot.wind_down();
        });
        *self.lifecycle.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Request stop and wait for the full wind-down: sensors unregistered,
    /// dispatchers joined, reset sweep done, power restored. "Stopped" is
    /// observable only once the layout is back in a known state.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        let handle = self.lifecycle.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("autopilot lifecycle thread panicked");
            }
        }
    }

    fn wind_down(&self) {
        info!("autopilot stopping");
        self.station.remove_sensor_listeners();
        self.router.clear();

        let entries: Vec<DispatcherEntry<S, C>> = {
            let mut dispatchers = self.dispatchers.lock().unwrap();
            dispatchers.drain().map(|(_, entry)| entry).collect()
        };
        for mut entry in entries {
            entry.dispatcher.stop_running();
            entry.dispatcher.shutdown();
            if let Some(thread) = entry.thread.take() {
                if thread.join().is_err() {
                    warn!(loco = entry.dispatcher.loco_name(), "dispatcher thread panicked");
                }
            }
        }

        self.reset_sweep();
        self.running.store(false, Ordering::SeqCst);
        self.notify_status(false);
        info!("autopilot stopped");
    }

    // ------------------------------------------------------------------
    // Dispatcher registry
    // ------------------------------------------------------------------

    /// Locomotives currently associated with an occupied block, one entry
    /// per locomotive id.
    fn on_track_locomotives(&self) -> Result<Vec<Locomotive>, PilotError> {
        let mut seen = HashSet::new();
        let mut locos = Vec::new();
        for block in self.store.blocks()? {
            let Some(loco_id) = block.locomotive_id else {
                continue;
            };
            if !seen.insert(loco_id.clone()) {
                continue;
            }
            match self.store.locomotive(&loco_id)? {
                Some(loco) => locos.push(loco),
                // A dangling block reference must not abort the whole
                // buildout; the row can be repaired while we run.
                None => warn!(loco = %loco_id, "block references unknown locomotive"),
            }
        }
        Ok(locos)
    }

    /// Build-or-reuse one dispatcher per on-track locomotive.
    ///
    /// Reuse preserves in-flight progress: calling this twice never
    /// duplicates or resets a dispatcher.
    pub fn prepare_dispatchers(self: &Arc<Self>) -> Result<(), PilotError> {
        for loco in self.on_track_locomotives()? {
            self.ensure_dispatcher(&loco);
        }
        Ok(())
    }

    /// Build-or-reuse dispatchers and request automation on all of them.
    pub fn start_all_locomotives(self: &Arc<Self>) -> Result<(), PilotError> {
        self.prepare_dispatchers()?;
        let dispatchers = self.dispatchers.lock().unwrap();
        for entry in dispatchers.values() {
            entry.dispatcher.start_running();
        }
        Ok(())
    }

    /// Start or stop automation for a single locomotive, building its
    /// dispatcher on first need.
    pub fn start_stop_locomotive(self: &Arc<Self>, loco: &Locomotive, start: bool) {
        let dispatcher = self.ensure_dispatcher(loco);
        if start {
            dispatcher.start_running();
        } else {
            dispatcher.stop_running();
        }
    }

    /// Register a locomotive for automation without starting it.
    pub fn add_locomotive(self: &Arc<Self>, loco: &Locomotive) {
        self.ensure_dispatcher(loco);
    }

    /// Stop and discard a locomotive's dispatcher.
    pub fn remove_locomotive(&self, loco: &Locomotive) {
        let entry = self.dispatchers.lock().unwrap().remove(&loco.name);
        if let Some(mut entry) = entry {
            entry.dispatcher.stop_running();
            entry.dispatcher.shutdown();
            if let Some(thread) = entry.thread.take() {
                let _ = thread.join();
            }
            info!(loco = %loco.name, "dispatcher removed");
        }
    }

    fn ensure_dispatcher(self: &Arc<Self>, loco: &Locomotive) -> Arc<TrainDispatcher<S, C>> {
        let mut dispatchers = self.dispatchers.lock().unwrap();
        if let Some(entry) = dispatchers.get(&loco.name) {
            return Arc::clone(&entry.dispatcher);
        }

        let dispatcher = Arc::new(TrainDispatcher::new(
            loco.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.station),
            Arc::clone(&self.router),
            self.config.clone(),
        ));
        for listener in self.state_listeners() {
            dispatcher.add_state_listener(listener);
        }
        for listener in self.layout_listeners() {
            dispatcher.add_layout_listener(listener);
        }
        let thread = dispatcher.spawn();
        info!(loco = %loco.name, "dispatcher created");
        dispatchers.insert(
            loco.name.clone(),
            DispatcherEntry {
                dispatcher: Arc::clone(&dispatcher),
                thread: Some(thread),
            },
        );
        dispatcher
    }

    /// Look up a dispatcher by locomotive name.
    pub fn dispatcher(&self, loco_name: &str) -> Option<Arc<TrainDispatcher<S, C>>> {
        self.dispatchers
            .lock()
            .unwrap()
            .get(loco_name)
            .map(|entry| Arc::clone(&entry.dispatcher))
    }

    /// Number of registered dispatchers.
    pub fn dispatcher_count(&self) -> usize {
        self.dispatchers.lock().unwrap().len()
    }

    // ------------------------------------------------------------------
    // Sensor pipeline
    // ------------------------------------------------------------------

    /// Entry point for station sensor events; runs on the station's
    /// delivery context.
    pub fn handle_sensor_event(&self, event: SensorEvent) {
        if !event.changed {
            trace!(sensor = %event.id, "refresh event ignored");
            return;
        }
        match self.router.route(&event) {
            RouteOutcome::Delivered => {}
            RouteOutcome::Ghost => self.ghost_response(&event),
        }
    }

    /// Fail-safe for an unclaimed contact: cut power first, ask questions
    /// never. The matching block is marked `Ghost` while the contact is
    /// active and `Free` once it clears; power stays off until an operator
    /// (or the next reset sweep) restores it.
    fn ghost_response(&self, event: &SensorEvent) {
        warn!(sensor = %event.id, active = event.active, "ghost sensor event");
        if let Err(err) = self.station.switch_power(false) {
            warn!(error = %err, "power cut failed during ghost response");
        }

        let blocks = match self.store.blocks() {
            Ok(blocks) => blocks,
            Err(err) => {
                warn!(error = %err, "cannot read blocks for ghost marking");
                return;
            }
        };
        let Some(mut block) = blocks.into_iter().find(|b| b.owns_sensor(&event.id)) else {
            warn!(sensor = %event.id, "ghost event on a sensor owned by no block");
            return;
        };

        block.state = if event.active {
            BlockState::Ghost
        } else {
            BlockState::Free
        };
        if let Err(err) = self.store.persist_block(&block) {
            warn!(block = %block.id, error = %err, "ghost marking not persisted");
            return;
        }
        self.notify_layout(&LayoutEvent::BlockChanged {
            block_id: block.id.clone(),
        });
    }

    // ------------------------------------------------------------------
    // Reset sweep
    // ------------------------------------------------------------------

    /// Collapse all uncertain in-flight state to the most conservative
    /// known truth, then restore track power.
    ///
    /// Runs on every stop, normal or not, and on an explicit `Reset`
    /// command. Each row is persisted and notified individually: the sweep
    /// is best-effort, never transactional, and a failed row does not stop
    /// the rest.
    pub fn reset_sweep(&self) {
        info!("reset sweep");
        self.router.reset();
        match self.store.routes() {
            Ok(routes) => {
                for route in routes {
                    if let Err(err) = self.store.unlock_route(&route.id) {
                        warn!(route = %route.id, error = %err, "route unlock failed during sweep");
                        continue;
                    }
                    self.notify_layout(&LayoutEvent::RouteReleased {
                        route_id: route.id,
                    });
                }
            }
            Err(err) => warn!(error = %err, "cannot read routes for sweep"),
        }

        match self.store.blocks() {
            Ok(blocks) => {
                for block in blocks {
                    let reset = swept(&block);
                    if reset == block {
                        continue;
                    }
                    if let Err(err) = self.store.persist_block(&reset) {
                        warn!(block = %block.id, error = %err, "block reset not persisted");
                        continue;
                    }
                    self.notify_layout(&LayoutEvent::BlockChanged { block_id: reset.id });
                }
            }
            Err(err) => warn!(error = %err, "cannot read blocks for sweep"),
        }

        if let Err(err) = self.station.switch_power(true) {
            warn!(error = %err, "power restore failed after sweep");
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
    use crate::layout::Route;

    fn pilot_with(
        store: Arc<MemoryStore>,
        station: Arc<MockStation>,
    ) -> Arc<AutoPilot<MemoryStore, MockStation>> {
        Arc::new(AutoPilot::new(store, station, PilotConfig::fast()))
    }

    // === Reset table ===
    #[test]
    fn swept_matches_the_reset_table() {
        let mut block = Block::new("bk-1");

        // No locomotive: always Free.
        for state in [
            BlockState::Free,
            BlockState::Occupied,
            BlockState::Ghost,
            BlockState::Arriving,
        ] {
            block.state = state;
            block.locomotive_id = None;
            assert_eq!(swept(&block).state, BlockState::Free);
        }

        // Destination never materialized: Free, loco and suffix cleared.
        for state in [BlockState::Locked, BlockState::Arriving] {
            block.state = state;
            block.locomotive_id = Some("v-1".to_string());
            block.arrival_suffix = Some("+".to_string());
            let reset = swept(&block);
            assert_eq!(reset.state, BlockState::Free);
            assert!(reset.locomotive_id.is_none());
            assert!(reset.arrival_suffix.is_none());
        }

        // Train still physically present: Occupied, suffix cleared.
        for state in [BlockState::Departing, BlockState::Leaving] {
            block.state = state;
            block.locomotive_id = Some("v-1".to_string());
            block.arrival_suffix = Some("+".to_string());
            let reset = swept(&block);
            assert_eq!(reset.state, BlockState::Occupied);
            assert_eq!(reset.locomotive_id.as_deref(), Some("v-1"));
            assert!(reset.arrival_suffix.is_none());
        }

        // Any other state with a locomotive: Occupied.
        for state in [BlockState::Free, BlockState::Occupied, BlockState::Ghost] {
            block.state = state;
            block.locomotive_id = Some("v-1".to_string());
            block.arrival_suffix = None;
            assert_eq!(swept(&block).state, BlockState::Occupied);
        }
    }

    #[test]
    fn swept_is_idempotent() {
        for state in [
            BlockState::Free,
            BlockState::Occupied,
            BlockState::Locked,
            BlockState::Arriving,
            BlockState::Departing,
            BlockState::Leaving,
            BlockState::Ghost,
        ] {
            for loco in [None, Some("v-1".to_string())] {
                let mut block = Block::new("bk-1");
                block.state = state;
                block.locomotive_id = loco;
                let once = swept(&block);
                assert_eq!(swept(&once), once, "state {state:?}");
            }
        }
    }

    // === Sweep ===
    #[test]
    fn sweep_unlocks_routes_and_restores_power() {
        let store = Arc::new(MemoryStore::new());
        let mut route = Route::new("rt-1", "bk-1", "bk-2");
        route.locked = true;
        route.locked_by = Some("BR 81".to_string());
        store.put_route(route);
        let station = Arc::new(MockStation::new());
        station.switch_power(false).unwrap();

        let pilot = pilot_with(Arc::clone(&store), Arc::clone(&station));
        pilot.reset_sweep();

        let route = store.route("rt-1").unwrap().unwrap();
        assert!(!route.locked);
        assert!(route.locked_by.is_none());
        assert!(station.power_on());
    }

    // === Ghost response ===
    #[test]
    fn ghost_event_cuts_power_and_marks_block() {
        let store = Arc::new(MemoryStore::new());
        store.put_block(Block::new("bk-3").with_enter_sensor("se-5"));
        let station = Arc::new(MockStation::new());
        let pilot = pilot_with(Arc::clone(&store), Arc::clone(&station));

        pilot.handle_sensor_event(SensorEvent::changed("se-5", true));

        assert!(!station.power_on());
        assert_eq!(
            store.block("bk-3").unwrap().unwrap().state,
            BlockState::Ghost
        );
    }

    #[test]
    fn refresh_events_are_ignored() {
        let store = Arc::new(MemoryStore::new());
        store.put_block(Block::new("bk-3").with_enter_sensor("se-5"));
        let station = Arc::new(MockStation::new());
        let pilot = pilot_with(Arc::clone(&store), Arc::clone(&station));

        pilot.handle_sensor_event(SensorEvent::refresh("se-5", true));

        assert!(station.power_on());
        assert_eq!(
            store.block("bk-3").unwrap().unwrap().state,
            BlockState::Free
        );
    }

    // === Registry ===
    #[test]
    fn prepare_dispatchers_builds_one_per_on_track_loco() {
        let store = Arc::new(MemoryStore::new());
        store.put_locomotive(Locomotive::new("v-81", "BR 81"));
        store.put_locomotive(Locomotive::new("v-12", "NS 1211"));
        store.put_block(Block::new("bk-1").with_locomotive("v-81"));
        store.put_block(Block::new("bk-2").with_locomotive("v-12"));
        store.put_block(Block::new("bk-3"));
        let pilot = pilot_with(store, Arc::new(MockStation::new()));

        pilot.prepare_dispatchers().unwrap();
        assert_eq!(pilot.dispatcher_count(), 2);
        assert!(pilot.dispatcher("BR 81").is_some());

        // Calling again reuses, never duplicates.
        pilot.prepare_dispatchers().unwrap();
        assert_eq!(pilot.dispatcher_count(), 2);

        pilot.stop();
    }

    #[test]
    fn unknown_on_track_locomotive_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        store.put_block(Block::new("bk-1").with_locomotive("v-404"));
        let pilot = pilot_with(store, Arc::new(MockStation::new()));

        pilot.prepare_dispatchers().unwrap();
        assert_eq!(pilot.dispatcher_count(), 0);
    }

    #[test]
    fn remove_locomotive_discards_dispatcher() {
        let store = Arc::new(MemoryStore::new());
        let loco = Locomotive::new("v-81", "BR 81");
        store.put_locomotive(loco.clone());
        store.put_block(Block::new("bk-1").with_locomotive("v-81"));
        let pilot = pilot_with(store, Arc::new(MockStation::new()));

        pilot.add_locomotive(&loco);
        assert_eq!(pilot.dispatcher_count(), 1);
        pilot.remove_locomotive(&loco);
        assert_eq!(pilot.dispatcher_count(), 0);
    }
}
