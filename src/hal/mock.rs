//! In-memory store and recording command station.
//!
//! [`MemoryStore`] is a complete [`LayoutStore`] whose `lock_route` is a
//! real compare-and-swap (all rows live under one mutex, so check-then-set
//! is atomic). [`MockStation`] records every call and fires sensor events
//! on the caller's thread, which is exactly the "station delivery context"
//! the autopilot sees in production.
//!
//! # Example
//!
//! ```rust
//! use railpilot::hal::{MemoryStore, MockStation};
//! use railpilot::{Block, Route};
//! use railpilot::traits::LayoutStore;
//!
//! let store = MemoryStore::new();
//! store.put_block(Block::new("bk-1").with_locomotive("NS-1211"));
//! store.put_route(Route::new("rt-1", "bk-1", "bk-2"));
//!
//! assert!(store.lock_route("rt-1", "NS 1211").unwrap());
//! assert!(!store.lock_route("rt-1", "BR 81").unwrap()); // already held
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::error::{StationError, StoreError};
use crate::layout::{Block, Direction, ElementSetting, Locomotive, Route, Sensor, SensorEvent};
use crate::traits::{CommandStation, LayoutStore, SensorCallback};

// ============================================================================
// MemoryStore
// ============================================================================

#[derive(Default)]
struct Rows {
    blocks: BTreeMap<String, Block>,
    routes: BTreeMap<String, Route>,
    sensors: BTreeMap<String, Sensor>,
    locomotives: BTreeMap<String, Locomotive>,
}

/// In-memory [`LayoutStore`] for tests and desktop runs.
///
/// A single mutex guards all rows, which makes `lock_route` trivially
/// atomic and keeps iteration order stable (`BTreeMap`), so route search
/// is deterministic in tests.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<Rows>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a block row.
    pub fn put_block(&self, block: Block) {
        let mut rows = self.rows.lock().unwrap();
        rows.blocks.insert(block.id.clone(), block);
    }

    /// Insert or replace a route row.
    pub fn put_route(&self, route: Route) {
        let mut rows = self.rows.lock().unwrap();
        rows.routes.insert(route.id.clone(), route);
    }

    /// Insert or replace a sensor row.
    pub fn put_sensor(&self, sensor: Sensor) {
        let mut rows = self.rows.lock().unwrap();
        rows.sensors.insert(sensor.id.clone(), sensor);
    }

    /// Insert or replace a locomotive row.
    pub fn put_locomotive(&self, loco: Locomotive) {
        let mut rows = self.rows.lock().unwrap();
        rows.locomotives.insert(loco.id.clone(), loco);
    }
}

impl LayoutStore for MemoryStore {
    fn blocks(&self) -> Result<Vec<Block>, StoreError> {
        Ok(self.rows.lock().unwrap().blocks.values().cloned().collect())
    }

    fn routes(&self) -> Result<Vec<Route>, StoreError> {
        Ok(self.rows.lock().unwrap().routes.values().cloned().collect())
    }

    fn sensors(&self) -> Result<Vec<Sensor>, StoreError> {
        Ok(self.rows.lock().unwrap().sensors.values().cloned().collect())
    }

    fn locomotive(&self, id: &str) -> Result<Option<Locomotive>, StoreError> {
        Ok(self.rows.lock().unwrap().locomotives.get(id).cloned())
    }

    fn persist_block(&self, block: &Block) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        rows.blocks.insert(block.id.clone(), block.clone());
        Ok(())
    }

    fn persist_route(&self, route: &Route) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        rows.routes.insert(route.id.clone(), route.clone());
        Ok(())
    }

    fn lock_route(&self, route_id: &str, owner: &str) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let route = rows.routes.get_mut(route_id).ok_or(StoreError::NotFound {
            kind: "route",
            id: route_id.to_string(),
        })?;
        if route.locked {
            return Ok(false);
        }
        route.locked = true;
        route.locked_by = Some(owner.to_string());
        Ok(true)
    }

    fn unlock_route(&self, route_id: &str) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let route = rows.routes.get_mut(route_id).ok_or(StoreError::NotFound {
            kind: "route",
            id: route_id.to_string(),
        })?;
        route.locked = false;
        route.locked_by = None;
        Ok(())
    }

    fn block(&self, id: &str) -> Result<Option<Block>, StoreError> {
        Ok(self.rows.lock().unwrap().blocks.get(id).cloned())
    }

    fn route(&self, id: &str) -> Result<Option<Route>, StoreError> {
        Ok(self.rows.lock().unwrap().routes.get(id).cloned())
    }
}

// ============================================================================
// MockStation
// ============================================================================

/// Recording [`CommandStation`] for tests.
///
/// Every call is logged for later assertion; sensor events are delivered
/// synchronously on the thread that calls [`fire_sensor`](Self::fire_sensor).
#[derive(Default)]
pub struct MockStation {
    power_on: AtomicBool,
    power_calls: Mutex<Vec<bool>>,
    velocity_calls: Mutex<Vec<(String, u8)>>,
    direction_calls: Mutex<Vec<(String, Direction)>>,
    turnout_calls: Mutex<Vec<(String, ElementSetting)>>,
    listeners: Mutex<Vec<SensorCallback>>,
    /// When set, every station call fails with [`StationError::Offline`].
    offline: AtomicBool,
}

impl MockStation {
    /// Create a station with power on and no listeners.
    pub fn new() -> Self {
        let station = Self::default();
        station.power_on.store(true, Ordering::SeqCst);
        station
    }

    /// Simulate a dropped station link; subsequent calls fail.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), StationError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StationError::Offline)
        } else {
            Ok(())
        }
    }

    /// Deliver a sensor event to all registered listeners, on this thread.
    pub fn fire_sensor(&self, event: SensorEvent) {
        let listeners: Vec<SensorCallback> = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener(event.clone());
        }
    }

    /// Current track power state.
    pub fn power_on(&self) -> bool {
        self.power_on.load(Ordering::SeqCst)
    }

    /// Every `switch_power` argument in call order.
    pub fn power_calls(&self) -> Vec<bool> {
        self.power_calls.lock().unwrap().clone()
    }

    /// Every `set_velocity` call in order.
    pub fn velocity_calls(&self) -> Vec<(String, u8)> {
        self.velocity_calls.lock().unwrap().clone()
    }

    /// Every `set_direction` call in order.
    pub fn direction_calls(&self) -> Vec<(String, Direction)> {
        self.direction_calls.lock().unwrap().clone()
    }

    /// Every `set_turnout` call in order.
    pub fn turnout_calls(&self) -> Vec<(String, ElementSetting)> {
        self.turnout_calls.lock().unwrap().clone()
    }

    /// Number of registered sensor listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    /// Last commanded velocity for the given locomotive, if any.
    pub fn last_velocity(&self, loco_id: &str) -> Option<u8> {
        self.velocity_calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, _)| id == loco_id)
            .map(|(_, v)| *v)
    }
}

impl CommandStation for MockStation {
    fn switch_power(&self, on: bool) -> Result<(), StationError> {
        self.check_online()?;
        self.power_on.store(on, Ordering::SeqCst);
        self.power_calls.lock().unwrap().push(on);
        Ok(())
    }

    fn set_velocity(&self, loco_id: &str, velocity: u8) -> Result<(), StationError> {
        self.check_online()?;
        self.velocity_calls
            .lock()
            .unwrap()
            .push((loco_id.to_string(), velocity));
        Ok(())
    }

    fn set_direction(&self, loco_id: &str, direction: Direction) -> Result<(), StationError> {
        self.check_online()?;
        self.direction_calls
            .lock()
            .unwrap()
            .push((loco_id.to_string(), direction));
        Ok(())
    }

    fn set_turnout(&self, tile_id: &str, setting: ElementSetting) -> Result<(), StationError> {
        self.check_online()?;
        self.turnout_calls
            .lock()
            .unwrap()
            .push((tile_id.to_string(), setting));
        Ok(())
    }

    fn add_sensor_listener(&self, listener: SensorCallback) {
        self.listeners.lock().unwrap().push(listener);
    }

    fn remove_sensor_listeners(&self) {
        self.listeners.lock().unwrap().clear();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    // === MemoryStore ===
    #[test]
    fn store_upsert_is_idempotent() {
        let store = MemoryStore::new();
        let block = Block::new("bk-1");
        store.persist_block(&block).unwrap();
        store.persist_block(&block).unwrap();
        assert_eq!(store.blocks().unwrap().len(), 1);
    }

    #[test]
    fn lock_route_is_exclusive() {
        let store = MemoryStore::new();
        store.put_route(Route::new("rt-1", "bk-1", "bk-2"));

        assert!(store.lock_route("rt-1", "BR 81").unwrap());
        assert!(!store.lock_route("rt-1", "NS 1211").unwrap());

        let route = store.route("rt-1").unwrap().unwrap();
        assert!(route.locked);
        assert_eq!(route.locked_by.as_deref(), Some("BR 81"));
    }

    #[test]
    fn unlock_route_is_idempotent() {
        let store = MemoryStore::new();
        store.put_route(Route::new("rt-1", "bk-1", "bk-2"));

        store.unlock_route("rt-1").unwrap();
        assert!(store.lock_route("rt-1", "BR 81").unwrap());
        store.unlock_route("rt-1").unwrap();
        store.unlock_route("rt-1").unwrap();
        assert!(!store.route("rt-1").unwrap().unwrap().locked);
    }

    #[test]
    fn lock_route_unknown_id_errors() {
        let store = MemoryStore::new();
        assert!(store.lock_route("rt-404", "BR 81").is_err());
    }

    #[test]
    fn lock_route_race_has_one_winner() {
        let store = Arc::new(MemoryStore::new());
        store.put_route(Route::new("rt-1", "bk-1", "bk-2"));

        let mut handles = Vec::new();
        for n in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                store.lock_route("rt-1", &format!("loco-{n}")).unwrap()
            }));
        }
        let wins: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(wins, 1);
    }

    // === MockStation ===
    #[test]
    fn station_records_calls() {
        let station = MockStation::new();
        station.switch_power(false).unwrap();
        station.set_velocity("v-1", 60).unwrap();
        station.set_direction("v-1", Direction::Forward).unwrap();
        station.set_turnout("sw-3", ElementSetting::Diverging).unwrap();

        assert!(!station.power_on());
        assert_eq!(station.power_calls(), vec![false]);
        assert_eq!(station.last_velocity("v-1"), Some(60));
        assert_eq!(station.direction_calls().len(), 1);
        assert_eq!(station.turnout_calls().len(), 1);
    }

    #[test]
    fn station_delivers_events_synchronously() {
        let station = MockStation::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        station.add_sensor_listener(Arc::new(move |event| {
            sink.lock().unwrap().push(event);
        }));

        station.fire_sensor(SensorEvent::changed("se-5", true));
        assert_eq!(seen.lock().unwrap().len(), 1);

        station.remove_sensor_listeners();
        station.fire_sensor(SensorEvent::changed("se-5", false));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn station_offline_fails_calls() {
        let station = MockStation::new();
        station.set_offline(true);
        assert!(station.switch_power(false).is_err());
        assert!(station.set_velocity("v-1", 10).is_err());
    }
}
