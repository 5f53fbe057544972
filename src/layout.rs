//! Layout data model: blocks, routes, sensors, and locomotives.
//!
//! These are the persisted rows the autopilot reads and writes through the
//! [`LayoutStore`] contract. The canonical truth for block and route state
//! lives in persistence, not in memory: a dispatcher that wants a route
//! must flip its `locked` flag through the store, and the reset sweep
//! rewrites block rows back to a conservative known state.
//!
//! # Block lifecycle
//!
//! A [`Block`] is a track section holding at most one locomotive. During an
//! automated run its state moves through reservation and arrival phases:
//!
//! ```text
//! Free -> Locked -> Arriving -> Occupied        (destination side)
//! Occupied -> Departing -> Leaving -> Free      (departure side)
//! ```
//!
//! `Ghost` is the fail-safe marker for a block whose sensor fired with no
//! registered claimant.
//!
//! [`LayoutStore`]: crate::traits::LayoutStore

// ============================================================================
// Direction
// ============================================================================

/// Direction of travel for a locomotive.
///
/// Defaults to [`Stopped`](Self::Stopped) for safety.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Moving forward.
    Forward,
    /// Moving in reverse.
    Reverse,
    /// Not moving.
    #[default]
    Stopped,
}

impl Direction {
    /// Returns the direction as a lowercase string.
    ///
    /// ```
    /// use railpilot::Direction;
    ///
    /// assert_eq!(Direction::Forward.as_str(), "forward");
    /// assert_eq!(Direction::Stopped.as_str(), "stopped");
    /// ```
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Reverse => "reverse",
            Direction::Stopped => "stopped",
        }
    }
}

// ============================================================================
// Locomotive
// ============================================================================

/// A physical locomotive, referenced by id.
///
/// Owned by persistence; the autopilot and dispatchers only hold references
/// to it and never mutate the row themselves. Movement goes through the
/// [`CommandStation`](crate::traits::CommandStation).
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Locomotive {
    /// Stable identifier (decoder/database id).
    pub id: String,
    /// Display name; dispatchers are keyed by this.
    pub name: String,
    /// Last commanded direction.
    pub direction: Direction,
    /// Last commanded velocity (0-100).
    pub velocity: u8,
}

impl Locomotive {
    /// Create a locomotive with the given id and name, stopped.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            direction: Direction::Stopped,
            velocity: 0,
        }
    }
}

// ============================================================================
// Block
// ============================================================================

/// Occupancy / reservation state of a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockState {
    /// No locomotive, no reservation.
    #[default]
    Free,
    /// A locomotive is physically present.
    Occupied,
    /// Reserved as a destination; the train has not started moving yet.
    Locked,
    /// The incoming train has hit the enter sensor.
    Arriving,
    /// The resident train has been given a move command.
    Departing,
    /// The departing train has cleared into the route.
    Leaving,
    /// An unclaimed sensor fired here; treated as a hazard.
    Ghost,
}

impl BlockState {
    /// Returns the state as a lowercase string.
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            BlockState::Free => "free",
            BlockState::Occupied => "occupied",
            BlockState::Locked => "locked",
            BlockState::Arriving => "arriving",
            BlockState::Departing => "departing",
            BlockState::Leaving => "leaving",
            BlockState::Ghost => "ghost",
        }
    }
}

/// A track section with defined entry/exit sensors, holding at most one
/// locomotive.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Block {
    /// Block identifier, e.g. `"bk-1"`.
    pub id: String,
    /// Current occupancy / reservation state.
    pub state: BlockState,
    /// Id of the occupying (or expected) locomotive, if any.
    pub locomotive_id: Option<String>,
    /// Which end the expected train arrives at (`"+"` or `"-"`).
    pub arrival_suffix: Option<String>,
    /// Sensor at the block boundary; first contact on arrival.
    pub enter_sensor_id: Option<String>,
    /// Sensor at the far end; the train is fully inside once it fires.
    pub exit_sensor_id: Option<String>,
}

impl Block {
    /// Create a free block with no sensors assigned.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: BlockState::Free,
            locomotive_id: None,
            arrival_suffix: None,
            enter_sensor_id: None,
            exit_sensor_id: None,
        }
    }

    /// Assign the enter sensor.
    pub fn with_enter_sensor(mut self, sensor_id: impl Into<String>) -> Self {
        self.enter_sensor_id = Some(sensor_id.into());
        self
    }

    /// Assign the exit sensor.
    pub fn with_exit_sensor(mut self, sensor_id: impl Into<String>) -> Self {
        self.exit_sensor_id = Some(sensor_id.into());
        self
    }

    /// Mark the block as occupied by the given locomotive.
    pub fn with_locomotive(mut self, loco_id: impl Into<String>) -> Self {
        self.locomotive_id = Some(loco_id.into());
        self.state = BlockState::Occupied;
        self
    }

    /// True if the given sensor id is this block's enter or exit sensor.
    pub fn owns_sensor(&self, sensor_id: &str) -> bool {
        self.enter_sensor_id.as_deref() == Some(sensor_id)
            || self.exit_sensor_id.as_deref() == Some(sensor_id)
    }
}

// ============================================================================
// Route
// ============================================================================

/// Required setting for one accessory along a route.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementSetting {
    /// Turnout in the straight position.
    Straight,
    /// Turnout in the diverging position.
    Diverging,
}

/// One tile along a route with its required accessory setting.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RouteElement {
    /// Tile identifier on the layout.
    pub tile_id: String,
    /// Setting the tile must take before the route is driveable.
    pub setting: ElementSetting,
}

/// An ordered path between two block ends, lockable for exclusive use.
///
/// `locked` is the contended flag: a dispatcher must win the store's
/// compare-and-swap ([`LayoutStore::lock_route`]) before driving the route
/// and must clear it on completion or abort. `locked_by` records the winner
/// so the at-most-one-owner invariant is checkable from outside.
///
/// [`LayoutStore::lock_route`]: crate::traits::LayoutStore::lock_route
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Route {
    /// Route identifier.
    pub id: String,
    /// Block the route leaves from.
    pub from_block: String,
    /// Side of the departure block (`"+"` or `"-"`).
    pub from_side: String,
    /// Block the route arrives at.
    pub to_block: String,
    /// Side of the destination block (`"+"` or `"-"`).
    pub to_side: String,
    /// Tiles and required settings along the path.
    pub elements: Vec<RouteElement>,
    /// Exclusive-use flag; flipped only through the store.
    pub locked: bool,
    /// Dispatcher (locomotive name) currently holding the lock.
    pub locked_by: Option<String>,
}

impl Route {
    /// Create an unlocked route between two block ends.
    pub fn new(
        id: impl Into<String>,
        from_block: impl Into<String>,
        to_block: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            from_block: from_block.into(),
            from_side: "+".to_string(),
            to_block: to_block.into(),
            to_side: "+".to_string(),
            elements: Vec::new(),
            locked: false,
            locked_by: None,
        }
    }

    /// Add an element to the path.
    pub fn with_element(mut self, tile_id: impl Into<String>, setting: ElementSetting) -> Self {
        self.elements.push(RouteElement {
            tile_id: tile_id.into(),
            setting,
        });
        self
    }

    /// True if either end of the route is the given block.
    pub fn touches(&self, block_id: &str) -> bool {
        self.from_block == block_id || self.to_block == block_id
    }

    /// The far end of the route as seen from `departure`, if the route
    /// connects to that block at all.
    ///
    /// Routes are driveable from either end; the destination and its
    /// arrival side depend on where the train starts.
    pub fn destination_from(&self, departure: &str) -> Option<(&str, &str)> {
        if self.from_block == departure {
            Some((self.to_block.as_str(), self.to_side.as_str()))
        } else if self.to_block == departure {
            Some((self.from_block.as_str(), self.from_side.as_str()))
        } else {
            None
        }
    }
}

// ============================================================================
// Sensors
// ============================================================================

/// A persisted feedback sensor.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Sensor {
    /// Sensor identifier, e.g. `"se-5"`.
    pub id: String,
    /// Last known contact state.
    pub active: bool,
}

impl Sensor {
    /// Create an inactive sensor.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            active: false,
        }
    }
}

/// A sensor transition delivered by the command station.
///
/// The sole source of real-world feedback. `changed` distinguishes real
/// transitions from periodic state refreshes; the autopilot only reacts to
/// changed events.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SensorEvent {
    /// Id of the sensor that fired.
    pub id: String,
    /// Contact state after the transition.
    pub active: bool,
    /// Whether this is a real transition rather than a refresh.
    pub changed: bool,
}

impl SensorEvent {
    /// A real transition for the given sensor.
    pub fn changed(id: impl Into<String>, active: bool) -> Self {
        Self {
            id: id.into(),
            active,
            changed: true,
        }
    }

    /// A periodic refresh carrying the current state.
    pub fn refresh(id: impl Into<String>, active: bool) -> Self {
        Self {
            id: id.into(),
            active,
            changed: false,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // === Direction ===
    #[test]
    fn direction_default_is_stopped() {
        assert_eq!(Direction::default(), Direction::Stopped);
    }

    // === Block ===
    #[test]
    fn block_builder_sets_sensors_and_occupant() {
        let block = Block::new("bk-1")
            .with_enter_sensor("se-1")
            .with_exit_sensor("se-2")
            .with_locomotive("BR81");

        assert_eq!(block.state, BlockState::Occupied);
        assert_eq!(block.locomotive_id.as_deref(), Some("BR81"));
        assert!(block.owns_sensor("se-1"));
        assert!(block.owns_sensor("se-2"));
        assert!(!block.owns_sensor("se-3"));
    }

    #[test]
    fn block_without_sensors_owns_nothing() {
        let block = Block::new("bk-1");
        assert!(!block.owns_sensor("se-1"));
    }

    // === Route ===
    #[test]
    fn route_destination_from_either_end() {
        let mut route = Route::new("rt-1", "bk-1", "bk-2");
        route.from_side = "-".to_string();

        assert_eq!(route.destination_from("bk-1"), Some(("bk-2", "+")));
        assert_eq!(route.destination_from("bk-2"), Some(("bk-1", "-")));
        assert_eq!(route.destination_from("bk-3"), None);
    }

    #[test]
    fn route_touches_both_ends() {
        let route = Route::new("rt-1", "bk-1", "bk-2");
        assert!(route.touches("bk-1"));
        assert!(route.touches("bk-2"));
        assert!(!route.touches("bk-3"));
    }

    #[test]
    fn route_starts_unlocked() {
        let route = Route::new("rt-1", "bk-1", "bk-2").with_element("sw-3", ElementSetting::Diverging);
        assert!(!route.locked);
        assert!(route.locked_by.is_none());
        assert_eq!(route.elements.len(), 1);
    }

    // === SensorEvent ===
    #[test]
    fn sensor_event_constructors() {
        let event = SensorEvent::changed("se-5", true);
        assert!(event.changed);
        assert!(event.active);

        let refresh = SensorEvent::refresh("se-5", false);
        assert!(!refresh.changed);
    }
}
