//! Command-station contract: track power, movement, and sensor feedback.
//!
//! The wire protocol (CAN/ECoS/DCC-EX framing) lives behind this trait.
//! The autopilot only needs power switching, abstract movement commands,
//! turnout setting, and a way to receive sensor transitions.

use std::sync::Arc;

use crate::error::StationError;
use crate::layout::{Direction, ElementSetting, SensorEvent};

/// Callback invoked for every sensor event the station delivers.
///
/// Runs on the station's own delivery context, not a dedicated thread per
/// sensor. Keep it short and never block in it.
pub type SensorCallback = Arc<dyn Fn(SensorEvent) + Send + Sync>;

/// Connection to the layout's command station.
pub trait CommandStation: Send + Sync {
    /// Switch track power on or off.
    fn switch_power(&self, on: bool) -> Result<(), StationError>;

    /// Set a locomotive's velocity (0-100).
    fn set_velocity(&self, loco_id: &str, velocity: u8) -> Result<(), StationError>;

    /// Set a locomotive's direction of travel.
    fn set_direction(&self, loco_id: &str, direction: Direction) -> Result<(), StationError>;

    /// Throw a turnout to the given setting.
    fn set_turnout(&self, tile_id: &str, setting: ElementSetting) -> Result<(), StationError>;

    /// Register a listener for sensor events.
    fn add_sensor_listener(&self, listener: SensorCallback);

    /// Remove all registered sensor listeners.
    fn remove_sensor_listeners(&self);
}
