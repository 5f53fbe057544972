//! Collaborator seams: persistence, command station, and listeners.
//!
//! The autopilot core is written against these traits so it can run on
//! desktop against the in-memory backends in [`crate::hal`] and against a
//! real layout connection in production. Wire protocols and storage engines
//! live behind the seam; only their contracts are visible here.

mod listeners;
mod persistence;
mod station;

pub use listeners::{LayoutEvent, LayoutEventListener, StateEventListener, StatusListener};
pub use persistence::LayoutStore;
pub use station::{CommandStation, SensorCallback};
