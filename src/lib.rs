//! # railpilot
//!
//! An autopilot for model railway layouts: runs every locomotive on the
//! track automatically, finding and locking routes, driving block to
//! block, and keeping the whole layout consistent while trains move
//! concurrently.
//!
//! ## Features
//!
//! - **Per-train dispatchers**: one state-machine actor per locomotive,
//!   each on its own thread, so trains never block each other
//! - **Race-free routes**: route acquisition is a single compare-and-swap
//!   in the persistence layer, the system's one mutual-exclusion point
//! - **Ghost detection**: an unclaimed sensor firing cuts track power
//!   immediately and marks the block
//! - **Fail-safe stop**: every stop runs a reset sweep that collapses
//!   in-flight block state to the most conservative known truth
//! - **Serial commands**: all operator actions go through one FIFO queue
//!   with a single consumer
//!
//! ## Architecture
//!
//! The crate is structured to allow testing on desktop without a layout:
//!
//! - `traits` - Persistence and command-station abstractions
//! - `layout` - Blocks, routes, locomotives, sensors
//! - `sensors` - Sensor claim routing and ghost detection
//! - `dispatcher` - The per-locomotive automatic-operation state machine
//! - `autopilot` - Orchestrator, lifecycle, and reset sweep
//! - `commands` - Operator command queue
//! - `hal` - Concrete implementations (in-memory store, mock station)
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use railpilot::{
//!     ActionCommand, ActionCommandHandler, Block, Locomotive, PilotConfig, Route,
//!     hal::{MemoryStore, MockStation},
//! };
//!
//! // An in-memory layout: one locomotive, two blocks, one route.
//! let store = Arc::new(MemoryStore::new());
//! store.put_locomotive(Locomotive::new("v-81", "BR 81"));
//! store.put_block(Block::new("bk-1").with_locomotive("v-81"));
//! store.put_block(Block::new("bk-2"));
//! store.put_route(Route::new("rt-1", "bk-1", "bk-2"));
//!
//! let handler = ActionCommandHandler::new(
//!     store,
//!     Arc::new(MockStation::new()),
//!     PilotConfig::fast(),
//! );
//!
//! // Start the autopilot and automate every on-track locomotive.
//! handler.submit(ActionCommand::Start);
//! handler.submit(ActionCommand::StartAllLocomotives);
//!
//! // ... trains run ...
//!
//! handler.submit(ActionCommand::Stop);
//! handler.quit();
//! ```

#![warn(missing_docs)]

/// Orchestrator: lifecycle, dispatcher registry, ghost handling, reset sweep.
pub mod autopilot;
/// Operator command queue with a single consumer thread.
pub mod commands;
/// Scheduling cadences and drive parameters.
pub mod config;
/// Per-locomotive automatic-operation state machine.
pub mod dispatcher;
/// Error types for store, station, and pilot failures.
pub mod error;
/// Concrete store and station implementations (in-memory, mock).
pub mod hal;
/// Layout domain model: blocks, routes, locomotives, sensors.
pub mod layout;
/// Sensor claim routing and ghost detection.
pub mod sensors;
/// Persistence, command-station, and listener abstractions.
pub mod traits;

// Re-exports for convenience
pub use autopilot::AutoPilot;
pub use commands::{ActionCommand, ActionCommandHandler};
pub use config::{DriveConfig, PilotConfig, TimingConfig};
pub use dispatcher::{DispatcherState, TrainDispatcher};
pub use error::{PilotError, StationError, StoreError};
pub use layout::{
    Block, BlockState, Direction, ElementSetting, Locomotive, Route, RouteElement, Sensor,
    SensorEvent,
};
pub use sensors::{RouteOutcome, SensorEventRouter};
pub use traits::{
    CommandStation, LayoutEvent, LayoutEventListener, LayoutStore, SensorCallback,
    StateEventListener, StatusListener,
};
