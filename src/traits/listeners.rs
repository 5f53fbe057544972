//! Listener traits: the autopilot's only outward-facing signals.
//!
//! All notifications are fire-and-forget; no acknowledgement is awaited and
//! a slow listener must not stall the automation. Implementations are
//! invoked from autopilot or dispatcher threads, so they must be `Send +
//! Sync` and should return quickly.

/// Observes the autopilot's running state.
pub trait StatusListener: Send + Sync {
    /// Called after start completes and after the stop wind-down finishes.
    ///
    /// `running = false` is only delivered once the reset sweep has run, so
    /// observers see "stopped" and "layout reset" as one event.
    fn status_changed(&self, running: bool);
}

/// Observes per-dispatcher state transitions.
pub trait StateEventListener: Send + Sync {
    /// Called on every dispatcher state change with the locomotive name and
    /// the new state's name. The only externally observable per-train
    /// progress signal.
    fn on_state_change(&self, loco_name: &str, state_name: &str);
}

/// A change the presentation layer should reflect.
///
/// Replaces type-inspection of dispatcher internals with an explicit
/// signal: the UI learns *what* to redraw, never *why*.
#[derive(Clone, Debug, PartialEq)]
pub enum LayoutEvent {
    /// A route was locked for a train; highlight its tiles.
    RouteSelected {
        /// Id of the locked route.
        route_id: String,
    },
    /// A route lock was cleared; drop its highlighting.
    RouteReleased {
        /// Id of the released route.
        route_id: String,
    },
    /// A block row changed state; refresh its tile.
    BlockChanged {
        /// Id of the changed block.
        block_id: String,
    },
}

/// Receives [`LayoutEvent`]s for the presentation layer.
pub trait LayoutEventListener: Send + Sync {
    /// Called for every layout change worth redrawing.
    fn layout_changed(&self, event: &LayoutEvent);
}
