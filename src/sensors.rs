//! Sensor event routing and ghost detection.
//!
//! Before a dispatcher enters a state that depends on a forthcoming sensor
//! transition, it registers a claim for that sensor id here. A real
//! transition is delivered to exactly one claimant if one exists (never
//! broadcast), and an unclaimed firing is reported as a ghost so the
//! autopilot can fail safe. The single rule "claimed → routed, unclaimed →
//! fail-safe" is the whole safety model.
//!
//! # Claim layering
//!
//! A *preferred* claim can be layered over a *default* claim for the same
//! id. This supports different dispatch phases caring about the same
//! physical sensor at different times: on short blocks the braking phase
//! claims the same contact the drive phase already registered for.
//! [`reset`](SensorEventRouter::reset) clears preferred claims back to the
//! defaults.
//!
//! Claims are one-shot: delivery consumes the claim that was used.

use std::collections::HashMap;
use std::sync::mpsc::Sender;
use std::sync::Mutex;

use tracing::{debug, trace};

use crate::layout::SensorEvent;

/// What happened to a routed event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Delivered to exactly one claimant; the claim was consumed.
    Delivered,
    /// No live claimant; the caller must run the ghost response.
    Ghost,
}

#[derive(Default)]
struct ClaimSlot {
    default: Option<Sender<SensorEvent>>,
    preferred: Option<Sender<SensorEvent>>,
}

impl ClaimSlot {
    fn is_empty(&self) -> bool {
        self.default.is_none() && self.preferred.is_none()
    }
}

/// Maps sensor ids to at most one active claimant each.
#[derive(Default)]
pub struct SensorEventRouter {
    claims: Mutex<HashMap<String, ClaimSlot>>,
}

impl SensorEventRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a sensor id known without claiming it.
    ///
    /// The autopilot seeds the router with every persisted sensor at start;
    /// seeding does not change routing (an unclaimed known sensor is still
    /// a ghost), it only keeps the claim table aligned with the layout.
    pub fn seed(&self, sensor_id: impl Into<String>) {
        self.claims
            .lock()
            .unwrap()
            .entry(sensor_id.into())
            .or_default();
    }

    /// Register the default claimant for a sensor id.
    ///
    /// Replaces any existing default claim for that id.
    pub fn register_default(&self, sensor_id: impl Into<String>, claimant: Sender<SensorEvent>) {
        let mut claims = self.claims.lock().unwrap();
        claims.entry(sensor_id.into()).or_default().default = Some(claimant);
    }

    /// Layer a preferred claimant over the default for a sensor id.
    ///
    /// While present, the preferred claimant receives the next event for
    /// this id instead of the default.
    pub fn register_preferred(&self, sensor_id: impl Into<String>, claimant: Sender<SensorEvent>) {
        let mut claims = self.claims.lock().unwrap();
        claims.entry(sensor_id.into()).or_default().preferred = Some(claimant);
    }

    /// Deliver an event to its single claimant, consuming the claim.
    ///
    /// Preferred claims win over defaults. A claimant whose receiving end
    /// has been dropped counts as absent: the event is treated as unclaimed
    /// rather than silently lost.
    #[must_use]
    pub fn route(&self, event: &SensorEvent) -> RouteOutcome {
        let claimant = {
            let mut claims = self.claims.lock().unwrap();
            match claims.get_mut(&event.id) {
                Some(slot) => slot.preferred.take().or_else(|| slot.default.take()),
                None => None,
            }
        };

        match claimant {
            Some(sender) => {
                if sender.send(event.clone()).is_ok() {
                    debug!(sensor = %event.id, active = event.active, "sensor event delivered");
                    RouteOutcome::Delivered
                } else {
                    // Claimant gone; fail safe instead of dropping the event.
                    trace!(sensor = %event.id, "claimant receiver dropped");
                    RouteOutcome::Ghost
                }
            }
            None => RouteOutcome::Ghost,
        }
    }

    /// Clear all preferred claims, keeping defaults.
    pub fn reset(&self) {
        let mut claims = self.claims.lock().unwrap();
        for slot in claims.values_mut() {
            slot.preferred = None;
        }
    }

    /// Drop every claim and every seeded id.
    pub fn clear(&self) {
        self.claims.lock().unwrap().clear();
    }

    /// True if the sensor id currently has a claimant.
    pub fn is_claimed(&self, sensor_id: &str) -> bool {
        self.claims
            .lock()
            .unwrap()
            .get(sensor_id)
            .map(|slot| !slot.is_empty())
            .unwrap_or(false)
    }

    /// Number of known sensor ids (seeded or claimed).
    pub fn known_sensors(&self) -> usize {
        self.claims.lock().unwrap().len()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn event(id: &str) -> SensorEvent {
        SensorEvent::changed(id, true)
    }

    // === Routing ===
    #[test]
    fn unclaimed_sensor_is_ghost() {
        let router = SensorEventRouter::new();
        assert_eq!(router.route(&event("se-5")), RouteOutcome::Ghost);
    }

    #[test]
    fn seeded_but_unclaimed_is_still_ghost() {
        let router = SensorEventRouter::new();
        router.seed("se-5");
        assert_eq!(router.known_sensors(), 1);
        assert_eq!(router.route(&event("se-5")), RouteOutcome::Ghost);
    }

    #[test]
    fn default_claim_receives_event() {
        let router = SensorEventRouter::new();
        let (tx, rx) = mpsc::channel();
        router.register_default("se-1", tx);

        assert_eq!(router.route(&event("se-1")), RouteOutcome::Delivered);
        assert_eq!(rx.try_recv().unwrap().id, "se-1");
    }

    #[test]
    fn delivery_consumes_the_claim() {
        let router = SensorEventRouter::new();
        let (tx, _rx) = mpsc::channel();
        router.register_default("se-1", tx);

        assert_eq!(router.route(&event("se-1")), RouteOutcome::Delivered);
        assert!(!router.is_claimed("se-1"));
        assert_eq!(router.route(&event("se-1")), RouteOutcome::Ghost);
    }

    #[test]
    fn dropped_receiver_counts_as_ghost() {
        let router = SensorEventRouter::new();
        let (tx, rx) = mpsc::channel();
        router.register_default("se-1", tx);
        drop(rx);

        assert_eq!(router.route(&event("se-1")), RouteOutcome::Ghost);
    }

    // === Layering ===
    #[test]
    fn preferred_wins_over_default() {
        let router = SensorEventRouter::new();
        let (default_tx, default_rx) = mpsc::channel();
        let (preferred_tx, preferred_rx) = mpsc::channel();
        router.register_default("se-1", default_tx);
        router.register_preferred("se-1", preferred_tx);

        assert_eq!(router.route(&event("se-1")), RouteOutcome::Delivered);
        assert!(preferred_rx.try_recv().is_ok());
        assert!(default_rx.try_recv().is_err());

        // Default is still in place for the next event.
        assert_eq!(router.route(&event("se-1")), RouteOutcome::Delivered);
        assert!(default_rx.try_recv().is_ok());
    }

    #[test]
    fn reset_clears_preferred_keeps_default() {
        let router = SensorEventRouter::new();
        let (default_tx, default_rx) = mpsc::channel();
        let (preferred_tx, preferred_rx) = mpsc::channel();
        router.register_default("se-1", default_tx);
        router.register_preferred("se-1", preferred_tx);

        router.reset();

        assert_eq!(router.route(&event("se-1")), RouteOutcome::Delivered);
        assert!(default_rx.try_recv().is_ok());
        assert!(preferred_rx.try_recv().is_err());
    }

    #[test]
    fn clear_drops_everything() {
        let router = SensorEventRouter::new();
        let (tx, _rx) = mpsc::channel();
        router.register_default("se-1", tx);
        router.seed("se-2");

        router.clear();

        assert_eq!(router.known_sensors(), 0);
        assert_eq!(router.route(&event("se-1")), RouteOutcome::Ghost);
    }

    #[test]
    fn events_never_broadcast() {
        let router = SensorEventRouter::new();
        let (tx1, rx1) = mpsc::channel();
        router.register_default("se-1", tx1);
        let (tx2, rx2) = mpsc::channel();
        // Second default replaces the first; only one claimant per id.
        router.register_default("se-1", tx2);

        assert_eq!(router.route(&event("se-1")), RouteOutcome::Delivered);
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }
}
