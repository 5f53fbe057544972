//! Autopilot configuration: scheduling cadences and drive parameters.
//!
//! Defaults match the production cadences (100 ms dispatcher tick, 2 s
//! blocked backoff, 1 s lifecycle idle, 10 s command-queue wait). Tests
//! shrink them to keep scenario runs fast without changing any logic.
//!
//! # Example
//!
//! ```rust
//! use railpilot::config::{PilotConfig, TimingConfig};
//!
//! let config = PilotConfig::default()
//!     .with_timing(TimingConfig::default().with_dispatcher_tick_ms(50));
//! assert_eq!(config.timing.dispatcher_tick_ms, 50);
//! ```

use std::time::Duration;

// ============================================================================
// Timing
// ============================================================================

/// Scheduling cadences for all actor loops.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct TimingConfig {
    /// Dispatcher scheduling tick in milliseconds.
    pub dispatcher_tick_ms: u64,
    /// Backoff when a dispatcher state cannot advance, in milliseconds.
    pub blocked_backoff_ms: u64,
    /// AutoPilot lifecycle idle increment in milliseconds.
    pub lifecycle_idle_ms: u64,
    /// Command-queue wait when empty, in milliseconds.
    pub queue_wait_ms: u64,
    /// Dwell time in a block after stopping, in milliseconds.
    pub dwell_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            dispatcher_tick_ms: 100,
            blocked_backoff_ms: 2000,
            lifecycle_idle_ms: 1000,
            queue_wait_ms: 10_000,
            dwell_ms: 3000,
        }
    }
}

impl TimingConfig {
    /// Set the dispatcher tick.
    pub fn with_dispatcher_tick_ms(mut self, ms: u64) -> Self {
        self.dispatcher_tick_ms = ms;
        self
    }

    /// Set the blocked backoff.
    pub fn with_blocked_backoff_ms(mut self, ms: u64) -> Self {
        self.blocked_backoff_ms = ms;
        self
    }

    /// Set the lifecycle idle increment.
    pub fn with_lifecycle_idle_ms(mut self, ms: u64) -> Self {
        self.lifecycle_idle_ms = ms;
        self
    }

    /// Set the command-queue wait.
    pub fn with_queue_wait_ms(mut self, ms: u64) -> Self {
        self.queue_wait_ms = ms;
        self
    }

    /// Set the post-arrival dwell time.
    pub fn with_dwell_ms(mut self, ms: u64) -> Self {
        self.dwell_ms = ms;
        self
    }

    /// Dispatcher tick as a [`Duration`].
    #[inline]
    pub fn dispatcher_tick(&self) -> Duration {
        Duration::from_millis(self.dispatcher_tick_ms)
    }

    /// Blocked backoff as a [`Duration`].
    #[inline]
    pub fn blocked_backoff(&self) -> Duration {
        Duration::from_millis(self.blocked_backoff_ms)
    }

    /// Lifecycle idle increment as a [`Duration`].
    #[inline]
    pub fn lifecycle_idle(&self) -> Duration {
        Duration::from_millis(self.lifecycle_idle_ms)
    }

    /// Command-queue wait as a [`Duration`].
    #[inline]
    pub fn queue_wait(&self) -> Duration {
        Duration::from_millis(self.queue_wait_ms)
    }

    /// Dwell time as a [`Duration`].
    #[inline]
    pub fn dwell(&self) -> Duration {
        Duration::from_millis(self.dwell_ms)
    }

    /// Cadences shrunk for fast test runs.
    pub fn fast() -> Self {
        Self {
            dispatcher_tick_ms: 2,
            blocked_backoff_ms: 5,
            lifecycle_idle_ms: 5,
            queue_wait_ms: 20,
            dwell_ms: 10,
        }
    }
}

// ============================================================================
// Drive parameters
// ============================================================================

/// Velocities commanded during a drive.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct DriveConfig {
    /// Cruising velocity between blocks (0-100).
    pub cruise_velocity: u8,
    /// Velocity after the enter sensor, while braking (0-100).
    pub brake_velocity: u8,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            cruise_velocity: 60,
            brake_velocity: 20,
        }
    }
}

impl DriveConfig {
    /// Set the cruising velocity.
    pub fn with_cruise_velocity(mut self, velocity: u8) -> Self {
        self.cruise_velocity = velocity;
        self
    }

    /// Set the braking velocity.
    pub fn with_brake_velocity(mut self, velocity: u8) -> Self {
        self.brake_velocity = velocity;
        self
    }
}

// ============================================================================
// Main config
// ============================================================================

/// Complete autopilot configuration.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct PilotConfig {
    /// Scheduling cadences.
    pub timing: TimingConfig,
    /// Drive velocities.
    pub drive: DriveConfig,
}

impl PilotConfig {
    /// Set the timing configuration.
    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    /// Set the drive configuration.
    pub fn with_drive(mut self, drive: DriveConfig) -> Self {
        self.drive = drive;
        self
    }

    /// Configuration with cadences shrunk for tests.
    pub fn fast() -> Self {
        Self {
            timing: TimingConfig::fast(),
            drive: DriveConfig::default(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_production_cadences() {
        let timing = TimingConfig::default();
        assert_eq!(timing.dispatcher_tick_ms, 100);
        assert_eq!(timing.blocked_backoff_ms, 2000);
        assert_eq!(timing.lifecycle_idle_ms, 1000);
        assert_eq!(timing.queue_wait_ms, 10_000);
    }

    #[test]
    fn builders_compose() {
        let config = PilotConfig::default()
            .with_timing(TimingConfig::default().with_dwell_ms(500))
            .with_drive(DriveConfig::default().with_cruise_velocity(80));
        assert_eq!(config.timing.dwell_ms, 500);
        assert_eq!(config.drive.cruise_velocity, 80);
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = PilotConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: PilotConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(
            back.timing.dispatcher_tick_ms,
            config.timing.dispatcher_tick_ms
        );
        assert_eq!(back.drive.cruise_velocity, config.drive.cruise_velocity);
    }
}
