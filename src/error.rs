//! Error types for the autopilot and its collaborator seams.
//!
//! The store and command station get their own small error enums so mock
//! and real backends share a concrete contract; [`PilotError`] wraps both
//! for the orchestration layer. Ghost events and missing routes are *not*
//! errors; they are normal outcomes with their own handling paths.

/// Persistence failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The referenced row does not exist.
    #[error("unknown {kind} '{id}'")]
    NotFound {
        /// Row kind, e.g. `"route"` or `"block"`.
        kind: &'static str,
        /// Row id.
        id: String,
    },
    /// The backing engine rejected the operation.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Command-station failure.
#[derive(Debug, thiserror::Error)]
pub enum StationError {
    /// The station link is down or unresponsive.
    #[error("command station offline")]
    Offline,
    /// The station rejected the request.
    #[error("command station rejected request: {0}")]
    Rejected(String),
}

/// Top-level error for autopilot operations.
#[derive(Debug, thiserror::Error)]
pub enum PilotError {
    /// A persistence call failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A command-station call failed.
    #[error(transparent)]
    Station(#[from] StationError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display() {
        let err = StoreError::NotFound {
            kind: "route",
            id: "rt-9".to_string(),
        };
        assert_eq!(err.to_string(), "unknown route 'rt-9'");
    }

    #[test]
    fn pilot_error_wraps_station() {
        let err: PilotError = StationError::Offline.into();
        assert_eq!(err.to_string(), "command station offline");
    }
}
