//! Persistence contract for layout rows.
//!
//! The store is more than a database: its route lock update is the single
//! mutual-exclusion primitive in the whole system. Dispatchers racing for
//! the same route are serialized *only* by [`LayoutStore::lock_route`];
//! no dispatcher-side locking exists.

use crate::error::StoreError;
use crate::layout::{Block, Locomotive, Route, Sensor};

/// Read/write contract against the layout database.
///
/// Implementations must be shareable across the autopilot's actor threads.
///
/// # Atomicity contract
///
/// [`lock_route`](Self::lock_route) must be an atomic compare-and-swap on
/// the route's `locked` flag: among any number of concurrent callers for
/// the same unlocked route, exactly one may observe `true`. Everything else
/// is plain reads and idempotent upserts with no ordering guarantees.
pub trait LayoutStore: Send + Sync {
    /// All persisted blocks.
    fn blocks(&self) -> Result<Vec<Block>, StoreError>;

    /// All persisted routes.
    fn routes(&self) -> Result<Vec<Route>, StoreError>;

    /// All persisted sensors.
    fn sensors(&self) -> Result<Vec<Sensor>, StoreError>;

    /// Look up a locomotive by id.
    fn locomotive(&self, id: &str) -> Result<Option<Locomotive>, StoreError>;

    /// Idempotent upsert of a block row.
    fn persist_block(&self, block: &Block) -> Result<(), StoreError>;

    /// Idempotent upsert of a route row.
    fn persist_route(&self, route: &Route) -> Result<(), StoreError>;

    /// Atomically flip the route's `locked` flag from `false` to `true`,
    /// recording `owner` as the holder.
    ///
    /// Returns `Ok(true)` if this caller won the lock, `Ok(false)` if the
    /// route was already locked. This is the compare-and-swap the whole
    /// scheduling model leans on; see the trait-level contract.
    fn lock_route(&self, route_id: &str, owner: &str) -> Result<bool, StoreError>;

    /// Clear the route's `locked` flag and owner unconditionally.
    ///
    /// Idempotent: unlocking an unlocked route succeeds.
    fn unlock_route(&self, route_id: &str) -> Result<(), StoreError>;

    /// Look up a single block by id.
    ///
    /// Default implementation scans [`blocks`](Self::blocks); backends with
    /// keyed access should override.
    fn block(&self, id: &str) -> Result<Option<Block>, StoreError> {
        Ok(self.blocks()?.into_iter().find(|b| b.id == id))
    }

    /// Look up a single route by id.
    fn route(&self, id: &str) -> Result<Option<Route>, StoreError> {
        Ok(self.routes()?.into_iter().find(|r| r.id == id))
    }
}
