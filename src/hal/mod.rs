//! Concrete backends for the collaborator seams.
//!
//! Desktop development and the test suite run against [`MemoryStore`] and
//! [`MockStation`]; a production build wires in a real persistence engine
//! and command-station link instead.

pub mod mock;

pub use mock::{MemoryStore, MockStation};
