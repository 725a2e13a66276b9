//! Developer tooling: read-only inspection of captured worlds and map views.
//!
//! # Invariants
//! - Inspection never mutates the world it is given.

mod inspector;

pub use inspector::{EntityInfo, MapInfo, WorldInspector, WorldSummary};
