//! Shared types used by every liveworld crate.
//!
//! # Invariants
//! - Ids are plain integers; nothing outside the kernel holds references into world data.
//! - Positions are integer tile coordinates so hashing and replay are bit-exact.

mod types;

pub use types::{
    Direction, EntityId, LogicalTime, MapId, ParseDirectionError, Position, Privilege, SessionId,
    ShardId, TileCoord, Version, WorldId,
};
