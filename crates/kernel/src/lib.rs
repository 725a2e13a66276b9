//! World Store: maps, tiles and entities, atomic command application, deterministic replay.
//!
//! # Invariants
//! - World contents change only through [`World::apply`] and [`World::apply_joint`].
//! - A rejected command mutates nothing.
//! - Every entity on a map reports that map as its location; held items share their holder's map.
//! - Entity, tile and map versions only grow.
//! - Applying the same command sequence to equal worlds yields equal canonical bytes.

pub mod command;
pub mod delta;
pub mod entity;
pub mod error;
pub mod map;
pub mod replica;
mod txn;
pub mod world;

pub use command::{ActionOp, Command, CommandKind, EditOp, Origin, Scope, ScriptOp, Stamp};
pub use delta::{Audience, ChatChannel, Delivery, Delta, DeltaKind, Removal};
pub use entity::{AttrValue, Entity, EntityKind, PlayerFlags};
pub use error::{ApplyError, InvariantViolation, Target};
pub use map::{
    Collision, EdgeLinks, LAYER_COUNT, Layer, MAX_MAP_SIDE, MapSettings, MapState, MapSummary,
    Retired, Sprite, Terrain, Tile, TileAnimation, TilePatch, Trigger,
};
pub use replica::Replica;
pub use world::{Counters, Rules, World};
