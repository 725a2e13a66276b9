//! Command Pipeline: stamps commands, orders them per shard, routes them and
//! applies them on a pool of worker threads.
//!
//! # Invariants
//! - Commands touching the same shard apply in stamp order: logical time, then session, then arrival.
//!   This holds for commands spanning several shards too: they wait for earlier stamps on each of them.
//! - Disjoint shards are processed independently and concurrently.
//! - A command spanning several shards locks them in ascending `ShardId` order and applies atomically.
//! - A command is validated and admitted once, however often it is re-routed.
//! - A command that panics is rejected; its worker carries on.
//! - Every failed command yields exactly one rejection for the issuing session.

pub mod clock;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod routing;
pub mod sequencer;
pub mod shard;
pub mod validate;

pub use clock::Stamper;
pub use error::PipelineError;
pub use pipeline::{Applied, Capture, Pipeline, PipelineConfig, PipelineHooks};
pub use queue::{ShardQueue, Stamped};
pub use routing::{EntityDirectory, ShardMap};
pub use sequencer::Sequencer;
pub use shard::{Shard, ShardSet};
pub use validate::{Limits, validate};
