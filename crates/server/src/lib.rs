//! Engine assembly: wires the command pipeline, interest manager, broadcaster,
//! script bridge and persistence into one running world.
//!
//! Shard workers hand applied batches to a single dispatcher thread, which
//! owns interest and the broadcaster, so per-shard order holds all the way to
//! each session's stream.

pub mod config;
pub mod directory;
mod dispatch;
pub mod engine;
pub mod error;
mod hooks;
mod session;

pub use config::{ConfigError, EngineConfig};
pub use directory::{SessionDirectory, SessionProfile, StaticDirectory};
pub use dispatch::WatchTarget;
pub use engine::{Engine, EngineIo};
pub use error::EngineError;
pub use session::SessionEntry;
