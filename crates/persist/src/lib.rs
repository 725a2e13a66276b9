//! Persistence/Snapshot Manager: periodic snapshots of the whole world, an
//! append-only command log between them, and recovery on startup.
//!
//! # Invariants
//! - A snapshot is taken at a commit boundary; snapshot commits only grow.
//! - A damaged snapshot is never loaded.
//! - Log replay stops at the first unreadable or failing record, and nothing after it is kept.
//! - Snapshots from another world are refused.

pub mod blob;
mod codec;
pub mod error;
pub mod log;
pub mod snapshot;
pub mod store;
pub mod writer;

pub use blob::{BlobStore, FileBlobStore, MemoryBlobStore};
pub use error::PersistError;
pub use log::{LOG_SCHEMA_VERSION, LogRecord, LogStop};
pub use snapshot::{SNAPSHOT_SCHEMA_VERSION, Snapshot, SnapshotHeader};
pub use store::{
    LogTail, META_KEY, RecoveryReport, SegmentSummary, SnapshotManager, StoreSummary, WorldMeta,
};
pub use writer::{Captured, SnapshotPolicy, SnapshotSource, SnapshotWriter};
