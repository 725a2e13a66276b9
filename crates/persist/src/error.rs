use liveworld_common::WorldId;

/// Errors from snapshot and log persistence.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CBOR serialization error: {0}")]
    Encode(String),
    #[error("CBOR deserialization error: {0}")]
    Decode(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// Fatal at startup: the operator must restore or remove the snapshot.
    #[error("snapshot {key} is corrupt: {reason}")]
    SnapshotCorrupt { key: String, reason: String },
    #[error("{what} schema mismatch: file has v{file_version}, expected v{expected_version}")]
    SchemaMismatch {
        what: &'static str,
        file_version: u32,
        expected_version: u32,
    },
    #[error("snapshot belongs to world {found}, store holds {expected}")]
    WorldMismatch { expected: WorldId, found: WorldId },
    #[error("invalid blob key {0:?}")]
    InvalidKey(String),
    #[error("failed to spawn snapshot writer: {0}")]
    Spawn(String),
    #[error("snapshot writer stopped")]
    WriterStopped,
}
