use liveworld_common::{EntityId, MapId, TileCoord, Version};
use serde::{Deserialize, Serialize};

/// What a command pointed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    Map(MapId),
    Entity(EntityId),
    Tile(MapId, TileCoord),
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Map(map) => write!(f, "{map}"),
            Target::Entity(id) => write!(f, "{id}"),
            Target::Tile(map, at) => write!(f, "{map} tile {at}"),
        }
    }
}

/// Why a command was not applied. Carried back to the issuing session in an error delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum ApplyError {
    #[error("invalid target: {0} does not exist")]
    InvalidTarget(Target),
    #[error("privilege denied: {0}")]
    PrivilegeDenied(String),
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("stale precondition: expected {expected}, current {actual}")]
    ConflictStale { expected: Version, actual: Version },
    #[error("script fault: {0}")]
    ScriptFault(String),
}

impl ApplyError {
    pub(crate) fn constraint(msg: impl Into<String>) -> Self {
        Self::ConstraintViolation(msg.into())
    }

    pub(crate) fn denied(msg: impl Into<String>) -> Self {
        Self::PrivilegeDenied(msg.into())
    }

    /// Short machine-readable kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidTarget(_) => "invalid_target",
            Self::PrivilegeDenied(_) => "privilege_denied",
            Self::ConstraintViolation(_) => "constraint_violation",
            Self::ConflictStale { .. } => "conflict_stale",
            Self::ScriptFault(_) => "script_fault",
        }
    }
}

/// A broken shard invariant. Fatal for the shard; reported to the operator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("world invariant violated on {map}: {detail}")]
pub struct InvariantViolation {
    pub map: MapId,
    pub detail: String,
}
