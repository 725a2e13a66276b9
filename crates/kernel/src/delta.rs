use std::sync::Arc;

use liveworld_common::{Direction, EntityId, MapId, Position, SessionId, TileCoord, Version};
use serde::{Deserialize, Serialize};

use crate::command::Stamp;
use crate::entity::{AttrValue, Entity, PlayerFlags};
use crate::error::ApplyError;
use crate::map::{MapSettings, MapState, MapSummary, Tile};

/// Why an entity left a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Removal {
    Despawned,
    Departed { to: MapId },
    MapRemoved,
}

/// Where a chat line is heard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ChatChannel {
    /// Everyone on the speaker's map.
    #[default]
    Map,
    /// Every connected player.
    World,
    /// Notices from the engine itself, such as players joining.
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaKind {
    MapCreated {
        summary: MapSummary,
    },
    MapRemoved,
    MapSettingsChanged {
        settings: MapSettings,
        version: Version,
    },
    /// Grid, size and settings swapped in one edit. Entities are carried over.
    MapReplaced {
        state: Arc<MapState>,
    },
    TileChanged {
        at: TileCoord,
        tile: Tile,
    },
    /// Spawned, entered, or arrived from another map.
    EntityCreated {
        entity: Entity,
    },
    EntityRemoved {
        id: EntityId,
        version: Version,
        reason: Removal,
    },
    EntityMoved {
        id: EntityId,
        position: Position,
        facing: Direction,
        version: Version,
    },
    AttributeChanged {
        id: EntityId,
        key: String,
        value: Option<AttrValue>,
        version: Version,
    },
    ItemHeld {
        item: EntityId,
        holder: Option<EntityId>,
        position: Position,
        version: Version,
    },
    FlagsChanged {
        id: EntityId,
        flags: PlayerFlags,
        version: Version,
    },
    TriggerFired {
        entity: EntityId,
        tag: String,
    },
    Chat {
        from: Option<EntityId>,
        text: String,
        #[serde(default)]
        channel: ChatChannel,
    },
    /// Every map in the world, sent to an editor opening the editor.
    MapList {
        maps: Vec<MapSummary>,
    },
    /// Error reply to the issuing session.
    Rejected {
        error: ApplyError,
    },
    /// Full state of a map the session just started observing.
    Resync {
        state: Arc<MapState>,
    },
    /// The session no longer observes this map.
    Unsubscribed,
}

impl DeltaKind {
    /// Entity whose record this delta changes, if any.
    pub fn entity(&self) -> Option<EntityId> {
        match self {
            Self::EntityCreated { entity } => Some(entity.id),
            Self::EntityRemoved { id, .. }
            | Self::EntityMoved { id, .. }
            | Self::AttributeChanged { id, .. }
            | Self::FlagsChanged { id, .. } => Some(*id),
            Self::ItemHeld { item, .. } => Some(*item),
            Self::TriggerFired { entity, .. } => Some(*entity),
            _ => None,
        }
    }
}

/// Delivery guarantee of a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Delivery {
    /// Best effort; may be dropped on send failure.
    Cosmetic,
    /// At least once; the client de-duplicates by version.
    State,
}

/// Who a delta is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Audience {
    /// Every session observing the scope.
    Scope,
    /// Only the given session.
    Session(SessionId),
    /// Every connected session, wherever it is.
    World,
}

/// Minimal description of one state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub scope: MapId,
    /// Map revision after the command that produced this delta.
    pub revision: u64,
    /// Global commit sequence of that command; zero for synthetic deltas.
    pub commit: u64,
    pub cause: Stamp,
    pub audience: Audience,
    pub kind: DeltaKind,
}

impl Delta {
    pub(crate) fn scoped(scope: MapId, cause: Stamp, kind: DeltaKind) -> Self {
        Self {
            scope,
            revision: 0,
            commit: 0,
            cause,
            audience: Audience::Scope,
            kind,
        }
    }

    /// Error delta for the session that issued the failed command.
    pub fn rejection(scope: MapId, cause: Stamp, error: ApplyError) -> Self {
        Self {
            scope,
            revision: 0,
            commit: 0,
            cause,
            audience: Audience::Session(cause.session),
            kind: DeltaKind::Rejected { error },
        }
    }

    /// Full-state delta for a session entering a scope.
    pub fn resync(session: SessionId, state: Arc<MapState>) -> Self {
        Self {
            scope: state.id,
            revision: state.revision,
            commit: 0,
            cause: Stamp::default(),
            audience: Audience::Session(session),
            kind: DeltaKind::Resync { state },
        }
    }

    /// List of every map for one session.
    pub fn map_list(session: SessionId, scope: MapId, maps: Vec<MapSummary>) -> Self {
        Self {
            scope,
            revision: 0,
            commit: 0,
            cause: Stamp::default(),
            audience: Audience::Session(session),
            kind: DeltaKind::MapList { maps },
        }
    }

    pub fn unsubscribed(session: SessionId, scope: MapId) -> Self {
        Self {
            scope,
            revision: 0,
            commit: 0,
            cause: Stamp::default(),
            audience: Audience::Session(session),
            kind: DeltaKind::Unsubscribed,
        }
    }

    pub fn delivery(&self) -> Delivery {
        match self.kind {
            DeltaKind::Chat { .. } | DeltaKind::TriggerFired { .. } => Delivery::Cosmetic,
            _ => Delivery::State,
        }
    }

    pub fn is_rejection(&self) -> bool {
        matches!(self.kind, DeltaKind::Rejected { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liveworld_common::LogicalTime;

    #[test]
    fn chat_is_cosmetic_and_tile_changes_are_state() {
        let stamp = Stamp::default();
        let chat = Delta::scoped(
            MapId(1),
            stamp,
            DeltaKind::Chat {
                from: None,
                text: "hello".into(),
                channel: ChatChannel::Map,
            },
        );
        assert_eq!(chat.delivery(), Delivery::Cosmetic);

        let tile = Delta::scoped(
            MapId(1),
            stamp,
            DeltaKind::TileChanged {
                at: TileCoord::new(0, 0),
                tile: Tile::default(),
            },
        );
        assert_eq!(tile.delivery(), Delivery::State);
    }

    #[test]
    fn rejection_is_addressed_to_the_issuer() {
        let stamp = Stamp {
            time: LogicalTime(4),
            session: SessionId(12),
            arrival: 1,
        };
        let delta = Delta::rejection(MapId(1), stamp, ApplyError::ScriptFault("boom".into()));
        assert_eq!(delta.audience, Audience::Session(SessionId(12)));
        assert!(delta.is_rejection());
    }
}
