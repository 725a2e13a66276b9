use std::collections::BTreeMap;

use liveworld_common::{Direction, EntityId, MapId, Position, SessionId, Version};
use serde::{Deserialize, Serialize};

/// Value stored in an entity's attribute bag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttrValue {
    Int(i64),
    Bool(bool),
    Text(String),
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlayerFlags {
    /// Editor mode: collision and triggers are ignored for this avatar.
    pub in_editor: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKind {
    Player {
        name: String,
        session: SessionId,
        flags: PlayerFlags,
    },
    Npc {
        name: String,
        behavior: String,
    },
    Item {
        kind: String,
        quantity: u32,
        /// Entity carrying this item. A held item is always on its holder's map.
        holder: Option<EntityId>,
    },
}

/// An entity record. Owned exclusively by the map it is located on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub map: MapId,
    pub position: Position,
    pub facing: Direction,
    pub version: Version,
    pub kind: EntityKind,
    pub attributes: BTreeMap<String, AttrValue>,
}

impl Entity {
    pub(crate) fn new(id: EntityId, map: MapId, position: Position, kind: EntityKind) -> Self {
        Self {
            id,
            map,
            position,
            facing: Direction::South,
            version: Version(1),
            kind,
            attributes: BTreeMap::new(),
        }
    }

    /// Record a mutation.
    pub(crate) fn bump(&mut self) {
        self.version = self.version.next();
    }

    pub fn is_player(&self) -> bool {
        matches!(self.kind, EntityKind::Player { .. })
    }

    pub fn is_item(&self) -> bool {
        matches!(self.kind, EntityKind::Item { .. })
    }

    /// Display name for players and NPCs, item kind for items.
    pub fn name(&self) -> &str {
        match &self.kind {
            EntityKind::Player { name, .. } | EntityKind::Npc { name, .. } => name,
            EntityKind::Item { kind, .. } => kind,
        }
    }

    pub fn session(&self) -> Option<SessionId> {
        match self.kind {
            EntityKind::Player { session, .. } => Some(session),
            _ => None,
        }
    }

    pub fn flags(&self) -> PlayerFlags {
        match self.kind {
            EntityKind::Player { flags, .. } => flags,
            _ => PlayerFlags::default(),
        }
    }

    pub fn in_editor(&self) -> bool {
        self.flags().in_editor
    }

    pub fn holder(&self) -> Option<EntityId> {
        match self.kind {
            EntityKind::Item { holder, .. } => holder,
            _ => None,
        }
    }

    pub(crate) fn set_holder(&mut self, new_holder: Option<EntityId>) {
        if let EntityKind::Item { holder, .. } = &mut self.kind {
            *holder = new_holder;
        }
    }

    pub(crate) fn set_flags(&mut self, new_flags: PlayerFlags) {
        if let EntityKind::Player { flags, .. } = &mut self.kind {
            *flags = new_flags;
        }
    }
}
