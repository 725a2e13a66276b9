use liveworld_common::{
    Direction, EntityId, LogicalTime, MapId, Position, Privilege, SessionId, TileCoord, Version,
};
use serde::{Deserialize, Serialize};

use crate::entity::AttrValue;
use crate::map::{MapSettings, Tile, TilePatch};
use crate::world::Counters;

/// Ordering key of a command: logical time, then session, then arrival sequence.
///
/// The derived `Ord` compares fields in declaration order, which is exactly
/// the total order commands are applied in within a scope.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Stamp {
    pub time: LogicalTime,
    pub session: SessionId,
    pub arrival: u64,
}

/// Who issued a command, as established by the session directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub session: SessionId,
    pub privilege: Privilege,
    pub avatar: Option<EntityId>,
}

impl Origin {
    pub fn player(session: SessionId, avatar: EntityId) -> Self {
        Self {
            session,
            privilege: Privilege::Player,
            avatar: Some(avatar),
        }
    }

    pub fn editor(session: SessionId, avatar: Option<EntityId>) -> Self {
        Self {
            session,
            privilege: Privilege::Editor,
            avatar,
        }
    }

    /// Origin of engine- and script-issued commands.
    pub fn system() -> Self {
        Self {
            session: SessionId::SYSTEM,
            privilege: Privilege::Editor,
            avatar: None,
        }
    }
}

/// Routing target of a command. Decides which shard sequences it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    Map(MapId),
    Entity(EntityId),
}

/// Map, tile and spawn edits. Editor privilege required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditOp {
    CreateMap {
        map: MapId,
        width: u32,
        height: u32,
        settings: MapSettings,
    },
    RemoveMap {
        map: MapId,
    },
    SetMapSettings {
        map: MapId,
        settings: MapSettings,
    },
    SetTile {
        map: MapId,
        at: TileCoord,
        patch: TilePatch,
    },
    SpawnNpc {
        map: MapId,
        /// Filled in from the id allocator when the command is enqueued.
        id: Option<EntityId>,
        position: Position,
        name: String,
        behavior: String,
    },
    SpawnItem {
        map: MapId,
        id: Option<EntityId>,
        position: Position,
        kind: String,
        quantity: u32,
    },
    Despawn {
        entity: EntityId,
    },
    SetAttribute {
        entity: EntityId,
        key: String,
        value: Option<AttrValue>,
    },
    Teleport {
        entity: EntityId,
        map: MapId,
        position: Position,
    },
    /// Swap a map's size, settings and whole grid at once. `tiles` is
    /// row-major, `width * height` long. Entities stay where they are.
    ReplaceMap {
        map: MapId,
        width: u32,
        height: u32,
        settings: MapSettings,
        tiles: Vec<Tile>,
    },
}

impl EditOp {
    pub fn scope(&self) -> Scope {
        match self {
            Self::CreateMap { map, .. }
            | Self::RemoveMap { map }
            | Self::SetMapSettings { map, .. }
            | Self::SetTile { map, .. }
            | Self::SpawnNpc { map, .. }
            | Self::SpawnItem { map, .. }
            | Self::ReplaceMap { map, .. } => Scope::Map(*map),
            Self::Despawn { entity }
            | Self::SetAttribute { entity, .. }
            | Self::Teleport { entity, .. } => Scope::Entity(*entity),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateMap { .. } => "create_map",
            Self::RemoveMap { .. } => "remove_map",
            Self::SetMapSettings { .. } => "set_map_settings",
            Self::SetTile { .. } => "set_tile",
            Self::SpawnNpc { .. } => "spawn_npc",
            Self::SpawnItem { .. } => "spawn_item",
            Self::Despawn { .. } => "despawn",
            Self::SetAttribute { .. } => "set_attribute",
            Self::Teleport { .. } => "teleport",
            Self::ReplaceMap { .. } => "replace_map",
        }
    }
}

/// Gameplay actions performed by the issuing session's avatar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionOp {
    /// Creates the avatar. Issued by the engine when a session connects.
    Enter {
        name: String,
        map: MapId,
        position: Position,
    },
    /// Removes the avatar, dropping whatever it carries.
    Leave,
    Move {
        to: Position,
        facing: Direction,
    },
    Say {
        text: String,
    },
    /// Chat heard by every connected player.
    Shout {
        text: String,
    },
    PickUp {
        item: EntityId,
    },
    Drop {
        item: EntityId,
    },
    Give {
        item: EntityId,
        to: EntityId,
    },
    /// Editor-only.
    Warp {
        map: MapId,
        position: Option<Position>,
    },
    /// Editor-only.
    SetEditorMode {
        open: bool,
    },
}

impl ActionOp {
    pub fn requires_editor(&self) -> bool {
        matches!(self, Self::Warp { .. } | Self::SetEditorMode { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Enter { .. } => "enter",
            Self::Leave => "leave",
            Self::Move { .. } => "move",
            Self::Say { .. } => "say",
            Self::Shout { .. } => "shout",
            Self::PickUp { .. } => "pick_up",
            Self::Drop { .. } => "drop",
            Self::Give { .. } => "give",
            Self::Warp { .. } => "warp",
            Self::SetEditorMode { .. } => "set_editor_mode",
        }
    }
}

/// Commands injected by the scripting bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptOp {
    Announce { map: MapId, text: String },
    Edit(EditOp),
}

impl ScriptOp {
    pub fn scope(&self) -> Scope {
        match self {
            Self::Announce { map, .. } => Scope::Map(*map),
            Self::Edit(op) => op.scope(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    Edit(EditOp),
    Action(ActionOp),
    Script(ScriptOp),
}

/// An intent to mutate the world.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub origin: Origin,
    pub stamp: Stamp,
    /// Optimistic-concurrency precondition on the command's target.
    pub expect: Option<Version>,
    pub kind: CommandKind,
}

impl Command {
    pub fn new(origin: Origin, kind: CommandKind) -> Self {
        Self {
            origin,
            stamp: Stamp {
                session: origin.session,
                ..Stamp::default()
            },
            expect: None,
            kind,
        }
    }

    pub fn edit(origin: Origin, op: EditOp) -> Self {
        Self::new(origin, CommandKind::Edit(op))
    }

    pub fn action(origin: Origin, op: ActionOp) -> Self {
        Self::new(origin, CommandKind::Action(op))
    }

    pub fn script(op: ScriptOp) -> Self {
        Self::new(Origin::system(), CommandKind::Script(op))
    }

    #[must_use]
    pub fn expecting(mut self, version: Version) -> Self {
        self.expect = Some(version);
        self
    }

    #[must_use]
    pub fn stamped(mut self, stamp: Stamp) -> Self {
        self.stamp = stamp;
        self
    }

    /// Routing scope. Actions are scoped to the avatar; `Enter` to the map it enters.
    pub fn scope(&self) -> Option<Scope> {
        match &self.kind {
            CommandKind::Edit(op) => Some(op.scope()),
            CommandKind::Script(op) => Some(op.scope()),
            CommandKind::Action(ActionOp::Enter { map, .. }) => Some(Scope::Map(*map)),
            CommandKind::Action(_) => self.origin.avatar.map(Scope::Entity),
        }
    }

    pub fn name(&self) -> &'static str {
        match &self.kind {
            CommandKind::Edit(op) | CommandKind::Script(ScriptOp::Edit(op)) => op.name(),
            CommandKind::Action(op) => op.name(),
            CommandKind::Script(ScriptOp::Announce { .. }) => "announce",
        }
    }

    /// Fill unassigned spawn ids from the allocator. Done once, at enqueue time,
    /// so that replaying the logged command reproduces the same ids.
    pub fn assign_ids(&mut self, counters: &Counters) {
        let op = match &mut self.kind {
            CommandKind::Edit(op) | CommandKind::Script(ScriptOp::Edit(op)) => op,
            _ => return,
        };
        match op {
            EditOp::SpawnNpc { id, .. } | EditOp::SpawnItem { id, .. } if id.is_none() => {
                *id = Some(counters.allocate_entity());
            }
            _ => {}
        }
    }
}
