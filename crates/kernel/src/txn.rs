//! Command application in two phases.
//!
//! `plan` reads the participating worlds and either rejects the command or
//! produces a list of steps. `commit` applies the steps; it cannot fail, so a
//! rejected command leaves every world untouched.

use std::borrow::Cow;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use glam::IVec2;
use liveworld_common::{Direction, EntityId, MapId, Position, TileCoord, Version};

use crate::command::{ActionOp, Command, CommandKind, EditOp, Scope, ScriptOp, Stamp};
use crate::delta::{Audience, ChatChannel, Delta, DeltaKind, Removal};
use crate::entity::{AttrValue, Entity, EntityKind, PlayerFlags};
use crate::error::{ApplyError, Target};
use crate::map::{MAX_MAP_SIDE, MapSettings, MapState, MapSummary, Retired, TilePatch, Trigger};
use crate::world::{Rules, World};

/// One planned mutation.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    CreateMap(MapState),
    RemoveMap(MapId),
    /// Swaps in a whole new state for an existing map.
    Replace(MapState),
    Settings {
        map: MapId,
        settings: MapSettings,
    },
    Tile {
        map: MapId,
        at: TileCoord,
        patch: TilePatch,
    },
    Insert(Entity),
    /// Removes an entity, dropping whatever it carries at its position.
    Remove {
        map: MapId,
        id: EntityId,
    },
    Move {
        map: MapId,
        id: EntityId,
        position: Position,
        facing: Direction,
    },
    Attribute {
        map: MapId,
        id: EntityId,
        key: String,
        value: Option<AttrValue>,
    },
    Hold {
        map: MapId,
        item: EntityId,
        holder: Option<EntityId>,
        position: Position,
    },
    Flags {
        map: MapId,
        id: EntityId,
        flags: PlayerFlags,
    },
    /// Moves an entity, and everything it carries, to another map.
    Transfer {
        id: EntityId,
        from: MapId,
        to: MapId,
        position: Position,
        facing: Option<Direction>,
        holder: Option<Option<EntityId>>,
    },
    Emit {
        map: MapId,
        kind: DeltaKind,
        audience: Audience,
    },
}

/// Read-only view across the worlds taking part in a command.
pub(crate) struct Scene<'a> {
    parts: Vec<&'a World>,
}

impl<'a> Scene<'a> {
    pub(crate) fn new(parts: &'a [&'a mut World]) -> Self {
        Self {
            parts: parts.iter().map(|w| &**w).collect(),
        }
    }

    pub(crate) fn single(world: &'a World) -> Self {
        Self { parts: vec![world] }
    }

    pub(crate) fn map(&self, id: MapId) -> Option<&'a MapState> {
        self.parts.iter().find_map(|w| w.map(id))
    }

    pub(crate) fn entity(&self, id: EntityId) -> Option<&'a Entity> {
        self.parts.iter().find_map(|w| w.entity(id))
    }

    pub(crate) fn retired(&self, id: MapId) -> Option<&'a Retired> {
        self.parts.iter().find_map(|w| w.retired.get(&id))
    }
}

/// A new map under `id`, starting above any map that held the id before.
fn fresh_map(scene: &Scene<'_>, id: MapId, width: u32, height: u32, settings: MapSettings) -> MapState {
    let map = MapState::new(id, width, height, settings);
    match scene.retired(id) {
        Some(retired) => map.reissued(retired),
        None => map,
    }
}

fn check_size(width: u32, height: u32) -> Result<(), ApplyError> {
    let valid = 1..=MAX_MAP_SIDE;
    if !valid.contains(&width) || !valid.contains(&height) {
        return Err(ApplyError::constraint(format!(
            "map size {width}x{height} outside 1..={MAX_MAP_SIDE}"
        )));
    }
    Ok(())
}

fn check_chat(rules: &Rules, text: &str) -> Result<(), ApplyError> {
    if text.trim().is_empty() {
        return Err(ApplyError::constraint("chat line is empty"));
    }
    let len = text.chars().count();
    if len > rules.max_chat_len {
        return Err(ApplyError::constraint(format!(
            "chat line of {len} characters exceeds {}",
            rules.max_chat_len
        )));
    }
    Ok(())
}

/// Engine notice to every connected session.
fn notice(map: MapId, about: EntityId, text: String) -> Step {
    Step::Emit {
        map,
        kind: DeltaKind::Chat {
            from: Some(about),
            text,
            channel: ChatChannel::Server,
        },
        audience: Audience::World,
    }
}

fn require_map<'a>(scene: &Scene<'a>, id: MapId) -> Result<&'a MapState, ApplyError> {
    scene
        .map(id)
        .ok_or(ApplyError::InvalidTarget(Target::Map(id)))
}

fn require_entity<'a>(scene: &Scene<'a>, id: EntityId) -> Result<&'a Entity, ApplyError> {
    scene
        .entity(id)
        .ok_or(ApplyError::InvalidTarget(Target::Entity(id)))
}

fn require_inside(map: &MapState, position: Position) -> Result<(), ApplyError> {
    if map.contains_position(position) {
        Ok(())
    } else {
        Err(ApplyError::constraint(format!(
            "position {position} is outside {} ({}x{})",
            map.id, map.width, map.height
        )))
    }
}

/// Resolve a destination map, creating it when the rules allow.
fn destination<'a>(
    scene: &Scene<'a>,
    rules: &Rules,
    id: MapId,
    steps: &mut Vec<Step>,
) -> Result<Cow<'a, MapState>, ApplyError> {
    if let Some(map) = scene.map(id) {
        return Ok(Cow::Borrowed(map));
    }
    if !rules.auto_create_maps {
        return Err(ApplyError::InvalidTarget(Target::Map(id)));
    }
    let [width, height] = rules.default_map_size;
    let settings = MapSettings {
        name: format!("Map {}", id.0),
        ..MapSettings::default()
    };
    let map = fresh_map(scene, id, width, height, settings);
    steps.push(Step::CreateMap(map.clone()));
    Ok(Cow::Owned(map))
}

/// Version of the thing a command's precondition refers to.
fn target_version(scene: &Scene<'_>, cmd: &Command) -> Result<Version, ApplyError> {
    let map_version = |id: MapId| require_map(scene, id).map(|m| m.version);
    let entity_version = |id: EntityId| require_entity(scene, id).map(|e| e.version);
    let edit = match &cmd.kind {
        CommandKind::Edit(op) | CommandKind::Script(ScriptOp::Edit(op)) => op,
        CommandKind::Script(ScriptOp::Announce { map, .. }) => return map_version(*map),
        CommandKind::Action(ActionOp::Enter { .. }) => {
            return Ok(cmd
                .origin
                .avatar
                .and_then(|id| scene.entity(id))
                .map_or(Version::ZERO, |e| e.version));
        }
        CommandKind::Action(_) => {
            let avatar = cmd
                .origin
                .avatar
                .ok_or_else(|| ApplyError::constraint("session has no avatar"))?;
            return entity_version(avatar);
        }
    };
    match edit {
        EditOp::CreateMap { map, .. } => Ok(scene.map(*map).map_or(Version::ZERO, |m| m.version)),
        EditOp::RemoveMap { map }
        | EditOp::SetMapSettings { map, .. }
        | EditOp::SpawnNpc { map, .. }
        | EditOp::SpawnItem { map, .. }
        | EditOp::ReplaceMap { map, .. } => map_version(*map),
        EditOp::SetTile { map, at, .. } => {
            let state = require_map(scene, *map)?;
            state
                .tile(*at)
                .map(|t| t.version)
                .ok_or_else(|| ApplyError::constraint(format!("tile {at} is outside {map}")))
        }
        EditOp::Despawn { entity }
        | EditOp::SetAttribute { entity, .. }
        | EditOp::Teleport { entity, .. } => entity_version(*entity),
    }
}

fn check_privilege(cmd: &Command) -> Result<(), ApplyError> {
    match &cmd.kind {
        CommandKind::Edit(op) if !cmd.origin.privilege.can_edit() => Err(ApplyError::denied(
            format!("{} requires editor privilege", op.name()),
        )),
        CommandKind::Script(_) if !cmd.origin.session.is_system() => Err(ApplyError::denied(
            "script commands may only come from the script bridge",
        )),
        CommandKind::Action(op) if op.requires_editor() && !cmd.origin.privilege.can_edit() => Err(
            ApplyError::denied(format!("{} requires editor privilege", op.name())),
        ),
        _ => Ok(()),
    }
}

/// Validate a command against the scene and produce its steps.
pub(crate) fn plan(scene: &Scene<'_>, rules: &Rules, cmd: &Command) -> Result<Vec<Step>, ApplyError> {
    check_privilege(cmd)?;
    let actual = target_version(scene, cmd)?;
    if let Some(expected) = cmd.expect {
        if expected != actual {
            return Err(ApplyError::ConflictStale { expected, actual });
        }
    }

    let mut steps = Vec::new();
    match &cmd.kind {
        CommandKind::Edit(op) | CommandKind::Script(ScriptOp::Edit(op)) => {
            plan_edit(scene, op, &mut steps)?
        }
        CommandKind::Script(ScriptOp::Announce { map, text }) => {
            require_map(scene, *map)?;
            if text.trim().is_empty() {
                return Err(ApplyError::constraint("announcement is empty"));
            }
            steps.push(Step::Emit {
                map: *map,
                kind: DeltaKind::Chat {
                    from: None,
                    text: text.clone(),
                    channel: ChatChannel::Map,
                },
                audience: Audience::Scope,
            });
        }
        CommandKind::Action(op) => plan_action(scene, rules, cmd, op, &mut steps)?,
    }
    Ok(steps)
}

fn plan_edit(scene: &Scene<'_>, op: &EditOp, steps: &mut Vec<Step>) -> Result<(), ApplyError> {
    match op {
        EditOp::CreateMap {
            map,
            width,
            height,
            settings,
        } => {
            if scene.map(*map).is_some() {
                return Err(ApplyError::constraint(format!("{map} already exists")));
            }
            check_size(*width, *height)?;
            steps.push(Step::CreateMap(fresh_map(
                scene,
                *map,
                *width,
                *height,
                settings.clone(),
            )));
        }
        EditOp::RemoveMap { map } => {
            let state = require_map(scene, *map)?;
            let players = state.player_count();
            if players > 0 {
                return Err(ApplyError::constraint(format!(
                    "{map} is still occupied by {players} player(s)"
                )));
            }
            steps.push(Step::RemoveMap(*map));
        }
        EditOp::SetMapSettings { map, settings } => {
            require_map(scene, *map)?;
            steps.push(Step::Settings {
                map: *map,
                settings: settings.clone(),
            });
        }
        EditOp::SetTile { map, at, patch } => {
            let state = require_map(scene, *map)?;
            if !state.contains(*at) {
                return Err(ApplyError::constraint(format!("tile {at} is outside {map}")));
            }
            if patch.is_empty() {
                return Err(ApplyError::constraint("tile patch changes nothing"));
            }
            steps.push(Step::Tile {
                map: *map,
                at: *at,
                patch: patch.clone(),
            });
        }
        EditOp::SpawnNpc {
            map,
            id,
            position,
            name,
            behavior,
        } => {
            let id = spawn_id(scene, *id)?;
            if name.trim().is_empty() {
                return Err(ApplyError::constraint("npc name is empty"));
            }
            let state = require_map(scene, *map)?;
            require_inside(state, *position)?;
            steps.push(Step::Insert(Entity::new(
                id,
                *map,
                *position,
                EntityKind::Npc {
                    name: name.clone(),
                    behavior: behavior.clone(),
                },
            )));
        }
        EditOp::SpawnItem {
            map,
            id,
            position,
            kind,
            quantity,
        } => {
            let id = spawn_id(scene, *id)?;
            if *quantity == 0 {
                return Err(ApplyError::constraint("item quantity must be positive"));
            }
            let state = require_map(scene, *map)?;
            require_inside(state, *position)?;
            steps.push(Step::Insert(Entity::new(
                id,
                *map,
                *position,
                EntityKind::Item {
                    kind: kind.clone(),
                    quantity: *quantity,
                    holder: None,
                },
            )));
        }
        EditOp::Despawn { entity } => {
            let e = require_entity(scene, *entity)?;
            if e.is_player() {
                return Err(ApplyError::constraint(format!(
                    "{entity} is a player avatar and leaves with its session"
                )));
            }
            steps.push(Step::Remove {
                map: e.map,
                id: e.id,
            });
        }
        EditOp::SetAttribute { entity, key, value } => {
            let e = require_entity(scene, *entity)?;
            if key.trim().is_empty() {
                return Err(ApplyError::constraint("attribute key is empty"));
            }
            steps.push(Step::Attribute {
                map: e.map,
                id: e.id,
                key: key.clone(),
                value: value.clone(),
            });
        }
        EditOp::Teleport {
            entity,
            map,
            position,
        } => {
            let e = require_entity(scene, *entity)?;
            if e.holder().is_some() {
                return Err(ApplyError::constraint(format!("{entity} is being carried")));
            }
            let dest = require_map(scene, *map)?;
            require_inside(dest, *position)?;
            steps.push(relocate(e, dest.id, *position, e.facing));
        }
        EditOp::ReplaceMap {
            map,
            width,
            height,
            settings,
            tiles,
        } => {
            let state = require_map(scene, *map)?;
            check_size(*width, *height)?;
            let cells = *width as usize * *height as usize;
            if tiles.len() != cells {
                return Err(ApplyError::constraint(format!(
                    "{} tiles given for a {width}x{height} map",
                    tiles.len()
                )));
            }
            let mut next = MapState::new(*map, *width, *height, settings.clone())
                .reissued(&state.retire());
            if let Some(outside) = state
                .entities()
                .values()
                .find(|e| !next.contains_position(e.position))
            {
                return Err(ApplyError::constraint(format!(
                    "{} would be left outside the resized {map}",
                    outside.id
                )));
            }
            next.fill(tiles.clone());
            next.entities = state.entities.clone();
            steps.push(Step::Replace(next));
        }
    }
    Ok(())
}

fn spawn_id(scene: &Scene<'_>, id: Option<EntityId>) -> Result<EntityId, ApplyError> {
    let id = id.ok_or_else(|| ApplyError::constraint("spawn has no allocated entity id"))?;
    if scene.entity(id).is_some() {
        return Err(ApplyError::constraint(format!("{id} already exists")));
    }
    Ok(id)
}

/// Move within the map, or transfer to another one.
fn relocate(entity: &Entity, map: MapId, position: Position, facing: Direction) -> Step {
    if map == entity.map {
        Step::Move {
            map,
            id: entity.id,
            position,
            facing,
        }
    } else {
        Step::Transfer {
            id: entity.id,
            from: entity.map,
            to: map,
            position,
            facing: Some(facing),
            holder: None,
        }
    }
}

fn plan_action(
    scene: &Scene<'_>,
    rules: &Rules,
    cmd: &Command,
    op: &ActionOp,
    steps: &mut Vec<Step>,
) -> Result<(), ApplyError> {
    if let ActionOp::Enter {
        name,
        map,
        position,
    } = op
    {
        let id = cmd
            .origin
            .avatar
            .ok_or_else(|| ApplyError::constraint("enter without an allocated avatar id"))?;
        if scene.entity(id).is_some() {
            return Err(ApplyError::constraint(format!("{id} already exists")));
        }
        if name.trim().is_empty() {
            return Err(ApplyError::constraint("player name is empty"));
        }
        let dest = destination(scene, rules, *map, steps)?;
        require_inside(&dest, *position)?;
        steps.push(Step::Insert(Entity::new(
            id,
            *map,
            *position,
            EntityKind::Player {
                name: name.clone(),
                session: cmd.origin.session,
                flags: PlayerFlags::default(),
            },
        )));
        if rules.announce_sessions {
            steps.push(notice(*map, id, format!("{name} has joined the game")));
        }
        return Ok(());
    }

    let avatar_id = cmd
        .origin
        .avatar
        .ok_or_else(|| ApplyError::constraint("session has no avatar"))?;
    let avatar = require_entity(scene, avatar_id)?;
    if avatar.session() != Some(cmd.origin.session) {
        return Err(ApplyError::denied(format!(
            "{avatar_id} is not controlled by {}",
            cmd.origin.session
        )));
    }

    match op {
        ActionOp::Enter { .. } => {}
        ActionOp::Leave => {
            steps.push(Step::Remove {
                map: avatar.map,
                id: avatar.id,
            });
            if rules.announce_sessions {
                let text = format!("{} has left the game", avatar.name());
                steps.push(notice(avatar.map, avatar.id, text));
            }
        }
        ActionOp::Move { to, facing } => plan_move(scene, rules, avatar, *to, *facing, steps)?,
        ActionOp::Say { text } => {
            check_chat(rules, text)?;
            steps.push(Step::Emit {
                map: avatar.map,
                kind: DeltaKind::Chat {
                    from: Some(avatar.id),
                    text: text.clone(),
                    channel: ChatChannel::Map,
                },
                audience: Audience::Scope,
            });
        }
        ActionOp::Shout { text } => {
            check_chat(rules, text)?;
            steps.push(Step::Emit {
                map: avatar.map,
                kind: DeltaKind::Chat {
                    from: Some(avatar.id),
                    text: text.clone(),
                    channel: ChatChannel::World,
                },
                audience: Audience::World,
            });
        }
        ActionOp::PickUp { item } => {
            let it = require_entity(scene, *item)?;
            if !it.is_item() {
                return Err(ApplyError::constraint(format!("{item} is not an item")));
            }
            if it.holder().is_some() {
                return Err(ApplyError::constraint(format!("{item} is already carried")));
            }
            let reach = (it.position - avatar.position).abs().max_element();
            if it.map != avatar.map || reach > 1 {
                return Err(ApplyError::constraint(format!("{item} is out of reach")));
            }
            steps.push(Step::Hold {
                map: avatar.map,
                item: it.id,
                holder: Some(avatar.id),
                position: avatar.position,
            });
        }
        ActionOp::Drop { item } => {
            let it = carried_by(scene, avatar, *item)?;
            steps.push(Step::Hold {
                map: avatar.map,
                item: it.id,
                holder: None,
                position: avatar.position,
            });
        }
        ActionOp::Give { item, to } => {
            let it = carried_by(scene, avatar, *item)?;
            if *to == avatar.id {
                return Err(ApplyError::constraint("cannot give an item to oneself"));
            }
            let receiver = require_entity(scene, *to)?;
            if receiver.is_item() {
                return Err(ApplyError::constraint(format!("{to} cannot carry items")));
            }
            if receiver.map == avatar.map {
                steps.push(Step::Hold {
                    map: avatar.map,
                    item: it.id,
                    holder: Some(receiver.id),
                    position: receiver.position,
                });
            } else {
                steps.push(Step::Transfer {
                    id: it.id,
                    from: avatar.map,
                    to: receiver.map,
                    position: receiver.position,
                    facing: None,
                    holder: Some(Some(receiver.id)),
                });
            }
        }
        ActionOp::Warp { map, position } => {
            let dest = destination(scene, rules, *map, steps)?;
            let position = position.unwrap_or_else(|| centre(&dest));
            require_inside(&dest, position)?;
            steps.push(relocate(avatar, *map, position, avatar.facing));
        }
        ActionOp::SetEditorMode { open } => steps.push(Step::Flags {
            map: avatar.map,
            id: avatar.id,
            flags: PlayerFlags { in_editor: *open },
        }),
    }
    Ok(())
}

fn carried_by<'a>(
    scene: &Scene<'a>,
    avatar: &Entity,
    item: EntityId,
) -> Result<&'a Entity, ApplyError> {
    let it = require_entity(scene, item)?;
    if it.holder() != Some(avatar.id) {
        return Err(ApplyError::constraint(format!(
            "{item} is not carried by {}",
            avatar.id
        )));
    }
    Ok(it)
}

fn centre(map: &MapState) -> Position {
    IVec2::new((map.width / 2) as i32, (map.height / 2) as i32)
}

/// Edge crossed when stepping to `to`, if `to` lies off exactly one side of the map.
pub(crate) fn leaving_edge(map: &MapState, to: Position) -> Option<Direction> {
    let off_x = to.x < 0 || to.x >= map.width as i32;
    let off_y = to.y < 0 || to.y >= map.height as i32;
    match (off_x, off_y) {
        (true, false) if to.x < 0 => Some(Direction::West),
        (true, false) => Some(Direction::East),
        (false, true) if to.y < 0 => Some(Direction::North),
        (false, true) => Some(Direction::South),
        _ => None,
    }
}

/// Arrival position on the neighbour reached through `edge`.
pub(crate) fn entry_point(neighbour: &MapState, edge: Direction, to: Position) -> Position {
    let max = IVec2::new(
        neighbour.width.saturating_sub(1) as i32,
        neighbour.height.saturating_sub(1) as i32,
    );
    let arrival = match edge {
        Direction::West => IVec2::new(max.x, to.y),
        Direction::East => IVec2::new(0, to.y),
        Direction::North => IVec2::new(to.x, max.y),
        Direction::South => IVec2::new(to.x, 0),
    };
    arrival.clamp(IVec2::ZERO, max)
}

fn plan_move(
    scene: &Scene<'_>,
    rules: &Rules,
    avatar: &Entity,
    to: Position,
    facing: Direction,
    steps: &mut Vec<Step>,
) -> Result<(), ApplyError> {
    let map = require_map(scene, avatar.map)?;
    let dx = i64::from(to.x) - i64::from(avatar.position.x);
    let dy = i64::from(to.y) - i64::from(avatar.position.y);
    let distance = dx.unsigned_abs() + dy.unsigned_abs();
    if distance > u64::from(rules.max_step) {
        return Err(ApplyError::constraint(format!(
            "step of {distance} tiles exceeds {}",
            rules.max_step
        )));
    }
    let free = avatar.in_editor();

    if !map.contains_position(to) {
        let edge = leaving_edge(map, to)
            .ok_or_else(|| ApplyError::constraint(format!("{to} leaves {} diagonally", map.id)))?;
        let next = map
            .settings
            .edges
            .get(edge)
            .ok_or_else(|| ApplyError::constraint(format!("nothing beyond the {edge} edge")))?;
        let neighbour = require_map(scene, next)?;
        let arrival = entry_point(neighbour, edge, to);
        if !free && neighbour.is_blocked(arrival) {
            return Err(ApplyError::constraint(format!(
                "arrival tile {arrival} on {next} is blocked"
            )));
        }
        steps.push(relocate(avatar, next, arrival, facing));
        return Ok(());
    }

    if to == avatar.position || free {
        steps.push(relocate(avatar, map.id, to, facing));
        return Ok(());
    }
    if map.is_blocked(to) {
        return Err(ApplyError::constraint(format!("tile {to} is blocked")));
    }

    match map.tile_at(to).and_then(|t| t.trigger.as_ref()) {
        Some(Trigger::Warp {
            map: target,
            position,
            facing: warp_facing,
        }) => {
            let facing = warp_facing.unwrap_or(facing);
            match scene.map(*target) {
                Some(dest) if dest.contains_position(*position) => {
                    steps.push(relocate(avatar, *target, *position, facing));
                }
                _ => {
                    tracing::warn!(
                        map = %map.id,
                        target = %target,
                        "warp trigger leads nowhere; treating as a plain step"
                    );
                    steps.push(relocate(avatar, map.id, to, facing));
                }
            }
        }
        Some(Trigger::Script { tag }) => {
            steps.push(relocate(avatar, map.id, to, facing));
            steps.push(Step::Emit {
                map: map.id,
                kind: DeltaKind::TriggerFired {
                    entity: avatar.id,
                    tag: tag.clone(),
                },
                audience: Audience::Scope,
            });
        }
        None => steps.push(relocate(avatar, map.id, to, facing)),
    }
    Ok(())
}

/// Maps a command may touch, given the current state of its primary world.
///
/// `locate` resolves entities held by other worlds.
pub(crate) fn footprint(
    world: &World,
    cmd: &Command,
    locate: &dyn Fn(EntityId) -> Option<MapId>,
) -> BTreeSet<MapId> {
    let scene = Scene::single(world);
    let find = |id: EntityId| world.locate(id).or_else(|| locate(id));
    let mut maps = BTreeSet::new();
    match cmd.scope() {
        Some(Scope::Map(map)) => {
            maps.insert(map);
        }
        Some(Scope::Entity(id)) => maps.extend(find(id)),
        None => {}
    }

    match &cmd.kind {
        CommandKind::Edit(EditOp::Teleport { map, .. })
        | CommandKind::Script(ScriptOp::Edit(EditOp::Teleport { map, .. }))
        | CommandKind::Action(ActionOp::Warp { map, .. }) => {
            maps.insert(*map);
        }
        CommandKind::Action(ActionOp::Give { to, .. }) => maps.extend(find(*to)),
        CommandKind::Action(ActionOp::Move { to, .. }) => {
            let avatar = cmd.origin.avatar.and_then(|id| scene.entity(id));
            if let Some(map) = avatar.and_then(|a| scene.map(a.map)) {
                if let Some(edge) = leaving_edge(map, *to) {
                    maps.extend(map.settings.edges.get(edge));
                } else if let Some(Trigger::Warp { map: target, .. }) =
                    map.tile_at(*to).and_then(|t| t.trigger.as_ref())
                {
                    maps.insert(*target);
                }
            }
        }
        _ => {}
    }
    maps
}

/// Applies planned steps. Revisions are bumped once per touched map.
pub(crate) struct Committer<'a, 'w> {
    parts: &'a mut [&'w mut World],
    stamp: Stamp,
    revisions: BTreeMap<MapId, u64>,
    deltas: Vec<Delta>,
}

impl<'a, 'w> Committer<'a, 'w> {
    pub(crate) fn new(parts: &'a mut [&'w mut World], stamp: Stamp) -> Self {
        Self {
            parts,
            stamp,
            revisions: BTreeMap::new(),
            deltas: Vec::new(),
        }
    }

    fn touch(&mut self, id: MapId) -> Option<&mut MapState> {
        let world = self.parts.iter_mut().find(|w| w.maps.contains_key(&id))?;
        let map = Arc::make_mut(world.maps.get_mut(&id)?);
        if let Entry::Vacant(slot) = self.revisions.entry(id) {
            map.revision += 1;
            slot.insert(map.revision);
        }
        Some(map)
    }

    fn emit(&mut self, map: MapId, kind: DeltaKind) {
        self.emit_to(map, kind, Audience::Scope);
    }

    fn emit_to(&mut self, map: MapId, kind: DeltaKind, audience: Audience) {
        let mut delta = Delta::scoped(map, self.stamp, kind);
        delta.revision = self.revisions.get(&map).copied().unwrap_or_default();
        delta.audience = audience;
        self.deltas.push(delta);
    }

    fn lost(&self, map: MapId, what: &str) {
        tracing::error!(%map, what, "planned step refers to state outside the transaction");
    }

    pub(crate) fn run(mut self, steps: Vec<Step>, home: &dyn Fn(MapId) -> usize) -> Vec<Delta> {
        for step in steps {
            self.step(step, home);
        }
        self.deltas
    }

    fn step(&mut self, step: Step, home: &dyn Fn(MapId) -> usize) {
        match step {
            Step::CreateMap(state) => {
                let id = state.id;
                let last = self.parts.len().saturating_sub(1);
                for world in self.parts.iter_mut() {
                    world.retired.remove(&id);
                }
                let Some(world) = self.parts.get_mut(home(id).min(last)) else {
                    return self.lost(id, "home world");
                };
                world.maps.insert(id, Arc::new(state));
                let Some(map) = self.touch(id) else {
                    return self.lost(id, "created map");
                };
                let summary = MapSummary::from(&*map);
                self.emit(id, DeltaKind::MapCreated { summary });
            }
            Step::RemoveMap(id) => {
                let Some(map) = self.touch(id) else {
                    return self.lost(id, "map");
                };
                let retired = map.retire();
                let gone: Vec<(EntityId, Version)> = map
                    .entities
                    .values()
                    .map(|e| (e.id, e.version.next()))
                    .collect();
                for world in self.parts.iter_mut() {
                    if world.maps.remove(&id).is_some() {
                        world.retired.insert(id, retired);
                    }
                }
                for (entity, version) in gone {
                    self.emit(
                        id,
                        DeltaKind::EntityRemoved {
                            id: entity,
                            version,
                            reason: Removal::MapRemoved,
                        },
                    );
                }
                self.emit(id, DeltaKind::MapRemoved);
            }
            Step::Replace(state) => {
                let id = state.id;
                let Some(world) = self.parts.iter_mut().find(|w| w.maps.contains_key(&id)) else {
                    return self.lost(id, "map");
                };
                world.maps.insert(id, Arc::new(state));
                let Some(map) = self.touch(id) else {
                    return self.lost(id, "replaced map");
                };
                let state = Arc::new(map.clone());
                self.emit(id, DeltaKind::MapReplaced { state });
            }
            Step::Settings { map, settings } => {
                let Some(state) = self.touch(map) else {
                    return self.lost(map, "map");
                };
                state.settings = settings.clone();
                state.version = state.version.next();
                let version = state.version;
                self.emit(map, DeltaKind::MapSettingsChanged { settings, version });
            }
            Step::Tile { map, at, patch } => {
                let Some(tile) = self.touch(map).and_then(|m| m.tile_mut(at)) else {
                    return self.lost(map, "tile");
                };
                patch.apply_to(tile);
                tile.version = tile.version.next();
                let tile = tile.clone();
                self.emit(map, DeltaKind::TileChanged { at, tile });
            }
            Step::Insert(entity) => {
                let map = entity.map;
                let Some(state) = self.touch(map) else {
                    return self.lost(map, "map");
                };
                state.entities.insert(entity.id, entity.clone());
                self.emit(map, DeltaKind::EntityCreated { entity });
            }
            Step::Remove { map, id } => {
                let Some(state) = self.touch(map) else {
                    return self.lost(map, "map");
                };
                let Some(mut removed) = state.entities.remove(&id) else {
                    return self.lost(map, "entity");
                };
                removed.bump();
                let mut dropped = Vec::new();
                for item in state.entities.values_mut() {
                    if item.holder() == Some(id) {
                        item.set_holder(None);
                        item.position = removed.position;
                        item.bump();
                        dropped.push(DeltaKind::ItemHeld {
                            item: item.id,
                            holder: None,
                            position: item.position,
                            version: item.version,
                        });
                    }
                }
                for kind in dropped {
                    self.emit(map, kind);
                }
                self.emit(
                    map,
                    DeltaKind::EntityRemoved {
                        id,
                        version: removed.version,
                        reason: Removal::Despawned,
                    },
                );
            }
            Step::Move {
                map,
                id,
                position,
                facing,
            } => {
                let Some(entity) = self.touch(map).and_then(|m| m.entities.get_mut(&id)) else {
                    return self.lost(map, "entity");
                };
                entity.position = position;
                entity.facing = facing;
                entity.bump();
                let version = entity.version;
                self.emit(
                    map,
                    DeltaKind::EntityMoved {
                        id,
                        position,
                        facing,
                        version,
                    },
                );
            }
            Step::Attribute {
                map,
                id,
                key,
                value,
            } => {
                let Some(entity) = self.touch(map).and_then(|m| m.entities.get_mut(&id)) else {
                    return self.lost(map, "entity");
                };
                match &value {
                    Some(v) => entity.attributes.insert(key.clone(), v.clone()),
                    None => entity.attributes.remove(&key),
                };
                entity.bump();
                let version = entity.version;
                self.emit(
                    map,
                    DeltaKind::AttributeChanged {
                        id,
                        key,
                        value,
                        version,
                    },
                );
            }
            Step::Hold {
                map,
                item,
                holder,
                position,
            } => {
                let Some(entity) = self.touch(map).and_then(|m| m.entities.get_mut(&item)) else {
                    return self.lost(map, "item");
                };
                entity.set_holder(holder);
                entity.position = position;
                entity.bump();
                let version = entity.version;
                self.emit(
                    map,
                    DeltaKind::ItemHeld {
                        item,
                        holder,
                        position,
                        version,
                    },
                );
            }
            Step::Flags { map, id, flags } => {
                let Some(entity) = self.touch(map).and_then(|m| m.entities.get_mut(&id)) else {
                    return self.lost(map, "entity");
                };
                entity.set_flags(flags);
                entity.bump();
                let version = entity.version;
                self.emit(map, DeltaKind::FlagsChanged { id, flags, version });
            }
            Step::Transfer {
                id,
                from,
                to,
                position,
                facing,
                holder,
            } => self.transfer(id, from, to, position, facing, holder),
            Step::Emit {
                map,
                kind,
                audience,
            } => {
                if self.touch(map).is_none() {
                    return self.lost(map, "map");
                }
                self.emit_to(map, kind, audience);
            }
        }
    }

    fn transfer(
        &mut self,
        id: EntityId,
        from: MapId,
        to: MapId,
        position: Position,
        facing: Option<Direction>,
        holder: Option<Option<EntityId>>,
    ) {
        let Some(source) = self.touch(from) else {
            return self.lost(from, "source map");
        };
        let Some(lead) = source.entities.remove(&id) else {
            return self.lost(from, "entity");
        };
        let carried: Vec<EntityId> = source
            .entities
            .values()
            .filter(|e| e.holder() == Some(id))
            .map(|e| e.id)
            .collect();
        let mut moving = vec![lead];
        moving.extend(carried.iter().filter_map(|c| source.entities.remove(c)));
        for entity in &mut moving {
            entity.bump();
        }
        for entity in &moving {
            self.emit(
                from,
                DeltaKind::EntityRemoved {
                    id: entity.id,
                    version: entity.version,
                    reason: Removal::Departed { to },
                },
            );
        }

        let Some(dest) = self.touch(to) else {
            return self.lost(to, "destination map");
        };
        let mut created = Vec::with_capacity(moving.len());
        for mut entity in moving {
            entity.map = to;
            entity.position = position;
            if entity.id == id {
                if let Some(facing) = facing {
                    entity.facing = facing;
                }
                if let Some(holder) = holder {
                    entity.set_holder(holder);
                }
            }
            dest.entities.insert(entity.id, entity.clone());
            created.push(entity);
        }
        for entity in created {
            self.emit(to, DeltaKind::EntityCreated { entity });
        }
    }
}
