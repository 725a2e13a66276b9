use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use liveworld_common::{EntityId, MapId};
use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::delta::Delta;
use crate::entity::Entity;
use crate::error::{ApplyError, InvariantViolation};
use crate::map::{MapState, Retired};
use crate::txn::{self, Committer, Scene};

/// Gameplay limits enforced while applying actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rules {
    /// Manhattan distance one `Move` may cover.
    pub max_step: u32,
    pub max_chat_len: usize,
    /// Warping or entering a map that does not exist creates it.
    pub auto_create_maps: bool,
    pub default_map_size: [u32; 2],
    /// Tell every session when a player joins or leaves.
    pub announce_sessions: bool,
}

impl Default for Rules {
    fn default() -> Self {
        Self {
            max_step: 1,
            max_chat_len: 256,
            auto_create_maps: true,
            default_map_size: [32, 32],
            announce_sessions: true,
        }
    }
}

/// Engine-wide monotonic counters: entity id allocation and commit sequence.
///
/// Shared by every shard. Both values only ever grow, and both are persisted
/// with snapshots so that ids and commit numbers are never reused.
#[derive(Debug)]
pub struct Counters {
    next_entity: AtomicU64,
    commit: AtomicU64,
}

impl Default for Counters {
    fn default() -> Self {
        Self::new(1, 0)
    }
}

impl Counters {
    pub fn new(next_entity: u64, last_commit: u64) -> Self {
        Self {
            next_entity: AtomicU64::new(next_entity.max(1)),
            commit: AtomicU64::new(last_commit),
        }
    }

    pub fn allocate_entity(&self) -> EntityId {
        EntityId(self.next_entity.fetch_add(1, Ordering::SeqCst))
    }

    /// The id the next allocation will return. Every live id is below it.
    pub fn entity_high_water(&self) -> u64 {
        self.next_entity.load(Ordering::SeqCst)
    }

    /// Make sure `id` is never handed out again.
    pub fn reserve(&self, id: EntityId) {
        self.next_entity
            .fetch_max(id.0.saturating_add(1), Ordering::SeqCst);
    }

    /// Allocate the sequence number of a freshly applied command.
    pub fn next_commit(&self) -> u64 {
        self.commit.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn last_commit(&self) -> u64 {
        self.commit.load(Ordering::SeqCst)
    }

    /// Advance past a commit number seen during replay.
    pub fn observe_commit(&self, commit: u64) {
        self.commit.fetch_max(commit, Ordering::SeqCst);
    }
}

/// The maps owned by one shard, or the whole world when shards are merged.
///
/// Maps are held behind `Arc` and copied on write, so handing out a frozen
/// view never blocks a writer. All containers are ordered for deterministic
/// iteration, serialisation and hashing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct World {
    pub(crate) maps: BTreeMap<MapId, Arc<MapState>>,
    /// Ids of removed maps, kept so a map recreated under one never reuses a version.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) retired: BTreeMap<MapId, Retired>,
    #[serde(skip)]
    rules: Rules,
}

impl PartialEq for World {
    fn eq(&self, other: &Self) -> bool {
        self.maps == other.maps && self.retired == other.retired
    }
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: Rules) -> Self {
        Self {
            rules,
            ..Self::default()
        }
    }

    pub fn rules(&self) -> &Rules {
        &self.rules
    }

    pub fn set_rules(&mut self, rules: Rules) {
        self.rules = rules;
    }

    pub fn map_count(&self) -> usize {
        self.maps.len()
    }

    pub fn map_ids(&self) -> impl Iterator<Item = MapId> + '_ {
        self.maps.keys().copied()
    }

    pub fn contains_map(&self, id: MapId) -> bool {
        self.maps.contains_key(&id)
    }

    pub fn map(&self, id: MapId) -> Option<&MapState> {
        self.maps.get(&id).map(|m| &**m)
    }

    /// Frozen, shared view of a map. Later writes do not affect it.
    pub fn view(&self, id: MapId) -> Option<Arc<MapState>> {
        self.maps.get(&id).cloned()
    }

    /// Frozen views of every map, in id order.
    pub fn views(&self) -> Vec<Arc<MapState>> {
        self.maps.values().cloned().collect()
    }

    /// Insert or replace a whole map. Used when restoring persisted state.
    pub fn insert_map(&mut self, map: Arc<MapState>) {
        self.maps.insert(map.id, map);
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.maps.values().find_map(|m| m.entity(id))
    }

    pub fn entity_count(&self) -> usize {
        self.maps.values().map(|m| m.entities().len()).sum()
    }

    /// Map an entity is located on.
    pub fn locate(&self, id: EntityId) -> Option<MapId> {
        self.entity(id).map(|e| e.map)
    }

    /// Every entity with the map it is on, in map then id order.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> + '_ {
        self.maps.values().flat_map(|m| m.entities().values())
    }

    /// Apply a command to this world alone.
    pub fn apply(&mut self, cmd: &Command) -> Result<Vec<Delta>, ApplyError> {
        World::apply_joint(&mut [self], |_| 0, cmd)
    }

    /// Apply a command atomically across several worlds.
    ///
    /// Either every part is mutated or none is. `home` names the part that
    /// takes ownership of a map the command creates.
    pub fn apply_joint(
        parts: &mut [&mut World],
        home: impl Fn(MapId) -> usize,
        cmd: &Command,
    ) -> Result<Vec<Delta>, ApplyError> {
        let _span = tracing::debug_span!("apply", command = cmd.name(), stamp = ?cmd.stamp).entered();
        let rules = parts.first().map(|w| w.rules).unwrap_or_default();
        let steps = {
            let scene = Scene::new(parts);
            txn::plan(&scene, &rules, cmd)?
        };
        let deltas = Committer::new(parts, cmd.stamp).run(steps, &home);
        tracing::debug!(deltas = deltas.len(), "command applied");
        Ok(deltas)
    }

    /// Maps the command may read or write, judged from this world's current state.
    ///
    /// `locate` resolves entities living in other worlds.
    pub fn footprint(
        &self,
        cmd: &Command,
        locate: impl Fn(EntityId) -> Option<MapId>,
    ) -> BTreeSet<MapId> {
        txn::footprint(self, cmd, &locate)
    }

    /// Union of disjoint partitions.
    pub fn merge(parts: impl IntoIterator<Item = World>) -> World {
        let mut merged = World::new();
        for (i, part) in parts.into_iter().enumerate() {
            if i == 0 {
                merged.rules = part.rules;
            }
            merged.maps.extend(part.maps);
            merged.retired.extend(part.retired);
        }
        merged
    }

    /// Partition maps by `route`. Every partition keeps this world's rules.
    pub fn split<K: Ord>(self, route: impl Fn(MapId) -> K) -> BTreeMap<K, World> {
        let mut parts: BTreeMap<K, World> = BTreeMap::new();
        let rules = self.rules;
        for (id, map) in self.maps {
            parts
                .entry(route(id))
                .or_insert_with(|| World::with_rules(rules))
                .maps
                .insert(id, map);
        }
        for (id, retired) in self.retired {
            parts
                .entry(route(id))
                .or_insert_with(|| World::with_rules(rules))
                .retired
                .insert(id, retired);
        }
        parts
    }

    /// Tombstone of a removed map id, if the id is not in use again.
    pub fn retired(&self, id: MapId) -> Option<&Retired> {
        self.retired.get(&id)
    }

    /// Canonical CBOR encoding. Equal worlds encode to equal bytes.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, ciborium::ser::Error<std::io::Error>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)?;
        Ok(buf)
    }

    /// FNV-1a over the canonical encoding.
    pub fn state_hash(&self) -> u64 {
        let mut hasher = Fnv(0xcbf2_9ce4_8422_2325);
        if let Err(err) = ciborium::into_writer(self, &mut hasher) {
            tracing::error!(?err, "failed to encode world for hashing");
        }
        hasher.0
    }

    /// Verify the structural invariants of every map.
    ///
    /// `high_water` is the entity allocator's next id, when known; every
    /// live id must be below it.
    pub fn check_consistency(&self, high_water: Option<u64>) -> Result<(), InvariantViolation> {
        let mut seen = BTreeSet::new();
        for (id, map) in &self.maps {
            let fail = |detail: String| InvariantViolation { map: *id, detail };
            if map.id != *id {
                return Err(fail(format!("stored under {id} but names itself {}", map.id)));
            }
            let cells = map.width as usize * map.height as usize;
            if map.tiles().count() != cells {
                return Err(fail(format!("grid does not hold {cells} tiles")));
            }
            for (eid, entity) in map.entities() {
                if entity.id != *eid {
                    return Err(fail(format!("{eid} stored as {}", entity.id)));
                }
                if entity.map != map.id {
                    return Err(fail(format!("{eid} reports location {}", entity.map)));
                }
                if !map.contains_position(entity.position) {
                    return Err(fail(format!("{eid} is outside the grid")));
                }
                if let Some(holder) = entity.holder() {
                    match map.entity(holder) {
                        Some(h) if !h.is_item() => {}
                        _ => return Err(fail(format!("{eid} is held by absent {holder}"))),
                    }
                }
                if high_water.is_some_and(|hw| eid.0 >= hw) {
                    return Err(fail(format!("{eid} was never allocated")));
                }
                if !seen.insert(*eid) {
                    return Err(fail(format!("{eid} is located on more than one map")));
                }
            }
        }
        Ok(())
    }
}

struct Fnv(u64);

impl std::io::Write for Fnv {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for &b in buf {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{ActionOp, EditOp, Origin, Stamp};
    use crate::delta::{Audience, ChatChannel, DeltaKind, Removal};
    use crate::entity::AttrValue;
    use crate::map::{Collision, MapSettings, Terrain, Tile, TilePatch, Trigger};
    use glam::IVec2;
    use liveworld_common::{Direction, LogicalTime, SessionId, TileCoord, Version};

    const EDITOR: SessionId = SessionId(1);
    const PLAYER: SessionId = SessionId(2);

    fn editor() -> Origin {
        Origin::editor(EDITOR, None)
    }

    fn create_map(id: u64, w: u32, h: u32) -> Command {
        Command::edit(
            editor(),
            EditOp::CreateMap {
                map: MapId(id),
                width: w,
                height: h,
                settings: MapSettings::default(),
            },
        )
    }

    fn enter(world: &mut World, session: SessionId, avatar: u64, map: u64, at: IVec2) -> Origin {
        let origin = Origin::player(session, EntityId(avatar));
        world
            .apply(&Command::action(
                origin,
                ActionOp::Enter {
                    name: format!("p{avatar}"),
                    map: MapId(map),
                    position: at,
                },
            ))
            .unwrap();
        origin
    }

    fn world_with_map() -> World {
        let mut world = World::new();
        world.apply(&create_map(1, 10, 10)).unwrap();
        world
    }

    #[test]
    fn set_tile_bumps_version_and_emits_delta() {
        let mut world = world_with_map();
        let at = TileCoord::new(5, 5);
        let deltas = world
            .apply(&Command::edit(
                editor(),
                EditOp::SetTile {
                    map: MapId(1),
                    at,
                    patch: TilePatch::terrain(Terrain::Water),
                },
            ))
            .unwrap();

        let tile = world.map(MapId(1)).unwrap().tile(at).unwrap();
        assert_eq!(tile.terrain, Terrain::Water);
        assert_eq!(tile.version, Version(1));
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].revision, 2);
        assert!(matches!(
            &deltas[0].kind,
            DeltaKind::TileChanged { at: a, tile } if *a == at && tile.terrain == Terrain::Water
        ));
    }

    #[test]
    fn stale_precondition_leaves_world_unchanged() {
        let mut world = world_with_map();
        let edit = |terrain| {
            Command::edit(
                editor(),
                EditOp::SetTile {
                    map: MapId(1),
                    at: TileCoord::new(2, 2),
                    patch: TilePatch::terrain(terrain),
                },
            )
            .expecting(Version::ZERO)
        };
        world.apply(&edit(Terrain::Sand)).unwrap();
        let before = world.state_hash();

        let err = world.apply(&edit(Terrain::Stone)).unwrap_err();
        assert_eq!(
            err,
            ApplyError::ConflictStale {
                expected: Version::ZERO,
                actual: Version(1)
            }
        );
        assert_eq!(world.state_hash(), before);
    }

    #[test]
    fn player_cannot_edit_or_warp() {
        let mut world = world_with_map();
        let origin = enter(&mut world, PLAYER, 10, 1, IVec2::new(1, 1));
        let before = world.state_hash();

        let edit = Command::edit(
            origin,
            EditOp::SetTile {
                map: MapId(1),
                at: TileCoord::new(0, 0),
                patch: TilePatch::terrain(Terrain::Wall),
            },
        );
        assert!(matches!(
            world.apply(&edit),
            Err(ApplyError::PrivilegeDenied(_))
        ));

        let warp = Command::action(
            origin,
            ActionOp::Warp {
                map: MapId(1),
                position: None,
            },
        );
        assert!(matches!(
            world.apply(&warp),
            Err(ApplyError::PrivilegeDenied(_))
        ));
        assert_eq!(world.state_hash(), before);
    }

    #[test]
    fn failed_multi_step_command_is_atomic() {
        let mut world = world_with_map();
        let before = world.clone();
        // Out of bounds position: nothing is created, not even the map revision moves.
        let err = world
            .apply(&Command::edit(
                editor(),
                EditOp::SpawnNpc {
                    map: MapId(1),
                    id: Some(EntityId(5)),
                    position: IVec2::new(40, 0),
                    name: "guard".into(),
                    behavior: "idle".into(),
                },
            ))
            .unwrap_err();
        assert!(matches!(err, ApplyError::ConstraintViolation(_)));
        assert_eq!(world, before);
        assert_eq!(world.map(MapId(1)).unwrap().revision, 1);
    }

    #[test]
    fn moving_into_a_wall_is_rejected() {
        let mut world = world_with_map();
        world
            .apply(&Command::edit(
                editor(),
                EditOp::SetTile {
                    map: MapId(1),
                    at: TileCoord::new(2, 1),
                    patch: TilePatch::collision(Collision::Blocked),
                },
            ))
            .unwrap();
        let origin = enter(&mut world, PLAYER, 10, 1, IVec2::new(1, 1));
        let step = |x| {
            Command::action(
                origin,
                ActionOp::Move {
                    to: IVec2::new(x, 1),
                    facing: Direction::East,
                },
            )
        };
        assert!(world.apply(&step(2)).is_err());
        assert!(world.apply(&step(3)).is_err(), "two tiles in one step");
        world.apply(&step(0)).unwrap();
        assert_eq!(world.entity(EntityId(10)).unwrap().position, IVec2::new(0, 1));
    }

    #[test]
    fn walking_off_an_edge_enters_the_linked_map() {
        let mut world = World::new();
        let mut settings = MapSettings::default();
        settings.edges.set(Direction::East, Some(MapId(2)));
        world
            .apply(&Command::edit(
                editor(),
                EditOp::CreateMap {
                    map: MapId(1),
                    width: 4,
                    height: 4,
                    settings,
                },
            ))
            .unwrap();
        world.apply(&create_map(2, 6, 6)).unwrap();
        let origin = enter(&mut world, PLAYER, 10, 1, IVec2::new(3, 2));

        let deltas = world
            .apply(&Command::action(
                origin,
                ActionOp::Move {
                    to: IVec2::new(4, 2),
                    facing: Direction::East,
                },
            ))
            .unwrap();

        let avatar = world.entity(EntityId(10)).unwrap();
        assert_eq!(avatar.map, MapId(2));
        assert_eq!(avatar.position, IVec2::new(0, 2));
        assert_eq!(deltas[0].scope, MapId(1));
        assert!(matches!(
            deltas[0].kind,
            DeltaKind::EntityRemoved {
                reason: Removal::Departed { to: MapId(2) },
                ..
            }
        ));
        assert_eq!(deltas[1].scope, MapId(2));
        world.check_consistency(None).unwrap();
    }

    #[test]
    fn warp_trigger_moves_the_player_and_carried_items() {
        let mut world = world_with_map();
        world.apply(&create_map(2, 5, 5)).unwrap();
        world
            .apply(&Command::edit(
                editor(),
                EditOp::SetTile {
                    map: MapId(1),
                    at: TileCoord::new(2, 1),
                    patch: TilePatch::trigger(Some(Trigger::Warp {
                        map: MapId(2),
                        position: IVec2::new(4, 4),
                        facing: None,
                    })),
                },
            ))
            .unwrap();
        world
            .apply(&Command::edit(
                editor(),
                EditOp::SpawnItem {
                    map: MapId(1),
                    id: Some(EntityId(20)),
                    position: IVec2::new(1, 1),
                    kind: "lamp".into(),
                    quantity: 1,
                },
            ))
            .unwrap();
        let origin = enter(&mut world, PLAYER, 10, 1, IVec2::new(1, 1));
        world
            .apply(&Command::action(
                origin,
                ActionOp::PickUp {
                    item: EntityId(20),
                },
            ))
            .unwrap();
        world
            .apply(&Command::action(
                origin,
                ActionOp::Move {
                    to: IVec2::new(2, 1),
                    facing: Direction::East,
                },
            ))
            .unwrap();

        let lamp = world.entity(EntityId(20)).unwrap();
        assert_eq!(lamp.map, MapId(2));
        assert_eq!(lamp.holder(), Some(EntityId(10)));
        assert_eq!(world.locate(EntityId(10)), Some(MapId(2)));
        world.check_consistency(None).unwrap();
    }

    #[test]
    fn extreme_move_is_rejected_without_overflow() {
        let mut world = world_with_map();
        let origin = enter(&mut world, PLAYER, 10, 1, IVec2::new(1, 1));
        let before = world.state_hash();
        let err = world
            .apply(&Command::action(
                origin,
                ActionOp::Move {
                    to: IVec2::new(i32::MIN + 1, i32::MIN + 1),
                    facing: Direction::North,
                },
            ))
            .unwrap_err();
        assert!(matches!(err, ApplyError::ConstraintViolation(_)));
        assert_eq!(world.state_hash(), before);
    }

    #[test]
    fn a_recreated_map_never_reuses_versions() {
        let mut world = world_with_map();
        let at = TileCoord::new(2, 2);
        let paint = |terrain| {
            Command::edit(
                editor(),
                EditOp::SetTile {
                    map: MapId(1),
                    at,
                    patch: TilePatch::terrain(terrain),
                },
            )
        };
        world.apply(&paint(Terrain::Sand)).unwrap();
        world.apply(&paint(Terrain::Grass)).unwrap();
        let old = world.map(MapId(1)).unwrap().clone();
        world
            .apply(&Command::edit(editor(), EditOp::RemoveMap { map: MapId(1) }))
            .unwrap();
        assert_eq!(world.retired(MapId(1)).map(|r| r.floor), Some(Version(2)));

        let deltas = world.apply(&create_map(1, 10, 10)).unwrap();
        assert!(world.retired(MapId(1)).is_none());
        let fresh = world.map(MapId(1)).unwrap();
        assert!(fresh.version > old.version);
        assert!(fresh.revision > old.revision);
        assert_eq!(fresh.edited_tiles().count(), 0);
        assert!(matches!(
            &deltas[0].kind,
            DeltaKind::MapCreated { summary } if summary.tile_base == Version(3)
        ));

        // A precondition taken on the old map's tile no longer holds.
        let err = world.apply(&paint(Terrain::Water).expecting(Version(2))).unwrap_err();
        assert_eq!(
            err,
            ApplyError::ConflictStale {
                expected: Version(2),
                actual: Version(3)
            }
        );
        world.apply(&paint(Terrain::Water).expecting(Version(3))).unwrap();
        assert_eq!(world.map(MapId(1)).unwrap().tile(at).unwrap().version, Version(4));
    }

    #[test]
    fn tombstones_follow_their_map_through_split_and_merge() {
        let mut world = world_with_map();
        world.apply(&create_map(2, 4, 4)).unwrap();
        world
            .apply(&Command::edit(editor(), EditOp::RemoveMap { map: MapId(2) }))
            .unwrap();
        let parts = world.clone().split(|map| map.0);
        assert!(parts[&2].retired(MapId(2)).is_some());
        assert!(parts[&1].retired(MapId(2)).is_none());
        assert_eq!(World::merge(parts.into_values()), world);
    }

    #[test]
    fn replace_map_swaps_the_grid_and_keeps_entities() {
        let mut world = world_with_map();
        enter(&mut world, PLAYER, 10, 1, IVec2::new(1, 1));
        let before = world.map(MapId(1)).unwrap().clone();
        let replace = |width: u32, height: u32| {
            let mut tiles = vec![Tile::default(); (width * height) as usize];
            tiles[0].terrain = Terrain::Stone;
            Command::edit(
                editor(),
                EditOp::ReplaceMap {
                    map: MapId(1),
                    width,
                    height,
                    settings: MapSettings {
                        name: "Quarry".into(),
                        ..MapSettings::default()
                    },
                    tiles,
                },
            )
        };

        // Shrinking past the player is refused.
        assert!(matches!(
            world.apply(&replace(1, 1)),
            Err(ApplyError::ConstraintViolation(_))
        ));
        let deltas = world.apply(&replace(4, 3)).unwrap();
        let map = world.map(MapId(1)).unwrap();
        assert_eq!((map.width, map.height), (4, 3));
        assert_eq!(map.settings.name, "Quarry");
        assert_eq!(map.tile(TileCoord::new(0, 0)).unwrap().terrain, Terrain::Stone);
        assert!(map.version > before.version);
        assert!(map.tiles().all(|(_, t)| t.version == map.base));
        assert!(map.entity(EntityId(10)).is_some());
        assert_eq!(deltas.len(), 1);
        assert!(matches!(
            &deltas[0].kind,
            DeltaKind::MapReplaced { state } if **state == *map
        ));
        world.check_consistency(None).unwrap();
    }

    #[test]
    fn shouts_and_session_notices_reach_the_whole_world() {
        let mut world = world_with_map();
        let origin = Origin::player(PLAYER, EntityId(10));
        let entered = world
            .apply(&Command::action(
                origin,
                ActionOp::Enter {
                    name: "wren".into(),
                    map: MapId(1),
                    position: IVec2::ONE,
                },
            ))
            .unwrap();
        let joined = entered.last().unwrap();
        assert_eq!(joined.audience, Audience::World);
        assert!(matches!(
            &joined.kind,
            DeltaKind::Chat { text, channel: ChatChannel::Server, .. } if text == "wren has joined the game"
        ));

        let shout = world
            .apply(&Command::action(origin, ActionOp::Shout { text: "hey all".into() }))
            .unwrap();
        assert_eq!(shout[0].audience, Audience::World);
        assert!(matches!(
            &shout[0].kind,
            DeltaKind::Chat { from: Some(EntityId(10)), channel: ChatChannel::World, .. }
        ));

        let left = world.apply(&Command::action(origin, ActionOp::Leave)).unwrap();
        assert!(left.iter().any(|d| matches!(
            &d.kind,
            DeltaKind::Chat { text, channel: ChatChannel::Server, .. } if text == "wren has left the game"
        )));

        let mut quiet = World::with_rules(Rules {
            announce_sessions: false,
            ..Rules::default()
        });
        quiet.apply(&create_map(1, 4, 4)).unwrap();
        let entered = quiet
            .apply(&Command::action(
                origin,
                ActionOp::Enter {
                    name: "wren".into(),
                    map: MapId(1),
                    position: IVec2::ONE,
                },
            ))
            .unwrap();
        assert!(entered.iter().all(|d| d.audience == Audience::Scope));
    }

    #[test]
    fn remove_map_refuses_while_players_remain() {
        let mut world = world_with_map();
        let origin = enter(&mut world, PLAYER, 10, 1, IVec2::new(1, 1));
        let remove = Command::edit(editor(), EditOp::RemoveMap { map: MapId(1) });
        assert!(matches!(
            world.apply(&remove),
            Err(ApplyError::ConstraintViolation(_))
        ));

        world.apply(&Command::action(origin, ActionOp::Leave)).unwrap();
        let deltas = world.apply(&remove).unwrap();
        assert!(matches!(deltas.last().unwrap().kind, DeltaKind::MapRemoved));
        assert_eq!(world.map_count(), 0);
    }

    #[test]
    fn leaving_drops_carried_items() {
        let mut world = world_with_map();
        world
            .apply(&Command::edit(
                editor(),
                EditOp::SpawnItem {
                    map: MapId(1),
                    id: Some(EntityId(20)),
                    position: IVec2::new(2, 2),
                    kind: "coin".into(),
                    quantity: 3,
                },
            ))
            .unwrap();
        let origin = enter(&mut world, PLAYER, 10, 1, IVec2::new(2, 3));
        world
            .apply(&Command::action(origin, ActionOp::PickUp { item: EntityId(20) }))
            .unwrap();
        world.apply(&Command::action(origin, ActionOp::Leave)).unwrap();

        let coin = world.entity(EntityId(20)).unwrap();
        assert_eq!(coin.holder(), None);
        assert_eq!(coin.position, IVec2::new(2, 3));
        world.check_consistency(None).unwrap();
    }

    #[test]
    fn actions_require_owning_the_avatar() {
        let mut world = world_with_map();
        enter(&mut world, PLAYER, 10, 1, IVec2::new(1, 1));
        let impostor = Origin::player(SessionId(99), EntityId(10));
        let err = world
            .apply(&Command::action(impostor, ActionOp::Say { text: "hi".into() }))
            .unwrap_err();
        assert!(matches!(err, ApplyError::PrivilegeDenied(_)));
    }

    #[test]
    fn warp_auto_creates_missing_maps() {
        let mut world = world_with_map();
        let origin = Origin::editor(EDITOR, Some(EntityId(10)));
        world
            .apply(&Command::action(
                origin,
                ActionOp::Enter {
                    name: "ed".into(),
                    map: MapId(1),
                    position: IVec2::ZERO,
                },
            ))
            .unwrap();
        world
            .apply(&Command::action(
                origin,
                ActionOp::Warp {
                    map: MapId(7),
                    position: None,
                },
            ))
            .unwrap();
        let map = world.map(MapId(7)).unwrap();
        assert_eq!((map.width, map.height), (32, 32));
        assert_eq!(world.entity(EntityId(10)).unwrap().position, IVec2::new(16, 16));

        let mut strict = World::with_rules(Rules {
            auto_create_maps: false,
            ..Rules::default()
        });
        strict.apply(&create_map(1, 4, 4)).unwrap();
        let err = strict
            .apply(&Command::action(
                origin,
                ActionOp::Enter {
                    name: "ed".into(),
                    map: MapId(3),
                    position: IVec2::ZERO,
                },
            ))
            .unwrap_err();
        assert_eq!(err, ApplyError::InvalidTarget(crate::error::Target::Map(MapId(3))));
    }

    #[test]
    fn joint_apply_moves_items_between_partitions() {
        let mut world = world_with_map();
        world.apply(&create_map(2, 10, 10)).unwrap();
        let giver = enter(&mut world, PLAYER, 10, 1, IVec2::new(1, 1));
        enter(&mut world, SessionId(3), 11, 2, IVec2::new(4, 4));
        world
            .apply(&Command::edit(
                editor(),
                EditOp::SpawnItem {
                    map: MapId(1),
                    id: Some(EntityId(20)),
                    position: IVec2::new(1, 1),
                    kind: "gem".into(),
                    quantity: 1,
                },
            ))
            .unwrap();
        world
            .apply(&Command::action(giver, ActionOp::PickUp { item: EntityId(20) }))
            .unwrap();

        let mut parts = world.split(|id| id.0);
        let mut one = parts.remove(&1).unwrap();
        let mut two = parts.remove(&2).unwrap();
        let give = Command::action(
            giver,
            ActionOp::Give {
                item: EntityId(20),
                to: EntityId(11),
            },
        );
        let footprint = one.footprint(&give, |id| two.locate(id));
        assert_eq!(footprint, BTreeSet::from([MapId(1), MapId(2)]));

        World::apply_joint(&mut [&mut one, &mut two], |_| 0, &give).unwrap();
        assert!(one.entity(EntityId(20)).is_none());
        assert_eq!(two.entity(EntityId(20)).unwrap().holder(), Some(EntityId(11)));

        let merged = World::merge([one, two]);
        merged.check_consistency(None).unwrap();
    }

    #[test]
    fn replaying_commands_is_deterministic() {
        let stamp = |n| Stamp {
            time: LogicalTime(n),
            session: EDITOR,
            arrival: n,
        };
        let script: Vec<Command> = vec![
            create_map(1, 8, 8).stamped(stamp(1)),
            Command::edit(
                editor(),
                EditOp::SetTile {
                    map: MapId(1),
                    at: TileCoord::new(3, 3),
                    patch: TilePatch::terrain(Terrain::Stone),
                },
            )
            .stamped(stamp(2)),
            Command::edit(
                editor(),
                EditOp::SpawnNpc {
                    map: MapId(1),
                    id: Some(EntityId(4)),
                    position: IVec2::new(1, 2),
                    name: "smith".into(),
                    behavior: "shop".into(),
                },
            )
            .stamped(stamp(3)),
            Command::edit(
                editor(),
                EditOp::SetAttribute {
                    entity: EntityId(4),
                    key: "hp".into(),
                    value: Some(AttrValue::Int(30)),
                },
            )
            .stamped(stamp(4)),
        ];

        let run = || {
            let mut world = World::new();
            for cmd in &script {
                world.apply(cmd).unwrap();
            }
            world
        };
        let a = run();
        let b = run();
        assert_eq!(a.state_hash(), b.state_hash());
        assert_eq!(a.canonical_bytes().unwrap(), b.canonical_bytes().unwrap());
        a.check_consistency(Some(5)).unwrap();
        assert!(a.check_consistency(Some(4)).is_err());
    }

    #[test]
    fn views_are_frozen() {
        let mut world = world_with_map();
        let view = world.view(MapId(1)).unwrap();
        world
            .apply(&Command::edit(
                editor(),
                EditOp::SetTile {
                    map: MapId(1),
                    at: TileCoord::new(0, 0),
                    patch: TilePatch::terrain(Terrain::Grass),
                },
            ))
            .unwrap();
        assert_eq!(view.tile(TileCoord::new(0, 0)).unwrap().terrain, Terrain::Void);
        assert_eq!(view.revision, 1);
        assert_eq!(world.map(MapId(1)).unwrap().revision, 2);
    }

    #[test]
    fn counters_never_repeat() {
        let counters = Counters::default();
        let a = counters.allocate_entity();
        counters.reserve(EntityId(40));
        let b = counters.allocate_entity();
        assert_eq!(a, EntityId(1));
        assert_eq!(b, EntityId(41));
        assert_eq!(counters.next_commit(), 1);
        counters.observe_commit(10);
        assert_eq!(counters.next_commit(), 11);
    }
}
