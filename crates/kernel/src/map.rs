use std::collections::BTreeMap;
use std::sync::Arc;

use liveworld_common::{Direction, EntityId, MapId, Position, TileCoord, Version};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;

/// Largest accepted map side, in tiles.
pub const MAX_MAP_SIDE: u32 = 512;

/// Number of graphic layers per tile.
pub const LAYER_COUNT: usize = 5;

/// Ground material of a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Terrain {
    #[default]
    Void,
    Grass,
    Dirt,
    Sand,
    Water,
    Stone,
    Wall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Collision {
    #[default]
    Open,
    Blocked,
}

/// Behaviour fired when an entity steps onto a tile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Trigger {
    Warp {
        map: MapId,
        position: Position,
        facing: Option<Direction>,
    },
    /// Raises a `TriggerFired` delta carrying the tag for scripts to react to.
    Script { tag: String },
}

/// Graphic layers, drawn bottom to top.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Layer {
    Ground,
    Mask,
    Mask2,
    Fringe,
    Fringe2,
}

impl Layer {
    pub const ALL: [Layer; LAYER_COUNT] = [
        Layer::Ground,
        Layer::Mask,
        Layer::Mask2,
        Layer::Fringe,
        Layer::Fringe2,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TileAnimation {
    pub frames: u16,
    pub frame_ms: u32,
    pub bouncy: bool,
}

/// Reference into the map's tileset. Interpreting it is the client's business.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Sprite {
    pub sheet_x: i32,
    pub sheet_y: i32,
    pub autotile: bool,
    pub animation: Option<TileAnimation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Tile {
    pub terrain: Terrain,
    pub collision: Collision,
    pub trigger: Option<Trigger>,
    pub layers: [Option<Sprite>; LAYER_COUNT],
    pub version: Version,
}

impl Tile {
    pub fn is_blocked(&self) -> bool {
        self.collision == Collision::Blocked || self.terrain == Terrain::Wall
    }
}

/// Partial tile edit. `None` fields are left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TilePatch {
    pub terrain: Option<Terrain>,
    pub collision: Option<Collision>,
    /// `Some(None)` clears the trigger.
    pub trigger: Option<Option<Trigger>>,
    pub layer: Option<(Layer, Option<Sprite>)>,
}

impl TilePatch {
    pub fn terrain(terrain: Terrain) -> Self {
        Self {
            terrain: Some(terrain),
            ..Self::default()
        }
    }

    pub fn collision(collision: Collision) -> Self {
        Self {
            collision: Some(collision),
            ..Self::default()
        }
    }

    pub fn trigger(trigger: Option<Trigger>) -> Self {
        Self {
            trigger: Some(trigger),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.terrain.is_none()
            && self.collision.is_none()
            && self.trigger.is_none()
            && self.layer.is_none()
    }

    pub(crate) fn apply_to(&self, tile: &mut Tile) {
        if let Some(terrain) = self.terrain {
            tile.terrain = terrain;
        }
        if let Some(collision) = self.collision {
            tile.collision = collision;
        }
        if let Some(trigger) = &self.trigger {
            tile.trigger = trigger.clone();
        }
        if let Some((layer, sprite)) = self.layer {
            tile.layers[layer.index()] = sprite;
        }
    }
}

/// Neighbouring maps reached by walking off an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EdgeLinks {
    pub north: Option<MapId>,
    pub east: Option<MapId>,
    pub south: Option<MapId>,
    pub west: Option<MapId>,
}

impl EdgeLinks {
    pub fn get(&self, edge: Direction) -> Option<MapId> {
        match edge {
            Direction::North => self.north,
            Direction::East => self.east,
            Direction::South => self.south,
            Direction::West => self.west,
        }
    }

    pub fn set(&mut self, edge: Direction, map: Option<MapId>) {
        match edge {
            Direction::North => self.north = map,
            Direction::East => self.east = map,
            Direction::South => self.south = map,
            Direction::West => self.west = map,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Direction, MapId)> + '_ {
        Direction::ALL
            .into_iter()
            .filter_map(|edge| self.get(edge).map(|map| (edge, map)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapSettings {
    pub name: String,
    pub tileset: String,
    pub music: Option<String>,
    pub edges: EdgeLinks,
}

impl Default for MapSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            tileset: String::from("default.png"),
            music: None,
            edges: EdgeLinks::default(),
        }
    }
}

/// Everything a shard owns for one map: the tile grid and the entities located on it.
///
/// Entities live with their map so that a map can be copied on write as a unit.
/// The set of entity ids on a map is exactly the key set of `entities`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapState {
    pub id: MapId,
    pub width: u32,
    pub height: u32,
    pub settings: MapSettings,
    /// Bumped by settings edits and creation.
    pub version: Version,
    /// Bumped once per applied command touching this map. Orders deltas within the scope.
    pub revision: u64,
    /// Version every tile started from. Tiles above it have been edited.
    #[serde(default)]
    pub base: Version,
    tiles: Arc<Vec<Tile>>,
    pub(crate) entities: BTreeMap<EntityId, Entity>,
}

impl MapState {
    pub fn new(id: MapId, width: u32, height: u32, settings: MapSettings) -> Self {
        let len = width as usize * height as usize;
        Self {
            id,
            width,
            height,
            settings,
            version: Version(1),
            revision: 0,
            base: Version::ZERO,
            tiles: Arc::new(vec![Tile::default(); len]),
            entities: BTreeMap::new(),
        }
    }

    /// Blank map as described by a creation summary.
    pub fn from_summary(summary: &MapSummary) -> Self {
        let mut map = Self::new(summary.id, summary.width, summary.height, summary.settings.clone());
        map.version = summary.version;
        map.rebase(summary.tile_base);
        map
    }

    /// What the map leaves behind when it is removed.
    pub fn retire(&self) -> Retired {
        let floor = self
            .tiles
            .iter()
            .map(|t| t.version)
            .fold(self.version, Version::max);
        Retired {
            floor,
            revision: self.revision,
        }
    }

    /// Start every version of this map above those of a map that held its id before.
    #[must_use]
    pub fn reissued(mut self, retired: &Retired) -> Self {
        let base = retired.floor.next();
        self.version = base;
        self.revision = retired.revision;
        self.rebase(base);
        self
    }

    fn rebase(&mut self, base: Version) {
        self.base = base;
        for tile in Arc::make_mut(&mut self.tiles) {
            tile.version = base;
        }
    }

    /// Replace the whole grid. `tiles` must be row-major and exactly `width * height` long;
    /// every tile takes the map's base version.
    pub(crate) fn fill(&mut self, tiles: Vec<Tile>) {
        let base = self.base;
        self.tiles = Arc::new(
            tiles
                .into_iter()
                .map(|tile| Tile {
                    version: base,
                    ..tile
                })
                .collect(),
        );
    }

    pub fn contains(&self, at: TileCoord) -> bool {
        at.x < self.width && at.y < self.height
    }

    pub fn contains_position(&self, pos: Position) -> bool {
        TileCoord::from_position(pos, self.width, self.height).is_some()
    }

    fn offset(&self, at: TileCoord) -> Option<usize> {
        self.contains(at)
            .then(|| at.y as usize * self.width as usize + at.x as usize)
    }

    pub fn tile(&self, at: TileCoord) -> Option<&Tile> {
        self.offset(at).and_then(|i| self.tiles.get(i))
    }

    pub fn tile_at(&self, pos: Position) -> Option<&Tile> {
        TileCoord::from_position(pos, self.width, self.height).and_then(|at| self.tile(at))
    }

    /// Mutable tile access; clones the grid first if a frozen view still shares it.
    pub(crate) fn tile_mut(&mut self, at: TileCoord) -> Option<&mut Tile> {
        let i = self.offset(at)?;
        Arc::make_mut(&mut self.tiles).get_mut(i)
    }

    /// Tiles in row-major order with their coordinates.
    pub fn tiles(&self) -> impl Iterator<Item = (TileCoord, &Tile)> + '_ {
        let width = self.width.max(1);
        self.tiles
            .iter()
            .enumerate()
            .map(move |(i, tile)| (TileCoord::new(i as u32 % width, i as u32 / width), tile))
    }

    /// Tiles edited since the map was created or last replaced.
    pub fn edited_tiles(&self) -> impl Iterator<Item = (TileCoord, &Tile)> + '_ {
        self.tiles().filter(|(_, tile)| tile.version > self.base)
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn entities(&self) -> &BTreeMap<EntityId, Entity> {
        &self.entities
    }

    pub fn entity_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.keys().copied()
    }

    pub fn player_count(&self) -> usize {
        self.entities.values().filter(|e| e.is_player()).count()
    }

    pub fn is_blocked(&self, pos: Position) -> bool {
        self.tile_at(pos).is_none_or(Tile::is_blocked)
    }

    /// Whether two views share the same tile grid allocation.
    pub fn shares_tiles_with(&self, other: &MapState) -> bool {
        Arc::ptr_eq(&self.tiles, &other.tiles)
    }
}

/// Tombstone of a removed map. A map later created under the same id starts
/// its versions above `floor`, so preconditions taken on the old map go stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retired {
    /// Highest version the map or any of its tiles reached.
    pub floor: Version,
    pub revision: u64,
}

/// Lightweight description of a map, sent when it is created and listed to editors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapSummary {
    pub id: MapId,
    pub width: u32,
    pub height: u32,
    pub settings: MapSettings,
    pub version: Version,
    /// Version of every tile the map was created with.
    #[serde(default)]
    pub tile_base: Version,
}

impl From<&MapState> for MapSummary {
    fn from(map: &MapState) -> Self {
        Self {
            id: map.id,
            width: map.width,
            height: map.height,
            settings: map.settings.clone(),
            version: map.version,
            tile_base: map.base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::IVec2;

    #[test]
    fn new_map_has_blank_tiles() {
        let map = MapState::new(MapId(1), 4, 3, MapSettings::default());
        assert_eq!(map.tiles().count(), 12);
        assert_eq!(map.tile(TileCoord::new(3, 2)), Some(&Tile::default()));
        assert!(map.tile(TileCoord::new(4, 0)).is_none());
        assert_eq!(map.edited_tiles().count(), 0);
    }

    #[test]
    fn tile_iteration_is_row_major() {
        let map = MapState::new(MapId(1), 3, 2, MapSettings::default());
        let coords: Vec<TileCoord> = map.tiles().map(|(at, _)| at).collect();
        assert_eq!(coords[1], TileCoord::new(1, 0));
        assert_eq!(coords[3], TileCoord::new(0, 1));
    }

    #[test]
    fn patch_only_touches_given_fields() {
        let mut tile = Tile {
            terrain: Terrain::Grass,
            ..Tile::default()
        };
        TilePatch::collision(Collision::Blocked).apply_to(&mut tile);
        assert_eq!(tile.terrain, Terrain::Grass);
        assert_eq!(tile.collision, Collision::Blocked);
        assert!(TilePatch::default().is_empty());
    }

    #[test]
    fn walls_and_outside_positions_block() {
        let mut map = MapState::new(MapId(1), 2, 2, MapSettings::default());
        if let Some(tile) = map.tile_mut(TileCoord::new(1, 1)) {
            tile.terrain = Terrain::Wall;
        }
        assert!(map.is_blocked(IVec2::new(1, 1)));
        assert!(map.is_blocked(IVec2::new(-1, 0)));
        assert!(!map.is_blocked(IVec2::new(0, 0)));
    }

    #[test]
    fn tile_grid_is_copied_on_write() {
        let mut map = MapState::new(MapId(1), 2, 2, MapSettings::default());
        let frozen = map.clone();
        assert!(map.shares_tiles_with(&frozen));

        if let Some(tile) = map.tile_mut(TileCoord::new(0, 0)) {
            tile.terrain = Terrain::Water;
        }
        assert!(!map.shares_tiles_with(&frozen));
        assert_eq!(frozen.tile(TileCoord::new(0, 0)).unwrap().terrain, Terrain::Void);
    }

    #[test]
    fn a_reissued_map_starts_above_everything_its_predecessor_reached() {
        let mut old = MapState::new(MapId(3), 2, 2, MapSettings::default());
        if let Some(tile) = old.tile_mut(TileCoord::new(1, 0)) {
            tile.version = Version(9);
        }
        old.revision = 14;
        let retired = old.retire();
        assert_eq!(retired.floor, Version(9));

        let fresh = MapState::new(MapId(3), 3, 3, MapSettings::default()).reissued(&retired);
        assert_eq!(fresh.version, Version(10));
        assert_eq!(fresh.revision, 14);
        assert!(fresh.tiles().all(|(_, t)| t.version == Version(10)));
        assert_eq!(fresh.edited_tiles().count(), 0);
        assert_eq!(MapState::from_summary(&MapSummary::from(&fresh)), fresh);
    }

    #[test]
    fn edge_links_iterate_only_set_edges() {
        let mut edges = EdgeLinks::default();
        edges.set(Direction::East, Some(MapId(2)));
        let linked: Vec<_> = edges.iter().collect();
        assert_eq!(linked, vec![(Direction::East, MapId(2))]);
    }
}
