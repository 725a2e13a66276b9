use std::fmt;

use liveworld_common::{EntityId, MapId, TileCoord, Version};
use liveworld_kernel::{Entity, EntityKind, MapState, Terrain, World};

/// World inspector for developer tooling.
///
/// Read-only queries over a captured world or a frozen map view. Nothing
/// here touches a live shard.
pub struct WorldInspector;

impl WorldInspector {
    pub fn summary(world: &World) -> WorldSummary {
        let mut summary = WorldSummary {
            maps: world.map_count(),
            state_hash: world.state_hash(),
            ..WorldSummary::default()
        };
        for entity in world.entities() {
            match entity.kind {
                EntityKind::Player { .. } => summary.players += 1,
                EntityKind::Npc { .. } => summary.npcs += 1,
                EntityKind::Item { .. } => summary.items += 1,
            }
        }
        summary
    }

    pub fn inspect_map(world: &World, id: MapId) -> Option<MapInfo> {
        world.map(id).map(MapInfo::from)
    }

    pub fn inspect_entity(world: &World, id: EntityId) -> Option<EntityInfo> {
        world.entity(id).map(EntityInfo::from)
    }

    /// Entity ids on `map`, or in the whole world.
    pub fn list_entities(world: &World, map: Option<MapId>) -> Vec<EntityId> {
        match map {
            Some(map) => world
                .map(map)
                .map(|m| m.entity_ids().collect())
                .unwrap_or_default(),
            None => world.entities().map(|e| e.id).collect(),
        }
    }

    /// One character per tile, one line per row. Entities are drawn over
    /// terrain: `@` player, `n` npc, `*` item lying on the ground.
    pub fn render_map(map: &MapState) -> String {
        let width = map.width as usize;
        let mut rows: Vec<Vec<char>> = (0..map.height)
            .map(|y| {
                (0..map.width)
                    .map(|x| {
                        map.tile(TileCoord::new(x, y))
                            .map_or('?', |tile| terrain_glyph(tile.terrain))
                    })
                    .collect()
            })
            .collect();
        for entity in map.entities().values() {
            let glyph = match entity.kind {
                EntityKind::Player { .. } => '@',
                EntityKind::Npc { .. } => 'n',
                EntityKind::Item { holder: None, .. } => '*',
                EntityKind::Item { .. } => continue,
            };
            if let Some(at) = TileCoord::from_position(entity.position, map.width, map.height) {
                rows[at.y as usize][at.x as usize] = glyph;
            }
        }
        let mut out = String::with_capacity((width + 1) * rows.len());
        for row in rows {
            out.extend(row);
            out.push('\n');
        }
        out
    }
}

fn terrain_glyph(terrain: Terrain) -> char {
    match terrain {
        Terrain::Void => '.',
        Terrain::Grass => '"',
        Terrain::Dirt => ':',
        Terrain::Sand => '_',
        Terrain::Water => '~',
        Terrain::Stone => '^',
        Terrain::Wall => '#',
    }
}

/// Counts over the whole world.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorldSummary {
    pub maps: usize,
    pub players: usize,
    pub npcs: usize,
    pub items: usize,
    pub state_hash: u64,
}

impl WorldSummary {
    pub fn entities(&self) -> usize {
        self.players + self.npcs + self.items
    }
}

impl fmt::Display for WorldSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "World: maps={} entities={} (players={} npcs={} items={}) hash={:#018x}",
            self.maps,
            self.entities(),
            self.players,
            self.npcs,
            self.items,
            self.state_hash
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapInfo {
    pub id: MapId,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub version: Version,
    pub revision: u64,
    pub edited_tiles: usize,
    pub players: usize,
    pub entities: usize,
    pub edges: Vec<String>,
}

impl From<&MapState> for MapInfo {
    fn from(map: &MapState) -> Self {
        Self {
            id: map.id,
            name: map.settings.name.clone(),
            width: map.width,
            height: map.height,
            version: map.version,
            revision: map.revision,
            edited_tiles: map.edited_tiles().count(),
            players: map.player_count(),
            entities: map.entities().len(),
            edges: map
                .settings
                .edges
                .iter()
                .map(|(dir, to)| format!("{dir}->{to}"))
                .collect(),
        }
    }
}

impl fmt::Display for MapInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:?} {}x{} v{} rev={} edited={} entities={} players={}",
            self.id,
            self.name,
            self.width,
            self.height,
            self.version.0,
            self.revision,
            self.edited_tiles,
            self.entities,
            self.players
        )?;
        if !self.edges.is_empty() {
            write!(f, " edges=[{}]", self.edges.join(", "))?;
        }
        Ok(())
    }
}

/// Detailed info about a single entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityInfo {
    pub id: EntityId,
    pub map: MapId,
    pub kind: &'static str,
    pub name: String,
    pub position: [i32; 2],
    pub version: Version,
    pub holder: Option<EntityId>,
    pub attributes: usize,
}

impl From<&Entity> for EntityInfo {
    fn from(entity: &Entity) -> Self {
        let kind = match entity.kind {
            EntityKind::Player { .. } => "player",
            EntityKind::Npc { .. } => "npc",
            EntityKind::Item { .. } => "item",
        };
        Self {
            id: entity.id,
            map: entity.map,
            kind,
            name: entity.name().to_string(),
            position: entity.position.to_array(),
            version: entity.version,
            holder: entity.holder(),
            attributes: entity.attributes.len(),
        }
    }
}

impl fmt::Display for EntityInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {:?} on {} at ({}, {}) v{}",
            self.id,
            self.kind,
            self.name,
            self.map,
            self.position[0],
            self.position[1],
            self.version.0
        )?;
        if let Some(holder) = self.holder {
            write!(f, " held by {holder}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::IVec2;
    use liveworld_common::SessionId;
    use liveworld_kernel::{
        ActionOp, Command, EdgeLinks, EditOp, MapSettings, Origin, TilePatch,
    };

    fn editor() -> Origin {
        Origin::editor(SessionId(1), None)
    }

    fn world() -> World {
        let mut world = World::new();
        for (id, edges) in [
            (
                1,
                EdgeLinks {
                    east: Some(MapId(2)),
                    ..EdgeLinks::default()
                },
            ),
            (2, EdgeLinks::default()),
        ] {
            world
                .apply(&Command::edit(
                    editor(),
                    EditOp::CreateMap {
                        map: MapId(id),
                        width: 4,
                        height: 3,
                        settings: MapSettings {
                            name: format!("map {id}"),
                            edges,
                            ..MapSettings::default()
                        },
                    },
                ))
                .unwrap();
        }
        world
            .apply(&Command::edit(
                editor(),
                EditOp::SetTile {
                    map: MapId(1),
                    at: TileCoord::new(3, 0),
                    patch: TilePatch::terrain(Terrain::Water),
                },
            ))
            .unwrap();
        world
            .apply(&Command::edit(
                editor(),
                EditOp::SpawnNpc {
                    map: MapId(1),
                    id: Some(EntityId(20)),
                    position: IVec2::new(1, 1),
                    name: "guard".into(),
                    behavior: "patrol".into(),
                },
            ))
            .unwrap();
        world
            .apply(&Command::action(
                Origin::player(SessionId(2), EntityId(21)),
                ActionOp::Enter {
                    name: "cy".into(),
                    map: MapId(1),
                    position: IVec2::new(0, 2),
                },
            ))
            .unwrap();
        world
    }

    #[test]
    fn summary_counts_entities_by_kind() {
        let world = world();
        let summary = WorldInspector::summary(&world);
        assert_eq!(summary.maps, 2);
        assert_eq!(summary.players, 1);
        assert_eq!(summary.npcs, 1);
        assert_eq!(summary.items, 0);
        assert_eq!(summary.state_hash, world.state_hash());
        assert!(summary.to_string().contains("entities=2"));
    }

    #[test]
    fn summary_empty_world() {
        let summary = WorldInspector::summary(&World::new());
        assert_eq!(summary.maps, 0);
        assert_eq!(summary.entities(), 0);
    }

    #[test]
    fn inspect_map_reports_edits_and_edges() {
        let world = world();
        let info = WorldInspector::inspect_map(&world, MapId(1)).unwrap();
        assert_eq!(info.name, "map 1");
        assert_eq!((info.width, info.height), (4, 3));
        assert_eq!(info.edited_tiles, 1);
        assert_eq!(info.entities, 2);
        assert_eq!(info.players, 1);
        assert_eq!(info.edges.len(), 1);
        assert!(WorldInspector::inspect_map(&world, MapId(9)).is_none());
    }

    #[test]
    fn inspect_entity_found_and_missing() {
        let world = world();
        let info = WorldInspector::inspect_entity(&world, EntityId(20)).unwrap();
        assert_eq!(info.kind, "npc");
        assert_eq!(info.name, "guard");
        assert_eq!(info.position, [1, 1]);
        assert_eq!(info.map, MapId(1));
        assert!(WorldInspector::inspect_entity(&world, EntityId(99)).is_none());
    }

    #[test]
    fn list_entities_per_map_and_world() {
        let world = world();
        let on_map = WorldInspector::list_entities(&world, Some(MapId(1)));
        assert_eq!(on_map, vec![EntityId(20), EntityId(21)]);
        assert!(WorldInspector::list_entities(&world, Some(MapId(2))).is_empty());
        assert_eq!(WorldInspector::list_entities(&world, None).len(), 2);
    }

    #[test]
    fn render_draws_terrain_under_entities() {
        let world = world();
        let picture = WorldInspector::render_map(world.map(MapId(1)).unwrap());
        assert_eq!(picture, "...~\n.n..\n@...\n");
    }
}
