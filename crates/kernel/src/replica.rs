use std::collections::BTreeMap;

use liveworld_common::{EntityId, MapId, Version};

use crate::delta::{Delta, DeltaKind};
use crate::entity::Entity;
use crate::map::MapState;

/// A client-side reflected copy of the maps a session observes.
///
/// Deltas are applied at least once, so applying one whose version is not
/// newer than what the replica holds is a no-op.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Replica {
    maps: BTreeMap<MapId, MapState>,
}

fn newer(entity: Option<&mut Entity>, version: Version) -> Option<&mut Entity> {
    let entity = entity?;
    if entity.version >= version {
        return None;
    }
    entity.version = version;
    Some(entity)
}

impl Replica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(&self, id: MapId) -> Option<&MapState> {
        self.maps.get(&id)
    }

    pub fn map_ids(&self) -> impl Iterator<Item = MapId> + '_ {
        self.maps.keys().copied()
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.maps.values().find_map(|m| m.entity(id))
    }

    /// Apply one delta. Returns whether the replica changed.
    pub fn apply(&mut self, delta: &Delta) -> bool {
        let changed = self.apply_kind(delta);
        if changed {
            if let Some(map) = self.maps.get_mut(&delta.scope) {
                map.revision = map.revision.max(delta.revision);
            }
        }
        changed
    }

    fn apply_kind(&mut self, delta: &Delta) -> bool {
        let scope = delta.scope;
        match &delta.kind {
            DeltaKind::Resync { state } => {
                if self
                    .maps
                    .get(&scope)
                    .is_some_and(|held| held.revision >= state.revision)
                {
                    return false;
                }
                self.maps.insert(scope, (**state).clone());
                true
            }
            DeltaKind::Unsubscribed | DeltaKind::MapRemoved => self.maps.remove(&scope).is_some(),
            DeltaKind::MapCreated { summary } => {
                if self.maps.contains_key(&scope) {
                    return false;
                }
                self.maps.insert(scope, MapState::from_summary(summary));
                true
            }
            DeltaKind::MapReplaced { state } => match self.maps.get(&scope) {
                Some(held) if held.version < state.version => {
                    self.maps.insert(scope, (**state).clone());
                    true
                }
                _ => false,
            },
            DeltaKind::MapSettingsChanged { settings, version } => {
                match self.maps.get_mut(&scope) {
                    Some(map) if map.version < *version => {
                        map.settings = settings.clone();
                        map.version = *version;
                        true
                    }
                    _ => false,
                }
            }
            DeltaKind::TileChanged { at, tile } => {
                let Some(current) = self.maps.get_mut(&scope).and_then(|m| m.tile_mut(*at)) else {
                    return false;
                };
                if current.version >= tile.version {
                    return false;
                }
                *current = tile.clone();
                true
            }
            DeltaKind::EntityCreated { entity } => {
                let Some(map) = self.maps.get_mut(&scope) else {
                    return false;
                };
                if map
                    .entities
                    .get(&entity.id)
                    .is_some_and(|held| held.version >= entity.version)
                {
                    return false;
                }
                map.entities.insert(entity.id, entity.clone());
                true
            }
            DeltaKind::EntityRemoved { id, version, .. } => {
                let Some(map) = self.maps.get_mut(&scope) else {
                    return false;
                };
                if map.entities.get(id).is_some_and(|held| held.version <= *version) {
                    map.entities.remove(id);
                    return true;
                }
                false
            }
            DeltaKind::EntityMoved {
                id,
                position,
                facing,
                version,
            } => {
                let map = self.maps.get_mut(&scope);
                match newer(map.and_then(|m| m.entities.get_mut(id)), *version) {
                    Some(entity) => {
                        entity.position = *position;
                        entity.facing = *facing;
                        true
                    }
                    None => false,
                }
            }
            DeltaKind::AttributeChanged {
                id,
                key,
                value,
                version,
            } => {
                let map = self.maps.get_mut(&scope);
                match newer(map.and_then(|m| m.entities.get_mut(id)), *version) {
                    Some(entity) => {
                        match value {
                            Some(v) => entity.attributes.insert(key.clone(), v.clone()),
                            None => entity.attributes.remove(key),
                        };
                        true
                    }
                    None => false,
                }
            }
            DeltaKind::ItemHeld {
                item,
                holder,
                position,
                version,
            } => {
                let map = self.maps.get_mut(&scope);
                match newer(map.and_then(|m| m.entities.get_mut(item)), *version) {
                    Some(entity) => {
                        entity.set_holder(*holder);
                        entity.position = *position;
                        true
                    }
                    None => false,
                }
            }
            DeltaKind::FlagsChanged { id, flags, version } => {
                let map = self.maps.get_mut(&scope);
                match newer(map.and_then(|m| m.entities.get_mut(id)), *version) {
                    Some(entity) => {
                        entity.set_flags(*flags);
                        true
                    }
                    None => false,
                }
            }
            DeltaKind::TriggerFired { .. }
            | DeltaKind::Chat { .. }
            | DeltaKind::MapList { .. }
            | DeltaKind::Rejected { .. } => false,
        }
    }
}
