use std::collections::BTreeMap;
use std::sync::RwLock;

use liveworld_common::{EntityId, MapId, ShardId};
use liveworld_kernel::{Delta, DeltaKind, World};

use crate::error::PipelineError;

/// Routes maps to shards. A map belongs to its own shard unless it is part
/// of a configured cluster, in which case the cluster's lowest map id names
/// the shard.
#[derive(Debug, Clone, Default)]
pub struct ShardMap {
    clusters: BTreeMap<MapId, ShardId>,
}

impl ShardMap {
    pub fn new(clusters: &[Vec<MapId>]) -> Result<Self, PipelineError> {
        let mut map = BTreeMap::new();
        for cluster in clusters {
            let Some(lead) = cluster.iter().min() else {
                continue;
            };
            for id in cluster {
                if map.insert(*id, ShardId(lead.0)).is_some() {
                    return Err(PipelineError::OverlappingClusters { map: *id });
                }
            }
        }
        Ok(Self { clusters: map })
    }

    pub fn shard_of(&self, map: MapId) -> ShardId {
        self.clusters
            .get(&map)
            .copied()
            .unwrap_or(ShardId(map.0))
    }
}

/// EntityId to MapId index used to route entity-scoped commands.
///
/// Maintained from committed deltas. It may briefly lag the shards; workers
/// re-check the location under the shard lock and re-route when needed.
#[derive(Debug, Default)]
pub struct EntityDirectory {
    index: RwLock<BTreeMap<EntityId, MapId>>,
}

impl EntityDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn locate(&self, id: EntityId) -> Option<MapId> {
        self.index
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&id)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.index.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn observe(&self, deltas: &[Delta]) {
        let mut index = self.index.write().unwrap_or_else(|p| p.into_inner());
        for delta in deltas {
            match &delta.kind {
                DeltaKind::EntityCreated { entity } => {
                    index.insert(entity.id, delta.scope);
                }
                DeltaKind::EntityRemoved { id, .. } => {
                    if index.get(id) == Some(&delta.scope) {
                        index.remove(id);
                    }
                }
                _ => {}
            }
        }
    }

    /// Index every entity in `world`, keeping existing entries for other maps.
    pub fn index_world(&self, world: &World) {
        let mut index = self.index.write().unwrap_or_else(|p| p.into_inner());
        for entity in world.entities() {
            index.insert(entity.id, entity.map);
        }
    }
}
