use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use liveworld_common::ShardId;
use liveworld_kernel::{Rules, World};

/// One ordering domain: a partition of the world behind a mutex.
#[derive(Debug)]
pub struct Shard {
    id: ShardId,
    world: Mutex<World>,
}

impl Shard {
    pub fn new(id: ShardId, world: World) -> Self {
        Self {
            id,
            world: Mutex::new(world),
        }
    }

    pub fn id(&self) -> ShardId {
        self.id
    }

    /// Lock the shard's world. A worker that panicked mid-command cannot
    /// have left a partial mutation behind, so a poisoned lock is reused.
    pub fn lock(&self) -> MutexGuard<'_, World> {
        self.world.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(shard = %self.id, "recovering poisoned shard lock");
            poisoned.into_inner()
        })
    }
}

/// Registry of shards, created on first use.
///
/// Never touched while a shard lock is held, so registry and shard locks
/// cannot deadlock.
#[derive(Debug, Default)]
pub struct ShardSet {
    shards: RwLock<BTreeMap<ShardId, Arc<Shard>>>,
    rules: Rules,
}

impl ShardSet {
    pub fn new(rules: Rules) -> Self {
        Self {
            shards: RwLock::default(),
            rules,
        }
    }

    pub fn get(&self, id: ShardId) -> Option<Arc<Shard>> {
        self.shards
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&id)
            .cloned()
    }

    pub fn get_or_create(&self, id: ShardId) -> Arc<Shard> {
        if let Some(shard) = self.get(id) {
            return shard;
        }
        let mut shards = self.shards.write().unwrap_or_else(|p| p.into_inner());
        shards
            .entry(id)
            .or_insert_with(|| {
                tracing::debug!(shard = %id, "creating shard");
                Arc::new(Shard::new(id, World::with_rules(self.rules)))
            })
            .clone()
    }

    /// Replace a shard's contents. Used while restoring persisted state.
    pub fn install(&self, id: ShardId, mut world: World) {
        world.set_rules(self.rules);
        let mut shards = self.shards.write().unwrap_or_else(|p| p.into_inner());
        shards.insert(id, Arc::new(Shard::new(id, world)));
    }

    /// Every shard, in ascending id order.
    pub fn all(&self) -> Vec<Arc<Shard>> {
        self.shards
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shards.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` with every shard locked, in ascending id order.
    pub fn with_all<R>(&self, f: impl FnOnce(&[&World]) -> R) -> R {
        let shards = self.shards.read().unwrap_or_else(|p| p.into_inner());
        let guards: Vec<MutexGuard<'_, World>> = shards.values().map(|s| s.lock()).collect();
        let worlds: Vec<&World> = guards.iter().map(|g| &**g).collect();
        f(&worlds)
    }
}
