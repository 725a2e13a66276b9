//! Per-shard admission by stamp.
//!
//! Every command is enlisted on the shards it is expected to touch. It may
//! start only once it holds the lowest unfinished stamp on each of them, so
//! a command spanning several shards applies after everything stamped
//! earlier on any of them and before anything stamped later.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use liveworld_common::ShardId;
use liveworld_kernel::Stamp;

#[derive(Debug, Default)]
struct Lane {
    /// Unfinished commands expected to touch the shard.
    waiting: BTreeSet<Stamp>,
    /// Highest stamp that has started on the shard.
    started: Option<Stamp>,
}

impl Lane {
    fn runs_next(&self, stamp: Stamp) -> bool {
        self.waiting.first() == Some(&stamp)
    }
}

#[derive(Debug, Default)]
struct State {
    lanes: BTreeMap<ShardId, Lane>,
    /// Workers waiting for some stamp to finish.
    parked: BTreeSet<usize>,
}

/// Orders commands across shards.
#[derive(Debug, Default)]
pub struct Sequencer {
    state: Mutex<State>,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Register a freshly stamped command. Stamps must be enlisted in increasing order.
    pub fn enlist(&self, stamp: Stamp, shards: &BTreeSet<ShardId>) {
        let mut state = self.state();
        for shard in shards {
            state.lanes.entry(*shard).or_default().waiting.insert(stamp);
        }
    }

    /// Add shards to a command discovered to need them while it runs.
    ///
    /// Refused, changing nothing, when one of them already started a later
    /// command: joining it now would apply out of stamp order.
    pub fn extend(&self, stamp: Stamp, shards: &BTreeSet<ShardId>) -> bool {
        let mut state = self.state();
        let passed = shards.iter().any(|shard| {
            state
                .lanes
                .get(shard)
                .and_then(|lane| lane.started)
                .is_some_and(|started| started > stamp)
        });
        if passed {
            return false;
        }
        for shard in shards {
            state.lanes.entry(*shard).or_default().waiting.insert(stamp);
        }
        true
    }

    /// Start the first candidate that is next in line on all of its shards.
    ///
    /// When none is, `worker` is parked and will be named by a later
    /// [`Sequencer::finish`].
    pub fn start_first<'a>(
        &self,
        worker: usize,
        candidates: impl IntoIterator<Item = (Stamp, &'a BTreeSet<ShardId>)>,
    ) -> Option<Stamp> {
        let mut state = self.state();
        for (stamp, shards) in candidates {
            let ready = shards
                .iter()
                .all(|shard| state.lanes.get(shard).is_some_and(|lane| lane.runs_next(stamp)));
            if ready {
                for shard in shards {
                    if let Some(lane) = state.lanes.get_mut(shard) {
                        lane.started = lane.started.max(Some(stamp));
                    }
                }
                return Some(stamp);
            }
        }
        state.parked.insert(worker);
        None
    }

    /// Retire a command. Returns the parked workers, which should be woken.
    pub fn finish(&self, stamp: Stamp, shards: &BTreeSet<ShardId>) -> Vec<usize> {
        let mut state = self.state();
        for shard in shards {
            if let Some(lane) = state.lanes.get_mut(shard) {
                lane.waiting.remove(&stamp);
            }
        }
        std::mem::take(&mut state.parked).into_iter().collect()
    }

    /// Unfinished commands across all shards.
    pub fn outstanding(&self) -> usize {
        let state = self.state();
        let stamps: BTreeSet<&Stamp> = state.lanes.values().flat_map(|l| l.waiting.iter()).collect();
        stamps.len()
    }
}
