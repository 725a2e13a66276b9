use std::collections::BTreeMap;

use liveworld_kernel::{Command, Stamp};

/// Anything ordered by a command stamp.
pub trait Stamped {
    fn stamp(&self) -> Stamp;
}

impl Stamped for Command {
    fn stamp(&self) -> Stamp {
        self.stamp
    }
}

/// Work waiting on a shard worker, released lowest stamp first.
///
/// Stamps are unique, so a second entry with the same stamp replaces the first.
pub struct ShardQueue<T = Command> {
    entries: BTreeMap<Stamp, T>,
}

impl<T> Default for ShardQueue<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T: Stamped> ShardQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: T) {
        self.entries.insert(item.stamp(), item);
    }

    pub fn pop(&mut self) -> Option<T> {
        self.entries.pop_first().map(|(_, item)| item)
    }

    /// Entries in stamp order.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.entries.values()
    }

    /// Remove the entry with `stamp`.
    pub fn take(&mut self, stamp: Stamp) -> Option<T> {
        self.entries.remove(&stamp)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
