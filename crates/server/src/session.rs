use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use liveworld_common::SessionId;
use liveworld_kernel::Origin;

/// A connected session as the engine sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    pub name: String,
    /// Stamped onto every command the session submits.
    pub origin: Origin,
}

/// Connected sessions, shared by the engine front and the dispatcher.
#[derive(Debug, Default)]
pub(crate) struct SessionTable {
    entries: Mutex<BTreeMap<SessionId, SessionEntry>>,
}

impl SessionTable {
    fn entries(&self) -> MutexGuard<'_, BTreeMap<SessionId, SessionEntry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// False when the session is already present.
    pub fn insert(&self, session: SessionId, entry: SessionEntry) -> bool {
        let mut entries = self.entries();
        if entries.contains_key(&session) {
            return false;
        }
        entries.insert(session, entry);
        true
    }

    pub fn get(&self, session: SessionId) -> Option<SessionEntry> {
        self.entries().get(&session).cloned()
    }

    pub fn remove(&self, session: SessionId) -> Option<SessionEntry> {
        self.entries().remove(&session)
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.entries().keys().copied().collect()
    }
}
