use std::collections::BTreeMap;

use liveworld_common::{Privilege, SessionId};

/// What the session directory knows about a connecting session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionProfile {
    pub name: String,
    pub privilege: Privilege,
}

/// Authentication boundary. Consulted once, when a session connects.
pub trait SessionDirectory: Send + Sync {
    fn lookup(&self, session: SessionId) -> Option<SessionProfile>;
}

/// A fixed table of sessions.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    entries: BTreeMap<SessionId, SessionProfile>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, session: SessionId, name: &str, privilege: Privilege) -> Self {
        self.insert(session, name, privilege);
        self
    }

    pub fn insert(&mut self, session: SessionId, name: &str, privilege: Privilege) {
        self.entries.insert(
            session,
            SessionProfile {
                name: name.to_string(),
                privilege,
            },
        );
    }
}

impl SessionDirectory for StaticDirectory {
    fn lookup(&self, session: SessionId) -> Option<SessionProfile> {
        self.entries.get(&session).cloned()
    }
}
