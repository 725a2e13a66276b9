use std::collections::{BTreeMap, BTreeSet};

use liveworld_common::{EntityId, MapId, Privilege, SessionId};
use liveworld_kernel::{Audience, Delta, DeltaKind, EdgeLinks, MapState, Removal};
use tracing::debug;

use crate::cell::{CellCoord, CellGrid};
use crate::error::InterestError;

/// Proximity tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterestConfig {
    /// Side of a proximity cell, in tiles.
    pub cell_size: i32,
    /// Distance from a linked edge at which the neighbour map is observed.
    pub edge_radius: i32,
}

impl Default for InterestConfig {
    fn default() -> Self {
        Self {
            cell_size: 8,
            edge_radius: 4,
        }
    }
}

/// The parts of a map interest needs to know about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapGeometry {
    pub width: u32,
    pub height: u32,
    pub edges: EdgeLinks,
}

impl From<&MapState> for MapGeometry {
    fn from(map: &MapState) -> Self {
        Self {
            width: map.width,
            height: map.height,
            edges: map.settings.edges,
        }
    }
}

/// Source of map geometry, usually the pipeline's frozen views.
pub trait Geometry {
    fn geometry(&self, map: MapId) -> Option<MapGeometry>;
}

impl<F> Geometry for F
where
    F: Fn(MapId) -> Option<MapGeometry>,
{
    fn geometry(&self, map: MapId) -> Option<MapGeometry> {
        self(map)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Subscribed,
    Disconnected,
}

/// Where a session's avatar currently is, at cell granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Anchor {
    map: MapId,
    cell: CellCoord,
}

/// Interest state of one session.
#[derive(Debug, Clone)]
pub struct SessionInterest {
    privilege: Privilege,
    phase: Phase,
    avatar: Option<EntityId>,
    anchor: Option<Anchor>,
    maps: BTreeSet<MapId>,
    watched_maps: BTreeSet<MapId>,
    watched_entities: BTreeSet<EntityId>,
}

impl SessionInterest {
    fn new(privilege: Privilege) -> Self {
        Self {
            privilege,
            phase: Phase::Connecting,
            avatar: None,
            anchor: None,
            maps: BTreeSet::new(),
            watched_maps: BTreeSet::new(),
            watched_entities: BTreeSet::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn privilege(&self) -> Privilege {
        self.privilege
    }

    pub fn avatar(&self) -> Option<EntityId> {
        self.avatar
    }

    /// Maps the session currently receives deltas for.
    pub fn maps(&self) -> &BTreeSet<MapId> {
        &self.maps
    }

    pub fn watched_entities(&self) -> &BTreeSet<EntityId> {
        &self.watched_entities
    }
}

/// Difference between a session's old and new map set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterestChange {
    pub session: SessionId,
    /// Maps that need a full resync.
    pub entered: Vec<MapId>,
    /// Maps the session should drop.
    pub left: Vec<MapId>,
}

impl InterestChange {
    pub fn is_empty(&self) -> bool {
        self.entered.is_empty() && self.left.is_empty()
    }
}

/// Tracks, per session, the maps and entities it observes.
#[derive(Debug)]
pub struct InterestManager {
    grid: CellGrid,
    sessions: BTreeMap<SessionId, SessionInterest>,
    avatars: BTreeMap<EntityId, SessionId>,
    subscribers: BTreeMap<MapId, BTreeSet<SessionId>>,
    watchers: BTreeMap<EntityId, BTreeSet<SessionId>>,
}

impl Default for InterestManager {
    fn default() -> Self {
        Self::new(InterestConfig::default())
    }
}

impl InterestManager {
    pub fn new(config: InterestConfig) -> Self {
        Self {
            grid: CellGrid::new(config.cell_size, config.edge_radius),
            sessions: BTreeMap::new(),
            avatars: BTreeMap::new(),
            subscribers: BTreeMap::new(),
            watchers: BTreeMap::new(),
        }
    }

    pub fn grid(&self) -> CellGrid {
        self.grid
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn session(&self, session: SessionId) -> Option<&SessionInterest> {
        self.sessions.get(&session)
    }

    pub fn sessions(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.sessions.keys().copied()
    }

    pub fn connect(&mut self, session: SessionId, privilege: Privilege) -> Result<(), InterestError> {
        if self.sessions.contains_key(&session) {
            return Err(InterestError::AlreadyConnected(session));
        }
        debug!(%session, ?privilege, "session connecting");
        self.sessions.insert(session, SessionInterest::new(privilege));
        Ok(())
    }

    /// Forget a session. Returns its final state, now `Disconnected`.
    pub fn disconnect(&mut self, session: SessionId) -> Option<SessionInterest> {
        let mut state = self.sessions.remove(&session)?;
        for map in &state.maps {
            self.unindex_map(*map, session);
        }
        for entity in &state.watched_entities {
            if let Some(set) = self.watchers.get_mut(entity) {
                set.remove(&session);
                if set.is_empty() {
                    self.watchers.remove(entity);
                }
            }
        }
        if let Some(avatar) = state.avatar {
            self.avatars.remove(&avatar);
        }
        state.phase = Phase::Disconnected;
        debug!(%session, "session disconnected");
        Some(state)
    }

    /// Editor-only: observe a map regardless of where the avatar is.
    pub fn watch_map(
        &mut self,
        session: SessionId,
        map: MapId,
        geometry: &impl Geometry,
    ) -> Result<InterestChange, InterestError> {
        self.editor(session)?.watched_maps.insert(map);
        Ok(self.refresh(session, geometry))
    }

    pub fn unwatch_map(
        &mut self,
        session: SessionId,
        map: MapId,
        geometry: &impl Geometry,
    ) -> Result<InterestChange, InterestError> {
        self.editor(session)?.watched_maps.remove(&map);
        Ok(self.refresh(session, geometry))
    }

    /// Editor-only: receive deltas about one entity wherever it is.
    pub fn watch_entity(&mut self, session: SessionId, entity: EntityId) -> Result<(), InterestError> {
        self.editor(session)?.watched_entities.insert(entity);
        self.watchers.entry(entity).or_default().insert(session);
        Ok(())
    }

    pub fn unwatch_entity(&mut self, session: SessionId, entity: EntityId) -> Result<(), InterestError> {
        self.editor(session)?.watched_entities.remove(&entity);
        if let Some(set) = self.watchers.get_mut(&entity) {
            set.remove(&session);
            if set.is_empty() {
                self.watchers.remove(&entity);
            }
        }
        Ok(())
    }

    fn editor(&mut self, session: SessionId) -> Result<&mut SessionInterest, InterestError> {
        let state = self
            .sessions
            .get_mut(&session)
            .ok_or(InterestError::UnknownSession(session))?;
        if !state.privilege.can_edit() {
            return Err(InterestError::NotEditor(session));
        }
        Ok(state)
    }

    /// Sessions a delta must be delivered to.
    pub fn audience(&self, delta: &Delta) -> BTreeSet<SessionId> {
        match delta.audience {
            Audience::Session(session) => {
                if self.sessions.contains_key(&session) {
                    BTreeSet::from([session])
                } else {
                    BTreeSet::new()
                }
            }
            Audience::Scope => {
                let mut out = self
                    .subscribers
                    .get(&delta.scope)
                    .cloned()
                    .unwrap_or_default();
                if let Some(watchers) = delta.kind.entity().and_then(|id| self.watchers.get(&id)) {
                    out.extend(watchers.iter().copied());
                }
                out
            }
            Audience::World => self.sessions.keys().copied().collect(),
        }
    }

    /// Session controlling an avatar.
    pub fn session_of(&self, avatar: EntityId) -> Option<SessionId> {
        self.avatars.get(&avatar).copied()
    }

    /// Sessions currently subscribed to `map`.
    pub fn subscribers(&self, map: MapId) -> impl Iterator<Item = SessionId> + '_ {
        self.subscribers.get(&map).into_iter().flatten().copied()
    }

    /// Track avatar movement through a batch of applied deltas and return
    /// the resulting interest changes.
    pub fn observe(&mut self, deltas: &[Delta], geometry: &impl Geometry) -> Vec<InterestChange> {
        let _span = tracing::debug_span!("interest_update", deltas = deltas.len()).entered();
        let mut dirty = BTreeSet::new();

        for delta in deltas {
            match &delta.kind {
                DeltaKind::EntityCreated { entity } => {
                    let Some(session) = entity.session() else {
                        continue;
                    };
                    let Some(state) = self.sessions.get_mut(&session) else {
                        continue;
                    };
                    if let Some(old) = state.avatar.replace(entity.id) {
                        self.avatars.remove(&old);
                    }
                    self.avatars.insert(entity.id, session);
                    state.anchor = Some(Anchor {
                        map: delta.scope,
                        cell: self.grid.cell_of(entity.position),
                    });
                    dirty.insert(session);
                }
                DeltaKind::EntityMoved { id, position, .. } => {
                    let Some(&session) = self.avatars.get(id) else {
                        continue;
                    };
                    let cell = self.grid.cell_of(*position);
                    if let Some(state) = self.sessions.get_mut(&session)
                        && let Some(anchor) = state.anchor.as_mut()
                        && anchor.map == delta.scope
                        && anchor.cell != cell
                    {
                        anchor.cell = cell;
                        dirty.insert(session);
                    }
                }
                DeltaKind::EntityRemoved { id, reason, .. } => {
                    let Some(&session) = self.avatars.get(id) else {
                        continue;
                    };
                    let Some(state) = self.sessions.get_mut(&session) else {
                        continue;
                    };
                    if state.anchor.is_some_and(|a| a.map == delta.scope) {
                        state.anchor = None;
                        dirty.insert(session);
                    }
                    if !matches!(reason, Removal::Departed { .. }) {
                        state.avatar = None;
                        self.avatars.remove(id);
                    }
                }
                DeltaKind::MapSettingsChanged { .. }
                | DeltaKind::MapCreated { .. }
                | DeltaKind::MapReplaced { .. } => {
                    // Edge links may now point at a different or newly existing map.
                    for (session, state) in &self.sessions {
                        if state.anchor.is_some() {
                            dirty.insert(*session);
                        }
                    }
                }
                DeltaKind::MapRemoved => {
                    for (session, state) in self.sessions.iter_mut() {
                        if state.watched_maps.remove(&delta.scope) || state.maps.contains(&delta.scope) {
                            dirty.insert(*session);
                        }
                    }
                }
                _ => {}
            }
        }

        dirty
            .into_iter()
            .map(|session| self.refresh(session, geometry))
            .filter(|change| !change.is_empty())
            .collect()
    }

    /// Recompute one session's map set.
    pub fn refresh(&mut self, session: SessionId, geometry: &impl Geometry) -> InterestChange {
        let mut change = InterestChange {
            session,
            entered: Vec::new(),
            left: Vec::new(),
        };
        let Some(state) = self.sessions.get(&session) else {
            return change;
        };

        let desired = self.desired(state, geometry);
        change.entered = desired.difference(&state.maps).copied().collect();
        change.left = state.maps.difference(&desired).copied().collect();

        for map in &change.left {
            self.unindex_map(*map, session);
        }
        for map in &change.entered {
            self.subscribers.entry(*map).or_default().insert(session);
        }
        if let Some(state) = self.sessions.get_mut(&session) {
            state.maps = desired;
            if state.phase == Phase::Connecting && !state.maps.is_empty() {
                state.phase = Phase::Subscribed;
            }
        }
        if !change.is_empty() {
            debug!(
                %session,
                entered = ?change.entered,
                left = ?change.left,
                "interest changed"
            );
        }
        change
    }

    fn desired(&self, state: &SessionInterest, geometry: &impl Geometry) -> BTreeSet<MapId> {
        let mut maps = BTreeSet::new();
        if let Some(anchor) = state.anchor
            && let Some(home) = geometry.geometry(anchor.map)
        {
            maps.insert(anchor.map);
            for edge in self.grid.near_edges(anchor.cell, home.width, home.height) {
                if let Some(neighbour) = home.edges.get(edge)
                    && geometry.geometry(neighbour).is_some()
                {
                    maps.insert(neighbour);
                }
            }
        }
        maps.extend(
            state
                .watched_maps
                .iter()
                .copied()
                .filter(|map| geometry.geometry(*map).is_some()),
        );
        maps
    }

    fn unindex_map(&mut self, map: MapId, session: SessionId) {
        if let Some(set) = self.subscribers.get_mut(&map) {
            set.remove(&session);
            if set.is_empty() {
                self.subscribers.remove(&map);
            }
        }
    }
}
