use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use liveworld_common::{EntityId, MapId, ShardId};
use liveworld_kernel::{
    ActionOp, ApplyError, Command, CommandKind, Counters, Delta, EditOp, MapState, MapSummary,
    Rules, Scope, ScriptOp, Stamp, Target, World,
};

use crate::clock::Stamper;
use crate::error::PipelineError;
use crate::queue::{ShardQueue, Stamped};
use crate::routing::{EntityDirectory, ShardMap};
use crate::sequencer::Sequencer;
use crate::shard::ShardSet;
use crate::validate::{Limits, validate};

/// Times a command may discover new shards to lock before it is given up on.
const MAX_LOCK_ROUNDS: usize = 4;

/// A command that was applied, with the deltas it produced.
#[derive(Debug, Clone)]
pub struct Applied {
    pub commit: u64,
    pub command: Command,
    pub deltas: Vec<Delta>,
}

/// Callbacks the engine plugs into the pipeline.
///
/// `applied` runs while the shard locks of the command are still held, so
/// anything it forwards is ordered exactly like the shard applied it.
pub trait PipelineHooks: Send + Sync + 'static {
    /// Last word before a command is applied. May rewrite it or refuse it.
    /// Called once per command.
    fn admit(&self, cmd: Command) -> Result<Command, ApplyError> {
        Ok(cmd)
    }

    fn applied(&self, applied: Applied);

    /// `delta` is the error reply for the issuing session.
    fn rejected(&self, cmd: &Command, delta: Delta);
}

#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub workers: usize,
    pub clusters: Vec<Vec<MapId>>,
    pub rules: Rules,
    pub limits: Limits,
}

/// Consistent copy of the whole world at a commit boundary.
#[derive(Debug, Clone)]
pub struct Capture {
    pub commit: u64,
    pub next_entity: u64,
    pub world: World,
}

/// A command on its way through the workers.
struct Ticket {
    /// Shard holding the command's scope.
    shard: ShardId,
    /// Shards the command is enlisted on. Always contains `shard`.
    reach: BTreeSet<ShardId>,
    command: Command,
    /// Validated and passed through the admission hook.
    admitted: bool,
    rounds: usize,
}

impl Stamped for Ticket {
    fn stamp(&self) -> Stamp {
        self.command.stamp
    }
}

enum Job {
    Run(Ticket),
    /// Something finished; parked tickets may be able to start.
    Wake,
    Stop,
}

#[derive(Clone, Copy)]
enum Mode {
    Live,
    Replay(u64),
}

enum Outcome {
    Applied(Vec<Delta>),
    Rejected(ApplyError),
    /// The scope entity is held by another shard.
    Moved(ShardId),
    /// Shards the command needs beyond the ones it is enlisted on.
    Widen(BTreeSet<ShardId>),
}

enum Next {
    Done,
    Requeue(Ticket),
}

struct Inner {
    shards: ShardSet,
    routes: ShardMap,
    directory: EntityDirectory,
    counters: Arc<Counters>,
    stamper: Stamper,
    sequencer: Sequencer,
    limits: Limits,
    hooks: Arc<dyn PipelineHooks>,
    senders: Vec<Sender<Job>>,
    /// Serialises stamping with enlisting and sending, so both follow stamp order.
    ingest: Mutex<()>,
    pending: AtomicUsize,
}

/// Orders, routes and applies commands on a pool of shard workers.
pub struct Pipeline {
    inner: Arc<Inner>,
    workers: Vec<JoinHandle<()>>,
}

impl Pipeline {
    pub fn start(
        config: PipelineConfig,
        counters: Arc<Counters>,
        hooks: Arc<dyn PipelineHooks>,
    ) -> Result<Self, PipelineError> {
        let routes = ShardMap::new(&config.clusters)?;
        let count = config.workers.max(1);
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..count).map(|_| crossbeam_channel::unbounded::<Job>()).unzip();

        let inner = Arc::new(Inner {
            shards: ShardSet::new(config.rules),
            routes,
            directory: EntityDirectory::new(),
            counters,
            stamper: Stamper::default(),
            sequencer: Sequencer::new(),
            limits: config.limits,
            hooks,
            senders,
            ingest: Mutex::new(()),
            pending: AtomicUsize::new(0),
        });

        let mut workers = Vec::with_capacity(count);
        for (index, rx) in receivers.into_iter().enumerate() {
            let inner = Arc::clone(&inner);
            let handle = thread::Builder::new()
                .name(format!("liveworld-shard-{index}"))
                .spawn(move || run_worker(index, inner, rx))?;
            workers.push(handle);
        }
        tracing::info!(workers = count, "command pipeline started");
        Ok(Self { inner, workers })
    }

    /// Stamp a command and queue it on its shard.
    ///
    /// Commands that cannot be routed are rejected through the hooks like any
    /// other failed command.
    pub fn submit(&self, mut cmd: Command) -> Result<Stamp, PipelineError> {
        cmd.assign_ids(&self.inner.counters);
        let _order = self.inner.ingest.lock().unwrap_or_else(|p| p.into_inner());
        cmd.stamp = self.inner.stamper.stamp(cmd.origin.session);
        let stamp = cmd.stamp;
        match self.inner.route(&cmd) {
            Ok(shard) => {
                let reach = self.inner.predict(shard, &cmd);
                self.inner.pending.fetch_add(1, Ordering::SeqCst);
                self.inner.sequencer.enlist(stamp, &reach);
                let ticket = Ticket {
                    shard,
                    reach: reach.clone(),
                    command: cmd,
                    admitted: false,
                    rounds: 0,
                };
                if let Err(err) = self.inner.send(ticket) {
                    self.inner.done(stamp, &reach);
                    return Err(err);
                }
            }
            Err(err) => self.inner.reject(&cmd, err),
        }
        Ok(stamp)
    }

    /// Re-apply a logged command synchronously. Hooks are not consulted.
    pub fn replay(&self, commit: u64, cmd: &Command) -> Result<Vec<Delta>, ApplyError> {
        self.inner.stamper.observe(cmd.stamp.time);
        self.inner.reserve_ids(cmd);
        let shard = self.inner.route(cmd)?;
        let mut reach = BTreeSet::from([shard]);
        for _ in 0..MAX_LOCK_ROUNDS {
            match self.inner.apply(shard, &reach, cmd, Mode::Replay(commit)) {
                Outcome::Applied(deltas) => return Ok(deltas),
                Outcome::Rejected(err) => return Err(err),
                Outcome::Moved(_) => return Err(ApplyError::InvalidTarget(target_of(cmd))),
                Outcome::Widen(extra) => reach.extend(extra),
            }
        }
        Err(unsettled())
    }

    /// Load a restored world, replacing the shards it covers.
    pub fn install(&self, world: World) {
        self.inner.directory.index_world(&world);
        for entity in world.entities() {
            self.inner.counters.reserve(entity.id);
        }
        let routes = &self.inner.routes;
        for (shard, part) in world.split(|map| routes.shard_of(map)) {
            self.inner.shards.install(shard, part);
        }
    }

    /// Frozen view of a map.
    pub fn view(&self, map: MapId) -> Option<Arc<MapState>> {
        let shard = self.inner.shards.get(self.inner.routes.shard_of(map))?;
        let world = shard.lock();
        world.view(map)
    }

    /// Every map, in id order. Shards are read one after another, so the
    /// list is not a consistent cut.
    pub fn map_summaries(&self) -> Vec<MapSummary> {
        let mut maps = Vec::new();
        for shard in self.inner.shards.all() {
            let world = shard.lock();
            maps.extend(world.views().iter().map(|view| MapSummary::from(view.as_ref())));
        }
        maps.sort_by_key(|m| m.id);
        maps
    }

    pub fn locate(&self, entity: EntityId) -> Option<MapId> {
        self.inner.directory.locate(entity)
    }

    pub fn shard_of(&self, map: MapId) -> ShardId {
        self.inner.routes.shard_of(map)
    }

    /// Copy the whole world with every shard locked, so no command is half in.
    pub fn capture(&self) -> Capture {
        let counters = &self.inner.counters;
        self.inner.shards.with_all(|worlds| Capture {
            commit: counters.last_commit(),
            next_entity: counters.entity_high_water(),
            world: World::merge(worlds.iter().map(|w| (*w).clone())),
        })
    }

    /// Commands submitted but not yet applied or rejected.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.inner.counters
    }

    pub fn shard_count(&self) -> usize {
        self.inner.shards.len()
    }

    /// Stop the workers after they finish what is already queued.
    pub fn shutdown(mut self) -> Result<(), PipelineError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), PipelineError> {
        for tx in &self.inner.senders {
            let _ = tx.send(Job::Stop);
        }
        let mut result = Ok(());
        for handle in self.workers.drain(..) {
            let name = handle.thread().name().unwrap_or("shard").to_string();
            if handle.join().is_err() {
                tracing::error!(worker = %name, "shard worker panicked");
                result = Err(PipelineError::WorkerPanicked(name));
            }
        }
        tracing::info!("command pipeline stopped");
        result
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            let _ = self.stop();
        }
    }
}

fn target_of(cmd: &Command) -> Target {
    match cmd.scope() {
        Some(Scope::Map(map)) => Target::Map(map),
        Some(Scope::Entity(id)) => Target::Entity(id),
        None => Target::Entity(EntityId(0)),
    }
}

fn unsettled() -> ApplyError {
    ApplyError::ConstraintViolation("world kept changing while locking the command's maps".into())
}

fn panic_reason(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn run_worker(index: usize, inner: Arc<Inner>, rx: Receiver<Job>) {
    tracing::info!(worker = index, "shard worker started");
    let mut queue: ShardQueue<Ticket> = ShardQueue::new();
    let mut stopping = false;
    let accept = |job: Job, queue: &mut ShardQueue<Ticket>, stopping: &mut bool| match job {
        Job::Run(ticket) => queue.push(ticket),
        Job::Wake => {}
        Job::Stop => *stopping = true,
    };
    loop {
        for job in rx.try_iter() {
            accept(job, &mut queue, &mut stopping);
        }
        if queue.is_empty() {
            if stopping {
                break;
            }
        } else {
            let started = inner
                .sequencer
                .start_first(index, queue.iter().map(|t| (t.stamp(), &t.reach)));
            if let Some(ticket) = started.and_then(|stamp| queue.take(stamp)) {
                if let Next::Requeue(ticket) = inner.run(ticket) {
                    queue.push(ticket);
                }
                continue;
            }
        }
        match rx.recv() {
            Ok(job) => accept(job, &mut queue, &mut stopping),
            Err(_) => break,
        }
    }
    tracing::info!(worker = index, "shard worker stopped");
}

impl Inner {
    fn send(&self, ticket: Ticket) -> Result<(), PipelineError> {
        let index = (ticket.shard.0 % self.senders.len() as u64) as usize;
        self.senders[index]
            .send(Job::Run(ticket))
            .map_err(|_| PipelineError::Stopped)
    }

    fn route(&self, cmd: &Command) -> Result<ShardId, ApplyError> {
        let map = match cmd.scope() {
            Some(Scope::Map(map)) => map,
            Some(Scope::Entity(id)) => self
                .directory
                .locate(id)
                .ok_or(ApplyError::InvalidTarget(Target::Entity(id)))?,
            None => {
                return Err(ApplyError::ConstraintViolation(
                    "command has no target scope".into(),
                ));
            }
        };
        Ok(self.routes.shard_of(map))
    }

    /// Shards a command is expected to touch, judged before it runs.
    fn predict(&self, shard: ShardId, cmd: &Command) -> BTreeSet<ShardId> {
        let named = match &cmd.kind {
            CommandKind::Edit(EditOp::Teleport { map, .. })
            | CommandKind::Script(ScriptOp::Edit(EditOp::Teleport { map, .. }))
            | CommandKind::Action(ActionOp::Warp { map, .. }) => Some(*map),
            CommandKind::Action(ActionOp::Give { to, .. }) => self.directory.locate(*to),
            _ => None,
        };
        let mut reach = BTreeSet::from([shard]);
        reach.extend(named.map(|map| self.routes.shard_of(map)));
        reach
    }

    fn scope_map(&self, cmd: &Command) -> MapId {
        match cmd.scope() {
            Some(Scope::Map(map)) => map,
            Some(Scope::Entity(id)) => self.directory.locate(id).unwrap_or(MapId(0)),
            None => MapId(0),
        }
    }

    fn reject(&self, cmd: &Command, err: ApplyError) {
        tracing::warn!(
            command = cmd.name(),
            session = %cmd.origin.session,
            kind = err.kind(),
            %err,
            "command rejected"
        );
        let delta = Delta::rejection(self.scope_map(cmd), cmd.stamp, err);
        self.hooks.rejected(cmd, delta);
    }

    /// Retire a command and wake the workers waiting on it.
    fn done(&self, stamp: Stamp, reach: &BTreeSet<ShardId>) {
        for worker in self.sequencer.finish(stamp, reach) {
            if let Some(tx) = self.senders.get(worker) {
                let _ = tx.send(Job::Wake);
            }
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    fn reserve_ids(&self, cmd: &Command) {
        match &cmd.kind {
            CommandKind::Edit(EditOp::SpawnNpc { id: Some(id), .. })
            | CommandKind::Edit(EditOp::SpawnItem { id: Some(id), .. })
            | CommandKind::Script(ScriptOp::Edit(EditOp::SpawnNpc { id: Some(id), .. }))
            | CommandKind::Script(ScriptOp::Edit(EditOp::SpawnItem { id: Some(id), .. })) => {
                self.counters.reserve(*id);
            }
            CommandKind::Action(ActionOp::Enter { .. }) => {
                if let Some(id) = cmd.origin.avatar {
                    self.counters.reserve(id);
                }
            }
            _ => {}
        }
    }

    /// Run a started ticket. A panic anywhere below rejects the command and
    /// leaves the worker running.
    fn run(&self, ticket: Ticket) -> Next {
        let stamp = ticket.stamp();
        let reach = ticket.reach.clone();
        let command = ticket.command.clone();
        match panic::catch_unwind(AssertUnwindSafe(|| self.execute(ticket))) {
            Ok(next) => next,
            Err(payload) => {
                let reason = panic_reason(payload.as_ref());
                tracing::error!(command = command.name(), %reason, "command panicked");
                self.reject(
                    &command,
                    ApplyError::ConstraintViolation(format!("command aborted: {reason}")),
                );
                self.done(stamp, &reach);
                Next::Done
            }
        }
    }

    fn execute(&self, mut ticket: Ticket) -> Next {
        let _span =
            tracing::debug_span!("command", command = ticket.command.name(), shard = %ticket.shard)
                .entered();
        if !ticket.admitted {
            match self.admit(&ticket.command) {
                Ok(admitted) => {
                    ticket.command = admitted;
                    ticket.admitted = true;
                }
                Err((cmd, err)) => {
                    self.reject(&cmd, err);
                    self.done(ticket.stamp(), &ticket.reach);
                    return Next::Done;
                }
            }
        }
        match self.apply(ticket.shard, &ticket.reach, &ticket.command, Mode::Live) {
            Outcome::Applied(_) => {}
            Outcome::Rejected(err) => self.reject(&ticket.command, err),
            Outcome::Moved(next) => {
                tracing::debug!(from = %ticket.shard, to = %next, "command scope changed shards");
                ticket.shard = next;
                return self.widen(ticket, BTreeSet::from([next]));
            }
            Outcome::Widen(extra) => return self.widen(ticket, extra),
        }
        self.done(ticket.stamp(), &ticket.reach);
        Next::Done
    }

    /// Validation and the admission hook. The error carries the command it refers to.
    fn admit(&self, cmd: &Command) -> Result<Command, (Command, ApplyError)> {
        validate(cmd, &self.limits).map_err(|err| (cmd.clone(), err))?;
        match self.hooks.admit(cmd.clone()) {
            Ok(admitted) if admitted == *cmd => Ok(admitted),
            Ok(rewritten) => match validate(&rewritten, &self.limits) {
                Ok(()) => Ok(rewritten),
                Err(err) => Err((rewritten, err)),
            },
            Err(err) => Err((cmd.clone(), err)),
        }
    }

    /// Enlist a running command on more shards, or give it a fresh stamp
    /// when one of them already moved past it.
    fn widen(&self, mut ticket: Ticket, extra: BTreeSet<ShardId>) -> Next {
        ticket.rounds += 1;
        if ticket.rounds > MAX_LOCK_ROUNDS {
            self.reject(&ticket.command, unsettled());
            self.done(ticket.stamp(), &ticket.reach);
            return Next::Done;
        }
        let extra: BTreeSet<ShardId> = extra.difference(&ticket.reach).copied().collect();
        if extra.is_empty() || self.sequencer.extend(ticket.stamp(), &extra) {
            ticket.reach.extend(extra);
            return Next::Requeue(ticket);
        }

        let old = ticket.stamp();
        for worker in self.sequencer.finish(old, &ticket.reach) {
            if let Some(tx) = self.senders.get(worker) {
                let _ = tx.send(Job::Wake);
            }
        }
        let _order = self.ingest.lock().unwrap_or_else(|p| p.into_inner());
        ticket.command.stamp = self.stamper.stamp(ticket.command.origin.session);
        ticket.reach.extend(extra);
        self.sequencer.enlist(ticket.stamp(), &ticket.reach);
        tracing::debug!(
            command = ticket.command.name(),
            from = ?old,
            to = ?ticket.stamp(),
            "command re-stamped behind work that overtook it"
        );
        Next::Requeue(ticket)
    }

    /// Lock the enlisted shards in ascending order and apply the command.
    fn apply(&self, shard: ShardId, reach: &BTreeSet<ShardId>, cmd: &Command, mode: Mode) -> Outcome {
        let handles: Vec<_> = reach
            .iter()
            .map(|id| self.shards.get_or_create(*id))
            .collect();
        let mut guards: Vec<MutexGuard<'_, World>> = handles.iter().map(|s| s.lock()).collect();
        let order: Vec<ShardId> = reach.iter().copied().collect();
        let Some(primary) = order.iter().position(|s| *s == shard) else {
            return Outcome::Widen(BTreeSet::from([shard]));
        };

        if let Some(Scope::Entity(id)) = cmd.scope()
            && guards[primary].locate(id).is_none()
        {
            return match self.directory.locate(id).map(|m| self.routes.shard_of(m)) {
                Some(next) if next != shard => Outcome::Moved(next),
                _ => Outcome::Rejected(ApplyError::InvalidTarget(Target::Entity(id))),
            };
        }

        let needed: BTreeSet<ShardId> = guards[primary]
            .footprint(cmd, |id| self.directory.locate(id))
            .into_iter()
            .map(|map| self.routes.shard_of(map))
            .filter(|s| !reach.contains(s))
            .collect();
        if !needed.is_empty() {
            return Outcome::Widen(needed);
        }

        let mut parts: Vec<&mut World> = guards.iter_mut().map(|g| &mut **g).collect();
        let home = |map: MapId| {
            let owner = self.routes.shard_of(map);
            order.iter().position(|s| *s == owner).unwrap_or(primary)
        };
        match World::apply_joint(&mut parts, home, cmd) {
            Ok(deltas) => Outcome::Applied(self.commit(cmd, deltas, mode)),
            Err(err) => Outcome::Rejected(err),
        }
    }

    /// Runs under the command's shard locks.
    fn commit(&self, cmd: &Command, mut deltas: Vec<Delta>, mode: Mode) -> Vec<Delta> {
        let commit = match mode {
            Mode::Live => self.counters.next_commit(),
            Mode::Replay(commit) => {
                self.counters.observe_commit(commit);
                commit
            }
        };
        for delta in &mut deltas {
            delta.commit = commit;
        }
        self.directory.observe(&deltas);
        if let Mode::Live = mode {
            self.hooks.applied(Applied {
                commit,
                command: cmd.clone(),
                deltas: deltas.clone(),
            });
        }
        deltas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::IVec2;
    use liveworld_common::{Direction, SessionId, TileCoord};
    use liveworld_kernel::{ChatChannel, DeltaKind, EdgeLinks, MapSettings, Origin, Terrain, TilePatch};
    use std::time::{Duration, Instant};

    type Admit = Box<dyn Fn(Command) -> Result<Command, ApplyError> + Send + Sync>;

    #[derive(Default)]
    struct Recorder {
        applied: Mutex<Vec<Applied>>,
        rejected: Mutex<Vec<Delta>>,
        admitted: Mutex<Vec<&'static str>>,
        admit: Option<Admit>,
    }

    impl Recorder {
        fn admitting(
            admit: impl Fn(Command) -> Result<Command, ApplyError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                admit: Some(Box::new(admit)),
                ..Self::default()
            }
        }
    }

    impl PipelineHooks for Recorder {
        fn admit(&self, cmd: Command) -> Result<Command, ApplyError> {
            self.admitted.lock().unwrap().push(cmd.name());
            match &self.admit {
                Some(admit) => admit(cmd),
                None => Ok(cmd),
            }
        }

        fn applied(&self, applied: Applied) {
            self.applied.lock().unwrap().push(applied);
        }

        fn rejected(&self, _cmd: &Command, delta: Delta) {
            self.rejected.lock().unwrap().push(delta);
        }
    }

    fn start(workers: usize) -> (Pipeline, Arc<Recorder>) {
        start_with(workers, Recorder::default())
    }

    fn start_with(workers: usize, recorder: Recorder) -> (Pipeline, Arc<Recorder>) {
        let hooks = Arc::new(recorder);
        let config = PipelineConfig {
            workers,
            ..PipelineConfig::default()
        };
        let pipeline = Pipeline::start(config, Arc::new(Counters::default()), hooks.clone()).unwrap();
        (pipeline, hooks)
    }

    fn settle(pipeline: &Pipeline) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while pipeline.pending() > 0 {
            assert!(Instant::now() < deadline, "pipeline did not drain");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn editor() -> Origin {
        Origin::editor(SessionId(1), None)
    }

    fn create_map(id: u64) -> Command {
        create_map_with(id, MapSettings::default())
    }

    fn create_map_with(id: u64, settings: MapSettings) -> Command {
        Command::edit(
            editor(),
            EditOp::CreateMap {
                map: MapId(id),
                width: 8,
                height: 8,
                settings,
            },
        )
    }

    fn set_tile(map: u64, x: u32, terrain: Terrain) -> Command {
        Command::edit(
            editor(),
            EditOp::SetTile {
                map: MapId(map),
                at: TileCoord::new(x, 0),
                patch: TilePatch::terrain(terrain),
            },
        )
    }

    /// Creates an avatar for session 1 on `map` at (1, 1).
    fn enter(pipeline: &Pipeline, map: u64) -> Origin {
        let origin = Origin::editor(SessionId(1), Some(pipeline.counters().allocate_entity()));
        pipeline
            .submit(Command::action(
                origin,
                ActionOp::Enter {
                    name: "ed".into(),
                    map: MapId(map),
                    position: IVec2::ONE,
                },
            ))
            .unwrap();
        settle(pipeline);
        origin
    }

    #[test]
    fn commands_on_one_map_apply_in_submission_order() {
        let (pipeline, hooks) = start(3);
        pipeline.submit(create_map(1)).unwrap();
        for x in 0..8 {
            pipeline.submit(set_tile(1, x, Terrain::Sand)).unwrap();
        }
        settle(&pipeline);

        let applied = hooks.applied.lock().unwrap();
        let revisions: Vec<u64> = applied.iter().map(|a| a.deltas[0].revision).collect();
        assert_eq!(revisions, (1..=9).collect::<Vec<_>>());
        let stamps: Vec<Stamp> = applied.iter().map(|a| a.command.stamp).collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
        let commits: Vec<u64> = applied.iter().map(|a| a.commit).collect();
        assert_eq!(commits, (1..=9).collect::<Vec<_>>());
    }

    #[test]
    fn unknown_entity_scope_is_rejected_to_the_session() {
        let (pipeline, hooks) = start(1);
        pipeline
            .submit(Command::action(
                Origin::player(SessionId(8), EntityId(77)),
                ActionOp::Say { text: "hello".into() },
            ))
            .unwrap();
        settle(&pipeline);
        let rejected = hooks.rejected.lock().unwrap();
        assert_eq!(rejected.len(), 1);
        assert!(matches!(
            &rejected[0].kind,
            DeltaKind::Rejected {
                error: ApplyError::InvalidTarget(Target::Entity(EntityId(77)))
            }
        ));
    }

    #[test]
    fn cross_shard_warp_applies_atomically() {
        let (pipeline, hooks) = start(2);
        pipeline.submit(create_map(1)).unwrap();
        pipeline.submit(create_map(2)).unwrap();
        settle(&pipeline);
        let origin = enter(&pipeline, 1);
        pipeline
            .submit(Command::action(
                origin,
                ActionOp::Warp {
                    map: MapId(2),
                    position: Some(IVec2::new(3, 3)),
                },
            ))
            .unwrap();
        settle(&pipeline);

        let avatar = origin.avatar.unwrap();
        assert_eq!(pipeline.locate(avatar), Some(MapId(2)));
        assert!(pipeline.view(MapId(1)).unwrap().entity(avatar).is_none());
        assert!(pipeline.view(MapId(2)).unwrap().entity(avatar).is_some());
        assert!(hooks.rejected.lock().unwrap().is_empty());

        // Warping into a map that cannot hold the position fails on both sides.
        pipeline
            .submit(Command::action(
                origin,
                ActionOp::Warp {
                    map: MapId(1),
                    position: Some(IVec2::new(50, 50)),
                },
            ))
            .unwrap();
        settle(&pipeline);
        assert_eq!(hooks.rejected.lock().unwrap().len(), 1);
        assert_eq!(pipeline.locate(avatar), Some(MapId(2)));
    }

    #[test]
    fn a_warp_applies_after_earlier_work_queued_on_the_target_map() {
        let (pipeline, hooks) = start(2);
        pipeline.submit(create_map(1)).unwrap();
        pipeline.submit(create_map(2)).unwrap();
        settle(&pipeline);
        let origin = enter(&pipeline, 1);

        for i in 0..4000u32 {
            let terrain = if i % 2 == 0 { Terrain::Sand } else { Terrain::Grass };
            pipeline.submit(set_tile(2, i % 8, terrain)).unwrap();
        }
        pipeline
            .submit(Command::action(
                origin,
                ActionOp::Warp {
                    map: MapId(2),
                    position: Some(IVec2::new(3, 3)),
                },
            ))
            .unwrap();
        settle(&pipeline);
        assert!(hooks.rejected.lock().unwrap().is_empty());

        let applied = hooks.applied.lock().unwrap();
        let mut on_target: Vec<(u64, Stamp)> = applied
            .iter()
            .filter_map(|a| {
                a.deltas
                    .iter()
                    .find(|d| d.scope == MapId(2))
                    .map(|d| (d.revision, a.command.stamp))
            })
            .collect();
        on_target.sort_by_key(|(revision, _)| *revision);
        assert!(on_target.windows(2).all(|w| w[0].1 < w[1].1));
        let last = applied.iter().max_by_key(|a| a.command.stamp).unwrap();
        assert_eq!(last.command.name(), "warp");
        assert_eq!(on_target.last().map(|(_, stamp)| *stamp), Some(last.command.stamp));
    }

    #[test]
    fn a_command_that_changes_shards_is_admitted_once() {
        let recorder = Recorder::admitting(|mut cmd| {
            if let CommandKind::Action(ActionOp::Warp { .. }) = &cmd.kind {
                // Give the next command time to be routed by the stale directory.
                std::thread::sleep(Duration::from_millis(20));
            }
            if let CommandKind::Action(ActionOp::Say { text }) = &mut cmd.kind {
                *text = text.to_uppercase();
            }
            Ok(cmd)
        });
        let (pipeline, hooks) = start_with(2, recorder);
        let mut settings = MapSettings::default();
        settings.edges = EdgeLinks {
            east: Some(MapId(3)),
            ..EdgeLinks::default()
        };
        pipeline.submit(create_map_with(1, settings)).unwrap();
        pipeline.submit(create_map(2)).unwrap();
        pipeline.submit(create_map(3)).unwrap();
        settle(&pipeline);
        let origin = enter(&pipeline, 1);
        let avatar = origin.avatar.unwrap();
        hooks.admitted.lock().unwrap().clear();

        pipeline
            .submit(Command::action(
                origin,
                ActionOp::Warp {
                    map: MapId(2),
                    position: Some(IVec2::new(3, 3)),
                },
            ))
            .unwrap();
        pipeline
            .submit(Command::action(origin, ActionOp::Say { text: "hello".into() }))
            .unwrap();
        settle(&pipeline);

        assert_eq!(*hooks.admitted.lock().unwrap(), vec!["warp", "say"]);
        let said: Vec<(MapId, String)> = hooks
            .applied
            .lock()
            .unwrap()
            .iter()
            .flat_map(|a| a.deltas.iter())
            .filter_map(|d| match &d.kind {
                DeltaKind::Chat {
                    text,
                    channel: ChatChannel::Map,
                    ..
                } => Some((d.scope, text.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(said, vec![(MapId(2), "HELLO".to_string())]);

        // Back to map 1, then step off its east edge onto map 3.
        pipeline
            .submit(Command::action(
                origin,
                ActionOp::Warp {
                    map: MapId(1),
                    position: Some(IVec2::new(7, 2)),
                },
            ))
            .unwrap();
        settle(&pipeline);
        hooks.admitted.lock().unwrap().clear();
        pipeline
            .submit(Command::action(
                origin,
                ActionOp::Move {
                    to: IVec2::new(8, 2),
                    facing: Direction::East,
                },
            ))
            .unwrap();
        settle(&pipeline);
        assert_eq!(*hooks.admitted.lock().unwrap(), vec!["move"]);
        assert!(hooks.rejected.lock().unwrap().is_empty());
        assert_eq!(pipeline.locate(avatar), Some(MapId(3)));
        let arrived = pipeline.view(MapId(3)).unwrap();
        assert_eq!(arrived.entity(avatar).unwrap().position, IVec2::new(0, 2));
    }

    #[test]
    fn a_panicking_command_is_rejected_and_the_worker_keeps_going() {
        let recorder = Recorder::admitting(|cmd| {
            if let CommandKind::Edit(EditOp::SetTile { at, .. }) = &cmd.kind
                && at.x == 7
            {
                panic!("tile seven");
            }
            Ok(cmd)
        });
        let (pipeline, hooks) = start_with(1, recorder);
        pipeline.submit(create_map(1)).unwrap();
        settle(&pipeline);
        let origin = enter(&pipeline, 1);

        pipeline
            .submit(Command::action(
                origin,
                ActionOp::Move {
                    to: IVec2::new(i32::MIN + 1, i32::MIN + 1),
                    facing: Direction::North,
                },
            ))
            .unwrap();
        pipeline.submit(set_tile(1, 7, Terrain::Wall)).unwrap();
        pipeline.submit(set_tile(1, 0, Terrain::Sand)).unwrap();
        settle(&pipeline);

        let rejected = hooks.rejected.lock().unwrap();
        assert_eq!(rejected.len(), 2);
        assert!(rejected.iter().all(|d| matches!(
            &d.kind,
            DeltaKind::Rejected {
                error: ApplyError::ConstraintViolation(_)
            }
        )));
        let map = pipeline.view(MapId(1)).unwrap();
        assert_eq!(map.tile(TileCoord::new(0, 0)).unwrap().terrain, Terrain::Sand);
        assert_eq!(map.tile(TileCoord::new(7, 0)).unwrap().terrain, Terrain::Void);
        assert_eq!(map.entity(origin.avatar.unwrap()).unwrap().position, IVec2::ONE);
        assert_eq!(pipeline.pending(), 0);
    }

    #[test]
    fn capture_and_replay_reproduce_the_world() {
        let (pipeline, hooks) = start(2);
        pipeline.submit(create_map(1)).unwrap();
        pipeline.submit(create_map(5)).unwrap();
        pipeline
            .submit(Command::edit(
                editor(),
                EditOp::SpawnNpc {
                    map: MapId(5),
                    id: None,
                    position: IVec2::new(2, 2),
                    name: "keeper".into(),
                    behavior: "idle".into(),
                },
            ))
            .unwrap();
        settle(&pipeline);
        let capture = pipeline.capture();
        assert_eq!(capture.commit, 3);
        assert_eq!(capture.world.map_count(), 2);

        let (replayed, _) = start(1);
        for applied in hooks.applied.lock().unwrap().iter() {
            replayed.replay(applied.commit, &applied.command).unwrap();
        }
        let again = replayed.capture();
        assert_eq!(again.world.state_hash(), capture.world.state_hash());
        assert_eq!(again.commit, capture.commit);
        assert!(again.next_entity >= capture.next_entity);
        assert_eq!(
            replayed.map_summaries().iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![MapId(1), MapId(5)]
        );
    }
}
