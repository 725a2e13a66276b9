//! Background snapshot thread.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use liveworld_kernel::World;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::PersistError;
use crate::snapshot::Snapshot;
use crate::store::SnapshotManager;

/// When to take a snapshot. Zero disables a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotPolicy {
    pub interval: Duration,
    pub every_commands: u64,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            every_commands: 1000,
        }
    }
}

impl SnapshotPolicy {
    /// Only on request and at shutdown.
    pub fn manual() -> Self {
        Self {
            interval: Duration::ZERO,
            every_commands: 0,
        }
    }

    pub fn due(&self, elapsed: Duration, commits: u64) -> bool {
        if commits == 0 {
            return false;
        }
        (!self.interval.is_zero() && elapsed >= self.interval)
            || (self.every_commands > 0 && commits >= self.every_commands)
    }

    fn poll(&self) -> Duration {
        const MAX_POLL: Duration = Duration::from_millis(250);
        if self.interval.is_zero() {
            MAX_POLL
        } else {
            self.interval.min(MAX_POLL)
        }
    }
}

/// A world copied at a commit boundary.
#[derive(Debug, Clone)]
pub struct Captured {
    pub commit: u64,
    pub next_entity: u64,
    pub world: World,
}

/// Where the writer gets the world from.
pub trait SnapshotSource: Send + Sync + 'static {
    fn last_commit(&self) -> u64;

    /// Must not interleave with command application.
    fn capture(&self) -> Captured;
}

type Reply = Sender<Result<Option<String>, PersistError>>;

enum Signal {
    Now(Reply),
    Stop,
}

/// Takes snapshots on a background thread so shard workers never wait on
/// encoding or disk.
pub struct SnapshotWriter {
    tx: Sender<Signal>,
    handle: Option<JoinHandle<()>>,
}

impl SnapshotWriter {
    pub fn start(
        manager: Arc<SnapshotManager>,
        source: Arc<dyn SnapshotSource>,
        policy: SnapshotPolicy,
    ) -> Result<Self, PersistError> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = thread::Builder::new()
            .name("liveworld-snapshot".into())
            .spawn(move || run(manager, source, policy, rx))
            .map_err(|e| PersistError::Spawn(e.to_string()))?;
        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    /// Take a snapshot now. `None` when nothing changed since the last one.
    pub fn snapshot_now(&self) -> Result<Option<String>, PersistError> {
        let (reply, result) = crossbeam_channel::bounded(1);
        self.tx
            .send(Signal::Now(reply))
            .map_err(|_| PersistError::WriterStopped)?;
        result
            .recv()
            .map_err(|_| PersistError::WriterStopped)?
    }

    /// Write a final snapshot and stop.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.tx.send(Signal::Stop);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            error!("snapshot writer panicked");
        }
    }
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Progress {
    commit: u64,
    at: Instant,
}

fn run(
    manager: Arc<SnapshotManager>,
    source: Arc<dyn SnapshotSource>,
    policy: SnapshotPolicy,
    rx: Receiver<Signal>,
) {
    info!(?policy, "snapshot writer started");
    let mut last = Progress {
        commit: source.last_commit(),
        at: Instant::now(),
    };
    loop {
        match rx.recv_timeout(policy.poll()) {
            Ok(Signal::Now(reply)) => {
                let _ = reply.send(take(&manager, source.as_ref(), &mut last));
            }
            Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => {
                if let Err(err) = take(&manager, source.as_ref(), &mut last) {
                    error!(%err, "final snapshot failed");
                }
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                let commits = source.last_commit().saturating_sub(last.commit);
                if policy.due(last.at.elapsed(), commits)
                    && let Err(err) = take(&manager, source.as_ref(), &mut last)
                {
                    error!(%err, "snapshot failed");
                    last.at = Instant::now();
                }
            }
        }
    }
    info!("snapshot writer stopped");
}

fn take(
    manager: &SnapshotManager,
    source: &dyn SnapshotSource,
    last: &mut Progress,
) -> Result<Option<String>, PersistError> {
    let captured = source.capture();
    if captured.commit == last.commit && manager.meta().latest_snapshot.is_some() {
        return Ok(None);
    }
    manager.rotate(captured.commit)?;
    let snapshot = Snapshot::new(
        manager.world_id(),
        captured.commit,
        captured.next_entity,
        captured.world,
    );
    let key = manager.write_snapshot(&snapshot)?;
    *last = Progress {
        commit: captured.commit,
        at: Instant::now(),
    };
    Ok(Some(key))
}
