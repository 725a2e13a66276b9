//! Snapshot manager over a [`BlobStore`].
//!
//! Layout inside the store:
//! ```text
//! world.meta.json                      - schema versions, world id, latest snapshot, active segment
//! snapshots/00000000000000000042.snap  - header + CBOR/zstd world at commit 42
//! log/00000000000000000043.log         - commands applied after commit 42
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use liveworld_common::WorldId;
use liveworld_kernel::{ApplyError, Command};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::blob::BlobStore;
use crate::error::PersistError;
use crate::log::{LOG_SCHEMA_VERSION, LogRecord, LogStop, encode_record, read_segment, segment_key};
use crate::snapshot::{SNAPSHOT_SCHEMA_VERSION, Snapshot, SnapshotHeader, snapshot_commit};

pub const META_KEY: &str = "world.meta.json";

/// Snapshots kept after pruning, newest first.
const KEEP_SNAPSHOTS: usize = 2;

/// Metadata stored in `world.meta.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldMeta {
    pub world_schema_version: u32,
    pub log_schema_version: u32,
    pub world_id: WorldId,
    pub latest_snapshot: Option<String>,
    pub active_segment: String,
}

/// What [`SnapshotManager::recover`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Commit of the snapshot loaded, zero when starting empty.
    pub snapshot_commit: u64,
    pub replayed: usize,
    /// Last commit in the recovered state.
    pub last_commit: u64,
    /// Commit of the first logged command that failed to replay.
    pub stopped_at: Option<u64>,
    /// Damage that cut the log short.
    pub damage: Option<LogStop>,
}

/// Logged commands after a snapshot, in commit order.
#[derive(Debug, Clone, Default)]
pub struct LogTail {
    pub records: Vec<LogRecord>,
    pub damage: Option<LogStop>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSummary {
    pub key: String,
    pub records: usize,
    pub first_commit: Option<u64>,
    pub last_commit: Option<u64>,
    pub damage: Option<LogStop>,
}

#[derive(Debug, Clone)]
pub struct StoreSummary {
    pub meta: WorldMeta,
    pub snapshots: Vec<(String, Result<SnapshotHeader, String>)>,
    pub segments: Vec<SegmentSummary>,
}

struct LogState {
    meta: WorldMeta,
    /// Highest commit written to each segment.
    segments: BTreeMap<String, u64>,
}

/// Owns the persistent side of one world: snapshots, command log and metadata.
pub struct SnapshotManager {
    blobs: Arc<dyn BlobStore>,
    state: Mutex<LogState>,
}

impl SnapshotManager {
    /// Open a store, creating fresh metadata when it is empty.
    pub fn open(blobs: Arc<dyn BlobStore>) -> Result<Self, PersistError> {
        let meta = match blobs.get(META_KEY)? {
            Some(bytes) => {
                let meta: WorldMeta = serde_json::from_slice(&bytes)?;
                if meta.world_schema_version != SNAPSHOT_SCHEMA_VERSION {
                    return Err(PersistError::SchemaMismatch {
                        what: "world",
                        file_version: meta.world_schema_version,
                        expected_version: SNAPSHOT_SCHEMA_VERSION,
                    });
                }
                if meta.log_schema_version != LOG_SCHEMA_VERSION {
                    return Err(PersistError::SchemaMismatch {
                        what: "log",
                        file_version: meta.log_schema_version,
                        expected_version: LOG_SCHEMA_VERSION,
                    });
                }
                meta
            }
            None => {
                let meta = WorldMeta {
                    world_schema_version: SNAPSHOT_SCHEMA_VERSION,
                    log_schema_version: LOG_SCHEMA_VERSION,
                    world_id: WorldId::new(),
                    latest_snapshot: None,
                    active_segment: segment_key(1),
                };
                blobs.put(META_KEY, &serde_json::to_vec_pretty(&meta)?)?;
                info!(world = %meta.world_id, "created new world store");
                meta
            }
        };

        let mut segments = BTreeMap::new();
        for key in blobs.list("log/")? {
            let high = match blobs.get(&key)? {
                Some(bytes) => read_segment(&key, &bytes)
                    .records
                    .iter()
                    .map(|r| r.commit)
                    .max()
                    .unwrap_or(0),
                None => 0,
            };
            segments.insert(key, high);
        }

        Ok(Self {
            blobs,
            state: Mutex::new(LogState { meta, segments }),
        })
    }

    fn state(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn save_meta(&self, meta: &WorldMeta) -> Result<(), PersistError> {
        self.blobs.put(META_KEY, &serde_json::to_vec_pretty(meta)?)
    }

    pub fn world_id(&self) -> WorldId {
        self.state().meta.world_id
    }

    pub fn meta(&self) -> WorldMeta {
        self.state().meta.clone()
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    /// Durably log an applied command.
    pub fn append(&self, commit: u64, command: &Command) -> Result<(), PersistError> {
        let bytes = encode_record(&LogRecord {
            commit,
            command: command.clone(),
        })?;
        let mut state = self.state();
        let key = state.meta.active_segment.clone();
        self.blobs.append(&key, &bytes)?;
        let high = state.segments.entry(key).or_insert(0);
        *high = (*high).max(commit);
        Ok(())
    }

    /// Start a new log segment for commands after `commit`.
    pub fn rotate(&self, commit: u64) -> Result<String, PersistError> {
        let mut state = self.state();
        let key = segment_key(commit + 1);
        if state.meta.active_segment != key {
            debug!(from = %state.meta.active_segment, to = %key, "rotating command log");
            state.meta.active_segment = key.clone();
            state.segments.entry(key.clone()).or_insert(0);
            self.save_meta(&state.meta)?;
        }
        Ok(key)
    }

    /// Write a snapshot and make it the recovery point, then prune what it supersedes.
    ///
    /// Call [`rotate`](Self::rotate) with the snapshot's commit first, right
    /// after capturing it.
    pub fn write_snapshot(&self, snapshot: &Snapshot) -> Result<String, PersistError> {
        let world_id = self.world_id();
        if snapshot.world_id != world_id {
            return Err(PersistError::WorldMismatch {
                expected: world_id,
                found: snapshot.world_id,
            });
        }
        let key = snapshot.key();
        let bytes = snapshot.encode()?;
        self.blobs.put(&key, &bytes)?;

        let mut state = self.state();
        state.meta.latest_snapshot = Some(key.clone());
        self.save_meta(&state.meta)?;
        info!(
            %key,
            commit = snapshot.commit,
            bytes = bytes.len(),
            maps = snapshot.world.map_count(),
            "snapshot written"
        );
        self.prune(&mut state, snapshot.commit)?;
        Ok(key)
    }

    fn prune(&self, state: &mut LogState, commit: u64) -> Result<(), PersistError> {
        let stale: Vec<String> = state
            .segments
            .iter()
            .filter(|(key, high)| **key != state.meta.active_segment && **high <= commit)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            self.blobs.delete(&key)?;
            state.segments.remove(&key);
            debug!(%key, "pruned log segment");
        }

        let mut snapshots = self.blobs.list("snapshots/")?;
        snapshots.sort_by_key(|key| std::cmp::Reverse(snapshot_commit(key)));
        for key in snapshots.into_iter().skip(KEEP_SNAPSHOTS) {
            if Some(&key) != state.meta.latest_snapshot.as_ref() {
                self.blobs.delete(&key)?;
                debug!(%key, "pruned snapshot");
            }
        }
        Ok(())
    }

    /// Load the snapshot named in the metadata. A missing or damaged snapshot is fatal.
    pub fn load_latest(&self) -> Result<Option<Snapshot>, PersistError> {
        let meta = self.meta();
        let Some(key) = meta.latest_snapshot else {
            return Ok(None);
        };
        let bytes = self
            .blobs
            .get(&key)?
            .ok_or_else(|| PersistError::SnapshotCorrupt {
                key: key.clone(),
                reason: "snapshot blob is missing".into(),
            })?;
        let snapshot = Snapshot::decode(&key, &bytes)?;
        if snapshot.world_id != meta.world_id {
            return Err(PersistError::WorldMismatch {
                expected: meta.world_id,
                found: snapshot.world_id,
            });
        }
        Ok(Some(snapshot))
    }

    /// Logged commands with a commit above `after`.
    ///
    /// Reading stops at the first damaged segment; later segments are ignored.
    pub fn read_log(&self, after: u64) -> Result<LogTail, PersistError> {
        let mut tail = LogTail::default();
        for key in self.blobs.list("log/")? {
            let Some(bytes) = self.blobs.get(&key)? else {
                continue;
            };
            let read = read_segment(&key, &bytes);
            tail.records
                .extend(read.records.into_iter().filter(|r| r.commit > after));
            if read.stop.is_some() {
                tail.damage = read.stop;
                break;
            }
        }
        tail.records.sort_by_key(|r| r.commit);
        tail.records.dedup_by_key(|r| r.commit);
        Ok(tail)
    }

    /// Rebuild state: hand the latest snapshot to `install`, then every later
    /// logged command to `replay` until one fails.
    pub fn recover(
        &self,
        install: impl FnOnce(Snapshot),
        mut replay: impl FnMut(&LogRecord) -> Result<(), ApplyError>,
    ) -> Result<RecoveryReport, PersistError> {
        let snapshot = self.load_latest()?;
        let mut report = RecoveryReport::default();
        if let Some(snapshot) = snapshot {
            report.snapshot_commit = snapshot.commit;
            info!(commit = snapshot.commit, maps = snapshot.world.map_count(), "snapshot loaded");
            install(snapshot);
        }
        report.last_commit = report.snapshot_commit;

        let tail = self.read_log(report.snapshot_commit)?;
        let mut kept = Vec::with_capacity(tail.records.len());
        for record in tail.records {
            if let Err(err) = replay(&record) {
                warn!(commit = record.commit, command = record.command.name(), %err, "replay stopped");
                report.stopped_at = Some(record.commit);
                break;
            }
            report.replayed += 1;
            report.last_commit = record.commit;
            kept.push(record);
        }
        if let Some(damage) = &tail.damage {
            warn!(
                segment = %damage.segment,
                offset = damage.offset,
                reason = %damage.reason,
                "command log damaged; replay stopped at last valid record"
            );
        }
        report.damage = tail.damage;

        if report.stopped_at.is_some() || report.damage.is_some() {
            self.compact(report.snapshot_commit, &kept)?;
        } else {
            self.rotate(report.last_commit)?;
        }
        info!(
            snapshot = report.snapshot_commit,
            replayed = report.replayed,
            last_commit = report.last_commit,
            "recovery finished"
        );
        Ok(report)
    }

    /// Replace the whole log with exactly `records`, so that nothing past a
    /// replay stop is ever read again.
    fn compact(&self, snapshot_commit: u64, records: &[LogRecord]) -> Result<(), PersistError> {
        let key = segment_key(snapshot_commit + 1);
        let mut bytes = Vec::new();
        for record in records {
            bytes.extend(encode_record(record)?);
        }
        self.blobs.put(&key, &bytes)?;

        let mut state = self.state();
        for old in self.blobs.list("log/")? {
            if old != key {
                self.blobs.delete(&old)?;
            }
        }
        state.segments.clear();
        state.segments.insert(
            key.clone(),
            records.last().map_or(0, |r| r.commit),
        );
        state.meta.active_segment = segment_key(records.last().map_or(snapshot_commit, |r| r.commit) + 1);
        let active = state.meta.active_segment.clone();
        state.segments.entry(active).or_insert(0);
        self.save_meta(&state.meta)?;
        warn!(%key, records = records.len(), "command log compacted after recovery stop");
        Ok(())
    }

    /// Headers of every snapshot and record counts of every log segment.
    pub fn summary(&self) -> Result<StoreSummary, PersistError> {
        let mut snapshots = Vec::new();
        for key in self.blobs.list("snapshots/")? {
            let header = match self.blobs.get(&key)? {
                Some(bytes) => Snapshot::header(&key, &bytes).map_err(|e| e.to_string()),
                None => Err("missing".to_string()),
            };
            snapshots.push((key, header));
        }
        let mut segments = Vec::new();
        for key in self.blobs.list("log/")? {
            let bytes = self.blobs.get(&key)?.unwrap_or_default();
            let read = read_segment(&key, &bytes);
            segments.push(SegmentSummary {
                records: read.records.len(),
                first_commit: read.records.iter().map(|r| r.commit).min(),
                last_commit: read.records.iter().map(|r| r.commit).max(),
                damage: read.stop,
                key,
            });
        }
        Ok(StoreSummary {
            meta: self.meta(),
            snapshots,
            segments,
        })
    }

    /// Fully decode every snapshot and segment. Returns one line per problem.
    pub fn verify(&self) -> Result<Vec<String>, PersistError> {
        let mut problems = Vec::new();
        let meta = self.meta();
        for key in self.blobs.list("snapshots/")? {
            let Some(bytes) = self.blobs.get(&key)? else {
                continue;
            };
            match Snapshot::decode(&key, &bytes) {
                Ok(snap) if snap.world_id != meta.world_id => {
                    problems.push(format!("{key}: belongs to world {}", snap.world_id));
                }
                Ok(_) => {}
                Err(err) => problems.push(err.to_string()),
            }
        }
        if let Some(latest) = &meta.latest_snapshot
            && self.blobs.get(latest)?.is_none()
        {
            problems.push(format!("{latest}: named as latest but missing"));
        }
        for key in self.blobs.list("log/")? {
            let bytes = self.blobs.get(&key)?.unwrap_or_default();
            if let Some(stop) = read_segment(&key, &bytes).stop {
                problems.push(format!("{key}: damaged at byte {}: {}", stop.offset, stop.reason));
            }
        }
        Ok(problems)
    }
}

impl std::fmt::Debug for SnapshotManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotManager")
            .field("meta", &self.state().meta)
            .finish()
    }
}
