//! Engine configuration, loaded from TOML. Every field has a default, so an
//! empty file is a valid configuration.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use glam::IVec2;
use liveworld_broadcast::RetryPolicy;
use liveworld_common::MapId;
use liveworld_interest::InterestConfig;
use liveworld_kernel::{MAX_MAP_SIDE, Rules};
use liveworld_persist::SnapshotPolicy;
use liveworld_pipeline::{Limits, PipelineConfig};
use liveworld_script::{BridgeConfig, ScriptCapabilities};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterestSection {
    pub cell_size: i32,
    pub edge_radius: i32,
}

impl Default for InterestSection {
    fn default() -> Self {
        let d = InterestConfig::default();
        Self {
            cell_size: d.cell_size,
            edge_radius: d.edge_radius,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        let d = RetryPolicy::default();
        Self {
            max_attempts: d.max_attempts,
            base_backoff_ms: d.base_backoff.as_millis() as u64,
            max_backoff_ms: d.max_backoff.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptSection {
    pub hook_timeout_ms: u64,
    pub capabilities: ScriptCapabilities,
    pub notify_capacity: usize,
}

impl Default for ScriptSection {
    fn default() -> Self {
        let d = BridgeConfig::default();
        Self {
            hook_timeout_ms: d.hook_timeout.as_millis() as u64,
            capabilities: d.capabilities,
            notify_capacity: d.notify_capacity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotSection {
    /// Zero disables the timer.
    pub interval_secs: u64,
    /// Zero disables the command-count trigger.
    pub every_commands: u64,
}

impl Default for SnapshotSection {
    fn default() -> Self {
        let d = SnapshotPolicy::default();
        Self {
            interval_secs: d.interval.as_secs(),
            every_commands: d.every_commands,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameplaySection {
    /// Map new avatars enter.
    pub start_map: u64,
    pub start_position: [i32; 2],
    pub max_step: u32,
    pub max_chat_len: usize,
    pub max_name_len: usize,
    pub default_map_size: [u32; 2],
    pub auto_create_maps: bool,
    /// Announce players joining and leaving to everyone.
    pub announce_sessions: bool,
}

impl Default for GameplaySection {
    fn default() -> Self {
        let rules = Rules::default();
        let limits = Limits::default();
        Self {
            start_map: 1,
            start_position: [0, 0],
            max_step: rules.max_step,
            max_chat_len: rules.max_chat_len,
            max_name_len: limits.max_name_len,
            default_map_size: rules.default_map_size,
            auto_create_maps: rules.auto_create_maps,
            announce_sessions: rules.announce_sessions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub worker_threads: usize,
    /// Groups of map ids that share one shard.
    pub shard_clusters: Vec<Vec<u64>>,
    pub interest: InterestSection,
    pub retry: RetrySection,
    pub script: ScriptSection,
    pub snapshot: SnapshotSection,
    pub gameplay: GameplaySection,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            shard_clusters: Vec::new(),
            interest: InterestSection::default(),
            retry: RetrySection::default(),
            script: ScriptSection::default(),
            snapshot: SnapshotSection::default(),
            gameplay: GameplaySection::default(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.worker_threads == 0 {
            return invalid("worker_threads must be at least 1".into());
        }
        let mut seen = BTreeSet::new();
        for map in self.shard_clusters.iter().flatten() {
            if !seen.insert(*map) {
                return invalid(format!("map {map} appears in more than one shard cluster"));
            }
        }
        if self.interest.cell_size <= 0 {
            return invalid("interest.cell_size must be positive".into());
        }
        if self.interest.edge_radius < 0 {
            return invalid("interest.edge_radius must not be negative".into());
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1".into());
        }
        if self.retry.base_backoff_ms > self.retry.max_backoff_ms {
            return invalid("retry.base_backoff_ms exceeds retry.max_backoff_ms".into());
        }
        if self.script.hook_timeout_ms == 0 {
            return invalid("script.hook_timeout_ms must be positive".into());
        }
        if self.script.notify_capacity == 0 {
            return invalid("script.notify_capacity must be positive".into());
        }
        let [w, h] = self.gameplay.default_map_size;
        if w == 0 || h == 0 || w > MAX_MAP_SIDE || h > MAX_MAP_SIDE {
            return invalid(format!(
                "gameplay.default_map_size must be within 1..={MAX_MAP_SIDE}"
            ));
        }
        if self.gameplay.max_step == 0 {
            return invalid("gameplay.max_step must be at least 1".into());
        }
        if self.gameplay.max_name_len == 0 {
            return invalid("gameplay.max_name_len must be at least 1".into());
        }
        Ok(())
    }

    pub fn rules(&self) -> Rules {
        Rules {
            max_step: self.gameplay.max_step,
            max_chat_len: self.gameplay.max_chat_len,
            auto_create_maps: self.gameplay.auto_create_maps,
            default_map_size: self.gameplay.default_map_size,
            announce_sessions: self.gameplay.announce_sessions,
        }
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            workers: self.worker_threads,
            clusters: self
                .shard_clusters
                .iter()
                .map(|cluster| cluster.iter().copied().map(MapId).collect())
                .collect(),
            rules: self.rules(),
            limits: Limits {
                max_chat_len: self.gameplay.max_chat_len,
                max_name_len: self.gameplay.max_name_len,
            },
        }
    }

    pub fn interest(&self) -> InterestConfig {
        InterestConfig {
            cell_size: self.interest.cell_size,
            edge_radius: self.interest.edge_radius,
        }
    }

    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_backoff: Duration::from_millis(self.retry.base_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
        }
    }

    pub fn bridge(&self) -> BridgeConfig {
        BridgeConfig {
            hook_timeout: Duration::from_millis(self.script.hook_timeout_ms),
            capabilities: self.script.capabilities,
            notify_capacity: self.script.notify_capacity,
        }
    }

    pub fn snapshot(&self) -> SnapshotPolicy {
        SnapshotPolicy {
            interval: Duration::from_secs(self.snapshot.interval_secs),
            every_commands: self.snapshot.every_commands,
        }
    }

    pub fn start_map(&self) -> MapId {
        MapId(self.gameplay.start_map)
    }

    pub fn start_position(&self) -> IVec2 {
        IVec2::from_array(self.gameplay.start_position)
    }
}
