use liveworld_common::MapId;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("command pipeline is shut down")]
    Stopped,
    #[error("{map} appears in more than one shard cluster")]
    OverlappingClusters { map: MapId },
    #[error("failed to spawn shard worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("shard worker {0} panicked")]
    WorkerPanicked(String),
}
