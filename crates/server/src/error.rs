use liveworld_common::SessionId;
use liveworld_interest::InterestError;
use liveworld_persist::PersistError;
use liveworld_pipeline::PipelineError;
use liveworld_script::ScriptError;

use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error(transparent)]
    Interest(#[from] InterestError),
    #[error("{0} is not known to the session directory")]
    UnknownSession(SessionId),
    #[error("{0} is already connected")]
    AlreadyConnected(SessionId),
    #[error("{0} is not connected")]
    NotConnected(SessionId),
    #[error("failed to spawn dispatcher: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine is shutting down")]
    Stopped,
}
