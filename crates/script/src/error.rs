use liveworld_kernel::ApplyError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
    #[error("hook timed out after {0} ms")]
    Timeout(u64),
    #[error("hook panicked: {0}")]
    Panicked(String),
    #[error("script engine is still busy with a timed-out call")]
    Busy,
    #[error("rewrite changed the command's scope")]
    ScopeChanged,
    #[error("script capability {0} not granted")]
    CapabilityDenied(&'static str),
    #[error("script bridge is stopped")]
    Stopped,
    #[error("failed to spawn script thread: {0}")]
    Spawn(String),
}

impl From<ScriptError> for ApplyError {
    fn from(err: ScriptError) -> Self {
        ApplyError::ScriptFault(err.to_string())
    }
}
