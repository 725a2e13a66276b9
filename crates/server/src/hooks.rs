use std::sync::Arc;

use liveworld_kernel::{ApplyError, Command, Delta};
use liveworld_persist::SnapshotManager;
use liveworld_pipeline::{Applied, PipelineHooks};
use liveworld_script::ScriptBridge;
use tracing::{debug, error};

use crate::dispatch::{DispatchSender, Message};

/// Connects the pipeline to the script bridge, the command log and the dispatcher.
pub(crate) struct EngineHooks {
    pub bridge: Arc<ScriptBridge>,
    pub log: Option<Arc<SnapshotManager>>,
    pub dispatch: DispatchSender,
}

impl PipelineHooks for EngineHooks {
    fn admit(&self, cmd: Command) -> Result<Command, ApplyError> {
        self.bridge.pre(cmd)
    }

    fn applied(&self, applied: Applied) {
        if let Some(log) = &self.log
            && let Err(err) = log.append(applied.commit, &applied.command)
        {
            error!(
                commit = applied.commit,
                command = applied.command.name(),
                %err,
                "applied command could not be logged"
            );
        }
        debug!(
            commit = applied.commit,
            command = applied.command.name(),
            session = %applied.command.origin.session,
            deltas = applied.deltas.len(),
            "command applied"
        );
        self.dispatch.send(Message::Batch(applied.deltas));
    }

    fn rejected(&self, _cmd: &Command, delta: Delta) {
        self.dispatch.send(Message::Batch(vec![delta]));
    }
}
