use liveworld_kernel::{Command, Delta, ScriptOp};

/// Verdict of a pre-apply hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookDecision {
    Allow,
    Deny(String),
    /// Apply this command instead. Must target the same scope.
    Rewrite(Command),
}

/// Handed to [`ScriptHooks::on_delta_applied`] for issuing follow-up commands.
#[derive(Debug, Default)]
pub struct ScriptContext {
    queued: Vec<ScriptOp>,
}

impl ScriptContext {
    /// Queue a command. It goes through the pipeline like any other and is
    /// applied after the current batch, never inline.
    pub fn enqueue(&mut self, op: ScriptOp) {
        self.queued.push(op);
    }

    pub(crate) fn take(&mut self) -> Vec<ScriptOp> {
        std::mem::take(&mut self.queued)
    }
}

/// Callbacks implemented by the scripting engine.
///
/// Runs on the bridge's own thread; implementations may block or panic
/// without stalling a shard.
pub trait ScriptHooks: Send + 'static {
    fn on_command_pre(&mut self, _cmd: &Command) -> HookDecision {
        HookDecision::Allow
    }

    fn on_delta_applied(&mut self, _delta: &Delta, _ctx: &mut ScriptContext) {}
}

/// Allows everything and observes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullHooks;

impl ScriptHooks for NullHooks {}
