use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use liveworld_kernel::{ApplyError, Command, Delta};
use tracing::{debug, info, warn};

use crate::capability::ScriptCapabilities;
use crate::error::ScriptError;
use crate::hooks::{HookDecision, ScriptContext, ScriptHooks};

const PENDING: u8 = 0;
const DONE: u8 = 1;
const ABANDONED: u8 = 2;

/// Work the script thread has accepted, for callers waiting on it to go idle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeActivity {
    /// Applied batches queued or being processed.
    pub queued: usize,
    /// Script commands handed to the sink so far.
    pub emitted: u64,
}

#[derive(Debug, Default)]
struct Activity {
    queued: AtomicUsize,
    emitted: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeConfig {
    pub hook_timeout: Duration,
    pub capabilities: ScriptCapabilities,
    /// Applied batches buffered for the script thread before new ones are dropped.
    pub notify_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            hook_timeout: Duration::from_millis(50),
            capabilities: ScriptCapabilities::default(),
            notify_capacity: 1024,
        }
    }
}

enum Call {
    Pre {
        cmd: Command,
        state: Arc<AtomicU8>,
        reply: Sender<Result<HookDecision, ScriptError>>,
    },
    Stop,
}

/// Runs a [`ScriptHooks`] implementation on a dedicated thread.
///
/// Commands the script enqueues are sent to `out` as script commands; the
/// owner feeds them back into the pipeline.
pub struct ScriptBridge {
    calls: Sender<Call>,
    notify: Sender<Vec<Delta>>,
    /// Pre-hook calls that timed out and have not finished yet.
    overdue: Arc<AtomicUsize>,
    activity: Arc<Activity>,
    config: BridgeConfig,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ScriptBridge {
    pub fn start(
        hooks: impl ScriptHooks,
        config: BridgeConfig,
        out: Sender<Command>,
    ) -> Result<Self, ScriptError> {
        let (calls, call_rx) = crossbeam_channel::unbounded();
        let (notify, notify_rx) = crossbeam_channel::bounded(config.notify_capacity.max(1));
        let overdue = Arc::new(AtomicUsize::new(0));
        let activity = Arc::new(Activity::default());

        let worker = {
            let overdue = Arc::clone(&overdue);
            let activity = Arc::clone(&activity);
            let capabilities = config.capabilities;
            thread::Builder::new()
                .name("liveworld-script".into())
                .spawn(move || {
                    run(hooks, call_rx, notify_rx, out, capabilities, overdue, activity)
                })
                .map_err(|err| ScriptError::Spawn(err.to_string()))?
        };
        info!(timeout_ms = config.hook_timeout.as_millis() as u64, "script bridge started");
        Ok(Self {
            calls,
            notify,
            overdue,
            activity,
            config,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Run the pre-apply hook for a session command.
    ///
    /// Returns the command to apply. Script-issued commands skip the hook.
    pub fn pre(&self, cmd: Command) -> Result<Command, ApplyError> {
        if cmd.origin.session.is_system() {
            return Ok(cmd);
        }
        match self.call_pre(&cmd) {
            Ok(HookDecision::Allow) => Ok(cmd),
            Ok(HookDecision::Deny(reason)) => {
                debug!(command = cmd.name(), %reason, "script denied command");
                Err(ApplyError::ConstraintViolation(format!(
                    "refused by script: {reason}"
                )))
            }
            Ok(HookDecision::Rewrite(mut rewritten)) => {
                if rewritten.scope() != cmd.scope() {
                    warn!(command = cmd.name(), "script rewrite changed scope");
                    return Err(ScriptError::ScopeChanged.into());
                }
                rewritten.origin = cmd.origin;
                rewritten.stamp = cmd.stamp;
                Ok(rewritten)
            }
            Err(err) => {
                warn!(command = cmd.name(), session = %cmd.origin.session, %err, "script fault");
                Err(err.into())
            }
        }
    }

    fn call_pre(&self, cmd: &Command) -> Result<HookDecision, ScriptError> {
        if self.overdue.load(Ordering::SeqCst) > 0 {
            return Err(ScriptError::Busy);
        }
        let (reply, rx) = crossbeam_channel::bounded(1);
        let state = Arc::new(AtomicU8::new(PENDING));
        self.calls
            .send(Call::Pre {
                cmd: cmd.clone(),
                state: Arc::clone(&state),
                reply,
            })
            .map_err(|_| ScriptError::Stopped)?;

        match rx.recv_timeout(self.config.hook_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                if state
                    .compare_exchange(PENDING, ABANDONED, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    self.overdue.fetch_add(1, Ordering::SeqCst);
                    Err(ScriptError::Timeout(self.config.hook_timeout.as_millis() as u64))
                } else {
                    // Finished right at the deadline; the reply is on its way.
                    rx.recv().unwrap_or(Err(ScriptError::Stopped))
                }
            }
            Err(RecvTimeoutError::Disconnected) => Err(ScriptError::Stopped),
        }
    }

    /// Hand an applied batch to the script thread. Never blocks.
    pub fn notify(&self, deltas: Vec<Delta>) {
        self.activity.queued.fetch_add(1, Ordering::SeqCst);
        match self.notify.try_send(deltas) {
            Ok(()) => {}
            Err(TrySendError::Full(batch)) => {
                self.activity.queued.fetch_sub(1, Ordering::SeqCst);
                warn!(deltas = batch.len(), "script thread lagging; dropping notification");
            }
            Err(TrySendError::Disconnected(_)) => {
                self.activity.queued.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    pub fn activity(&self) -> BridgeActivity {
        BridgeActivity {
            queued: self.activity.queued.load(Ordering::SeqCst),
            emitted: self.activity.emitted.load(Ordering::SeqCst),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.overdue.load(Ordering::SeqCst) > 0
    }

    pub fn shutdown(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = self.calls.send(Call::Stop);
            if handle.join().is_err() {
                warn!("script thread panicked");
            }
            info!("script bridge stopped");
        }
    }
}

impl Drop for ScriptBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ScriptBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptBridge")
            .field("config", &self.config)
            .field("overdue", &self.overdue.load(Ordering::SeqCst))
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic".to_string()
    }
}

fn run(
    mut hooks: impl ScriptHooks,
    calls: Receiver<Call>,
    notify: Receiver<Vec<Delta>>,
    out: Sender<Command>,
    capabilities: ScriptCapabilities,
    overdue: Arc<AtomicUsize>,
    activity: Arc<Activity>,
) {
    loop {
        crossbeam_channel::select! {
            recv(calls) -> msg => match msg {
                Ok(Call::Pre { cmd, state, reply }) => {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| hooks.on_command_pre(&cmd)))
                        .map_err(|payload| ScriptError::Panicked(panic_message(&*payload)));
                    if state
                        .compare_exchange(PENDING, DONE, Ordering::SeqCst, Ordering::SeqCst)
                        .is_err()
                    {
                        overdue.fetch_sub(1, Ordering::SeqCst);
                        debug!(command = cmd.name(), "timed-out hook finished");
                    }
                    let _ = reply.send(result);
                }
                Ok(Call::Stop) | Err(_) => break,
            },
            recv(notify) -> msg => match msg {
                Ok(batch) => {
                    applied(&mut hooks, &batch, &out, &capabilities, &activity.emitted);
                    activity.queued.fetch_sub(1, Ordering::SeqCst);
                }
                Err(_) => break,
            },
        }
    }
}

fn applied(
    hooks: &mut impl ScriptHooks,
    batch: &[Delta],
    out: &Sender<Command>,
    capabilities: &ScriptCapabilities,
    emitted: &AtomicU64,
) {
    let mut ctx = ScriptContext::default();
    for delta in batch {
        if let Err(payload) =
            panic::catch_unwind(AssertUnwindSafe(|| hooks.on_delta_applied(delta, &mut ctx)))
        {
            warn!(scope = %delta.scope, reason = %panic_message(&*payload), "delta hook panicked");
        }
    }
    for op in ctx.take() {
        if let Err(err) = capabilities.check(&op) {
            warn!(%err, "dropping script command");
            continue;
        }
        if out.send(Command::script(op)).is_err() {
            debug!("script command sink closed");
            return;
        }
        emitted.fetch_add(1, Ordering::SeqCst);
    }
}
