//! Scripting hook bridge.
//!
//! Scripts see commands before they apply and deltas after, and may issue
//! their own commands. Everything runs on one dedicated thread; a hook that
//! errors, panics or overruns its timeout fails only the command that
//! triggered it.

pub mod bridge;
pub mod capability;
pub mod error;
pub mod hooks;

pub use bridge::{BridgeActivity, BridgeConfig, ScriptBridge};
pub use capability::ScriptCapabilities;
pub use error::ScriptError;
pub use hooks::{HookDecision, NullHooks, ScriptContext, ScriptHooks};
