use liveworld_kernel::{ActionOp, ApplyError, Command, CommandKind, EditOp, ScriptOp};

/// Session-level limits checked before a command reaches a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_chat_len: usize,
    pub max_name_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_chat_len: 256,
            max_name_len: 32,
        }
    }
}

fn constraint(msg: impl Into<String>) -> ApplyError {
    ApplyError::ConstraintViolation(msg.into())
}

fn check_name(name: &str, limits: &Limits) -> Result<(), ApplyError> {
    if name.trim().is_empty() {
        return Err(constraint("name is empty"));
    }
    if name.chars().count() > limits.max_name_len {
        return Err(constraint(format!(
            "name longer than {} characters",
            limits.max_name_len
        )));
    }
    Ok(())
}

fn check_text(text: &str, limits: &Limits) -> Result<(), ApplyError> {
    if text.chars().count() > limits.max_chat_len {
        return Err(constraint(format!(
            "text longer than {} characters",
            limits.max_chat_len
        )));
    }
    Ok(())
}

/// Privilege and schema checks that need no world state.
pub fn validate(cmd: &Command, limits: &Limits) -> Result<(), ApplyError> {
    match &cmd.kind {
        CommandKind::Edit(op) => {
            if !cmd.origin.privilege.can_edit() {
                return Err(ApplyError::PrivilegeDenied(format!(
                    "{} requires editor privilege",
                    op.name()
                )));
            }
            validate_edit(op, limits)
        }
        CommandKind::Script(op) => {
            if !cmd.origin.session.is_system() {
                return Err(ApplyError::PrivilegeDenied(
                    "script commands may only come from the script bridge".into(),
                ));
            }
            match op {
                ScriptOp::Announce { text, .. } => check_text(text, limits),
                ScriptOp::Edit(op) => validate_edit(op, limits),
            }
        }
        CommandKind::Action(op) => {
            if op.requires_editor() && !cmd.origin.privilege.can_edit() {
                return Err(ApplyError::PrivilegeDenied(format!(
                    "{} requires editor privilege",
                    op.name()
                )));
            }
            if cmd.origin.avatar.is_none() {
                return Err(constraint("session has no avatar"));
            }
            match op {
                ActionOp::Enter { name, .. } => check_name(name, limits),
                ActionOp::Say { text } | ActionOp::Shout { text } => check_text(text, limits),
                _ => Ok(()),
            }
        }
    }
}

fn validate_edit(op: &EditOp, limits: &Limits) -> Result<(), ApplyError> {
    match op {
        EditOp::SpawnNpc { name, .. } => check_name(name, limits),
        EditOp::SetAttribute { key, .. } => check_name(key, limits),
        EditOp::CreateMap { settings, .. } | EditOp::SetMapSettings { settings, .. } => {
            check_text(&settings.name, limits)
        }
        EditOp::ReplaceMap {
            width,
            height,
            settings,
            tiles,
            ..
        } => {
            let cells = *width as usize * *height as usize;
            if tiles.len() != cells {
                return Err(constraint(format!(
                    "{} tiles given for a {width}x{height} map",
                    tiles.len()
                )));
            }
            check_text(&settings.name, limits)
        }
        _ => Ok(()),
    }
}
