use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{ExitInfo, OperationStatus};
use crate::event::Ticket;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallRequest {
    pub target: PathBuf,
    pub uncompressed_size_kb: u64,
    pub verify: bool,
    pub system: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, strum::Display)]
#[serde(tag = "kind", rename_all = "camelCase")]
#[strum(serialize_all = "lowercase")]
pub enum CommandKind {
    Install(InstallRequest),
    /// `target` is a package id or any app id inside the package. It is
    /// resolved when the command reaches the queue head.
    Remove { target: String, cause: String },
}

/// `Queued → Running → Completed`, or `Running → Interrupted` when brick
/// mode kills the tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum CommandState {
    Queued,
    Running { pid: Option<u32> },
    Interrupted,
    Completed { exit: ExitInfo },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: u64,
    pub ticket: Ticket,
    pub kind: CommandKind,
    pub state: CommandState,
    pub enqueued_at: DateTime<Utc>,
}

impl Command {
    pub fn new(id: u64, ticket: Ticket, kind: CommandKind) -> Self {
        Self {
            id,
            ticket,
            kind,
            state: CommandState::Queued,
            enqueued_at: Utc::now(),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, CommandState::Running { .. })
    }
}

/// A finished command, kept for snapshots
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    pub ticket: Ticket,
    pub kind: String,
    pub target: String,
    pub exit: ExitInfo,
    pub status: OperationStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CommandRecord {
    pub fn target_of(kind: &CommandKind) -> String {
        match kind {
            CommandKind::Install(request) => request.target.display().to_string(),
            CommandKind::Remove { target, .. } => target.clone(),
        }
    }
}
