//! Wire protocol types for the control channel.
//!
//! Every endpoint (controller listener, worker control link, operator client)
//! speaks newline-delimited JSON objects carrying a `cmd` field:
//!
//! | cmd        | payload        | reply                  |
//! |------------|----------------|------------------------|
//! | register   | `{pid, port}`  | none                   |
//! | unregister | `{pid}`        | none                   |
//! | status     | `{}`           | [`StatusReply`]        |
//! | stop       | `{}`           | [`StopReply`]          |
//!
//! Inbound lines are first decoded into a raw [`Envelope`], then resolved
//! through [`CommandKind`] into a typed [`Command`]. Unknown or malformed
//! commands surface as [`ProtocolError`] for that connection only.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::pool::WorkerStatus;

/// Closed set of command names understood by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Register,
    Unregister,
    Status,
    Stop,
}

impl CommandKind {
    pub const ALL: [CommandKind; 4] = [
        CommandKind::Register,
        CommandKind::Unregister,
        CommandKind::Status,
        CommandKind::Stop,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Register => "register",
            CommandKind::Unregister => "unregister",
            CommandKind::Status => "status",
            CommandKind::Stop => "stop",
        }
    }

    /// Look up a command by its wire name.
    pub fn lookup(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Whether the sender expects a reply before the connection closes.
    pub fn expects_reply(self) -> bool {
        matches!(self, CommandKind::Status | CommandKind::Stop)
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A control line before command resolution: `cmd` plus whatever else was sent.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Typed control command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    /// Worker announces itself; `port` is where it accepts proxied traffic.
    Register { pid: u32, port: u16 },

    /// Worker is exiting voluntarily.
    Unregister { pid: u32 },

    Status,

    Stop,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Register { .. } => CommandKind::Register,
            Command::Unregister { .. } => CommandKind::Unregister,
            Command::Status => CommandKind::Status,
            Command::Stop => CommandKind::Stop,
        }
    }
}

impl TryFrom<Envelope> for Command {
    type Error = ProtocolError;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        let name = envelope.cmd.ok_or(ProtocolError::MissingCommand)?;
        let kind =
            CommandKind::lookup(&name).ok_or_else(|| ProtocolError::UnknownCommand(name))?;

        let mut fields = envelope.fields;
        fields.insert("cmd".to_string(), Value::String(kind.as_str().to_string()));

        serde_json::from_value(Value::Object(fields))
            .map_err(|source| ProtocolError::InvalidPayload { kind, source })
    }
}

/// Reply to a `status` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReply {
    pub active_workers: usize,
    #[serde(default)]
    pub target_workers: usize,
    #[serde(default)]
    pub state: String,
    /// Connections routed since start.
    #[serde(default)]
    pub routed_connections: u64,
    /// Inbound connections waiting for a READY worker.
    #[serde(default)]
    pub pending_connections: usize,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub workers: Vec<WorkerSnapshot>,
}

/// Per-worker row of a [`StatusReply`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub pid: u32,
    pub port: u16,
    pub status: WorkerStatus,
    pub requests: u64,
    pub registered_at: String,
}

/// Acknowledgement of a `stop` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopReply {
    pub stopping: bool,
}

/// Reply written back on a control connection before it is closed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Status(StatusReply),
    Stop(StopReply),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("control message has no cmd field")]
    MissingCommand,
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("invalid payload for command '{kind}': {source}")]
    InvalidPayload {
        kind: CommandKind,
        #[source]
        source: serde_json::Error,
    },
}
