//! Wire-format models for the consume daemon's IPC protocol.
//!
//! Transport is newline-delimited JSON over localhost TCP. The schema is
//! additive: unknown fields are ignored on both sides, so older clients keep
//! working against newer daemons.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use fuel_types::{DaemonEvent, Epic, Review, Run, Task};

/// Contents of `.fuel/consume-runner.pid`. Clients read this to find the
/// daemon's endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidFile {
    pub pid: u32,
    pub port: u16,
    pub started_at: DateTime<Utc>,
}

/// A command sent by a client. Every message carries a client-generated
/// `request_id` when the sender wants a correlated response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientCommand {
    #[serde(rename = "ATTACH")]
    Attach,
    #[serde(rename = "DETACH")]
    Detach,
    #[serde(rename = "DISCONNECT")]
    Disconnect,
    #[serde(rename = "PAUSE_TASK")]
    PauseTask { task_id: String },
    #[serde(rename = "UNPAUSE_TASK")]
    UnpauseTask { task_id: String },
    #[serde(rename = "CANCEL_RUN")]
    CancelRun { task_id: String },
    #[serde(rename = "INJECT_TASK")]
    InjectTask {
        title: String,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        agent: Option<String>,
    },
    #[serde(rename = "STATUS")]
    Status,
    #[serde(rename = "HEALTH_RESET")]
    HealthReset,
    #[serde(rename = "SHUTDOWN")]
    Shutdown,
    /// Browser adjunct commands are passed through opaque; the daemon routes
    /// them to the bridge plugin when one is registered.
    #[serde(rename = "BROWSER")]
    Browser {
        op: String,
        #[serde(default)]
        params: Value,
    },
}

/// Envelope for client -> daemon messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(flatten)]
    pub command: ClientCommand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Board state delivered to a client right after ATTACH.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub epics: Vec<Epic>,
    #[serde(default)]
    pub running: Vec<Run>,
    #[serde(default)]
    pub reviews: Vec<Review>,
}

/// Daemon -> client messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerPayload {
    #[serde(rename = "SNAPSHOT")]
    Snapshot { snapshot: Snapshot },
    #[serde(rename = "EVENT")]
    Event { event: DaemonEvent },
    #[serde(rename = "RESPONSE")]
    Response {
        request_id: String,
        #[serde(default)]
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "ERROR")]
    Error { message: String },
}

/// Envelope for daemon -> client messages. `instance_id` is the daemon's
/// per-process uuid so clients can detect restarts mid-stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEnvelope {
    #[serde(flatten)]
    pub payload: ServerPayload,
    pub timestamp: DateTime<Utc>,
    pub instance_id: String,
}

impl ServerEnvelope {
    pub fn new(instance_id: &str, payload: ServerPayload) -> Self {
        Self {
            payload,
            timestamp: Utc::now(),
            instance_id: instance_id.to_string(),
        }
    }
}

/// Parse one NDJSON line from a client. Returns `None` for blank lines.
pub fn parse_command_line(line: &str) -> Option<Result<CommandEnvelope, serde_json::Error>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(serde_json::from_str(trimmed))
}
