use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::TaskStatus;

/// Events broadcast by the consume daemon to attached IPC clients.
///
/// Ordering guarantee for a single task: `TaskCreated` < `RunStarted(n)` <
/// `RunCompleted(n)` < the terminal `TaskStatusChanged`. Runs for different
/// tasks interleave arbitrarily.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonEvent {
    TaskCreated {
        task_short_id: String,
        title: String,
        timestamp: DateTime<Utc>,
    },
    TaskStatusChanged {
        task_short_id: String,
        from: TaskStatus,
        to: TaskStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
    RunStarted {
        task_short_id: String,
        run_short_id: String,
        agent: String,
        timestamp: DateTime<Utc>,
    },
    RunCompleted {
        task_short_id: String,
        run_short_id: String,
        exit_code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost_usd: Option<f64>,
        timestamp: DateTime<Utc>,
    },
    EpicCompleted {
        epic_short_id: String,
        review_task_short_id: String,
        timestamp: DateTime<Utc>,
    },
    Heartbeat {
        running: usize,
        ready: usize,
        timestamp: DateTime<Utc>,
    },
    BrowserResponse {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl DaemonEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DaemonEvent::TaskCreated { timestamp, .. }
            | DaemonEvent::TaskStatusChanged { timestamp, .. }
            | DaemonEvent::RunStarted { timestamp, .. }
            | DaemonEvent::RunCompleted { timestamp, .. }
            | DaemonEvent::EpicCompleted { timestamp, .. }
            | DaemonEvent::Heartbeat { timestamp, .. }
            | DaemonEvent::BrowserResponse { timestamp, .. }
            | DaemonEvent::Error { timestamp, .. } => *timestamp,
        }
    }
}
