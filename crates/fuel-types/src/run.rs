use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One execution of an agent process for one task. Multiple runs per task
/// record retries; the "latest" run is the one with the greatest
/// `started_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Monotonic within the task (1, 2, ...)
    pub run_id: u32,
    /// Project-unique short id; also names the process log directory
    pub short_id: String,
    pub task_short_id: String,
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Tail of stdout; the full stream lives in the per-run log file
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
}

impl Run {
    pub fn new(run_id: u32, short_id: String, task_short_id: String, agent: String) -> Self {
        Self {
            run_id,
            short_id,
            task_short_id,
            agent,
            model: None,
            started_at: Utc::now(),
            ended_at: None,
            exit_code: None,
            cost_usd: None,
            session_id: None,
            pid: None,
            output: String::new(),
            commit_hash: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}
