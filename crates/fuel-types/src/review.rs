use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    #[default]
    Pending,
    Passed,
    Failed,
}

/// Reviewer verdict record for one task completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    pub short_id: String,
    pub task_short_id: String,
    pub agent: String,
    pub status: ReviewStatus,
    #[serde(default)]
    pub issues: Vec<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Review {
    pub fn new(short_id: String, task_short_id: String, agent: String) -> Self {
        Self {
            short_id,
            task_short_id,
            agent,
            status: ReviewStatus::Pending,
            issues: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}
