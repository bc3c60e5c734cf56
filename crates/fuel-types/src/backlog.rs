use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A parked idea. Backlog items are never selected for execution; promoting
/// one to a task is an explicit user action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacklogItem {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl BacklogItem {
    pub fn new(title: String, description: Option<String>) -> Self {
        Self {
            title,
            description,
            created_at: Utc::now(),
        }
    }
}
