use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpicStatus {
    #[default]
    Planning,
    Active,
    /// Every member task is done; an epic-review task exists
    Review,
    /// Human (or review agent) signed off on the epic result
    Reviewed,
    Rejected,
    Done,
    Paused,
}

impl EpicStatus {
    /// Epics in these states hold their member tasks out of the ready queue.
    pub fn blocks_dispatch(self) -> bool {
        matches!(self, EpicStatus::Paused | EpicStatus::Rejected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EpicStatus::Planning => "planning",
            EpicStatus::Active => "active",
            EpicStatus::Review => "review",
            EpicStatus::Reviewed => "reviewed",
            EpicStatus::Rejected => "rejected",
            EpicStatus::Done => "done",
            EpicStatus::Paused => "paused",
        }
    }
}

/// Lifecycle of an epic's isolated working-copy mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorStatus {
    #[default]
    None,
    Creating,
    Ready,
    Merging,
    Merged,
    Failed,
}

/// A named grouping of tasks sharing a plan and optionally a mirror.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Epic {
    pub short_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: EpicStatus,
    #[serde(default)]
    pub self_guided: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub mirror_status: MirrorStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_commit: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Epic {
    pub fn new(short_id: String, title: String) -> Self {
        let now = Utc::now();
        Self {
            short_id,
            title,
            description: None,
            status: EpicStatus::default(),
            self_guided: false,
            plan_filename: None,
            approved_by: None,
            approved_at: None,
            mirror_status: MirrorStatus::default(),
            mirror_path: None,
            mirror_branch: None,
            base_commit: None,
            created_at: now,
            updated_at: now,
        }
    }
}
