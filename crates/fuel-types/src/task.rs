use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Label that excludes a task from automatic dispatch.
pub const NEEDS_HUMAN_LABEL: &str = "needs-human";

/// Status of a task in the consume lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Ready to be considered for dispatch
    Open,
    /// An agent process is currently running for this task
    InProgress,
    /// Finished successfully, awaiting reviewer verdict
    Review,
    /// Terminal success state
    Done,
    /// Explicitly held back by the user
    Paused,
    /// Deferred indefinitely
    Someday,
}

impl TaskStatus {
    /// Whether the transition `self -> next` is legal.
    ///
    /// ```text
    /// open -> in_progress | paused | someday
    /// in_progress -> review | done | open | paused
    /// review -> done | open
    /// paused -> open
    /// someday -> open
    /// done -> open (reopen)
    /// ```
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Open, InProgress) | (Open, Paused) | (Open, Someday) => true,
            (InProgress, Review) | (InProgress, Done) | (InProgress, Open) => true,
            (InProgress, Paused) => true,
            (Review, Done) | (Review, Open) => true,
            (Paused, Open) | (Someday, Open) | (Done, Open) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Review => "review",
            TaskStatus::Done => "done",
            TaskStatus::Paused => "paused",
            TaskStatus::Someday => "someday",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Bug,
    Fix,
    Feature,
    #[default]
    Task,
    Epic,
    Chore,
    Docs,
    Test,
    Refactor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSize {
    Xs,
    S,
    #[default]
    M,
    L,
    Xl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskComplexity {
    Trivial,
    #[default]
    Simple,
    Moderate,
    Complex,
}

pub const DEFAULT_PRIORITY: u8 = 2;
pub const MAX_PRIORITY: u8 = 4;

/// A unit of agent work. Rows reference each other by short id only; the
/// store hydrates related entities on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub short_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type", default)]
    pub task_type: TaskType,
    /// 0..=4, lower is more urgent
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub size: TaskSize,
    #[serde(default)]
    pub complexity: TaskComplexity,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub blocked_by: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epic_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    #[serde(default)]
    pub selfguided_iteration: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

impl Task {
    pub fn new(short_id: String, title: String) -> Self {
        let now = Utc::now();
        Self {
            short_id,
            title,
            description: None,
            task_type: TaskType::default(),
            priority: DEFAULT_PRIORITY,
            size: TaskSize::default(),
            complexity: TaskComplexity::default(),
            labels: BTreeSet::new(),
            blocked_by: BTreeSet::new(),
            epic_id: None,
            agent: None,
            status: TaskStatus::Open,
            reason: None,
            commit_hash: None,
            selfguided_iteration: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn needs_human(&self) -> bool {
        self.labels.contains(NEEDS_HUMAN_LABEL)
    }

    /// Self-guided is an agent-level looping mode: such tasks are
    /// re-dispatched with the same short id until an acceptance predicate
    /// holds.
    pub fn is_selfguided(&self) -> bool {
        self.agent.as_deref() == Some("selfguided")
    }
}
