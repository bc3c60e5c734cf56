pub mod backlog;
pub mod epic;
pub mod event;
pub mod ids;
pub mod review;
pub mod run;
pub mod task;

pub use backlog::BacklogItem;
pub use epic::{Epic, EpicStatus, MirrorStatus};
pub use event::DaemonEvent;
pub use ids::{new_epic_id, new_review_id, new_run_id, new_task_id};
pub use review::{Review, ReviewStatus};
pub use run::Run;
pub use task::{Task, TaskComplexity, TaskSize, TaskStatus, TaskType, NEEDS_HUMAN_LABEL};
