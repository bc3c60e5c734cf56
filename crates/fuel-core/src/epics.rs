//! Epic controller: completion rollup, approval lifecycle, and working-copy
//! mirrors.
//!
//! A mirror is a clone of the project directory under
//! `$HOME/.fuel/mirrors/<project-slug>/<epic-short-id>` with the clone's
//! `.fuel/` replaced by a symlink to the original (state stays shared) and a
//! dedicated `epic/<short-id>` git branch checked out.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::process::Command;

use fuel_store::{NewTask, Store, TaskPatch};
use fuel_types::{DaemonEvent, Epic, EpicStatus, MirrorStatus, TaskStatus, NEEDS_HUMAN_LABEL};

use crate::driver::{EPIC_MERGE_AGENT, EPIC_REVIEW_AGENT};
use crate::error::{FuelError, Result};
use crate::event_bus::EventBus;

pub struct EpicController {
    project_root: PathBuf,
    mirrors_enabled: bool,
}

impl EpicController {
    pub fn new(project_root: PathBuf, mirrors_enabled: bool) -> Self {
        Self {
            project_root,
            mirrors_enabled,
        }
    }

    /// Rollup after a member task finished. When every task of an active
    /// epic is done, synthesize the epic-review task and move the epic to
    /// `review`. Returns true when the epic just completed.
    pub fn check_epic_completion(
        &self,
        store: &Store,
        events: &EventBus,
        epic_id: &str,
    ) -> Result<bool> {
        let epic = store.get_epic(epic_id)?;
        if !matches!(epic.status, EpicStatus::Planning | EpicStatus::Active) {
            return Ok(false);
        }
        let tasks = store.tasks_in_epic(epic_id)?;
        if tasks.is_empty() || tasks.iter().any(|t| t.status != TaskStatus::Done) {
            return Ok(false);
        }

        let review_task = store.create_task(NewTask {
            title: format!("Review epic: {}", epic.title),
            description: epic.description.clone(),
            agent: Some(EPIC_REVIEW_AGENT.to_string()),
            epic_id: Some(epic_id.to_string()),
            priority: Some(1),
            ..NewTask::default()
        })?;
        store.set_epic_status(epic_id, EpicStatus::Review)?;
        tracing::info!(epic = epic_id, review_task = %review_task.short_id, "epic completed, review task created");
        events.publish(DaemonEvent::EpicCompleted {
            epic_short_id: epic_id.to_string(),
            review_task_short_id: review_task.short_id,
            timestamp: Utc::now(),
        });
        Ok(true)
    }

    /// Plan approval: the epic becomes active and its tasks dispatchable.
    pub fn approve(&self, store: &Store, epic_id: &str, approved_by: &str) -> Result<Epic> {
        Ok(store.update_epic_with(epic_id, |epic| {
            epic.status = EpicStatus::Active;
            epic.approved_by = Some(approved_by.to_string());
            epic.approved_at = Some(Utc::now());
        })?)
    }

    /// Rejection reopens every member task; they will need follow-up work.
    pub fn reject(&self, store: &Store, epic_id: &str) -> Result<Epic> {
        for task in store.tasks_in_epic(epic_id)? {
            if task.status == TaskStatus::Open {
                continue;
            }
            store.update_task(
                &task.short_id,
                TaskPatch {
                    status: Some(TaskStatus::Open),
                    reason: Some("epic rejected".to_string()),
                    ..TaskPatch::default()
                },
            )?;
        }
        Ok(store.set_epic_status(epic_id, EpicStatus::Rejected)?)
    }

    /// `epic:reviewed`: the human (or review agent outcome) signed off. With
    /// a ready mirror this enqueues the merge-agent task.
    pub fn mark_reviewed(&self, store: &Store, epic_id: &str) -> Result<Epic> {
        let epic = store.set_epic_status(epic_id, EpicStatus::Reviewed)?;
        if epic.mirror_status == MirrorStatus::Ready {
            let branch = epic
                .mirror_branch
                .clone()
                .unwrap_or_else(|| format!("epic/{epic_id}"));
            store.create_task(NewTask {
                title: format!("Merge epic: {}", epic.title),
                description: Some(format!("Merge branch {branch} back into the project.")),
                agent: Some(EPIC_MERGE_AGENT.to_string()),
                epic_id: Some(epic_id.to_string()),
                priority: Some(0),
                ..NewTask::default()
            })?;
            store.set_mirror_status(epic_id, MirrorStatus::Merging)?;
        }
        Ok(epic)
    }

    /// Outcome of the merge-agent task. Merge failure is not fatal: the
    /// epic's work stays on its branch and a human is flagged in.
    pub fn on_merge_result(
        &self,
        store: &Store,
        epic_id: &str,
        merge_task_id: &str,
        success: bool,
    ) -> Result<()> {
        if success {
            store.set_mirror_status(epic_id, MirrorStatus::Merged)?;
            store.set_epic_status(epic_id, EpicStatus::Done)?;
            tracing::info!(epic = epic_id, "epic mirror merged");
        } else {
            store.set_mirror_status(epic_id, MirrorStatus::Failed)?;
            let task = store.get_task(merge_task_id)?;
            let mut labels: BTreeSet<String> = task.labels.clone();
            labels.insert(NEEDS_HUMAN_LABEL.to_string());
            store.update_task(
                merge_task_id,
                TaskPatch {
                    labels: Some(labels),
                    ..TaskPatch::default()
                },
            )?;
            tracing::warn!(epic = epic_id, "epic merge failed, flagged for a human");
        }
        Ok(())
    }

    /// The dispatch cwd for an epic's tasks: the mirror when mirrors are
    /// enabled and usable, the project root otherwise. Creates the mirror on
    /// first use; creation failure degrades to the project root.
    pub async fn ensure_mirror(&self, store: &Store, epic_id: &str) -> Result<Option<PathBuf>> {
        if !self.mirrors_enabled {
            return Ok(None);
        }
        let epic = store.get_epic(epic_id)?;
        match epic.mirror_status {
            MirrorStatus::Ready | MirrorStatus::Merging => {
                return Ok(epic.mirror_path.map(PathBuf::from))
            }
            MirrorStatus::Creating | MirrorStatus::Failed | MirrorStatus::Merged => {
                return Ok(None)
            }
            MirrorStatus::None => {}
        }

        store.set_mirror_status(epic_id, MirrorStatus::Creating)?;
        match self.create_mirror(&epic).await {
            Ok((path, branch, base_commit)) => {
                let path_string = path.display().to_string();
                store.update_epic_with(epic_id, |epic| {
                    epic.mirror_status = MirrorStatus::Ready;
                    epic.mirror_path = Some(path_string.clone());
                    epic.mirror_branch = Some(branch.clone());
                    epic.base_commit = Some(base_commit.clone());
                })?;
                tracing::info!(epic = epic_id, mirror = %path.display(), "epic mirror ready");
                Ok(Some(path))
            }
            Err(e) => {
                tracing::warn!(epic = epic_id, "mirror creation failed: {e}");
                store.set_mirror_status(epic_id, MirrorStatus::Failed)?;
                Ok(None)
            }
        }
    }

    async fn create_mirror(&self, epic: &Epic) -> Result<(PathBuf, String, String)> {
        let slug = self
            .project_root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("project")
            .to_string();
        let home =
            dirs::home_dir().ok_or_else(|| FuelError::Mirror("no home directory".into()))?;
        let dest = home
            .join(".fuel")
            .join("mirrors")
            .join(&slug)
            .join(&epic.short_id);
        if dest.exists() {
            std::fs::remove_dir_all(&dest)?;
        }
        std::fs::create_dir_all(&dest)?;

        // Copy-on-write where the filesystem supports it, plain copy where
        // it does not. `.fuel/` is excluded and replaced by a symlink so the
        // mirror shares the project's store.
        for entry in std::fs::read_dir(&self.project_root)? {
            let entry = entry?;
            if entry.file_name() == ".fuel" {
                continue;
            }
            let status = Command::new("cp")
                .arg("--reflink=auto")
                .arg("-a")
                .arg(entry.path())
                .arg(&dest)
                .status()
                .await?;
            if !status.success() {
                return Err(FuelError::Mirror(format!(
                    "cp failed for {}",
                    entry.path().display()
                )));
            }
        }
        std::os::unix::fs::symlink(self.project_root.join(".fuel"), dest.join(".fuel"))?;

        let base_commit = git_stdout(&dest, &["rev-parse", "HEAD"]).await?;
        let branch = format!("epic/{}", epic.short_id);
        git_run(&dest, &["checkout", "-b", branch.as_str()]).await?;
        Ok((dest, branch, base_commit))
    }
}

async fn git_run(cwd: &Path, args: &[&str]) -> Result<()> {
    let status = Command::new("git").args(args).current_dir(cwd).status().await?;
    if !status.success() {
        return Err(FuelError::Mirror(format!("git {} failed", args.join(" "))));
    }
    Ok(())
}

async fn git_stdout(cwd: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git").args(args).current_dir(cwd).output().await?;
    if !output.status.success() {
        return Err(FuelError::Mirror(format!("git {} failed", args.join(" "))));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn controller(root: &Path) -> EpicController {
        EpicController::new(root.to_path_buf(), false)
    }

    fn finish(store: &Store, id: &str) {
        store
            .set_task_status(id, TaskStatus::InProgress, None)
            .unwrap();
        store.done(id, None, None).unwrap();
    }

    fn make_epic_with_tasks(store: &Store, count: usize) -> (Epic, Vec<String>) {
        let epic = store.create_epic("ship it", None, false, None).unwrap();
        let epic = store
            .set_epic_status(&epic.short_id, EpicStatus::Active)
            .unwrap();
        let mut ids = Vec::new();
        for idx in 0..count {
            let task = store
                .create_task(NewTask {
                    title: format!("task {idx}"),
                    epic_id: Some(epic.short_id.clone()),
                    ..NewTask::default()
                })
                .unwrap();
            ids.push(task.short_id);
        }
        (epic, ids)
    }

    #[test]
    fn completion_creates_review_task_once() {
        let temp = tempdir().unwrap();
        let store = Store::open(temp.path()).unwrap();
        let events = EventBus::new();
        let controller = controller(temp.path());
        let (epic, ids) = make_epic_with_tasks(&store, 2);

        finish(&store, &ids[0]);
        assert!(!controller
            .check_epic_completion(&store, &events, &epic.short_id)
            .unwrap());

        finish(&store, &ids[1]);
        assert!(controller
            .check_epic_completion(&store, &events, &epic.short_id)
            .unwrap());

        let epic_after = store.get_epic(&epic.short_id).unwrap();
        assert_eq!(epic_after.status, EpicStatus::Review);
        let members = store.tasks_in_epic(&epic.short_id).unwrap();
        let review_task = members
            .iter()
            .find(|t| t.agent.as_deref() == Some(EPIC_REVIEW_AGENT))
            .expect("review task exists");
        assert!(review_task.title.contains("Review epic"));

        // Epic is now in review; a second rollup is a no-op.
        assert!(!controller
            .check_epic_completion(&store, &events, &epic.short_id)
            .unwrap());
    }

    #[test]
    fn reject_reopens_member_tasks() {
        let temp = tempdir().unwrap();
        let store = Store::open(temp.path()).unwrap();
        let controller = controller(temp.path());
        let (epic, ids) = make_epic_with_tasks(&store, 2);

        finish(&store, &ids[0]);
        store
            .set_task_status(&ids[1], TaskStatus::Paused, None)
            .unwrap();

        let rejected = controller.reject(&store, &epic.short_id).unwrap();
        assert_eq!(rejected.status, EpicStatus::Rejected);
        for id in &ids {
            assert_eq!(store.get_task(id).unwrap().status, TaskStatus::Open);
        }
        // Rejected epics hold their tasks out of the ready queue.
        assert!(store.list_ready().unwrap().is_empty());
    }

    #[test]
    fn reviewed_with_ready_mirror_enqueues_merge_task() {
        let temp = tempdir().unwrap();
        let store = Store::open(temp.path()).unwrap();
        let controller = controller(temp.path());
        let (epic, ids) = make_epic_with_tasks(&store, 1);
        finish(&store, &ids[0]);
        store
            .set_epic_status(&epic.short_id, EpicStatus::Review)
            .unwrap();
        store
            .update_epic_with(&epic.short_id, |e| {
                e.mirror_status = MirrorStatus::Ready;
                e.mirror_branch = Some(format!("epic/{}", e.short_id));
            })
            .unwrap();

        controller.mark_reviewed(&store, &epic.short_id).unwrap();

        let epic_after = store.get_epic(&epic.short_id).unwrap();
        assert_eq!(epic_after.status, EpicStatus::Reviewed);
        assert_eq!(epic_after.mirror_status, MirrorStatus::Merging);
        let merge_task = store
            .tasks_in_epic(&epic.short_id)
            .unwrap()
            .into_iter()
            .find(|t| t.agent.as_deref() == Some(EPIC_MERGE_AGENT))
            .expect("merge task exists");
        assert_eq!(merge_task.priority, 0);
    }

    #[test]
    fn merge_failure_flags_a_human() {
        let temp = tempdir().unwrap();
        let store = Store::open(temp.path()).unwrap();
        let controller = controller(temp.path());
        let (epic, _) = make_epic_with_tasks(&store, 1);
        let merge_task = store
            .create_task(NewTask {
                title: "Merge epic: ship it".into(),
                agent: Some(EPIC_MERGE_AGENT.to_string()),
                epic_id: Some(epic.short_id.clone()),
                ..NewTask::default()
            })
            .unwrap();

        controller
            .on_merge_result(&store, &epic.short_id, &merge_task.short_id, false)
            .unwrap();

        assert_eq!(
            store.get_epic(&epic.short_id).unwrap().mirror_status,
            MirrorStatus::Failed
        );
        assert!(store.get_task(&merge_task.short_id).unwrap().needs_human());
    }

    #[test]
    fn mirrors_disabled_yields_no_cwd_override() {
        let temp = tempdir().unwrap();
        let store = Store::open(temp.path()).unwrap();
        let controller = controller(temp.path());
        let (epic, _) = make_epic_with_tasks(&store, 1);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let cwd = runtime
            .block_on(controller.ensure_mirror(&store, &epic.short_id))
            .unwrap();
        assert!(cwd.is_none());
        assert_eq!(
            store.get_epic(&epic.short_id).unwrap().mirror_status,
            MirrorStatus::None
        );
    }
}
