//! Daemon lifecycle: single-instance pid file, crash-recovery sweep.
//!
//! The pid file is acquired before anything else so two daemons can never
//! share a project. A stale file (dead recorded pid) is taken over.

use std::path::{Path, PathBuf};

use chrono::Utc;
use fuel_store::{RunPatch, Store, TaskPatch};
use fuel_types::TaskStatus;
use fuel_wire::PidFile;

use crate::error::{FuelError, Result};
use crate::supervisor::pid_alive;

pub const PID_FILE_NAME: &str = "consume-runner.pid";

pub fn pid_file_path(fuel_dir: &Path) -> PathBuf {
    fuel_dir.join(PID_FILE_NAME)
}

pub fn read_pid_file(fuel_dir: &Path) -> Option<PidFile> {
    let content = std::fs::read_to_string(pid_file_path(fuel_dir)).ok()?;
    serde_json::from_str(&content).ok()
}

/// Claim the project for this process. Fails with `PidFileLockHeld` when the
/// recorded daemon is still alive; silently replaces a stale file.
pub fn acquire_pid_file(fuel_dir: &Path, port: u16) -> Result<PidFile> {
    if let Some(existing) = read_pid_file(fuel_dir) {
        if existing.pid != std::process::id() && pid_alive(existing.pid) {
            return Err(FuelError::PidFileLockHeld(existing.pid));
        }
        tracing::info!(stale_pid = existing.pid, "replacing stale pid file");
    }
    let pid_file = PidFile {
        pid: std::process::id(),
        port,
        started_at: Utc::now(),
    };
    let content = serde_json::to_string(&pid_file)
        .map_err(|e| FuelError::InvalidConfig(format!("pid file serialize: {e}")))?;
    std::fs::write(pid_file_path(fuel_dir), content)?;
    Ok(pid_file)
}

pub fn remove_pid_file(fuel_dir: &Path) {
    let _ = std::fs::remove_file(pid_file_path(fuel_dir));
}

/// Crash recovery at startup: any `in_progress` task whose recorded child is
/// dead goes back to `open`, and its latest run is closed with exit code -1.
/// Returns the ids of swept tasks.
pub fn recovery_sweep(store: &Store) -> Result<Vec<String>> {
    let mut swept = Vec::new();
    for task in store.list_tasks()? {
        if task.status != TaskStatus::InProgress {
            continue;
        }
        let latest = store.latest_run(&task.short_id)?;
        let child_alive = latest
            .as_ref()
            .filter(|run| run.ended_at.is_none())
            .and_then(|run| run.pid)
            .map(pid_alive)
            .unwrap_or(false);
        if child_alive {
            continue;
        }

        if let Some(run) = latest {
            if run.ended_at.is_none() {
                store.update_run(
                    &run.short_id,
                    RunPatch {
                        exit_code: Some(-1),
                        ended_at: Some(Utc::now()),
                        ..RunPatch::default()
                    },
                )?;
            }
        }
        store.update_task(
            &task.short_id,
            TaskPatch {
                status: Some(TaskStatus::Open),
                reason: Some("daemon-restart".to_string()),
                ..TaskPatch::default()
            },
        )?;
        tracing::warn!(task = %task.short_id, "recovered orphaned in-progress task");
        swept.push(task.short_id);
    }
    Ok(swept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fuel_store::NewTask;
    use tempfile::tempdir;

    #[test]
    fn pid_file_round_trip_and_stale_takeover() {
        let temp = tempdir().unwrap();
        let acquired = acquire_pid_file(temp.path(), 4321).unwrap();
        assert_eq!(acquired.pid, std::process::id());
        assert_eq!(read_pid_file(temp.path()).unwrap().port, 4321);

        // Our own pid counts as a re-acquire, not a conflict.
        acquire_pid_file(temp.path(), 4322).unwrap();

        // A dead recorded pid is stale and gets replaced.
        let stale = PidFile {
            pid: 999_999_999,
            port: 1,
            started_at: Utc::now(),
        };
        std::fs::write(
            pid_file_path(temp.path()),
            serde_json::to_string(&stale).unwrap(),
        )
        .unwrap();
        let reacquired = acquire_pid_file(temp.path(), 5000).unwrap();
        assert_eq!(reacquired.pid, std::process::id());

        remove_pid_file(temp.path());
        assert!(read_pid_file(temp.path()).is_none());
    }

    #[test]
    fn live_pid_blocks_acquisition() {
        let temp = tempdir().unwrap();
        // PID 1 is always alive.
        let held = PidFile {
            pid: 1,
            port: 1,
            started_at: Utc::now(),
        };
        std::fs::write(
            pid_file_path(temp.path()),
            serde_json::to_string(&held).unwrap(),
        )
        .unwrap();
        assert!(matches!(
            acquire_pid_file(temp.path(), 5000).unwrap_err(),
            FuelError::PidFileLockHeld(1)
        ));
    }

    #[test]
    fn sweep_reopens_tasks_with_dead_children() {
        let temp = tempdir().unwrap();
        let store = Store::open(temp.path()).unwrap();
        let task = store
            .create_task(NewTask {
                title: "orphaned".to_string(),
                ..NewTask::default()
            })
            .unwrap();
        store
            .set_task_status(&task.short_id, TaskStatus::InProgress, None)
            .unwrap();
        let run = store.create_run(&task.short_id, "claude").unwrap();
        store
            .update_run(
                &run.short_id,
                RunPatch {
                    pid: Some(999_999_999),
                    ..RunPatch::default()
                },
            )
            .unwrap();

        let swept = recovery_sweep(&store).unwrap();
        assert_eq!(swept, vec![task.short_id.clone()]);

        let task = store.get_task(&task.short_id).unwrap();
        assert_eq!(task.status, TaskStatus::Open);
        assert_eq!(task.reason.as_deref(), Some("daemon-restart"));

        let run = store.latest_run(&task.short_id).unwrap().unwrap();
        assert_eq!(run.exit_code, Some(-1));
        assert!(run.ended_at.is_some());
    }

    #[test]
    fn sweep_leaves_live_children_alone() {
        let temp = tempdir().unwrap();
        let store = Store::open(temp.path()).unwrap();
        let task = store
            .create_task(NewTask {
                title: "alive".to_string(),
                ..NewTask::default()
            })
            .unwrap();
        store
            .set_task_status(&task.short_id, TaskStatus::InProgress, None)
            .unwrap();
        let run = store.create_run(&task.short_id, "claude").unwrap();
        store
            .update_run(
                &run.short_id,
                RunPatch {
                    pid: Some(std::process::id()),
                    ..RunPatch::default()
                },
            )
            .unwrap();

        assert!(recovery_sweep(&store).unwrap().is_empty());
        assert_eq!(
            store.get_task(&task.short_id).unwrap().status,
            TaskStatus::InProgress
        );
    }
}
