//! Persistence layer for tasks, epics, runs, reviews and backlog items.
//!
//! Tables are line-delimited JSON under `<project>/.fuel/`. Every write
//! re-reads the table, mutates in memory, and rewrites the file through a
//! temp-file rename, so a crash mid-write never tears a table. The CLI and
//! the consume daemon are separate processes sharing these files; each
//! operation works on a fresh snapshot.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use fuel_types::task::{DEFAULT_PRIORITY, MAX_PRIORITY};
use fuel_types::{
    new_epic_id, new_review_id, new_run_id, new_task_id, BacklogItem, Epic, EpicStatus,
    MirrorStatus, Review, ReviewStatus, Run, Task, TaskComplexity, TaskSize, TaskStatus, TaskType,
};

use crate::error::{Result, StoreError};
use crate::queue;

const TASKS_FILE: &str = "tasks.jsonl";
const EPICS_FILE: &str = "epics.jsonl";
const RUNS_FILE: &str = "runs.jsonl";
const REVIEWS_FILE: &str = "reviews.jsonl";
const BACKLOG_FILE: &str = "backlog.jsonl";

/// Fields accepted when creating a task. Everything not set falls back to
/// the documented defaults.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
    pub task_type: Option<TaskType>,
    pub priority: Option<u8>,
    pub size: Option<TaskSize>,
    pub complexity: Option<TaskComplexity>,
    pub labels: BTreeSet<String>,
    pub blocked_by: BTreeSet<String>,
    pub epic_id: Option<String>,
    pub agent: Option<String>,
}

/// Partial update for a task. `status` changes are validated against the
/// lifecycle state machine; use dependency operations for `blocked_by`.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub task_type: Option<TaskType>,
    pub priority: Option<u8>,
    pub size: Option<TaskSize>,
    pub complexity: Option<TaskComplexity>,
    pub labels: Option<BTreeSet<String>>,
    pub agent: Option<String>,
    pub status: Option<TaskStatus>,
    pub reason: Option<String>,
    /// Drop any stored reason (wins over `reason`)
    pub clear_reason: bool,
    pub commit_hash: Option<String>,
    pub selfguided_iteration: Option<u32>,
}

/// Partial update for a run row.
#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    pub model: Option<String>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub cost_usd: Option<f64>,
    pub session_id: Option<String>,
    pub pid: Option<u32>,
    pub output: Option<String>,
    pub commit_hash: Option<String>,
}

pub struct Store {
    fuel_dir: PathBuf,
    // Serializes writers within this process; cross-process safety comes
    // from the rewrite-rename discipline.
    write_guard: Mutex<()>,
}

impl Store {
    /// Open (creating if needed) the store under `<project>/.fuel/`.
    pub fn open(project_root: &Path) -> Result<Self> {
        let fuel_dir = project_root.join(".fuel");
        fs::create_dir_all(&fuel_dir)?;
        Ok(Self {
            fuel_dir,
            write_guard: Mutex::new(()),
        })
    }

    pub fn fuel_dir(&self) -> &Path {
        &self.fuel_dir
    }

    pub fn processes_dir(&self) -> PathBuf {
        self.fuel_dir.join("processes")
    }

    pub fn plans_dir(&self) -> PathBuf {
        self.fuel_dir.join("plans")
    }

    // ------------------------------------------------------------------
    // Table IO
    // ------------------------------------------------------------------

    fn table_path(&self, name: &str) -> PathBuf {
        self.fuel_dir.join(name)
    }

    fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>> {
        let path = self.table_path(name);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)?;
        let mut rows = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let row = serde_json::from_str(line).map_err(|e| {
                StoreError::Corrupted(format!("{name} line {}: {e}", idx + 1))
            })?;
            rows.push(row);
        }
        Ok(rows)
    }

    fn save<T: Serialize>(&self, name: &str, rows: &[T]) -> Result<()> {
        let path = self.table_path(name);
        let mut buf = String::new();
        for row in rows {
            let line = serde_json::to_string(row)
                .map_err(|e| StoreError::Corrupted(format!("serialize {name}: {e}")))?;
            buf.push_str(&line);
            buf.push('\n');
        }
        tracing::trace!(table = name, rows = rows.len(), "rewriting table");
        atomic_write(&path, &buf)
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        self.load(TASKS_FILE)
    }

    pub fn list_epics(&self) -> Result<Vec<Epic>> {
        self.load(EPICS_FILE)
    }

    pub fn list_runs(&self) -> Result<Vec<Run>> {
        self.load(RUNS_FILE)
    }

    pub fn list_reviews(&self) -> Result<Vec<Review>> {
        self.load(REVIEWS_FILE)
    }

    pub fn list_backlog(&self) -> Result<Vec<BacklogItem>> {
        self.load(BACKLOG_FILE)
    }

    // ------------------------------------------------------------------
    // Id resolution
    // ------------------------------------------------------------------

    /// Resolve a full short id or a prefix of at least two characters. The
    /// prefix may include or omit the type prefix (`abc` matches `f-abc123`).
    pub fn resolve(&self, partial: &str) -> Result<String> {
        let partial = partial.trim();
        if partial.len() < 2 {
            return Err(StoreError::InvalidField(format!(
                "id prefix '{partial}' is too short (need at least 2 characters)"
            )));
        }

        let mut ids: Vec<String> = Vec::new();
        ids.extend(self.list_tasks()?.into_iter().map(|t| t.short_id));
        ids.extend(self.list_epics()?.into_iter().map(|e| e.short_id));
        ids.extend(self.list_reviews()?.into_iter().map(|r| r.short_id));
        ids.extend(self.list_runs()?.into_iter().map(|r| r.short_id));

        if ids.iter().any(|id| id == partial) {
            return Ok(partial.to_string());
        }

        let matches: Vec<String> = ids
            .into_iter()
            .filter(|id| {
                id.starts_with(partial)
                    || id
                        .split_once('-')
                        .map(|(_, suffix)| suffix.starts_with(partial))
                        .unwrap_or(false)
            })
            .collect();

        match matches.len() {
            0 => Err(StoreError::NotFound(partial.to_string())),
            1 => Ok(matches.into_iter().next().unwrap()),
            _ => Err(StoreError::Ambiguous {
                prefix: partial.to_string(),
                candidates: matches,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    pub fn get_task(&self, id: &str) -> Result<Task> {
        self.list_tasks()?
            .into_iter()
            .find(|t| t.short_id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    pub fn create_task(&self, new: NewTask) -> Result<Task> {
        if new.title.trim().is_empty() {
            return Err(StoreError::InvalidField("title must not be empty".into()));
        }
        if let Some(priority) = new.priority {
            if priority > MAX_PRIORITY {
                return Err(StoreError::InvalidField(format!(
                    "priority {priority} out of range 0..={MAX_PRIORITY}"
                )));
            }
        }

        let _guard = self.write_guard.lock().unwrap();
        let mut tasks = self.list_tasks()?;

        for blocker in &new.blocked_by {
            if !tasks.iter().any(|t| &t.short_id == blocker) {
                return Err(StoreError::InvalidField(format!(
                    "blocked_by references unknown task {blocker}"
                )));
            }
        }
        if let Some(epic_id) = &new.epic_id {
            let epics = self.list_epics()?;
            if !epics.iter().any(|e| &e.short_id == epic_id) {
                return Err(StoreError::InvalidField(format!(
                    "epic {epic_id} does not exist"
                )));
            }
        }

        let short_id = unique_id(new_task_id, |id| tasks.iter().any(|t| t.short_id == id));
        let mut task = Task::new(short_id, new.title.trim().to_string());
        task.description = new.description;
        task.task_type = new.task_type.unwrap_or_default();
        task.priority = new.priority.unwrap_or(DEFAULT_PRIORITY);
        task.size = new.size.unwrap_or_default();
        task.complexity = new.complexity.unwrap_or_default();
        task.labels = new.labels;
        task.blocked_by = new.blocked_by;
        task.epic_id = new.epic_id;
        task.agent = new.agent;

        tasks.push(task.clone());
        if let Some(cycle) = queue::find_cycle(&tasks) {
            return Err(StoreError::CycleDetected(cycle.join(" -> ")));
        }
        self.save(TASKS_FILE, &tasks)?;
        Ok(task)
    }

    pub fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Task> {
        if let Some(priority) = patch.priority {
            if priority > MAX_PRIORITY {
                return Err(StoreError::InvalidField(format!(
                    "priority {priority} out of range 0..={MAX_PRIORITY}"
                )));
            }
        }
        if let Some(title) = &patch.title {
            if title.trim().is_empty() {
                return Err(StoreError::InvalidField("title must not be empty".into()));
            }
        }

        let _guard = self.write_guard.lock().unwrap();
        let mut tasks = self.list_tasks()?;
        let task = tasks
            .iter_mut()
            .find(|t| t.short_id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if let Some(to) = patch.status {
            if !task.status.can_transition_to(to) {
                return Err(StoreError::InvalidTransition {
                    id: id.to_string(),
                    from: task.status,
                    to,
                });
            }
            task.status = to;
        }
        if let Some(title) = patch.title {
            task.title = title.trim().to_string();
        }
        if let Some(description) = patch.description {
            task.description = Some(description);
        }
        if let Some(task_type) = patch.task_type {
            task.task_type = task_type;
        }
        if let Some(priority) = patch.priority {
            task.priority = priority;
        }
        if let Some(size) = patch.size {
            task.size = size;
        }
        if let Some(complexity) = patch.complexity {
            task.complexity = complexity;
        }
        if let Some(labels) = patch.labels {
            task.labels = labels;
        }
        if let Some(agent) = patch.agent {
            task.agent = Some(agent);
        }
        if patch.clear_reason {
            task.reason = None;
        } else if let Some(reason) = patch.reason {
            task.reason = Some(reason);
        }
        if let Some(commit) = patch.commit_hash {
            task.commit_hash = Some(commit);
        }
        if let Some(iteration) = patch.selfguided_iteration {
            task.selfguided_iteration = iteration;
        }
        task.updated_at = Utc::now();

        let updated = task.clone();
        self.save(TASKS_FILE, &tasks)?;
        Ok(updated)
    }

    /// Transition a task through the state machine, returning the previous
    /// status alongside the updated row.
    pub fn set_task_status(
        &self,
        id: &str,
        to: TaskStatus,
        reason: Option<String>,
    ) -> Result<(Task, TaskStatus)> {
        let from = self.get_task(id)?.status;
        let task = self.update_task(
            id,
            TaskPatch {
                status: Some(to),
                reason,
                ..TaskPatch::default()
            },
        )?;
        Ok((task, from))
    }

    /// Mark a task done. Not idempotent: a second `done` fails with
    /// `InvalidTransition`. Callers check `epic_id` on the returned row to
    /// drive epic rollup.
    pub fn done(&self, id: &str, reason: Option<String>, commit: Option<String>) -> Result<Task> {
        let current = self.get_task(id)?;
        if !current.status.can_transition_to(TaskStatus::Done) {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: current.status,
                to: TaskStatus::Done,
            });
        }
        self.update_task(
            id,
            TaskPatch {
                status: Some(TaskStatus::Done),
                reason,
                commit_hash: commit,
                ..TaskPatch::default()
            },
        )
    }

    pub fn add_dependency(&self, task_id: &str, blocker_id: &str) -> Result<Task> {
        let _guard = self.write_guard.lock().unwrap();
        let mut tasks = self.list_tasks()?;
        if !tasks.iter().any(|t| t.short_id == blocker_id) {
            return Err(StoreError::NotFound(blocker_id.to_string()));
        }
        let task = tasks
            .iter_mut()
            .find(|t| t.short_id == task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        task.blocked_by.insert(blocker_id.to_string());
        task.updated_at = Utc::now();
        let updated = task.clone();

        if let Some(cycle) = queue::find_cycle(&tasks) {
            // Store unchanged: the mutation above only lives in this snapshot.
            return Err(StoreError::CycleDetected(cycle.join(" -> ")));
        }
        self.save(TASKS_FILE, &tasks)?;
        Ok(updated)
    }

    pub fn remove_dependency(&self, task_id: &str, blocker_id: &str) -> Result<Task> {
        let _guard = self.write_guard.lock().unwrap();
        let mut tasks = self.list_tasks()?;
        let task = tasks
            .iter_mut()
            .find(|t| t.short_id == task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        if !task.blocked_by.remove(blocker_id) {
            return Err(StoreError::NotFound(format!(
                "{task_id} is not blocked by {blocker_id}"
            )));
        }
        task.updated_at = Utc::now();
        let updated = task.clone();
        self.save(TASKS_FILE, &tasks)?;
        Ok(updated)
    }

    /// The ordered ready set (eligibility rules minus agent cool-down,
    /// which the scheduler owns).
    pub fn list_ready(&self) -> Result<Vec<Task>> {
        let tasks = self.list_tasks()?;
        let epics = self.list_epics()?;
        Ok(queue::ready_tasks(&tasks, &epics)
            .into_iter()
            .cloned()
            .collect())
    }

    // ------------------------------------------------------------------
    // Epics
    // ------------------------------------------------------------------

    pub fn get_epic(&self, id: &str) -> Result<Epic> {
        self.list_epics()?
            .into_iter()
            .find(|e| e.short_id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    pub fn create_epic(
        &self,
        title: &str,
        description: Option<String>,
        self_guided: bool,
        plan_filename: Option<String>,
    ) -> Result<Epic> {
        if title.trim().is_empty() {
            return Err(StoreError::InvalidField("title must not be empty".into()));
        }
        let _guard = self.write_guard.lock().unwrap();
        let mut epics = self.list_epics()?;
        let short_id = unique_id(new_epic_id, |id| epics.iter().any(|e| e.short_id == id));
        let mut epic = Epic::new(short_id, title.trim().to_string());
        epic.description = description;
        epic.self_guided = self_guided;
        epic.plan_filename = plan_filename;
        epics.push(epic.clone());
        self.save(EPICS_FILE, &epics)?;
        Ok(epic)
    }

    /// Apply an in-place mutation to one epic and persist the table.
    pub fn update_epic_with(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut Epic),
    ) -> Result<Epic> {
        let _guard = self.write_guard.lock().unwrap();
        let mut epics = self.list_epics()?;
        let epic = epics
            .iter_mut()
            .find(|e| e.short_id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        mutate(epic);
        epic.updated_at = Utc::now();
        let updated = epic.clone();
        self.save(EPICS_FILE, &epics)?;
        Ok(updated)
    }

    pub fn set_epic_status(&self, id: &str, status: EpicStatus) -> Result<Epic> {
        self.update_epic_with(id, |epic| epic.status = status)
    }

    pub fn set_mirror_status(&self, id: &str, status: MirrorStatus) -> Result<Epic> {
        self.update_epic_with(id, |epic| epic.mirror_status = status)
    }

    pub fn tasks_in_epic(&self, epic_id: &str) -> Result<Vec<Task>> {
        Ok(self
            .list_tasks()?
            .into_iter()
            .filter(|t| t.epic_id.as_deref() == Some(epic_id))
            .collect())
    }

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    /// Create the next run row for a task. `run_id` is monotonic within the
    /// task; `short_id` is project-unique.
    pub fn create_run(&self, task_id: &str, agent: &str) -> Result<Run> {
        self.get_task(task_id)?;
        let _guard = self.write_guard.lock().unwrap();
        let mut runs = self.list_runs()?;
        let next = runs
            .iter()
            .filter(|r| r.task_short_id == task_id)
            .map(|r| r.run_id)
            .max()
            .unwrap_or(0)
            + 1;
        let short_id = unique_id(new_run_id, |id| runs.iter().any(|r| r.short_id == id));
        let run = Run::new(next, short_id, task_id.to_string(), agent.to_string());
        runs.push(run.clone());
        self.save(RUNS_FILE, &runs)?;
        Ok(run)
    }

    pub fn get_run(&self, short_id: &str) -> Result<Run> {
        self.list_runs()?
            .into_iter()
            .find(|r| r.short_id == short_id)
            .ok_or_else(|| StoreError::NotFound(short_id.to_string()))
    }

    pub fn update_run(&self, short_id: &str, patch: RunPatch) -> Result<Run> {
        let _guard = self.write_guard.lock().unwrap();
        let mut runs = self.list_runs()?;
        let run = runs
            .iter_mut()
            .find(|r| r.short_id == short_id)
            .ok_or_else(|| StoreError::NotFound(short_id.to_string()))?;
        apply_run_patch(run, patch);
        let updated = run.clone();
        self.save(RUNS_FILE, &runs)?;
        Ok(updated)
    }

    /// The task's latest run is the one with the greatest `started_at`.
    pub fn latest_run(&self, task_id: &str) -> Result<Option<Run>> {
        Ok(self
            .list_runs()?
            .into_iter()
            .filter(|r| r.task_short_id == task_id)
            .max_by_key(|r| r.started_at))
    }

    pub fn update_latest_run(&self, task_id: &str, patch: RunPatch) -> Result<Run> {
        let latest = self
            .latest_run(task_id)?
            .ok_or_else(|| StoreError::NotFound(format!("no runs for {task_id}")))?;
        self.update_run(&latest.short_id, patch)
    }

    pub fn runs_for_task(&self, task_id: &str) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = self
            .list_runs()?
            .into_iter()
            .filter(|r| r.task_short_id == task_id)
            .collect();
        runs.sort_by_key(|r| r.run_id);
        Ok(runs)
    }

    // ------------------------------------------------------------------
    // Reviews
    // ------------------------------------------------------------------

    pub fn create_review(&self, task_id: &str, agent: &str) -> Result<Review> {
        self.get_task(task_id)?;
        let _guard = self.write_guard.lock().unwrap();
        let mut reviews = self.list_reviews()?;
        let short_id = unique_id(new_review_id, |id| reviews.iter().any(|r| r.short_id == id));
        let review = Review::new(short_id, task_id.to_string(), agent.to_string());
        reviews.push(review.clone());
        self.save(REVIEWS_FILE, &reviews)?;
        Ok(review)
    }

    pub fn update_review(
        &self,
        short_id: &str,
        status: ReviewStatus,
        issues: Vec<String>,
    ) -> Result<Review> {
        let _guard = self.write_guard.lock().unwrap();
        let mut reviews = self.list_reviews()?;
        let review = reviews
            .iter_mut()
            .find(|r| r.short_id == short_id)
            .ok_or_else(|| StoreError::NotFound(short_id.to_string()))?;
        review.status = status;
        review.issues = issues;
        review.completed_at = Some(Utc::now());
        let updated = review.clone();
        self.save(REVIEWS_FILE, &reviews)?;
        Ok(updated)
    }

    /// The newest pending review for a task, if any.
    pub fn pending_review(&self, task_id: &str) -> Result<Option<Review>> {
        Ok(self
            .list_reviews()?
            .into_iter()
            .filter(|r| r.task_short_id == task_id && r.status == ReviewStatus::Pending)
            .max_by_key(|r| r.started_at))
    }

    // ------------------------------------------------------------------
    // Backlog
    // ------------------------------------------------------------------

    pub fn backlog_add(&self, title: &str, description: Option<String>) -> Result<BacklogItem> {
        if title.trim().is_empty() {
            return Err(StoreError::InvalidField("title must not be empty".into()));
        }
        let _guard = self.write_guard.lock().unwrap();
        let mut items = self.list_backlog()?;
        let item = BacklogItem::new(title.trim().to_string(), description);
        items.push(item.clone());
        self.save(BACKLOG_FILE, &items)?;
        Ok(item)
    }
}

fn apply_run_patch(run: &mut Run, patch: RunPatch) {
    if let Some(model) = patch.model {
        run.model = Some(model);
    }
    if let Some(ended_at) = patch.ended_at {
        run.ended_at = Some(ended_at);
    }
    if let Some(exit_code) = patch.exit_code {
        run.exit_code = Some(exit_code);
    }
    if let Some(cost) = patch.cost_usd {
        run.cost_usd = Some(cost);
    }
    if let Some(session) = patch.session_id {
        run.session_id = Some(session);
    }
    if let Some(pid) = patch.pid {
        run.pid = Some(pid);
    }
    if let Some(output) = patch.output {
        run.output = output;
    }
    if let Some(commit) = patch.commit_hash {
        run.commit_hash = Some(commit);
    }
}

fn unique_id(generate: impl Fn() -> String, taken: impl Fn(&str) -> bool) -> String {
    loop {
        let id = generate();
        if !taken(&id) {
            return id;
        }
    }
}

/// Atomic write using temp file and rename.
fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&temp_path, path)?;
    Ok(())
}
