//! The consume daemon's tick loop.
//!
//! Single-threaded and cooperative: each tick reaps finished children,
//! rolls completions into the store, admits ready work up to the
//! concurrency cap, dispatches agent processes, broadcasts events, and
//! drains IPC commands. The loop sleeps for the tick interval but wakes
//! early when a command arrives.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use fuel_store::{NewTask, RunPatch, Store};
use fuel_types::{DaemonEvent, Task, TaskStatus};

use crate::config::ConsumeConfig;
use crate::driver::{
    harvest_output, DriverRegistry, InvocationContext, EPIC_MERGE_AGENT, EPIC_REVIEW_AGENT,
};
use crate::epics::EpicController;
use crate::error::Result;
use crate::event_bus::EventBus;
use crate::health::HealthTracker;
use crate::prompt;
use crate::review::{parse_review_output, settle_review, ReviewVerdict};
use crate::supervisor::{Completion, RunOutcome, SpawnSpec, Supervisor};

/// Commands funnelled into the tick loop from IPC clients (and the CLI).
pub enum DaemonCommand {
    PauseTask {
        task_id: String,
    },
    UnpauseTask {
        task_id: String,
    },
    CancelRun {
        task_id: String,
    },
    InjectTask {
        title: String,
        description: Option<String>,
        agent: Option<String>,
    },
    HealthReset,
    Status {
        reply: oneshot::Sender<Value>,
    },
    Browser {
        op: String,
        params: Value,
        reply: oneshot::Sender<std::result::Result<Value, String>>,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunPurpose {
    Task,
    Review,
}

#[derive(Debug, Clone)]
struct RunningRun {
    task_short_id: String,
    agent: String,
    purpose: RunPurpose,
}

pub struct Scheduler {
    store: Arc<Store>,
    supervisor: Arc<Supervisor>,
    registry: DriverRegistry,
    epics: EpicController,
    health: HealthTracker,
    events: EventBus,
    config: ConsumeConfig,
    project_root: PathBuf,
    /// Live runs keyed by run short id
    running: HashMap<String, RunningRun>,
    cmd_rx: mpsc::Receiver<DaemonCommand>,
    shutdown: CancellationToken,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        supervisor: Arc<Supervisor>,
        registry: DriverRegistry,
        epics: EpicController,
        health: HealthTracker,
        events: EventBus,
        config: ConsumeConfig,
        project_root: PathBuf,
        cmd_rx: mpsc::Receiver<DaemonCommand>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            supervisor,
            registry,
            epics,
            health,
            events,
            config,
            project_root,
            running: HashMap::new(),
            cmd_rx,
            shutdown,
        }
    }

    /// Drive ticks until shutdown, then run the drain sequence.
    pub async fn run(mut self) -> Result<()> {
        let interval = Duration::from_millis(self.config.interval_ms.max(50));
        tracing::info!(
            interval_ms = self.config.interval_ms,
            concurrency_cap = self.config.concurrency_cap,
            review_enabled = self.config.review_enabled,
            "consume loop started"
        );
        loop {
            if let Err(e) = self.tick().await {
                if e.is_fatal() {
                    tracing::error!("fatal error in tick: {e}");
                    self.shutdown.cancel();
                } else {
                    tracing::warn!("tick error: {e}");
                }
            }
            if self.shutdown.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                Some(cmd) = self.cmd_rx.recv() => {
                    self.handle_command(cmd).await;
                }
                _ = self.shutdown.cancelled() => break,
            }
        }
        self.drain().await;
        Ok(())
    }

    pub(crate) async fn tick(&mut self) -> Result<()> {
        self.reap().await?;
        self.admit_and_dispatch().await?;
        self.events.publish(DaemonEvent::Heartbeat {
            running: self.running.len(),
            ready: self.store.list_ready()?.len(),
            timestamp: Utc::now(),
        });
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            self.handle_command(cmd).await;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reap
    // ------------------------------------------------------------------

    async fn reap(&mut self) -> Result<()> {
        for completion in self.supervisor.poll() {
            let Some(running) = self.running.remove(&completion.run_short_id) else {
                tracing::warn!(run = %completion.run_short_id, "completion for unknown run");
                continue;
            };
            let cost_usd = match self.record_completion(&running, &completion) {
                Ok(cost) => cost,
                Err(e) => {
                    tracing::warn!(run = %completion.run_short_id, "failed to record completion: {e}");
                    None
                }
            };
            self.events.publish(DaemonEvent::RunCompleted {
                task_short_id: running.task_short_id.clone(),
                run_short_id: completion.run_short_id.clone(),
                exit_code: completion.exit_code,
                cost_usd,
                timestamp: completion.ended_at,
            });
            let result = match running.purpose {
                RunPurpose::Task => self.finish_task_run(&running, &completion),
                RunPurpose::Review => self.finish_review_run(&running, &completion),
            };
            if let Err(e) = result {
                tracing::warn!(task = %running.task_short_id, "completion handling failed: {e}");
            }
        }
        Ok(())
    }

    fn record_completion(
        &self,
        running: &RunningRun,
        completion: &Completion,
    ) -> Result<Option<f64>> {
        let harvest = self
            .registry
            .resolve(&running.agent)
            .map(|driver| harvest_output(driver, &completion.stdout_tail))
            .unwrap_or_default();
        let cost_usd = harvest.cost_usd;
        self.store.update_run(
            &completion.run_short_id,
            RunPatch {
                model: harvest.model,
                cost_usd: harvest.cost_usd,
                session_id: harvest.session_id,
                exit_code: Some(completion.exit_code.unwrap_or(-1)),
                ended_at: Some(completion.ended_at),
                output: Some(completion.stdout_tail.clone()),
                ..RunPatch::default()
            },
        )?;
        Ok(cost_usd)
    }

    fn finish_task_run(&mut self, running: &RunningRun, completion: &Completion) -> Result<()> {
        let task = self.store.get_task(&running.task_short_id)?;
        if task.status != TaskStatus::InProgress {
            // Paused mid-run (cancel + pause); leave the user's state alone.
            return Ok(());
        }
        let success =
            completion.outcome == RunOutcome::NormalExit && completion.exit_code == Some(0);

        if success {
            self.health.record_success(&running.agent);
            self.on_task_success(&task, completion)?;
        } else {
            if completion.outcome != RunOutcome::Killed {
                self.health.record_failure(&running.agent);
            }
            let reason = match completion.outcome {
                RunOutcome::Killed => "run cancelled".to_string(),
                RunOutcome::CrashedEarly => "agent crashed before starting".to_string(),
                RunOutcome::NormalExit => format!(
                    "agent exited with code {}",
                    completion.exit_code.unwrap_or(-1)
                ),
            };
            self.transition(&task.short_id, TaskStatus::Open, Some(reason))?;
            if running.agent == EPIC_MERGE_AGENT {
                if let Some(epic_id) = &task.epic_id {
                    self.epics
                        .on_merge_result(&self.store, epic_id, &task.short_id, false)?;
                }
            }
        }
        Ok(())
    }

    fn on_task_success(&mut self, task: &Task, completion: &Completion) -> Result<()> {
        let agent = task.agent.as_deref().unwrap_or("");
        let is_internal = agent == EPIC_REVIEW_AGENT || agent == EPIC_MERGE_AGENT;

        // Self-guided tasks loop with the same short id until the agent
        // prints the completion marker or the iteration ceiling trips.
        if task.is_selfguided() && !prompt::selfguided_complete(&completion.stdout_tail) {
            let next_iteration = task.selfguided_iteration + 1;
            if next_iteration < self.config.selfguided_max_iterations {
                self.store.update_task(
                    &task.short_id,
                    fuel_store::TaskPatch {
                        status: Some(TaskStatus::Open),
                        selfguided_iteration: Some(next_iteration),
                        ..fuel_store::TaskPatch::default()
                    },
                )?;
                self.events.publish(DaemonEvent::TaskStatusChanged {
                    task_short_id: task.short_id.clone(),
                    from: TaskStatus::InProgress,
                    to: TaskStatus::Open,
                    reason: Some(format!("self-guided iteration {next_iteration}")),
                    timestamp: Utc::now(),
                });
                return Ok(());
            }
            self.mark_done(task, Some("iteration-ceiling".to_string()))?;
            return Ok(());
        }

        if self.config.review_enabled && !is_internal {
            self.transition(&task.short_id, TaskStatus::Review, None)?;
            self.store
                .create_review(&task.short_id, &self.config.review_agent)?;
            return Ok(());
        }

        self.mark_done(task, None)?;
        if agent == EPIC_MERGE_AGENT {
            if let Some(epic_id) = &task.epic_id {
                self.epics
                    .on_merge_result(&self.store, epic_id, &task.short_id, true)?;
            }
        }
        Ok(())
    }

    fn mark_done(&mut self, task: &Task, reason: Option<String>) -> Result<()> {
        let from = self.store.get_task(&task.short_id)?.status;
        self.store.done(&task.short_id, reason.clone(), None)?;
        self.events.publish(DaemonEvent::TaskStatusChanged {
            task_short_id: task.short_id.clone(),
            from,
            to: TaskStatus::Done,
            reason,
            timestamp: Utc::now(),
        });
        if let Some(epic_id) = &task.epic_id {
            if task.agent.as_deref() != Some(EPIC_MERGE_AGENT) {
                self.epics
                    .check_epic_completion(&self.store, &self.events, epic_id)?;
            }
        }
        Ok(())
    }

    fn finish_review_run(&mut self, running: &RunningRun, completion: &Completion) -> Result<()> {
        let success =
            completion.outcome == RunOutcome::NormalExit && completion.exit_code == Some(0);
        let verdict = if success {
            parse_review_output(&completion.stdout_tail)
        } else {
            ReviewVerdict {
                passed: false,
                issues: vec!["reviewer run failed".to_string()],
            }
        };
        settle_review(&self.store, &running.task_short_id, &verdict)?;

        let task = self.store.get_task(&running.task_short_id)?;
        if task.status != TaskStatus::Review {
            return Ok(());
        }
        if verdict.passed {
            self.mark_done(&task, None)?;
        } else {
            self.transition(
                &task.short_id,
                TaskStatus::Open,
                Some("review failed".to_string()),
            )?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Admit & dispatch
    // ------------------------------------------------------------------

    async fn admit_and_dispatch(&mut self) -> Result<()> {
        let mut free = self
            .config
            .concurrency_cap
            .saturating_sub(self.running.len());
        if free == 0 {
            return Ok(());
        }

        // Reviewer runs first; they block their tasks' terminal state and
        // share the concurrency cap with task runs.
        let awaiting_review: Vec<Task> = self
            .store
            .list_tasks()?
            .into_iter()
            .filter(|t| t.status == TaskStatus::Review && !self.task_has_live_run(&t.short_id))
            .collect();
        for task in awaiting_review {
            if free == 0 {
                return Ok(());
            }
            if self.store.pending_review(&task.short_id)?.is_none() {
                continue;
            }
            if self.dispatch_review(&task).await {
                free -= 1;
            }
        }

        for task in self.store.list_ready()? {
            if free == 0 {
                break;
            }
            if self.task_has_live_run(&task.short_id) {
                continue;
            }
            let agent = self.agent_for(&task);
            if self.health.in_cooldown(&agent) {
                tracing::debug!(task = %task.short_id, agent, "skipping: agent in cool-down");
                continue;
            }
            if self.dispatch_task(&task, &agent).await {
                free -= 1;
            }
        }
        Ok(())
    }

    fn agent_for(&self, task: &Task) -> String {
        task.agent
            .clone()
            .unwrap_or_else(|| self.config.default_agent.clone())
    }

    fn task_has_live_run(&self, task_short_id: &str) -> bool {
        self.running
            .values()
            .any(|r| r.task_short_id == task_short_id)
    }

    /// Returns true when a child was actually spawned.
    async fn dispatch_task(&mut self, task: &Task, agent: &str) -> bool {
        match self.try_dispatch(task, agent, RunPurpose::Task).await {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::warn!(task = %task.short_id, "dispatch failed: {e}");
                self.events.publish(DaemonEvent::Error {
                    message: format!("dispatch of {} failed: {e}", task.short_id),
                    timestamp: Utc::now(),
                });
                false
            }
        }
    }

    async fn dispatch_review(&mut self, task: &Task) -> bool {
        let agent = self.config.review_agent.clone();
        match self.try_dispatch(task, &agent, RunPurpose::Review).await {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::warn!(task = %task.short_id, "reviewer dispatch failed: {e}");
                false
            }
        }
    }

    async fn try_dispatch(
        &mut self,
        task: &Task,
        agent: &str,
        purpose: RunPurpose,
    ) -> Result<bool> {
        let driver = self.registry.resolve(agent)?;

        let epic = match &task.epic_id {
            Some(epic_id) => Some(self.store.get_epic(epic_id)?),
            None => None,
        };
        let cwd = match &task.epic_id {
            Some(epic_id) if purpose == RunPurpose::Task => self
                .epics
                .ensure_mirror(&self.store, epic_id)
                .await?
                .unwrap_or_else(|| self.project_root.clone()),
            _ => self.project_root.clone(),
        };

        let plan_snippet = epic
            .as_ref()
            .and_then(|e| prompt::load_plan_snippet(&self.store.plans_dir(), e));
        let prompt_text = match purpose {
            RunPurpose::Review => prompt::review_prompt(task),
            RunPurpose::Task if agent == EPIC_REVIEW_AGENT => prompt::epic_review_prompt(
                epic.as_ref().map(|e| e.title.as_str()).unwrap_or_default(),
            ),
            RunPurpose::Task if agent == EPIC_MERGE_AGENT => {
                let branch = epic
                    .as_ref()
                    .and_then(|e| e.mirror_branch.clone())
                    .unwrap_or_else(|| "epic branch".to_string());
                prompt::merge_prompt(
                    epic.as_ref().map(|e| e.title.as_str()).unwrap_or_default(),
                    &branch,
                )
            }
            RunPurpose::Task if task.is_selfguided() => {
                prompt::selfguided_prompt(task, epic.as_ref(), plan_snippet.as_deref())
            }
            RunPurpose::Task => prompt::task_prompt(task, epic.as_ref(), plan_snippet.as_deref()),
        };

        let mut ctx = InvocationContext::new(prompt_text, &cwd);
        if task.is_selfguided() && task.selfguided_iteration > 0 {
            // Resume the same agent session across iterations of the loop.
            ctx.session_id = self
                .store
                .latest_run(&task.short_id)?
                .and_then(|r| r.session_id);
        }
        let invocation = driver.build_invocation(&ctx);

        if purpose == RunPurpose::Task {
            self.transition(&task.short_id, TaskStatus::InProgress, None)?;
        }
        let run = self.store.create_run(&task.short_id, agent)?;

        let spawned = self.supervisor.spawn(SpawnSpec {
            run_short_id: run.short_id.clone(),
            argv: invocation.argv,
            env: invocation.env,
            cwd,
            timeout: Duration::from_secs(self.config.agent_timeout_seconds),
        });
        match spawned {
            Ok(pid) => {
                self.store.update_run(
                    &run.short_id,
                    RunPatch {
                        pid: Some(pid),
                        ..RunPatch::default()
                    },
                )?;
                self.running.insert(
                    run.short_id.clone(),
                    RunningRun {
                        task_short_id: task.short_id.clone(),
                        agent: agent.to_string(),
                        purpose,
                    },
                );
                self.events.publish(DaemonEvent::RunStarted {
                    task_short_id: task.short_id.clone(),
                    run_short_id: run.short_id,
                    agent: agent.to_string(),
                    timestamp: Utc::now(),
                });
                Ok(true)
            }
            Err(e) => {
                self.store.update_run(
                    &run.short_id,
                    RunPatch {
                        exit_code: Some(-1),
                        ended_at: Some(Utc::now()),
                        output: Some(format!("spawn failed: {e}")),
                        ..RunPatch::default()
                    },
                )?;
                if purpose == RunPurpose::Task {
                    self.transition(
                        &task.short_id,
                        TaskStatus::Open,
                        Some("spawn failed".to_string()),
                    )?;
                }
                self.health.record_failure(agent);
                Err(e)
            }
        }
    }

    fn transition(&self, task_id: &str, to: TaskStatus, reason: Option<String>) -> Result<()> {
        let (_, from) = self.store.set_task_status(task_id, to, reason.clone())?;
        self.events.publish(DaemonEvent::TaskStatusChanged {
            task_short_id: task_id.to_string(),
            from,
            to,
            reason,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: DaemonCommand) {
        let result = match cmd {
            DaemonCommand::PauseTask { task_id } => self.cmd_pause(&task_id),
            DaemonCommand::UnpauseTask { task_id } => {
                self.transition(&task_id, TaskStatus::Open, None)
            }
            DaemonCommand::CancelRun { task_id } => self.cmd_cancel(&task_id),
            DaemonCommand::InjectTask {
                title,
                description,
                agent,
            } => self.cmd_inject(title, description, agent),
            DaemonCommand::HealthReset => {
                self.health.reset();
                Ok(())
            }
            DaemonCommand::Status { reply } => {
                let _ = reply.send(self.status_payload());
                Ok(())
            }
            DaemonCommand::Browser { op, reply, .. } => {
                // Adjunct surface: without a registered bridge every browser
                // request answers with an error, never a crash.
                let _ = reply.send(Err(format!("browser bridge not available (op {op})")));
                Ok(())
            }
            DaemonCommand::Shutdown => {
                self.shutdown.cancel();
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::warn!("command failed: {e}");
            self.events.publish(DaemonEvent::Error {
                message: e.to_string(),
                timestamp: Utc::now(),
            });
        }
    }

    fn cmd_pause(&mut self, task_id: &str) -> Result<()> {
        let task = self.store.get_task(task_id)?;
        if task.status == TaskStatus::InProgress {
            self.kill_live_run(task_id);
        }
        self.transition(task_id, TaskStatus::Paused, None)
    }

    fn cmd_cancel(&mut self, task_id: &str) -> Result<()> {
        // The kill is delivered now; the Killed completion is reaped next
        // tick and returns the task to open.
        self.kill_live_run(task_id);
        Ok(())
    }

    fn kill_live_run(&self, task_id: &str) {
        let run_ids: Vec<String> = self
            .running
            .iter()
            .filter(|(_, r)| r.task_short_id == task_id)
            .map(|(run_id, _)| run_id.clone())
            .collect();
        for run_id in run_ids {
            if let Err(e) = self.supervisor.kill(&run_id, libc::SIGTERM) {
                tracing::warn!(run = %run_id, "kill failed: {e}");
            }
        }
    }

    fn cmd_inject(
        &mut self,
        title: String,
        description: Option<String>,
        agent: Option<String>,
    ) -> Result<()> {
        let task = self.store.create_task(NewTask {
            title,
            description,
            agent,
            ..NewTask::default()
        })?;
        self.events.publish(DaemonEvent::TaskCreated {
            task_short_id: task.short_id,
            title: task.title,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    fn status_payload(&self) -> Value {
        let tasks = self.store.list_tasks().unwrap_or_default();
        let count = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count();
        json!({
            "running": self.running.len(),
            "concurrency_cap": self.config.concurrency_cap,
            "review_enabled": self.config.review_enabled,
            "tasks": {
                "open": count(TaskStatus::Open),
                "in_progress": count(TaskStatus::InProgress),
                "review": count(TaskStatus::Review),
                "done": count(TaskStatus::Done),
                "paused": count(TaskStatus::Paused),
                "someday": count(TaskStatus::Someday),
            },
        })
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Graceful drain: SIGTERM every child, wait out the grace window while
    /// reaping, SIGKILL stragglers, and return orphaned tasks to `open`.
    async fn drain(&mut self) {
        tracing::info!("consume loop stopping");
        self.supervisor.terminate_all();

        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.shutdown_grace_seconds);
        while self.supervisor.running_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = self.reap().await;
        }
        if self.supervisor.running_count() > 0 {
            tracing::warn!(
                remaining = self.supervisor.running_count(),
                "grace expired, killing remaining children"
            );
            self.supervisor.kill_all();
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = self.reap().await;
        }

        // Anything still tracked never produced a completion; close it out.
        let leftovers: Vec<RunningRun> = self.running.drain().map(|(_, r)| r).collect();
        for run in leftovers {
            if let Ok(task) = self.store.get_task(&run.task_short_id) {
                if task.status == TaskStatus::InProgress {
                    let _ = self.transition(
                        &task.short_id,
                        TaskStatus::Open,
                        Some("daemon-shutdown".to_string()),
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthConfig;
    use crate::driver::{AgentDriver, AgentEvent, Invocation, SELFGUIDED_AGENT};
    use fuel_types::EpicStatus;
    use tempfile::tempdir;

    /// Test driver that ignores the prompt and runs a fixed shell script.
    struct StubDriver {
        name: &'static str,
        script: &'static str,
    }

    impl AgentDriver for StubDriver {
        fn name(&self) -> &'static str {
            self.name
        }

        fn build_invocation(&self, _ctx: &InvocationContext) -> Invocation {
            Invocation {
                argv: vec!["/bin/sh".into(), "-c".into(), self.script.into()],
                env: Vec::new(),
            }
        }

        fn parse_line(&self, _line: &str) -> AgentEvent {
            AgentEvent::Unknown
        }

        fn resume_command(&self, _session_id: &str) -> String {
            String::new()
        }
    }

    struct Harness {
        scheduler: Scheduler,
        store: Arc<Store>,
        _tx: mpsc::Sender<DaemonCommand>,
    }

    fn harness(config: ConsumeConfig, drivers: Vec<StubDriver>) -> (Harness, tempfile::TempDir) {
        let temp = tempdir().unwrap();
        let store = Arc::new(Store::open(temp.path()).unwrap());
        let supervisor = Arc::new(Supervisor::new(store.processes_dir()));
        let mut registry = DriverRegistry::new(&config);
        for driver in drivers {
            registry.register(Box::new(driver));
        }
        let epics = EpicController::new(temp.path().to_path_buf(), false);
        let health = HealthTracker::new(&config.health);
        let events = EventBus::new();
        let (tx, rx) = mpsc::channel(64);
        let scheduler = Scheduler::new(
            store.clone(),
            supervisor,
            registry,
            epics,
            health,
            events,
            config,
            temp.path().to_path_buf(),
            rx,
            CancellationToken::new(),
        );
        (
            Harness {
                scheduler,
                store,
                _tx: tx,
            },
            temp,
        )
    }

    async fn tick_until_idle(h: &mut Harness) {
        for _ in 0..200 {
            h.scheduler.tick().await.unwrap();
            if h.scheduler.running.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("scheduler never went idle");
    }

    async fn wait_children(h: &Harness) {
        for _ in 0..200 {
            if h.scheduler.supervisor.running_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("children never exited");
    }

    fn test_config() -> ConsumeConfig {
        ConsumeConfig {
            interval_ms: 50,
            concurrency_cap: 1,
            default_agent: "ok-agent".into(),
            review_agent: "pass-reviewer".into(),
            health: HealthConfig {
                failure_threshold: 2,
                cooldown_seconds: 300,
            },
            agent_timeout_seconds: 30,
            ..ConsumeConfig::default()
        }
    }

    fn drivers() -> Vec<StubDriver> {
        vec![
            StubDriver {
                name: "ok-agent",
                script: "echo done",
            },
            StubDriver {
                name: "fail-agent",
                script: "echo broken; exit 1",
            },
            StubDriver {
                name: "slow-agent",
                script: "sleep 5",
            },
            StubDriver {
                name: "pass-reviewer",
                script: "echo 'VERDICT: PASS'",
            },
            StubDriver {
                name: "fail-reviewer",
                script: "echo 'VERDICT: FAIL'; echo 'ISSUE: not finished'",
            },
        ]
    }

    #[tokio::test]
    async fn successful_run_marks_task_done() {
        let (mut h, _temp) = harness(test_config(), drivers());
        let task = h
            .store
            .create_task(NewTask {
                title: "do it".into(),
                ..NewTask::default()
            })
            .unwrap();

        tick_until_idle(&mut h).await;

        let task = h.store.get_task(&task.short_id).unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        let run = h.store.latest_run(&task.short_id).unwrap().unwrap();
        assert_eq!(run.exit_code, Some(0));
        assert!(run.ended_at.is_some());
        assert!(run.output.contains("done"));
        assert!(run.pid.is_some());
    }

    #[tokio::test]
    async fn failed_run_returns_task_to_open() {
        let (mut h, _temp) = harness(test_config(), drivers());
        let task = h
            .store
            .create_task(NewTask {
                title: "doomed".into(),
                agent: Some("fail-agent".into()),
                ..NewTask::default()
            })
            .unwrap();

        // One dispatch + one reap, then stop before the retry dispatch.
        h.scheduler.tick().await.unwrap();
        wait_children(&h).await;
        h.scheduler.reap().await.unwrap();

        let task = h.store.get_task(&task.short_id).unwrap();
        assert_eq!(task.status, TaskStatus::Open);
        assert!(task.reason.as_deref().unwrap_or("").contains("exited"));
        // Failure retry stays eligible; the health tracker guards runaways.
        assert_eq!(h.store.list_ready().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrency_cap_bounds_dispatch() {
        let mut config = test_config();
        config.concurrency_cap = 2;
        config.default_agent = "slow-agent".into();
        let (mut h, _temp) = harness(config, drivers());
        for idx in 0..5 {
            h.store
                .create_task(NewTask {
                    title: format!("task {idx}"),
                    ..NewTask::default()
                })
                .unwrap();
        }

        h.scheduler.tick().await.unwrap();

        let tasks = h.store.list_tasks().unwrap();
        let in_progress = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .count();
        assert_eq!(in_progress, 2);
        assert_eq!(h.scheduler.running.len(), 2);

        // A second tick with a full cap admits nothing new.
        h.scheduler.tick().await.unwrap();
        assert_eq!(h.scheduler.running.len(), 2);
    }

    #[tokio::test]
    async fn review_pipeline_pass_and_fail() {
        let mut config = test_config();
        config.review_enabled = true;
        let (mut h, _temp) = harness(config, drivers());
        let task = h
            .store
            .create_task(NewTask {
                title: "needs review".into(),
                ..NewTask::default()
            })
            .unwrap();

        tick_until_idle(&mut h).await;

        let task_row = h.store.get_task(&task.short_id).unwrap();
        assert_eq!(task_row.status, TaskStatus::Done);
        let reviews = h.store.list_reviews().unwrap();
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].status, fuel_types::ReviewStatus::Passed);

        // Failing reviewer sends the next task back to open with issues.
        // Stepped manually: a bounced task is immediately ready again, so
        // the idle helper would chase the retry loop forever.
        let mut config = test_config();
        config.review_enabled = true;
        config.review_agent = "fail-reviewer".into();
        let (mut h, _temp) = harness(config, drivers());
        let task = h
            .store
            .create_task(NewTask {
                title: "gets bounced".into(),
                ..NewTask::default()
            })
            .unwrap();

        h.scheduler.tick().await.unwrap(); // dispatch the task run
        wait_children(&h).await;
        h.scheduler.tick().await.unwrap(); // reap -> review, dispatch reviewer
        assert_eq!(
            h.store.get_task(&task.short_id).unwrap().status,
            TaskStatus::Review
        );
        wait_children(&h).await;
        h.scheduler.reap().await.unwrap(); // settle the verdict only

        let task_row = h.store.get_task(&task.short_id).unwrap();
        assert_eq!(task_row.status, TaskStatus::Open);
        assert_eq!(task_row.reason.as_deref(), Some("review failed"));
        let reviews = h.store.list_reviews().unwrap();
        assert_eq!(reviews[0].status, fuel_types::ReviewStatus::Failed);
        assert_eq!(reviews[0].issues, vec!["not finished".to_string()]);
    }

    #[tokio::test]
    async fn epic_completion_creates_review_task_within_a_tick() {
        let (mut h, _temp) = harness(test_config(), drivers());
        let epic = h.store.create_epic("big one", None, false, None).unwrap();
        h.store
            .set_epic_status(&epic.short_id, EpicStatus::Active)
            .unwrap();
        for idx in 0..2 {
            h.store
                .create_task(NewTask {
                    title: format!("part {idx}"),
                    epic_id: Some(epic.short_id.clone()),
                    ..NewTask::default()
                })
                .unwrap();
        }

        // Cap 1: the two member tasks run one after the other. The epic
        // review task appears in the tick that reaps the second completion.
        for _ in 0..200 {
            h.scheduler.tick().await.unwrap();
            tokio::time::sleep(Duration::from_millis(25)).await;
            let epic_row = h.store.get_epic(&epic.short_id).unwrap();
            if epic_row.status == EpicStatus::Review {
                break;
            }
        }

        let epic_row = h.store.get_epic(&epic.short_id).unwrap();
        assert_eq!(epic_row.status, EpicStatus::Review);
        let members = h.store.tasks_in_epic(&epic.short_id).unwrap();
        assert!(members
            .iter()
            .any(|t| t.agent.as_deref() == Some(EPIC_REVIEW_AGENT)));
    }

    #[tokio::test]
    async fn cooldown_skips_agent_until_it_recovers() {
        let mut config = test_config();
        config.health.failure_threshold = 1;
        let (mut h, _temp) = harness(config, drivers());
        let task = h
            .store
            .create_task(NewTask {
                title: "flaky".into(),
                agent: Some("fail-agent".into()),
                ..NewTask::default()
            })
            .unwrap();

        // First dispatch fails and trips the threshold.
        h.scheduler.tick().await.unwrap();
        wait_children(&h).await;
        h.scheduler.reap().await.unwrap();
        assert!(h.scheduler.health.in_cooldown("fail-agent"));

        // The task is ready but its agent is cooling down: no dispatch.
        h.scheduler.tick().await.unwrap();
        assert!(h.scheduler.running.is_empty());
        assert_eq!(
            h.store.get_task(&task.short_id).unwrap().status,
            TaskStatus::Open
        );
    }

    #[tokio::test]
    async fn inject_and_pause_commands() {
        let (mut h, _temp) = harness(test_config(), drivers());
        h.scheduler
            .handle_command(DaemonCommand::InjectTask {
                title: "injected".into(),
                description: None,
                agent: Some("slow-agent".into()),
            })
            .await;
        let tasks = h.store.list_tasks().unwrap();
        assert_eq!(tasks.len(), 1);
        let id = tasks[0].short_id.clone();

        h.scheduler
            .handle_command(DaemonCommand::PauseTask {
                task_id: id.clone(),
            })
            .await;
        assert_eq!(h.store.get_task(&id).unwrap().status, TaskStatus::Paused);

        // Paused tasks are not admitted.
        h.scheduler.tick().await.unwrap();
        assert!(h.scheduler.running.is_empty());

        h.scheduler
            .handle_command(DaemonCommand::UnpauseTask {
                task_id: id.clone(),
            })
            .await;
        assert_eq!(h.store.get_task(&id).unwrap().status, TaskStatus::Open);
    }

    #[tokio::test]
    async fn cancel_kills_the_running_child() {
        let mut config = test_config();
        config.default_agent = "slow-agent".into();
        let (mut h, _temp) = harness(config, drivers());
        let task = h
            .store
            .create_task(NewTask {
                title: "long haul".into(),
                ..NewTask::default()
            })
            .unwrap();

        h.scheduler.tick().await.unwrap();
        assert_eq!(h.scheduler.running.len(), 1);

        h.scheduler
            .handle_command(DaemonCommand::CancelRun {
                task_id: task.short_id.clone(),
            })
            .await;
        wait_children(&h).await;
        h.scheduler.reap().await.unwrap();

        let task_row = h.store.get_task(&task.short_id).unwrap();
        assert_eq!(task_row.status, TaskStatus::Open);
        assert_eq!(task_row.reason.as_deref(), Some("run cancelled"));
    }

    #[tokio::test]
    async fn selfguided_task_loops_until_marker() {
        // The selfguided logical agent runs on the configured default.
        let mut config = test_config();
        config.selfguided_max_iterations = 25;
        let (mut h, _temp) = harness(
            config,
            vec![
                StubDriver {
                    name: "ok-agent",
                    // Completes on the marker immediately: single iteration.
                    script: "echo FUEL_COMPLETE",
                },
                StubDriver {
                    name: "pass-reviewer",
                    script: "echo 'VERDICT: PASS'",
                },
            ],
        );

        let finishing = h
            .store
            .create_task(NewTask {
                title: "self loop".into(),
                agent: Some(SELFGUIDED_AGENT.to_string()),
                ..NewTask::default()
            })
            .unwrap();
        tick_until_idle(&mut h).await;
        let row = h.store.get_task(&finishing.short_id).unwrap();
        assert_eq!(row.status, TaskStatus::Done);
        assert_eq!(row.selfguided_iteration, 0);

        // Without the marker the task is re-queued with a bumped iteration.
        let mut config = test_config();
        config.selfguided_max_iterations = 25;
        config.default_agent = "loop-agent".into();
        let (mut h, _temp) = harness(
            config,
            vec![
                StubDriver {
                    name: "loop-agent",
                    script: "echo still going",
                },
                StubDriver {
                    name: "pass-reviewer",
                    script: "echo 'VERDICT: PASS'",
                },
            ],
        );
        let looping = h
            .store
            .create_task(NewTask {
                title: "keeps looping".into(),
                agent: Some(SELFGUIDED_AGENT.to_string()),
                ..NewTask::default()
            })
            .unwrap();
        h.scheduler.tick().await.unwrap();
        wait_children(&h).await;
        h.scheduler.reap().await.unwrap();
        let row = h.store.get_task(&looping.short_id).unwrap();
        assert_eq!(row.status, TaskStatus::Open);
        assert_eq!(row.selfguided_iteration, 1);
    }

    #[tokio::test]
    async fn selfguided_ceiling_forces_done() {
        let mut config = test_config();
        config.selfguided_max_iterations = 2;
        config.default_agent = "loop-agent".into();
        let (mut h, _temp) = harness(
            config,
            vec![
                StubDriver {
                    name: "loop-agent",
                    script: "echo still going",
                },
                StubDriver {
                    name: "pass-reviewer",
                    script: "echo 'VERDICT: PASS'",
                },
            ],
        );
        let task = h
            .store
            .create_task(NewTask {
                title: "runaway".into(),
                agent: Some(SELFGUIDED_AGENT.to_string()),
                ..NewTask::default()
            })
            .unwrap();

        tick_until_idle(&mut h).await;

        let row = h.store.get_task(&task.short_id).unwrap();
        assert_eq!(row.status, TaskStatus::Done);
        assert_eq!(row.reason.as_deref(), Some("iteration-ceiling"));
    }

    #[tokio::test]
    async fn status_command_reports_counts() {
        let (mut h, _temp) = harness(test_config(), drivers());
        h.store
            .create_task(NewTask {
                title: "a".into(),
                ..NewTask::default()
            })
            .unwrap();
        let (reply_tx, reply_rx) = oneshot::channel();
        h.scheduler
            .handle_command(DaemonCommand::Status { reply: reply_tx })
            .await;
        let status = reply_rx.await.unwrap();
        assert_eq!(status["tasks"]["open"], 1);
        assert_eq!(status["concurrency_cap"], 1);
    }

    #[tokio::test]
    async fn browser_command_answers_with_error() {
        let (mut h, _temp) = harness(test_config(), drivers());
        let (reply_tx, reply_rx) = oneshot::channel();
        h.scheduler
            .handle_command(DaemonCommand::Browser {
                op: "navigate".into(),
                params: json!({"url": "https://example.com"}),
                reply: reply_tx,
            })
            .await;
        let result = reply_rx.await.unwrap();
        assert!(result.unwrap_err().contains("not available"));
    }
}
