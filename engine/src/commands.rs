//! CLI verb implementations: thin wrappers over the store plus the two
//! daemon entry points. Validation failures exit 2, everything else 1.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use fuel_core::supervisor::pid_alive;
use fuel_core::{lifecycle, ConfigOverrides, ConsumeConfig, DriverRegistry, EpicController, EventBus, FuelError};
use fuel_store::{NewTask, Store, StoreError, TaskPatch};
use fuel_types::{Task, TaskStatus};

use crate::output;
use crate::{Cli, Command};

#[derive(Debug)]
pub enum CliError {
    Validation(String),
    Failure(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Validation(msg) | CliError::Failure(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for CliError {}

impl From<StoreError> for CliError {
    fn from(e: StoreError) -> Self {
        if e.is_validation() {
            CliError::Validation(e.to_string())
        } else {
            CliError::Failure(e.to_string())
        }
    }
}

impl From<FuelError> for CliError {
    fn from(e: FuelError) -> Self {
        match &e {
            FuelError::InvalidConfig(_) | FuelError::UnknownAgent(_) => {
                CliError::Validation(e.to_string())
            }
            FuelError::Store(inner) if inner.is_validation() => {
                CliError::Validation(e.to_string())
            }
            _ => CliError::Failure(e.to_string()),
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(e: std::io::Error) -> Self {
        CliError::Failure(e.to_string())
    }
}

impl From<anyhow::Error> for CliError {
    fn from(e: anyhow::Error) -> Self {
        CliError::Failure(format!("{e:#}"))
    }
}

fn parse_enum<T: DeserializeOwned>(kind: &str, value: &str) -> Result<T, CliError> {
    serde_json::from_value(Value::String(value.to_string()))
        .map_err(|_| CliError::Validation(format!("invalid {kind}: {value}")))
}

pub async fn run(cli: Cli) -> Result<(), CliError> {
    let project_root = match &cli.cwd {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let json = cli.json;

    match cli.command {
        Command::Consume {
            interval,
            concurrency,
            review,
            mirrors,
        } => daemon_overrides_run(&project_root, interval, concurrency, review, mirrors).await,
        Command::ConsumeRunner {
            interval,
            concurrency,
            review,
            mirrors,
        } => {
            let overrides = overrides_from(interval, concurrency, review, mirrors);
            let pid = crate::daemon::spawn_runner(&project_root, &overrides)?;
            if json {
                output::print_json(&json!({ "pid": pid }))?;
            } else {
                println!("consume runner started (pid {pid})");
            }
            Ok(())
        }
        command => store_command(&project_root, json, command).await,
    }
}

async fn daemon_overrides_run(
    project_root: &Path,
    interval: Option<u64>,
    concurrency: Option<usize>,
    review: bool,
    mirrors: bool,
) -> Result<(), CliError> {
    let overrides = overrides_from(interval, concurrency, review, mirrors);
    crate::daemon::run_consume(project_root, overrides)
        .await
        .map_err(|e| CliError::Failure(e.to_string()))
}

fn overrides_from(
    interval: Option<u64>,
    concurrency: Option<usize>,
    review: bool,
    mirrors: bool,
) -> ConfigOverrides {
    ConfigOverrides {
        interval_ms: interval,
        concurrency_cap: concurrency,
        review_enabled: review.then_some(true),
        epic_mirrors_enabled: mirrors.then_some(true),
    }
}

async fn store_command(
    project_root: &Path,
    json: bool,
    command: Command,
) -> Result<(), CliError> {
    let store = Store::open(project_root)?;
    let epics = EpicController::new(project_root.to_path_buf(), false);

    match command {
        Command::Add {
            title,
            description,
            task_type,
            priority,
            size,
            complexity,
            labels,
            blocked_by,
            epic,
            agent,
        } => {
            let epic_id = match epic {
                Some(partial) => Some(store.resolve(&partial)?),
                None => None,
            };
            let mut resolved_blockers = BTreeSet::new();
            for blocker in blocked_by {
                resolved_blockers.insert(store.resolve(&blocker)?);
            }
            let task = store.create_task(NewTask {
                title,
                description,
                task_type: task_type
                    .as_deref()
                    .map(|v| parse_enum("type", v))
                    .transpose()?,
                priority,
                size: size.as_deref().map(|v| parse_enum("size", v)).transpose()?,
                complexity: complexity
                    .as_deref()
                    .map(|v| parse_enum("complexity", v))
                    .transpose()?,
                labels: labels.into_iter().collect(),
                blocked_by: resolved_blockers,
                epic_id,
                agent,
            })?;
            output::emit_task(json, &task)
        }
        Command::Update {
            id,
            title,
            description,
            task_type,
            priority,
            size,
            complexity,
            agent,
        } => {
            let id = store.resolve(&id)?;
            let task = store.update_task(
                &id,
                TaskPatch {
                    title,
                    description,
                    task_type: task_type
                        .as_deref()
                        .map(|v| parse_enum("type", v))
                        .transpose()?,
                    priority,
                    size: size.as_deref().map(|v| parse_enum("size", v)).transpose()?,
                    complexity: complexity
                        .as_deref()
                        .map(|v| parse_enum("complexity", v))
                        .transpose()?,
                    agent,
                    ..TaskPatch::default()
                },
            )?;
            output::emit_task(json, &task)
        }
        Command::Done { id, reason, commit } => {
            let id = store.resolve(&id)?;
            let task = store.done(&id, reason, commit)?;
            if let Some(epic_id) = &task.epic_id {
                epics.check_epic_completion(&store, &EventBus::new(), epic_id)?;
            }
            output::emit_task(json, &task)
        }
        Command::Reopen { id } => transition(&store, json, &id, TaskStatus::Open),
        Command::Start { id } => transition(&store, json, &id, TaskStatus::InProgress),
        Command::Pause { id } => transition(&store, json, &id, TaskStatus::Paused),
        Command::Unpause { id } => transition(&store, json, &id, TaskStatus::Open),
        Command::Defer { id } => transition(&store, json, &id, TaskStatus::Someday),
        Command::Retry { id } => {
            let id = store.resolve(&id)?;
            let current = store.get_task(&id)?;
            let task = store.update_task(
                &id,
                TaskPatch {
                    status: (current.status != TaskStatus::Open).then_some(TaskStatus::Open),
                    clear_reason: true,
                    ..TaskPatch::default()
                },
            )?;
            output::emit_task(json, &task)
        }
        Command::Show { id } => {
            let id = store.resolve(&id)?;
            let task = store.get_task(&id)?;
            let runs = store.runs_for_task(&id)?;
            if json {
                output::print_json(&json!({ "task": task, "runs": runs }))
            } else {
                output::print_task_detail(&task, &runs, &resume_hint(&store, project_root, &task))
            }
        }
        Command::Tasks { status } => {
            let filter: Option<TaskStatus> = status
                .as_deref()
                .map(|v| parse_enum("status", v))
                .transpose()?;
            let tasks: Vec<Task> = store
                .list_tasks()?
                .into_iter()
                .filter(|t| filter.map(|s| t.status == s).unwrap_or(true))
                .collect();
            output::emit_tasks(json, &tasks)
        }
        Command::Ready => output::emit_tasks(json, &store.list_ready()?),
        Command::Blocked => {
            let tasks = store.list_tasks()?;
            let done: BTreeSet<&str> = tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Done)
                .map(|t| t.short_id.as_str())
                .collect();
            let blocked: Vec<Task> = tasks
                .iter()
                .filter(|t| {
                    t.status == TaskStatus::Open
                        && t.blocked_by.iter().any(|b| !done.contains(b.as_str()))
                })
                .cloned()
                .collect();
            output::emit_tasks(json, &blocked)
        }
        Command::Backlog => {
            let items = store.list_backlog()?;
            if json {
                output::print_json(&items)
            } else {
                for item in &items {
                    println!("{}", output::backlog_line(item));
                }
                Ok(())
            }
        }
        Command::BacklogAdd { title, description } => {
            let item = store.backlog_add(&title, description)?;
            if json {
                output::print_json(&item)
            } else {
                println!("backlogged: {}", item.title);
                Ok(())
            }
        }
        Command::Epics => {
            let epics = store.list_epics()?;
            if json {
                output::print_json(&epics)
            } else {
                for epic in &epics {
                    println!("{}", output::epic_line(epic));
                }
                Ok(())
            }
        }
        Command::Status => status_command(&store, json),
        Command::Runs { id } => {
            let mut runs = match id {
                Some(partial) => store.runs_for_task(&store.resolve(&partial)?)?,
                None => store.list_runs()?,
            };
            runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
            if json {
                output::print_json(&runs)
            } else {
                for run in &runs {
                    println!("{}", output::run_line(run));
                }
                Ok(())
            }
        }
        Command::Reviews => {
            let reviews = store.list_reviews()?;
            if json {
                output::print_json(&reviews)
            } else {
                for review in &reviews {
                    println!("{}", output::review_line(review));
                }
                Ok(())
            }
        }
        Command::EpicAdd {
            title,
            description,
            self_guided,
            plan,
        } => {
            let epic = store.create_epic(&title, description, self_guided, plan)?;
            if json {
                output::print_json(&epic)
            } else {
                println!("{}", output::epic_line(&epic));
                Ok(())
            }
        }
        Command::EpicApprove { id, by } => {
            let id = store.resolve(&id)?;
            let epic = epics.approve(&store, &id, &by)?;
            if json {
                output::print_json(&epic)
            } else {
                println!("{}", output::epic_line(&epic));
                Ok(())
            }
        }
        Command::EpicReject { id } => {
            let id = store.resolve(&id)?;
            let epic = epics.reject(&store, &id)?;
            if json {
                output::print_json(&epic)
            } else {
                println!("{}", output::epic_line(&epic));
                Ok(())
            }
        }
        Command::EpicReviewed { id } => {
            let id = store.resolve(&id)?;
            let epic = epics.mark_reviewed(&store, &id)?;
            if json {
                output::print_json(&epic)
            } else {
                println!("{}", output::epic_line(&epic));
                Ok(())
            }
        }
        Command::DepAdd { task, blocker } => {
            let task_id = store.resolve(&task)?;
            let blocker_id = store.resolve(&blocker)?;
            let task = store.add_dependency(&task_id, &blocker_id)?;
            output::emit_task(json, &task)
        }
        Command::DepRemove { task, blocker } => {
            let task_id = store.resolve(&task)?;
            let blocker_id = store.resolve(&blocker)?;
            let task = store.remove_dependency(&task_id, &blocker_id)?;
            output::emit_task(json, &task)
        }
        Command::HealthReset => health_reset(&store, json).await,
        Command::Consume { .. } | Command::ConsumeRunner { .. } => unreachable!(),
    }
}

fn transition(store: &Store, json: bool, id: &str, to: TaskStatus) -> Result<(), CliError> {
    let id = store.resolve(id)?;
    let (task, _) = store.set_task_status(&id, to, None)?;
    output::emit_task(json, &task)
}

fn status_command(store: &Store, json: bool) -> Result<(), CliError> {
    let tasks = store.list_tasks()?;
    let count = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count();
    let daemon = lifecycle::read_pid_file(store.fuel_dir())
        .filter(|p| pid_alive(p.pid))
        .map(|p| json!({ "pid": p.pid, "port": p.port, "started_at": p.started_at }));

    let payload = json!({
        "tasks": {
            "open": count(TaskStatus::Open),
            "in_progress": count(TaskStatus::InProgress),
            "review": count(TaskStatus::Review),
            "done": count(TaskStatus::Done),
            "paused": count(TaskStatus::Paused),
            "someday": count(TaskStatus::Someday),
        },
        "ready": store.list_ready()?.len(),
        "epics": store.list_epics()?.len(),
        "backlog": store.list_backlog()?.len(),
        "daemon": daemon,
    });
    if json {
        output::print_json(&payload)
    } else {
        output::print_status(&payload);
        Ok(())
    }
}

/// "Resume:" help line for the latest run, when the agent reported a session.
fn resume_hint(store: &Store, project_root: &Path, task: &Task) -> Option<String> {
    let run = store.latest_run(&task.short_id).ok()??;
    let session_id = run.session_id?;
    let config = ConsumeConfig::load(&project_root.join(".fuel")).ok()?;
    let registry = DriverRegistry::new(&config);
    let driver = registry.resolve(&run.agent).ok()?;
    Some(driver.resume_command(&session_id))
}

/// `health:reset` talks to the live daemon over IPC; without one there is
/// nothing to clear.
async fn health_reset(store: &Store, json: bool) -> Result<(), CliError> {
    let Some(pid_file) =
        lifecycle::read_pid_file(store.fuel_dir()).filter(|p| pid_alive(p.pid))
    else {
        return Err(CliError::Failure("no running consume daemon".to_string()));
    };
    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", pid_file.port))
        .await
        .map_err(|e| CliError::Failure(format!("daemon unreachable: {e}")))?;
    let envelope = fuel_wire::CommandEnvelope {
        command: fuel_wire::ClientCommand::HealthReset,
        request_id: None,
        timestamp: Some(chrono::Utc::now()),
    };
    let mut line = serde_json::to_string(&envelope)
        .map_err(|e| CliError::Failure(e.to_string()))?;
    line.push('\n');
    tokio::io::AsyncWriteExt::write_all(&mut stream, line.as_bytes())
        .await
        .map_err(|e| CliError::Failure(e.to_string()))?;
    if json {
        output::print_json(&json!({ "ok": true }))
    } else {
        println!("health state cleared");
        Ok(())
    }
}
