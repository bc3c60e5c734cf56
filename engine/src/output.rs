//! Plain-text and JSON rendering for CLI verbs.

use serde::Serialize;
use serde_json::Value;

use fuel_types::{BacklogItem, Epic, Review, Run, Task};

use crate::commands::CliError;

pub fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|e| CliError::Failure(format!("serialize output: {e}")))?;
    println!("{rendered}");
    Ok(())
}

pub fn emit_task(json: bool, task: &Task) -> Result<(), CliError> {
    if json {
        print_json(task)
    } else {
        println!("{}", task_line(task));
        Ok(())
    }
}

pub fn emit_tasks(json: bool, tasks: &[Task]) -> Result<(), CliError> {
    if json {
        print_json(&tasks)
    } else {
        for task in tasks {
            println!("{}", task_line(task));
        }
        Ok(())
    }
}

pub fn task_line(task: &Task) -> String {
    let mut line = format!(
        "{}  {:<11} p{}  {}",
        task.short_id,
        task.status.as_str(),
        task.priority,
        task.title
    );
    if let Some(epic) = &task.epic_id {
        line.push_str(&format!("  [{epic}]"));
    }
    if task.needs_human() {
        line.push_str("  (needs-human)");
    }
    if let Some(reason) = &task.reason {
        line.push_str(&format!("  ({reason})"));
    }
    line
}

pub fn epic_line(epic: &Epic) -> String {
    format!(
        "{}  {:<9} {}{}",
        epic.short_id,
        epic.status.as_str(),
        epic.title,
        epic.mirror_branch
            .as_deref()
            .map(|b| format!("  ({b})"))
            .unwrap_or_default()
    )
}

pub fn run_line(run: &Run) -> String {
    let state = match run.exit_code {
        None => "running".to_string(),
        Some(0) => "ok".to_string(),
        Some(code) => format!("exit {code}"),
    };
    format!(
        "{}  #{:<3} {}  {:<8} {}{}",
        run.short_id,
        run.run_id,
        run.task_short_id,
        state,
        run.agent,
        run.cost_usd
            .map(|c| format!("  ${c:.2}"))
            .unwrap_or_default()
    )
}

pub fn review_line(review: &Review) -> String {
    format!(
        "{}  {:?}  {}  {}",
        review.short_id,
        review.status,
        review.task_short_id,
        review.issues.join("; ")
    )
}

pub fn backlog_line(item: &BacklogItem) -> String {
    format!("{}  {}", item.created_at.format("%Y-%m-%d"), item.title)
}

pub fn print_task_detail(
    task: &Task,
    runs: &[Run],
    resume: &Option<String>,
) -> Result<(), CliError> {
    println!("{}", task_line(task));
    if let Some(description) = &task.description {
        println!("\n{description}");
    }
    if !task.blocked_by.is_empty() {
        println!(
            "\nblocked by: {}",
            task.blocked_by
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    if !runs.is_empty() {
        println!("\nruns:");
        for run in runs {
            println!("  {}", run_line(run));
        }
    }
    if let Some(resume) = resume {
        println!("\nResume: {resume}");
    }
    Ok(())
}

pub fn print_status(payload: &Value) {
    if let Some(tasks) = payload.get("tasks").and_then(Value::as_object) {
        let counts: Vec<String> = tasks
            .iter()
            .map(|(status, count)| format!("{status} {count}"))
            .collect();
        println!("tasks: {}", counts.join(", "));
    }
    println!(
        "ready: {}  epics: {}  backlog: {}",
        payload["ready"], payload["epics"], payload["backlog"]
    );
    match payload.get("daemon") {
        Some(Value::Object(daemon)) => println!(
            "daemon: running (pid {}, port {})",
            daemon["pid"], daemon["port"]
        ),
        _ => println!("daemon: not running"),
    }
}
