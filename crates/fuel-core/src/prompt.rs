//! Agent prompt assembly from task fields and epic plan context.

use std::path::Path;

use fuel_types::{Epic, Task};

/// Lines of an epic plan included in a task prompt.
const PLAN_SNIPPET_MAX_LINES: usize = 100;

pub fn task_prompt(task: &Task, epic: Option<&Epic>, plan_snippet: Option<&str>) -> String {
    let mut prompt = format!("Work on this task to completion.\n\nTask: {}\n", task.title);
    if let Some(description) = &task.description {
        prompt.push_str(&format!("\nDescription:\n{description}\n"));
    }
    prompt.push_str(&format!(
        "\nType: {:?}\nPriority: {}\nSize: {:?}\nComplexity: {:?}\n",
        task.task_type, task.priority, task.size, task.complexity
    ));
    if let Some(epic) = epic {
        prompt.push_str(&format!("\nThis task belongs to the epic: {}\n", epic.title));
        if let Some(snippet) = plan_snippet {
            prompt.push_str(&format!("\nEpic plan (excerpt):\n{snippet}\n"));
        }
    }
    prompt.push_str(
        "\nCommit your work when finished. If you are blocked on something only a human can \
         resolve, say so clearly and stop.\n",
    );
    prompt
}

pub fn selfguided_prompt(task: &Task, epic: Option<&Epic>, plan_snippet: Option<&str>) -> String {
    let mut prompt = task_prompt(task, epic, plan_snippet);
    prompt.push_str(&format!(
        "\nThis is iteration {} of a self-guided loop. Review the current state of the work, \
         make the next meaningful improvement, and commit it. When the objective is fully met, \
         print a line containing exactly FUEL_COMPLETE and stop.\n",
        task.selfguided_iteration + 1
    ));
    prompt
}

pub fn review_prompt(task: &Task) -> String {
    format!(
        "Review the most recent work for this task.\n\nTask: {}\n{}\n\
         Inspect the recent diff and judge whether the task is genuinely complete and correct.\n\
         Print exactly one line `VERDICT: PASS` or `VERDICT: FAIL`.\n\
         For a FAIL, also print one `ISSUE: <description>` line per problem found.\n",
        task.title,
        task.description
            .as_deref()
            .map(|d| format!("\nDescription:\n{d}\n"))
            .unwrap_or_default(),
    )
}

pub fn epic_review_prompt(epic_title: &str) -> String {
    format!(
        "Every task in the epic \"{epic_title}\" is complete. Review the combined result \
         against the epic's plan, then print `VERDICT: PASS` or `VERDICT: FAIL` with \
         `ISSUE:` lines for anything that needs follow-up work.\n"
    )
}

pub fn merge_prompt(epic_title: &str, branch: &str) -> String {
    format!(
        "Merge the branch `{branch}` for the epic \"{epic_title}\" into the current branch. \
         Resolve any conflicts in favour of correctness, run the project's checks, and commit \
         the merge. If the merge cannot be completed safely, explain why and exit nonzero.\n"
    )
}

/// First lines of the epic's plan file, when it has one.
pub fn load_plan_snippet(plans_dir: &Path, epic: &Epic) -> Option<String> {
    let filename = epic.plan_filename.as_deref()?;
    let content = std::fs::read_to_string(plans_dir.join(filename)).ok()?;
    let snippet: Vec<&str> = content.lines().take(PLAN_SNIPPET_MAX_LINES).collect();
    Some(snippet.join("\n"))
}

/// Acceptance predicate for self-guided loops.
pub fn selfguided_complete(stdout_tail: &str) -> bool {
    stdout_tail
        .lines()
        .any(|line| line.trim() == "FUEL_COMPLETE" || line.contains("FUEL_COMPLETE"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_includes_task_fields_and_plan() {
        let mut task = Task::new("f-abc234".into(), "Add retry logic".into());
        task.description = Some("Use exponential backoff".into());
        let epic = Epic::new("e-abc234".into(), "Resilience".into());

        let prompt = task_prompt(&task, Some(&epic), Some("## Plan\n- step one"));
        assert!(prompt.contains("Add retry logic"));
        assert!(prompt.contains("exponential backoff"));
        assert!(prompt.contains("Resilience"));
        assert!(prompt.contains("step one"));
    }

    #[test]
    fn selfguided_predicate_matches_marker() {
        assert!(selfguided_complete("working...\nFUEL_COMPLETE\n"));
        assert!(!selfguided_complete("still iterating\n"));
    }
}
