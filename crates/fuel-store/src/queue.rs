//! Ready-queue computation: a pure function of a store snapshot.
//!
//! A task is eligible when it is `open`, not labelled `needs-human`, every
//! blocker is `done`, and its epic (if any) is not paused or rejected.
//! Agent cool-down is a scheduler concern applied on top of this set.

use std::collections::{HashMap, HashSet};

use fuel_types::{Epic, Task, TaskStatus};

/// Compute the ordered ready set. Ordering is stable: priority ascending,
/// then `created_at` ascending, then short id.
pub fn ready_tasks<'a>(tasks: &'a [Task], epics: &[Epic]) -> Vec<&'a Task> {
    let done: HashSet<&str> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Done)
        .map(|t| t.short_id.as_str())
        .collect();
    let blocked_epics: HashSet<&str> = epics
        .iter()
        .filter(|e| e.status.blocks_dispatch())
        .map(|e| e.short_id.as_str())
        .collect();

    let mut ready: Vec<&Task> = tasks
        .iter()
        .filter(|task| {
            task.status == TaskStatus::Open
                && !task.needs_human()
                && task
                    .blocked_by
                    .iter()
                    .all(|dep| done.contains(dep.as_str()))
                && task
                    .epic_id
                    .as_deref()
                    .map(|epic| !blocked_epics.contains(epic))
                    .unwrap_or(true)
        })
        .collect();

    ready.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.short_id.cmp(&b.short_id))
    });
    ready
}

/// Detect whether adding `edges` (blocker edges of `task_id`) to the graph
/// would close a cycle. Returns the cycle path when one exists.
pub fn find_cycle(tasks: &[Task]) -> Option<Vec<String>> {
    let graph: HashMap<&str, &Task> = tasks.iter().map(|t| (t.short_id.as_str(), t)).collect();

    for task in tasks {
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        if dfs_cycle(&task.short_id, &graph, &mut visited, &mut path) {
            return Some(path);
        }
    }
    None
}

fn dfs_cycle(
    id: &str,
    graph: &HashMap<&str, &Task>,
    visited: &mut HashSet<String>,
    path: &mut Vec<String>,
) -> bool {
    if path.iter().any(|p| p == id) {
        path.push(id.to_string());
        return true;
    }
    if visited.contains(id) {
        return false;
    }
    visited.insert(id.to_string());
    path.push(id.to_string());

    if let Some(task) = graph.get(id) {
        for dep in &task.blocked_by {
            if dfs_cycle(dep, graph, visited, path) {
                return true;
            }
        }
    }
    path.pop();
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use fuel_types::NEEDS_HUMAN_LABEL;

    fn task(id: &str, priority: u8, age_secs: i64) -> Task {
        let mut t = Task::new(id.to_string(), format!("task {id}"));
        t.priority = priority;
        t.created_at = Utc::now() - Duration::seconds(age_secs);
        t
    }

    #[test]
    fn dependency_unblock() {
        let mut t1 = task("f-aaaaaa", 1, 10);
        let mut t2 = task("f-bbbbbb", 0, 5);
        t2.blocked_by.insert(t1.short_id.clone());

        let tasks = vec![t1.clone(), t2.clone()];
        let ready = ready_tasks(&tasks, &[]);
        assert_eq!(
            ready.iter().map(|t| t.short_id.as_str()).collect::<Vec<_>>(),
            vec!["f-aaaaaa"]
        );

        t1.status = TaskStatus::Done;
        let tasks = vec![t1, t2.clone()];
        let ready = ready_tasks(&tasks, &[]);
        assert_eq!(
            ready.iter().map(|t| t.short_id.as_str()).collect::<Vec<_>>(),
            vec!["f-bbbbbb"]
        );
        assert_eq!(t2.priority, 0);
    }

    #[test]
    fn priority_tie_breaks_on_age_then_id() {
        let t1 = task("f-zzzzzz", 2, 100); // older, later id
        let t2 = task("f-aaaaaa", 2, 10);
        let tasks = vec![t2, t1];
        let ready = ready_tasks(&tasks, &[]);
        assert_eq!(
            ready.iter().map(|t| t.short_id.as_str()).collect::<Vec<_>>(),
            vec!["f-zzzzzz", "f-aaaaaa"]
        );
    }

    #[test]
    fn needs_human_is_skipped() {
        let mut t1 = task("f-aaaaaa", 0, 10);
        t1.labels.insert(NEEDS_HUMAN_LABEL.to_string());
        let t2 = task("f-bbbbbb", 2, 5);
        let ready_ids: Vec<String> = ready_tasks(&[t1, t2], &[])
            .iter()
            .map(|t| t.short_id.clone())
            .collect();
        assert_eq!(ready_ids, vec!["f-bbbbbb"]);
    }

    #[test]
    fn paused_epic_holds_tasks_back() {
        let mut epic = Epic::new("e-aaaaaa".into(), "epic".into());
        epic.status = fuel_types::EpicStatus::Paused;
        let mut t1 = task("f-aaaaaa", 0, 10);
        t1.epic_id = Some(epic.short_id.clone());
        let t2 = task("f-bbbbbb", 2, 5);

        let tasks = vec![t1, t2];
        let ready_ids: Vec<String> = ready_tasks(&tasks, &[epic])
            .iter()
            .map(|t| t.short_id.clone())
            .collect();
        assert_eq!(ready_ids, vec!["f-bbbbbb"]);
    }

    #[test]
    fn missing_blocker_never_becomes_ready() {
        let mut t1 = task("f-aaaaaa", 0, 10);
        t1.blocked_by.insert("f-gone99".into());
        assert!(ready_tasks(&[t1], &[]).is_empty());
    }

    #[test]
    fn cycle_detection_finds_loop() {
        let mut t1 = task("f-aaaaaa", 2, 10);
        let mut t2 = task("f-bbbbbb", 2, 10);
        t1.blocked_by.insert("f-bbbbbb".into());
        t2.blocked_by.insert("f-aaaaaa".into());
        assert!(find_cycle(&[t1, t2]).is_some());

        let t3 = task("f-cccccc", 2, 10);
        let mut t4 = task("f-dddddd", 2, 10);
        t4.blocked_by.insert("f-cccccc".into());
        assert!(find_cycle(&[t3, t4]).is_none());
    }
}
