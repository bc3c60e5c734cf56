//! Review pipeline: verdict parsing and the bookkeeping around a reviewer
//! run finishing.

use fuel_store::{Result as StoreResult, Store};
use fuel_types::{Review, ReviewStatus};

/// Parsed reviewer output. A missing verdict counts as a failure so a
/// confused reviewer can never wave work through.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewVerdict {
    pub passed: bool,
    pub issues: Vec<String>,
}

/// Extract the verdict from reviewer stdout: the last `VERDICT: PASS|FAIL`
/// line wins, `ISSUE: ...` lines become the issue list.
pub fn parse_review_output(stdout: &str) -> ReviewVerdict {
    let mut passed = None;
    let mut issues = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("VERDICT:") {
            match rest.trim() {
                "PASS" => passed = Some(true),
                "FAIL" => passed = Some(false),
                _ => {}
            }
        } else if let Some(rest) = line.strip_prefix("ISSUE:") {
            let issue = rest.trim();
            if !issue.is_empty() {
                issues.push(issue.to_string());
            }
        }
    }
    match passed {
        Some(true) => ReviewVerdict {
            passed: true,
            issues,
        },
        Some(false) => ReviewVerdict {
            passed: false,
            issues: if issues.is_empty() {
                vec!["reviewer failed the task without naming issues".to_string()]
            } else {
                issues
            },
        },
        None => ReviewVerdict {
            passed: false,
            issues: vec!["no verdict in reviewer output".to_string()],
        },
    }
}

/// Close the pending review row for a task with the reviewer's outcome.
pub fn settle_review(
    store: &Store,
    task_short_id: &str,
    verdict: &ReviewVerdict,
) -> StoreResult<Option<Review>> {
    let Some(pending) = store.pending_review(task_short_id)? else {
        return Ok(None);
    };
    let status = if verdict.passed {
        ReviewStatus::Passed
    } else {
        ReviewStatus::Failed
    };
    store
        .update_review(&pending.short_id, status, verdict.issues.clone())
        .map(Some)
}
