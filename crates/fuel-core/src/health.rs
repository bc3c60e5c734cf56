//! Per-agent health tracking: consecutive-failure counting and cool-down.
//!
//! In-memory only; rebuilt at daemon startup from a scan of recent runs.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use fuel_types::Run;

use crate::config::HealthConfig;

const MAX_COOLDOWN_SECS: i64 = 60 * 60;

#[derive(Debug, Clone, Default)]
struct AgentHealth {
    consecutive_failures: u32,
    cooldown_until: Option<DateTime<Utc>>,
    /// How many cool-downs in a row; each doubles the window
    escalation: u32,
}

#[derive(Debug, Default)]
pub struct HealthTracker {
    failure_threshold: u32,
    base_cooldown_secs: u64,
    agents: HashMap<String, AgentHealth>,
}

impl HealthTracker {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            base_cooldown_secs: config.cooldown_seconds.max(1),
            agents: HashMap::new(),
        }
    }

    /// Replay recent runs (oldest first) so a restart does not forget a
    /// misbehaving agent.
    pub fn rebuild(config: &HealthConfig, runs: &[Run]) -> Self {
        let mut tracker = Self::new(config);
        let mut ordered: Vec<&Run> = runs.iter().filter(|r| r.ended_at.is_some()).collect();
        ordered.sort_by_key(|r| r.started_at);
        for run in ordered {
            match run.exit_code {
                Some(0) => tracker.record_success(&run.agent),
                _ => tracker.record_failure(&run.agent),
            }
        }
        tracker
    }

    pub fn record_success(&mut self, agent: &str) {
        let entry = self.agents.entry(agent.to_string()).or_default();
        entry.consecutive_failures = 0;
        entry.cooldown_until = None;
        entry.escalation = 0;
    }

    pub fn record_failure(&mut self, agent: &str) {
        let threshold = self.failure_threshold;
        let base = self.base_cooldown_secs;
        let entry = self.agents.entry(agent.to_string()).or_default();
        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= threshold {
            let secs = (base as i64)
                .saturating_mul(1 << entry.escalation.min(12))
                .min(MAX_COOLDOWN_SECS);
            entry.cooldown_until = Some(Utc::now() + Duration::seconds(secs));
            entry.escalation += 1;
            entry.consecutive_failures = 0;
            tracing::warn!(agent, cooldown_secs = secs, "agent entered cool-down");
        }
    }

    pub fn in_cooldown(&self, agent: &str) -> bool {
        self.agents
            .get(agent)
            .and_then(|a| a.cooldown_until)
            .map(|until| until > Utc::now())
            .unwrap_or(false)
    }

    pub fn cooldown_until(&self, agent: &str) -> Option<DateTime<Utc>> {
        self.agents.get(agent).and_then(|a| a.cooldown_until)
    }

    /// `health:reset` clears all counters and cool-downs.
    pub fn reset(&mut self) {
        self.agents.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32, cooldown: u64) -> HealthConfig {
        HealthConfig {
            failure_threshold: threshold,
            cooldown_seconds: cooldown,
        }
    }

    #[test]
    fn cooldown_after_threshold_failures() {
        let mut tracker = HealthTracker::new(&config(3, 300));
        tracker.record_failure("claude");
        tracker.record_failure("claude");
        assert!(!tracker.in_cooldown("claude"));
        tracker.record_failure("claude");
        assert!(tracker.in_cooldown("claude"));
    }

    #[test]
    fn success_resets_counter_and_escalation() {
        let mut tracker = HealthTracker::new(&config(2, 300));
        tracker.record_failure("claude");
        tracker.record_success("claude");
        tracker.record_failure("claude");
        assert!(!tracker.in_cooldown("claude"));
    }

    #[test]
    fn cooldown_escalates_and_caps() {
        let mut tracker = HealthTracker::new(&config(1, 300));
        tracker.record_failure("claude");
        let first = tracker.cooldown_until("claude").unwrap();
        tracker.record_failure("claude");
        let second = tracker.cooldown_until("claude").unwrap();
        assert!(second - Utc::now() > first - Utc::now());

        for _ in 0..20 {
            tracker.record_failure("claude");
        }
        let capped = tracker.cooldown_until("claude").unwrap() - Utc::now();
        assert!(capped <= Duration::seconds(MAX_COOLDOWN_SECS + 5));
    }

    #[test]
    fn rebuild_replays_trailing_failures() {
        let mut runs = Vec::new();
        for (idx, exit) in [Some(0), Some(1), Some(1), Some(1)].iter().enumerate() {
            let mut run = Run::new(
                idx as u32 + 1,
                format!("x-aaaaa{idx}"),
                "f-aaaaaa".to_string(),
                "claude".to_string(),
            );
            run.started_at = Utc::now() - Duration::seconds(100 - idx as i64);
            run.ended_at = Some(run.started_at + Duration::seconds(1));
            run.exit_code = *exit;
            runs.push(run);
        }
        let tracker = HealthTracker::rebuild(&config(3, 300), &runs);
        assert!(tracker.in_cooldown("claude"));
        assert!(!tracker.in_cooldown("opencode"));
    }

    #[test]
    fn reset_clears_state() {
        let mut tracker = HealthTracker::new(&config(1, 300));
        tracker.record_failure("claude");
        assert!(tracker.in_cooldown("claude"));
        tracker.reset();
        assert!(!tracker.in_cooldown("claude"));
    }
}
