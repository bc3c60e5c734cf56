//! Agent drivers: adapters from a logical agent name to concrete process
//! invocation mechanics and output parsing.
//!
//! The core treats a driver as an opaque capability: given a prompt, a
//! working directory and an optional session to resume, it yields argv + env
//! and a parser for the agent's JSONL stdout.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::config::ConsumeConfig;
use crate::error::{FuelError, Result};

/// Logical agent names with special routing.
pub const SELFGUIDED_AGENT: &str = "selfguided";
pub const EPIC_REVIEW_AGENT: &str = "epic-review";
pub const EPIC_MERGE_AGENT: &str = "epic-merge";

/// Everything a driver may need to build an invocation.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub prompt: String,
    pub cwd: PathBuf,
    pub session_id: Option<String>,
    pub extras: BTreeMap<String, String>,
}

impl InvocationContext {
    pub fn new(prompt: String, cwd: &Path) -> Self {
        Self {
            prompt,
            cwd: cwd.to_path_buf(),
            session_id: None,
            extras: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Invocation {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Semantic event parsed from one line of a driver's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Init {
        model: String,
    },
    Step {
        tool: String,
        text: String,
    },
    Result {
        cost_usd: Option<f64>,
        total_tokens: Option<u64>,
    },
    StepFinish {
        cost_usd: Option<f64>,
    },
    Unknown,
}

pub trait AgentDriver: Send + Sync {
    fn name(&self) -> &'static str;

    fn build_invocation(&self, ctx: &InvocationContext) -> Invocation;

    fn parse_line(&self, line: &str) -> AgentEvent;

    /// Session id embedded in a stdout line, when the agent reports one.
    fn extract_session_id(&self, _line: &str) -> Option<String> {
        None
    }

    /// User-facing "Resume:" help line only; never executed by the daemon.
    fn resume_command(&self, session_id: &str) -> String;
}

// ----------------------------------------------------------------------
// claude
// ----------------------------------------------------------------------

/// Driver for the `claude` CLI in streaming JSON mode.
pub struct ClaudeDriver;

impl AgentDriver for ClaudeDriver {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn build_invocation(&self, ctx: &InvocationContext) -> Invocation {
        let mut argv = vec!["claude".to_string()];
        if let Some(session) = &ctx.session_id {
            argv.push("--resume".to_string());
            argv.push(session.clone());
        }
        argv.extend([
            "-p".to_string(),
            ctx.prompt.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--dangerously-skip-permissions".to_string(),
        ]);
        Invocation {
            argv,
            env: vec![("CLAUDE_NON_INTERACTIVE".to_string(), "1".to_string())],
        }
    }

    fn parse_line(&self, line: &str) -> AgentEvent {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            return AgentEvent::Unknown;
        };
        match value.get("type").and_then(Value::as_str) {
            Some("system") if value.get("subtype").and_then(Value::as_str) == Some("init") => {
                match value.get("model").and_then(Value::as_str) {
                    Some(model) => AgentEvent::Init {
                        model: model.to_string(),
                    },
                    None => AgentEvent::Unknown,
                }
            }
            Some("assistant") => {
                let content = value
                    .pointer("/message/content")
                    .and_then(Value::as_array)
                    .and_then(|parts| parts.first());
                let tool = content
                    .and_then(|p| p.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or("text")
                    .to_string();
                let text = content
                    .and_then(|p| p.get("text"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                AgentEvent::Step { tool, text }
            }
            Some("result") => AgentEvent::Result {
                cost_usd: value.get("total_cost_usd").and_then(Value::as_f64),
                total_tokens: value
                    .pointer("/usage/output_tokens")
                    .and_then(Value::as_u64),
            },
            _ => AgentEvent::Unknown,
        }
    }

    fn extract_session_id(&self, line: &str) -> Option<String> {
        serde_json::from_str::<Value>(line)
            .ok()?
            .get("session_id")?
            .as_str()
            .map(str::to_string)
    }

    fn resume_command(&self, session_id: &str) -> String {
        format!("claude --resume {session_id}")
    }
}

// ----------------------------------------------------------------------
// opencode
// ----------------------------------------------------------------------

/// Driver for the `opencode` CLI in JSON output mode.
pub struct OpencodeDriver;

impl AgentDriver for OpencodeDriver {
    fn name(&self) -> &'static str {
        "opencode"
    }

    fn build_invocation(&self, ctx: &InvocationContext) -> Invocation {
        let mut argv = vec!["opencode".to_string(), "run".to_string()];
        if let Some(session) = &ctx.session_id {
            argv.push("--session".to_string());
            argv.push(session.clone());
        }
        argv.extend([
            "--format".to_string(),
            "json".to_string(),
            ctx.prompt.clone(),
        ]);
        Invocation {
            argv,
            env: Vec::new(),
        }
    }

    fn parse_line(&self, line: &str) -> AgentEvent {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            return AgentEvent::Unknown;
        };
        match value.get("type").and_then(Value::as_str) {
            Some("session.init") => match value.get("model").and_then(Value::as_str) {
                Some(model) => AgentEvent::Init {
                    model: model.to_string(),
                },
                None => AgentEvent::Unknown,
            },
            Some("tool.start") => AgentEvent::Step {
                tool: value
                    .get("tool")
                    .and_then(Value::as_str)
                    .unwrap_or("tool")
                    .to_string(),
                text: value
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            Some("step.finish") => AgentEvent::StepFinish {
                cost_usd: value.get("cost").and_then(Value::as_f64),
            },
            Some("session.finish") => AgentEvent::Result {
                cost_usd: value.get("cost").and_then(Value::as_f64),
                total_tokens: value.get("tokens").and_then(Value::as_u64),
            },
            _ => AgentEvent::Unknown,
        }
    }

    fn extract_session_id(&self, line: &str) -> Option<String> {
        serde_json::from_str::<Value>(line)
            .ok()?
            .get("sessionID")?
            .as_str()
            .map(str::to_string)
    }

    fn resume_command(&self, session_id: &str) -> String {
        format!("opencode run --session {session_id}")
    }
}

// ----------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------

/// Maps logical agent names to drivers. `selfguided` runs on the default
/// agent; `epic-review` and `epic-merge` run on the configured review agent.
pub struct DriverRegistry {
    drivers: std::collections::HashMap<&'static str, Box<dyn AgentDriver>>,
    default_agent: String,
    review_agent: String,
}

impl DriverRegistry {
    pub fn new(config: &ConsumeConfig) -> Self {
        let mut registry = Self {
            drivers: std::collections::HashMap::new(),
            default_agent: config.default_agent.clone(),
            review_agent: config.review_agent.clone(),
        };
        registry.register(Box::new(ClaudeDriver));
        registry.register(Box::new(OpencodeDriver));
        registry
    }

    pub fn register(&mut self, driver: Box<dyn AgentDriver>) {
        self.drivers.insert(driver.name(), driver);
    }

    pub fn resolve(&self, agent: &str) -> Result<&dyn AgentDriver> {
        let concrete = match agent {
            SELFGUIDED_AGENT => self.default_agent.as_str(),
            EPIC_REVIEW_AGENT | EPIC_MERGE_AGENT => self.review_agent.as_str(),
            other => other,
        };
        self.drivers
            .get(concrete)
            .map(|d| d.as_ref())
            .ok_or_else(|| FuelError::UnknownAgent(concrete.to_string()))
    }
}

// ----------------------------------------------------------------------
// Output harvesting
// ----------------------------------------------------------------------

/// Values harvested from a finished run's stdout.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunHarvest {
    pub model: Option<String>,
    pub cost_usd: Option<f64>,
    pub total_tokens: Option<u64>,
    pub session_id: Option<String>,
}

/// Scan a run's stdout: first line for `Init`, last line for `Result`,
/// falling back to summing `StepFinish` costs when no result line exists.
pub fn harvest_output(driver: &dyn AgentDriver, stdout: &str) -> RunHarvest {
    let mut harvest = RunHarvest::default();
    let lines: Vec<&str> = stdout.lines().filter(|l| !l.trim().is_empty()).collect();

    if let Some(first) = lines.first() {
        if let AgentEvent::Init { model } = driver.parse_line(first) {
            harvest.model = Some(model);
        }
    }
    if let Some(last) = lines.last() {
        if let AgentEvent::Result {
            cost_usd,
            total_tokens,
        } = driver.parse_line(last)
        {
            harvest.cost_usd = cost_usd;
            harvest.total_tokens = total_tokens;
        }
    }
    if harvest.cost_usd.is_none() {
        let mut sum = 0.0;
        let mut seen = false;
        for line in &lines {
            if let AgentEvent::StepFinish {
                cost_usd: Some(cost),
            } = driver.parse_line(line)
            {
                sum += cost;
                seen = true;
            }
        }
        if seen {
            harvest.cost_usd = Some(sum);
        }
    }
    for line in &lines {
        if let Some(session) = driver.extract_session_id(line) {
            harvest.session_id = Some(session);
            break;
        }
    }
    harvest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_invocation_includes_resume() {
        let mut ctx = InvocationContext::new("fix the bug".into(), Path::new("/tmp"));
        ctx.session_id = Some("sess-9".into());
        let invocation = ClaudeDriver.build_invocation(&ctx);
        assert_eq!(invocation.argv[0], "claude");
        let resume_at = invocation
            .argv
            .iter()
            .position(|arg| arg == "--resume")
            .expect("resume flag present");
        assert_eq!(invocation.argv[resume_at + 1], "sess-9");
        assert!(invocation.argv.contains(&"stream-json".to_string()));
    }

    #[test]
    fn claude_parses_init_and_result() {
        let init = r#"{"type":"system","subtype":"init","model":"claude-sonnet","session_id":"s1"}"#;
        assert_eq!(
            ClaudeDriver.parse_line(init),
            AgentEvent::Init {
                model: "claude-sonnet".into()
            }
        );
        assert_eq!(
            ClaudeDriver.extract_session_id(init).as_deref(),
            Some("s1")
        );

        let result = r#"{"type":"result","total_cost_usd":0.42,"usage":{"output_tokens":1200}}"#;
        assert_eq!(
            ClaudeDriver.parse_line(result),
            AgentEvent::Result {
                cost_usd: Some(0.42),
                total_tokens: Some(1200)
            }
        );

        assert_eq!(ClaudeDriver.parse_line("not json"), AgentEvent::Unknown);
    }

    #[test]
    fn harvest_prefers_result_then_sums_step_finish() {
        let with_result = concat!(
            r#"{"type":"system","subtype":"init","model":"m1"}"#, "\n",
            r#"{"type":"result","total_cost_usd":1.5}"#, "\n",
        );
        let harvest = harvest_output(&ClaudeDriver, with_result);
        assert_eq!(harvest.model.as_deref(), Some("m1"));
        assert_eq!(harvest.cost_usd, Some(1.5));

        let without_result = concat!(
            r#"{"type":"session.init","model":"m2","sessionID":"s2"}"#, "\n",
            r#"{"type":"step.finish","cost":0.1}"#, "\n",
            r#"{"type":"step.finish","cost":0.2}"#, "\n",
            r#"{"type":"tool.start","tool":"edit"}"#, "\n",
        );
        let harvest = harvest_output(&OpencodeDriver, without_result);
        assert_eq!(harvest.model.as_deref(), Some("m2"));
        assert_eq!(harvest.session_id.as_deref(), Some("s2"));
        let cost = harvest.cost_usd.unwrap();
        assert!((cost - 0.3).abs() < 1e-9);
    }

    #[test]
    fn registry_routes_logical_names() {
        let registry = DriverRegistry::new(&ConsumeConfig::default());
        assert_eq!(registry.resolve("claude").unwrap().name(), "claude");
        assert_eq!(registry.resolve("opencode").unwrap().name(), "opencode");
        assert_eq!(registry.resolve(SELFGUIDED_AGENT).unwrap().name(), "claude");
        assert_eq!(
            registry.resolve(EPIC_REVIEW_AGENT).unwrap().name(),
            "claude"
        );
        match registry.resolve("gpt-shell") {
            Err(err) => assert!(matches!(err, FuelError::UnknownAgent(_))),
            Ok(_) => panic!("expected UnknownAgent error"),
        }
    }
}
