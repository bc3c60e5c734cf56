//! Process supervisor: spawns agent children, streams their output to
//! per-run log files, enforces wall-clock limits, and reports completions.
//!
//! Log files under `processes/<run_short_id>/` are append-only while the
//! child lives and never rewritten afterwards. `poll()` hands each
//! completion to the scheduler exactly once.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::time::Instant;

use crate::error::{FuelError, Result};

/// A child that exits without producing any stdout inside this window is
/// classified as crashed-early rather than a normal failure.
const DEFAULT_INIT_WINDOW: Duration = Duration::from_secs(10);

/// Grace between SIGTERM and SIGKILL when a run exceeds its wall clock.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Bytes of stdout kept in memory as the run's tail.
const TAIL_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub run_short_id: String,
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
    /// Wall-clock limit; expiry sends SIGTERM then SIGKILL
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    NormalExit,
    CrashedEarly,
    Killed,
}

/// One reaped child, returned by `poll()` at most once.
#[derive(Debug, Clone)]
pub struct Completion {
    pub run_short_id: String,
    pub outcome: RunOutcome,
    pub exit_code: Option<i32>,
    pub ended_at: DateTime<Utc>,
    pub stdout_tail: String,
}

struct LiveChild {
    pid: u32,
    kill_requested: Arc<AtomicBool>,
}

pub struct Supervisor {
    processes_dir: PathBuf,
    live: Arc<Mutex<HashMap<String, LiveChild>>>,
    completed: Arc<Mutex<Vec<Completion>>>,
    init_window: Duration,
}

impl Supervisor {
    pub fn new(processes_dir: PathBuf) -> Self {
        Self {
            processes_dir,
            live: Arc::new(Mutex::new(HashMap::new())),
            completed: Arc::new(Mutex::new(Vec::new())),
            init_window: DEFAULT_INIT_WINDOW,
        }
    }

    #[cfg(test)]
    fn with_init_window(mut self, window: Duration) -> Self {
        self.init_window = window;
        self
    }

    pub fn run_dir(&self, run_short_id: &str) -> PathBuf {
        self.processes_dir.join(run_short_id)
    }

    pub fn stdout_log_path(&self, run_short_id: &str) -> PathBuf {
        self.run_dir(run_short_id).join("stdout.log")
    }

    pub fn stderr_log_path(&self, run_short_id: &str) -> PathBuf {
        self.run_dir(run_short_id).join("stderr.log")
    }

    /// Spawn a child. Returns once the pid is known; an exec error surfaces
    /// immediately as `SpawnFailed`.
    pub fn spawn(&self, spec: SpawnSpec) -> Result<u32> {
        if spec.argv.is_empty() {
            return Err(FuelError::SpawnFailed("empty argv".into()));
        }
        let run_dir = self.run_dir(&spec.run_short_id);
        fs::create_dir_all(&run_dir)?;

        let mut command = Command::new(&spec.argv[0]);
        command
            .args(&spec.argv[1..])
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .map_err(|e| FuelError::SpawnFailed(format!("{}: {e}", spec.argv[0])))?;
        let pid = child
            .id()
            .ok_or_else(|| FuelError::SpawnFailed("child exited before pid capture".into()))?;

        let kill_requested = Arc::new(AtomicBool::new(false));
        self.live.lock().unwrap().insert(
            spec.run_short_id.clone(),
            LiveChild {
                pid,
                kill_requested: kill_requested.clone(),
            },
        );
        tracing::info!(run = %spec.run_short_id, pid, argv0 = %spec.argv[0], "spawned agent child");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_path = self.stdout_log_path(&spec.run_short_id);
        let stderr_path = self.stderr_log_path(&spec.run_short_id);
        let live = self.live.clone();
        let completed = self.completed.clone();
        let init_window = self.init_window;
        let run_short_id = spec.run_short_id.clone();
        let timeout = spec.timeout;

        tokio::spawn(async move {
            let started = Instant::now();
            let deadline = started + timeout;

            let stderr_task =
                stderr.map(|s| tokio::spawn(copy_stream_to_log(s, stderr_path)));

            let mut tail = String::new();
            let mut saw_output = false;
            let mut timed_out = false;

            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                let mut log = match fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&stdout_path)
                {
                    Ok(f) => Some(f),
                    Err(e) => {
                        tracing::warn!(run = %run_short_id, "failed to open stdout log: {e}");
                        None
                    }
                };
                loop {
                    tokio::select! {
                        line = lines.next_line() => match line {
                            Ok(Some(line)) => {
                                saw_output = true;
                                if let Some(log) = log.as_mut() {
                                    let _ = writeln!(log, "{line}");
                                }
                                append_bounded(&mut tail, &line, TAIL_LIMIT);
                            }
                            _ => break,
                        },
                        _ = tokio::time::sleep_until(deadline) => {
                            timed_out = true;
                            tracing::warn!(run = %run_short_id, "run exceeded wall clock, terminating");
                            signal_pid(pid, libc::SIGTERM);
                            break;
                        }
                    }
                }
            }

            // Reap. After a timeout the child gets a short grace before
            // SIGKILL; a healthy child has already closed its pipes.
            let status = tokio::select! {
                status = child.wait() => status.ok(),
                _ = tokio::time::sleep(TERM_GRACE) => {
                    let _ = child.start_kill();
                    child.wait().await.ok()
                }
            };

            if let Some(task) = stderr_task {
                let _ = task.await;
            }

            let kill_was_requested = kill_requested.load(Ordering::SeqCst);
            let exit_code = status.and_then(|s| s.code());
            let outcome = if timed_out || kill_was_requested || exit_code.is_none() {
                RunOutcome::Killed
            } else if exit_code != Some(0)
                && !saw_output
                && started.elapsed() < init_window
            {
                RunOutcome::CrashedEarly
            } else {
                RunOutcome::NormalExit
            };

            live.lock().unwrap().remove(&run_short_id);
            completed.lock().unwrap().push(Completion {
                run_short_id,
                outcome,
                exit_code,
                ended_at: Utc::now(),
                stdout_tail: tail,
            });
        });

        Ok(pid)
    }

    /// Completions since the last call. Each completion is returned once.
    pub fn poll(&self) -> Vec<Completion> {
        std::mem::take(&mut *self.completed.lock().unwrap())
    }

    /// Deliver a signal to a live run's child.
    pub fn kill(&self, run_short_id: &str, signal: i32) -> Result<()> {
        let live = self.live.lock().unwrap();
        let child = live
            .get(run_short_id)
            .ok_or_else(|| FuelError::SpawnFailed(format!("no live run {run_short_id}")))?;
        child.kill_requested.store(true, Ordering::SeqCst);
        signal_pid(child.pid, signal);
        Ok(())
    }

    /// Liveness: the child table first, then the OS by recorded pid.
    pub fn is_alive(&self, run_short_id: &str, recorded_pid: Option<u32>) -> bool {
        if let Some(child) = self.live.lock().unwrap().get(run_short_id) {
            return pid_alive(child.pid);
        }
        recorded_pid.map(pid_alive).unwrap_or(false)
    }

    pub fn running_count(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn live_run_ids(&self) -> Vec<String> {
        self.live.lock().unwrap().keys().cloned().collect()
    }

    /// SIGTERM every live child (shutdown path).
    pub fn terminate_all(&self) {
        for child in self.live.lock().unwrap().values() {
            child.kill_requested.store(true, Ordering::SeqCst);
            signal_pid(child.pid, libc::SIGTERM);
        }
    }

    /// SIGKILL every child still alive after the shutdown grace.
    pub fn kill_all(&self) {
        for child in self.live.lock().unwrap().values() {
            signal_pid(child.pid, libc::SIGKILL);
        }
    }
}

async fn copy_stream_to_log(stream: impl AsyncRead + Unpin, path: PathBuf) {
    let mut lines = BufReader::new(stream).lines();
    let mut log = match fs::OpenOptions::new().create(true).append(true).open(&path) {
        Ok(f) => f,
        Err(_) => return,
    };
    while let Ok(Some(line)) = lines.next_line().await {
        let _ = writeln!(log, "{line}");
    }
}

fn append_bounded(tail: &mut String, line: &str, limit: usize) {
    tail.push_str(line);
    tail.push('\n');
    if tail.len() > limit {
        let mut cut = tail.len() - limit;
        while !tail.is_char_boundary(cut) {
            cut += 1;
        }
        tail.drain(..cut);
    }
}

fn signal_pid(pid: u32, signal: i32) {
    unsafe {
        libc::kill(pid as i32, signal);
    }
}

/// OS-level liveness probe by pid.
pub fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}
