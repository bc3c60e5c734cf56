//! Consume daemon wiring: subsystem construction, signal handling, and the
//! detached background runner.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use fuel_core::supervisor::pid_alive;
use fuel_core::{
    lifecycle, ConfigOverrides, ConsumeConfig, DriverRegistry, EpicController, EventBus,
    HealthTracker, Scheduler, Supervisor,
};
use fuel_server::IpcServer;
use fuel_store::Store;

/// Bound on queued IPC commands; the tick loop drains every cycle.
const COMMAND_QUEUE_DEPTH: usize = 256;

/// Run the consume daemon in the foreground until SIGINT/SIGTERM.
pub async fn run_consume(project_root: &Path, overrides: ConfigOverrides) -> anyhow::Result<()> {
    let store = Arc::new(Store::open(project_root)?);
    let fuel_dir = store.fuel_dir().to_path_buf();

    // Refuse early when a live daemon owns the project; the pid file is
    // re-checked (and written) once the port is known.
    if let Some(existing) = lifecycle::read_pid_file(&fuel_dir) {
        if existing.pid != std::process::id() && pid_alive(existing.pid) {
            anyhow::bail!("another consume daemon is running (pid {})", existing.pid);
        }
    }

    let config = ConsumeConfig::load(&fuel_dir)?.apply_overrides(&overrides);
    let events = EventBus::new();
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let shutdown = CancellationToken::new();
    let instance_id = fuel_server::new_instance_id();

    let server = IpcServer::new(store.clone(), events.clone(), cmd_tx, instance_id);
    let handle = server.serve(shutdown.clone()).await?;
    lifecycle::acquire_pid_file(&fuel_dir, handle.port)?;

    let swept = lifecycle::recovery_sweep(&store)?;
    if !swept.is_empty() {
        info!(count = swept.len(), "recovery sweep reopened orphaned tasks");
    }

    let health = HealthTracker::rebuild(&config.health, &store.list_runs()?);
    let registry = DriverRegistry::new(&config);
    let epics = EpicController::new(project_root.to_path_buf(), config.epic_mirrors_enabled);
    let supervisor = Arc::new(Supervisor::new(store.processes_dir()));

    let scheduler = Scheduler::new(
        store.clone(),
        supervisor,
        registry,
        epics,
        health,
        events,
        config,
        project_root.to_path_buf(),
        cmd_rx,
        shutdown.clone(),
    );

    spawn_signal_watcher(shutdown.clone());

    info!(port = handle.port, project = %project_root.display(), "consume daemon up");
    let result = scheduler.run().await;
    lifecycle::remove_pid_file(&fuel_dir);
    result.context("consume loop failed")
}

fn spawn_signal_watcher(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate());
        match sigterm {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
        info!("shutdown signal received");
        shutdown.cancel();
    });
}

/// `consume:runner`: re-exec this binary detached, logging to
/// `.fuel/consume-runner.log`. Returns the runner's pid.
pub fn spawn_runner(project_root: &Path, overrides: &ConfigOverrides) -> anyhow::Result<u32> {
    use std::os::unix::process::CommandExt;

    let exe = std::env::current_exe().context("resolve current executable")?;
    let fuel_dir = project_root.join(".fuel");
    std::fs::create_dir_all(&fuel_dir)?;
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(fuel_dir.join("consume-runner.log"))?;

    let mut command = std::process::Command::new(exe);
    command
        .arg("--cwd")
        .arg(project_root)
        .arg("consume");
    if let Some(interval) = overrides.interval_ms {
        command.arg("--interval").arg(interval.to_string());
    }
    if let Some(concurrency) = overrides.concurrency_cap {
        command.arg("--concurrency").arg(concurrency.to_string());
    }
    if overrides.review_enabled == Some(true) {
        command.arg("--review");
    }
    if overrides.epic_mirrors_enabled == Some(true) {
        command.arg("--mirrors");
    }
    command
        .stdin(std::process::Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log)
        .process_group(0);

    let child = command.spawn().context("spawn consume runner")?;
    Ok(child.id())
}
