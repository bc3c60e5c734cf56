//! TCP IPC server for the consume daemon.
//!
//! Listens on localhost with an ephemeral port (recorded in the pid file by
//! the daemon binary). Framing is newline-delimited JSON. Clients ATTACH to
//! receive a board snapshot followed by the live event stream; commands are
//! funnelled into the scheduler's queue. Each client has a bounded outbound
//! queue; a client that cannot keep up is dropped with a final error rather
//! than ever blocking the scheduler.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use fuel_core::{DaemonCommand, EventBus, FuelError, Result};
use fuel_store::{Store, StoreError};
use fuel_types::DaemonEvent;
use fuel_wire::{ClientCommand, CommandEnvelope, ServerEnvelope, ServerPayload, Snapshot};

/// Outbound messages buffered per client before it is declared slow.
const CLIENT_QUEUE_DEPTH: usize = 256;

#[derive(Clone)]
pub struct IpcServer {
    store: Arc<Store>,
    events: EventBus,
    cmd_tx: mpsc::Sender<DaemonCommand>,
    instance_id: String,
}

pub struct ServerHandle {
    pub port: u16,
}

impl IpcServer {
    pub fn new(
        store: Arc<Store>,
        events: EventBus,
        cmd_tx: mpsc::Sender<DaemonCommand>,
        instance_id: String,
    ) -> Self {
        Self {
            store,
            events,
            cmd_tx,
            instance_id,
        }
    }

    /// Bind 127.0.0.1 on an ephemeral port and run the accept loop in the
    /// background until `shutdown` fires. Returns the bound port.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<ServerHandle> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| FuelError::PortInUse(e.to_string()))?;
        let port = listener
            .local_addr()
            .map_err(|e| FuelError::PortInUse(e.to_string()))?
            .port();
        tracing::info!(port, "IPC server listening");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!(%peer, "IPC client connected");
                            let server = self.clone();
                            let client_shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_client(stream, client_shutdown).await {
                                    tracing::debug!("IPC client ended: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!("accept failed: {e}");
                        }
                    },
                    _ = shutdown.cancelled() => {
                        tracing::info!("IPC server stopping");
                        break;
                    }
                }
            }
        });

        Ok(ServerHandle { port })
    }

    async fn handle_client(
        &self,
        stream: TcpStream,
        shutdown: CancellationToken,
    ) -> std::io::Result<()> {
        let (read_half, write_half) = stream.into_split();
        let mut client = ClientConn::new(read_half, write_half, self.instance_id.clone());

        loop {
            tokio::select! {
                line = client.lines.next_line() => {
                    let Ok(Some(line)) = line else { break };
                    if !self.handle_line(&mut client, &line).await? {
                        break;
                    }
                }
                Some(queued) = client.out_rx.recv() => {
                    client.write_line(&queued).await?;
                }
                event = recv_if_attached(&mut client.events_rx) => {
                    match event {
                        Ok(event) => {
                            if !client.enqueue_event(&event) {
                                client.send_error("slow consumer, dropping connection").await?;
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "IPC client lagged behind the event stream");
                            client.send_error("event stream lagged, dropping connection").await?;
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
        Ok(())
    }

    /// Returns false when the connection should close.
    async fn handle_line(&self, client: &mut ClientConn, line: &str) -> std::io::Result<bool> {
        let Some(parsed) = fuel_wire::parse_command_line(line) else {
            return Ok(true);
        };
        let envelope = match parsed {
            Ok(envelope) => envelope,
            Err(e) => {
                client.send_error(&format!("malformed command: {e}")).await?;
                return Ok(true);
            }
        };
        let CommandEnvelope {
            command,
            request_id,
            ..
        } = envelope;

        match command {
            ClientCommand::Attach => {
                client.events_rx = Some(self.events.subscribe());
                let snapshot = self.snapshot();
                client
                    .send_payload(ServerPayload::Snapshot { snapshot })
                    .await?;
            }
            ClientCommand::Detach => {
                client.events_rx = None;
            }
            ClientCommand::Disconnect => return Ok(false),
            ClientCommand::PauseTask { task_id } => {
                self.forward_task_command(client, &task_id, request_id, |task_id| {
                    DaemonCommand::PauseTask { task_id }
                })
                .await?;
            }
            ClientCommand::UnpauseTask { task_id } => {
                self.forward_task_command(client, &task_id, request_id, |task_id| {
                    DaemonCommand::UnpauseTask { task_id }
                })
                .await?;
            }
            ClientCommand::CancelRun { task_id } => {
                self.forward_task_command(client, &task_id, request_id, |task_id| {
                    DaemonCommand::CancelRun { task_id }
                })
                .await?;
            }
            ClientCommand::InjectTask {
                title,
                description,
                agent,
            } => {
                let _ = self
                    .cmd_tx
                    .send(DaemonCommand::InjectTask {
                        title,
                        description,
                        agent,
                    })
                    .await;
            }
            ClientCommand::Status => {
                let (reply_tx, reply_rx) = oneshot::channel();
                let _ = self
                    .cmd_tx
                    .send(DaemonCommand::Status { reply: reply_tx })
                    .await;
                let payload = reply_rx.await.unwrap_or_else(|_| json!({}));
                client
                    .send_payload(ServerPayload::Response {
                        request_id: request_id.unwrap_or_default(),
                        payload,
                        error: None,
                    })
                    .await?;
            }
            ClientCommand::HealthReset => {
                let _ = self.cmd_tx.send(DaemonCommand::HealthReset).await;
            }
            ClientCommand::Shutdown => {
                let _ = self.cmd_tx.send(DaemonCommand::Shutdown).await;
            }
            ClientCommand::Browser { op, params } => {
                // Adjunct path: the reply comes back as a BrowserResponse on
                // the event bus so every attached client can correlate it.
                let (reply_tx, reply_rx) = oneshot::channel();
                let _ = self
                    .cmd_tx
                    .send(DaemonCommand::Browser {
                        op,
                        params,
                        reply: reply_tx,
                    })
                    .await;
                let events = self.events.clone();
                let request_id = request_id.unwrap_or_default();
                tokio::spawn(async move {
                    let (payload, error) = match reply_rx.await {
                        Ok(Ok(value)) => (Some(value), None),
                        Ok(Err(message)) => (None, Some(message)),
                        Err(_) => (None, Some("daemon did not answer".to_string())),
                    };
                    events.publish(DaemonEvent::BrowserResponse {
                        request_id,
                        payload,
                        error,
                        timestamp: chrono::Utc::now(),
                    });
                });
            }
        }
        Ok(true)
    }

    /// Resolve a possibly-partial task id, then forward the command. A
    /// validation failure answers the caller and mutates nothing.
    async fn forward_task_command(
        &self,
        client: &mut ClientConn,
        task_id: &str,
        request_id: Option<String>,
        make: impl FnOnce(String) -> DaemonCommand,
    ) -> std::io::Result<()> {
        match self.store.resolve(task_id) {
            Ok(full_id) => {
                let _ = self.cmd_tx.send(make(full_id)).await;
            }
            Err(e @ (StoreError::NotFound(_) | StoreError::Ambiguous { .. })) => {
                match request_id {
                    Some(request_id) => {
                        client
                            .send_payload(ServerPayload::Response {
                                request_id,
                                payload: Value::Null,
                                error: Some(e.to_string()),
                            })
                            .await?;
                    }
                    None => client.send_error(&e.to_string()).await?,
                }
            }
            Err(e) => client.send_error(&e.to_string()).await?,
        }
        Ok(())
    }

    fn snapshot(&self) -> Snapshot {
        let running = self
            .store
            .list_runs()
            .unwrap_or_default()
            .into_iter()
            .filter(|r| r.ended_at.is_none())
            .collect();
        Snapshot {
            tasks: self.store.list_tasks().unwrap_or_default(),
            epics: self.store.list_epics().unwrap_or_default(),
            running,
            reviews: self.store.list_reviews().unwrap_or_default(),
        }
    }
}

/// Keeps the `if attached` receive arm cancel-safe inside `select!`.
async fn recv_if_attached(
    events_rx: &mut Option<broadcast::Receiver<DaemonEvent>>,
) -> std::result::Result<DaemonEvent, broadcast::error::RecvError> {
    match events_rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

struct ClientConn {
    lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    writer: BufWriter<OwnedWriteHalf>,
    events_rx: Option<broadcast::Receiver<DaemonEvent>>,
    out_tx: mpsc::Sender<String>,
    out_rx: mpsc::Receiver<String>,
    instance_id: String,
}

impl ClientConn {
    fn new(read_half: OwnedReadHalf, write_half: OwnedWriteHalf, instance_id: String) -> Self {
        let (out_tx, out_rx) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        Self {
            lines: BufReader::new(read_half).lines(),
            writer: BufWriter::new(write_half),
            events_rx: None,
            out_tx,
            out_rx,
            instance_id,
        }
    }

    fn envelope(&self, payload: ServerPayload) -> String {
        let envelope = ServerEnvelope::new(&self.instance_id, payload);
        serde_json::to_string(&envelope).unwrap_or_else(|_| "{}".to_string())
    }

    /// Queue an event for delivery. False means the client is too slow.
    fn enqueue_event(&self, event: &DaemonEvent) -> bool {
        let line = self.envelope(ServerPayload::Event {
            event: event.clone(),
        });
        self.out_tx.try_send(line).is_ok()
    }

    async fn send_payload(&mut self, payload: ServerPayload) -> std::io::Result<()> {
        let line = self.envelope(payload);
        self.write_line(&line).await
    }

    async fn send_error(&mut self, message: &str) -> std::io::Result<()> {
        self.send_payload(ServerPayload::Error {
            message: message.to_string(),
        })
        .await
    }

    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }
}

/// A fresh per-process instance id for the daemon.
pub fn new_instance_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fuel_store::NewTask;
    use fuel_wire::PidFile;
    use tempfile::tempdir;

    struct TestRig {
        port: u16,
        store: Arc<Store>,
        events: EventBus,
        cmd_rx: mpsc::Receiver<DaemonCommand>,
        _shutdown: CancellationToken,
    }

    async fn start_server() -> (TestRig, tempfile::TempDir) {
        let temp = tempdir().unwrap();
        let store = Arc::new(Store::open(temp.path()).unwrap());
        let events = EventBus::new();
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let server = IpcServer::new(
            store.clone(),
            events.clone(),
            cmd_tx,
            new_instance_id(),
        );
        let handle = server.serve(shutdown.clone()).await.unwrap();
        (
            TestRig {
                port: handle.port,
                store,
                events,
                cmd_rx,
                _shutdown: shutdown,
            },
            temp,
        )
    }

    async fn connect(port: u16) -> (tokio::io::Lines<BufReader<OwnedReadHalf>>, OwnedWriteHalf) {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        (BufReader::new(read_half).lines(), write_half)
    }

    async fn send(write_half: &mut OwnedWriteHalf, line: &str) {
        write_half.write_all(line.as_bytes()).await.unwrap();
        write_half.write_all(b"\n").await.unwrap();
    }

    async fn next_json(
        lines: &mut tokio::io::Lines<BufReader<OwnedReadHalf>>,
    ) -> Value {
        let line = tokio::time::timeout(std::time::Duration::from_secs(5), lines.next_line())
            .await
            .expect("timed out waiting for server line")
            .unwrap()
            .expect("connection closed");
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn attach_receives_snapshot_then_events() {
        let (mut rig, _temp) = start_server().await;
        rig.store
            .create_task(NewTask {
                title: "board task".into(),
                ..NewTask::default()
            })
            .unwrap();

        let (mut lines, mut write_half) = connect(rig.port).await;
        send(&mut write_half, r#"{"type":"ATTACH"}"#).await;

        let snapshot = next_json(&mut lines).await;
        assert_eq!(snapshot["type"], "SNAPSHOT");
        assert_eq!(snapshot["snapshot"]["tasks"][0]["title"], "board task");
        assert!(snapshot["instance_id"].is_string());

        rig.events.publish(DaemonEvent::Heartbeat {
            running: 0,
            ready: 1,
            timestamp: chrono::Utc::now(),
        });
        let event = next_json(&mut lines).await;
        assert_eq!(event["type"], "EVENT");
        assert_eq!(event["event"]["type"], "heartbeat");
        assert_eq!(event["event"]["ready"], 1);
    }

    #[tokio::test]
    async fn commands_reach_the_scheduler_queue_with_resolved_ids() {
        let (mut rig, _temp) = start_server().await;
        let task = rig
            .store
            .create_task(NewTask {
                title: "pause me".into(),
                ..NewTask::default()
            })
            .unwrap();

        let (_lines, mut write_half) = connect(rig.port).await;
        // A unique 4-char prefix of the task id resolves server-side.
        let prefix = &task.short_id[..4];
        send(
            &mut write_half,
            &format!(r#"{{"type":"PAUSE_TASK","task_id":"{prefix}"}}"#),
        )
        .await;

        let cmd = tokio::time::timeout(std::time::Duration::from_secs(5), rig.cmd_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match cmd {
            DaemonCommand::PauseTask { task_id } => assert_eq!(task_id, task.short_id),
            _ => panic!("wrong command variant"),
        }
    }

    #[tokio::test]
    async fn unknown_id_answers_with_error_without_mutation() {
        let (rig, _temp) = start_server().await;
        let (mut lines, mut write_half) = connect(rig.port).await;
        send(
            &mut write_half,
            r#"{"type":"PAUSE_TASK","task_id":"zz9999","request_id":"req-7"}"#,
        )
        .await;

        let response = next_json(&mut lines).await;
        assert_eq!(response["type"], "RESPONSE");
        assert_eq!(response["request_id"], "req-7");
        assert!(response["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn status_round_trips_through_the_daemon() {
        let (rig, _temp) = start_server().await;
        let TestRig {
            port, mut cmd_rx, ..
        } = rig;

        // Stand in for the scheduler: answer status requests.
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                if let DaemonCommand::Status { reply } = cmd {
                    let _ = reply.send(json!({"running": 0}));
                }
            }
        });

        let (mut lines, mut write_half) = connect(port).await;
        send(
            &mut write_half,
            r#"{"type":"STATUS","request_id":"req-1"}"#,
        )
        .await;
        let response = next_json(&mut lines).await;
        assert_eq!(response["type"], "RESPONSE");
        assert_eq!(response["request_id"], "req-1");
        assert_eq!(response["payload"]["running"], 0);
    }

    #[tokio::test]
    async fn browser_reply_arrives_as_broadcast_event() {
        let (rig, _temp) = start_server().await;
        let TestRig {
            port, mut cmd_rx, ..
        } = rig;

        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                if let DaemonCommand::Browser { reply, .. } = cmd {
                    let _ = reply.send(Err("browser bridge not available".into()));
                }
            }
        });

        let (mut lines, mut write_half) = connect(port).await;
        send(&mut write_half, r#"{"type":"ATTACH"}"#).await;
        let _snapshot = next_json(&mut lines).await;
        send(
            &mut write_half,
            r#"{"type":"BROWSER","op":"navigate","params":{},"request_id":"req-9"}"#,
        )
        .await;

        let event = next_json(&mut lines).await;
        assert_eq!(event["type"], "EVENT");
        assert_eq!(event["event"]["type"], "browser_response");
        assert_eq!(event["event"]["request_id"], "req-9");
        assert!(event["event"]["error"]
            .as_str()
            .unwrap()
            .contains("not available"));
    }

    #[tokio::test]
    async fn detach_stops_event_delivery_but_keeps_the_connection() {
        let (rig, _temp) = start_server().await;
        let (mut lines, mut write_half) = connect(rig.port).await;
        send(&mut write_half, r#"{"type":"ATTACH"}"#).await;
        let _snapshot = next_json(&mut lines).await;
        send(&mut write_half, r#"{"type":"DETACH"}"#).await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        rig.events.publish(DaemonEvent::Heartbeat {
            running: 0,
            ready: 0,
            timestamp: chrono::Utc::now(),
        });

        // Still connected: a STATUS-free probe is answering ERROR for junk.
        send(&mut write_half, "not json").await;
        let response = next_json(&mut lines).await;
        assert_eq!(response["type"], "ERROR");
    }

    #[test]
    fn pid_file_shape_matches_wire_contract() {
        let pid_file = PidFile {
            pid: 1234,
            port: 43210,
            started_at: chrono::Utc::now(),
        };
        let json = serde_json::to_value(&pid_file).unwrap();
        assert_eq!(json["pid"], 1234);
        assert_eq!(json["port"], 43210);
        assert!(json["started_at"].is_string());
    }
}
