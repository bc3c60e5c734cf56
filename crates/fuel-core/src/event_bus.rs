use tokio::sync::broadcast;

use fuel_types::DaemonEvent;

/// Fan-out bus between the scheduler and IPC clients. Lossy for laggards:
/// a receiver that falls behind sees `RecvError::Lagged`, which the server
/// treats as a slow client.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DaemonEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: DaemonEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
