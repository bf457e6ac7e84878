use tokio::sync::broadcast;

use crate::types::SessionId;

/// Fire-and-forget announcements for external listeners such as a
/// conversation list. No acknowledgement, no delivery guarantee to late
/// subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineNotification {
    SessionCreated { id: SessionId, preview: String },
    MessageSent { session_id: SessionId, text: String },
}

#[derive(Clone)]
pub struct EngineBus {
    tx: broadcast::Sender<EngineNotification>,
}

impl EngineBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineNotification> {
        self.tx.subscribe()
    }

    /// Publishing with no subscribers is fine.
    pub fn publish(&self, notification: EngineNotification) {
        let _ = self.tx.send(notification);
    }
}

impl Default for EngineBus {
    fn default() -> Self {
        Self::new()
    }
}
