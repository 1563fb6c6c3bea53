use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const REFRESH_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefreshSignal {
    Focus,
    DataUpdated,
}

#[derive(Clone)]
pub struct RefreshBus {
    sender: broadcast::Sender<RefreshSignal>,
}

impl Default for RefreshBus {
    fn default() -> Self {
        Self::new()
    }
}

impl RefreshBus {
    pub fn new() -> Self {
        Self::with_capacity(REFRESH_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RefreshSignal> {
        self.sender.subscribe()
    }

    pub fn notify_focus(&self) -> usize {
        self.publish(RefreshSignal::Focus)
    }

    pub fn notify_data_updated(&self) -> usize {
        self.publish(RefreshSignal::DataUpdated)
    }

    pub fn publish(&self, signal: RefreshSignal) -> usize {
        let delivered = self.sender.send(signal).unwrap_or(0);
        tracing::debug!(signal = ?signal, delivered, "refresh signal published");
        delivered
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
