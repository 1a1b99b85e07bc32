use dashmap::DashMap;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

/// One LISTEN/NOTIFY message: channel name plus JSON payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyMsg {
    pub channel: String,
    pub payload: String,
}

/// Broadcast hub for LISTEN/NOTIFY, keyed by channel name. Sends are
/// fire-and-forget: a send with nobody listening, or to a lagging
/// receiver, is silently dropped and never blocks the sender.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<NotifyMsg>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a channel. Creates the channel if needed.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<NotifyMsg> {
        let sender = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a payload. No-op if nobody is listening.
    pub fn send(&self, channel: &str, payload: String) {
        if let Some(sender) = self.channels.get(channel) {
            let _ = sender.send(NotifyMsg {
                channel: channel.to_string(),
                payload,
            });
        }
    }

    /// Drop a channel (e.g. when a staff member is deleted).
    pub fn remove(&self, channel: &str) {
        self.channels.remove(channel);
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}
