use flux_types::message::{Message, MonitorEvent};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Message>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.sender.subscribe()
    }

    pub fn publish(&self, message: Message) -> Result<usize, broadcast::error::SendError<Message>> {
        self.sender.send(message)
    }

    /// 发布事件，没有订阅者时静默丢弃
    pub fn emit(&self, event: MonitorEvent) -> usize {
        let message = Message::new(event);
        let topic = message.topic.clone();
        match self.sender.send(message) {
            Ok(n) => n,
            Err(_) => {
                debug!(topic = %topic, "No subscribers for event");
                0
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

pub type SharedEventBus = Arc<EventBus>;
