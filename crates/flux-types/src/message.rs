use crate::alert::Alert;
use crate::notification::Notification;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 监控系统内部事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    AlertFiring { alert: Alert },
    AlertResolved { alert: Alert },
    /// 重试耗尽后的最终投递失败
    DeliveryFailed { notification: Notification },
}

impl MonitorEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            Self::AlertFiring { .. } => "alert/firing",
            Self::AlertResolved { .. } => "alert/resolved",
            Self::DeliveryFailed { .. } => "notification/failed",
        }
    }
}

/// 事件总线消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub topic: String,
    pub event: MonitorEvent,
    pub timestamp: i64,
}

impl Message {
    pub fn new(event: MonitorEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: event.topic().to_string(),
            event,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}
