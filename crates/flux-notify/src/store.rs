use async_trait::async_trait;
use flux_core::entity::notifications;
use flux_core::{FluxError, Result};
use flux_types::{AlertAction, ChannelType, Notification, NotificationStatus};
use sea_orm::sea_query::OnConflict;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// 通知记录存储
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// 保存（插入或覆盖）
    async fn save(&self, notification: &Notification) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Notification>>;

    /// 最近的通知，按创建时间倒序
    async fn list(&self, limit: usize) -> Result<Vec<Notification>>;

    async fn list_for_alert(&self, alert_id: &str) -> Result<Vec<Notification>>;
}

/// 内存存储，超过容量时淘汰最早的记录
pub struct MemoryNotificationStore {
    records: RwLock<HashMap<String, Notification>>,
    capacity: usize,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }
}

impl Default for MemoryNotificationStore {
    fn default() -> Self {
        Self::new()
    }
}

fn newest_first(mut records: Vec<Notification>) -> Vec<Notification> {
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
    records
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn save(&self, notification: &Notification) -> Result<()> {
        let mut records = self.records.write().await;
        records.insert(notification.id.clone(), notification.clone());

        if records.len() > self.capacity {
            let oldest = records
                .values()
                .min_by_key(|n| n.created_at)
                .map(|n| n.id.clone());
            if let Some(id) = oldest {
                records.remove(&id);
            }
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Notification>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn list(&self, limit: usize) -> Result<Vec<Notification>> {
        let records = self.records.read().await;
        let mut all = newest_first(records.values().cloned().collect());
        all.truncate(limit);
        Ok(all)
    }

    async fn list_for_alert(&self, alert_id: &str) -> Result<Vec<Notification>> {
        let records = self.records.read().await;
        Ok(newest_first(
            records
                .values()
                .filter(|n| n.alert_id == alert_id)
                .cloned()
                .collect(),
        ))
    }
}

/// 基于 sea-orm 的通知存储
pub struct DbNotificationStore {
    db: Arc<DatabaseConnection>,
}

impl DbNotificationStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

fn to_active_model(n: &Notification) -> notifications::ActiveModel {
    notifications::ActiveModel {
        id: Set(n.id.clone()),
        alert_id: Set(n.alert_id.clone()),
        channel_id: Set(n.channel_id.clone()),
        channel_type: Set(n.channel_type.to_string()),
        recipient: Set(n.recipient.clone()),
        action: Set(n.action.to_string()),
        status: Set(n.status.to_string()),
        retry_count: Set(n.retry_count as i32),
        sent_at: Set(n.sent_at),
        failed_at: Set(n.failed_at),
        last_error: Set(n.last_error.clone()),
        created_at: Set(n.created_at),
    }
}

fn from_model(model: notifications::Model) -> Result<Notification> {
    let invalid = |what: &str, e: String| FluxError::Internal(format!("corrupt notification {what}: {e}"));
    Ok(Notification {
        channel_type: model
            .channel_type
            .parse::<ChannelType>()
            .map_err(|e| invalid("channel_type", e))?,
        action: model.action.parse::<AlertAction>().map_err(|e| invalid("action", e))?,
        status: model
            .status
            .parse::<NotificationStatus>()
            .map_err(|e| invalid("status", e))?,
        id: model.id,
        alert_id: model.alert_id,
        channel_id: model.channel_id,
        recipient: model.recipient,
        retry_count: model.retry_count.max(0) as u32,
        sent_at: model.sent_at,
        failed_at: model.failed_at,
        last_error: model.last_error,
        created_at: model.created_at,
    })
}

#[async_trait]
impl NotificationStore for DbNotificationStore {
    async fn save(&self, notification: &Notification) -> Result<()> {
        notifications::Entity::insert(to_active_model(notification))
            .on_conflict(
                OnConflict::column(notifications::Column::Id)
                    .update_columns([
                        notifications::Column::Status,
                        notifications::Column::RetryCount,
                        notifications::Column::SentAt,
                        notifications::Column::FailedAt,
                        notifications::Column::LastError,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Notification>> {
        notifications::Entity::find_by_id(id.to_string())
            .one(&*self.db)
            .await?
            .map(from_model)
            .transpose()
    }

    async fn list(&self, limit: usize) -> Result<Vec<Notification>> {
        let models = notifications::Entity::find()
            .order_by_desc(notifications::Column::CreatedAt)
            .limit(limit as u64)
            .all(&*self.db)
            .await?;
        models.into_iter().map(from_model).collect()
    }

    async fn list_for_alert(&self, alert_id: &str) -> Result<Vec<Notification>> {
        let models = notifications::Entity::find()
            .filter(notifications::Column::AlertId.eq(alert_id))
            .order_by_desc(notifications::Column::CreatedAt)
            .all(&*self.db)
            .await?;
        models.into_iter().map(from_model).collect()
    }
}
