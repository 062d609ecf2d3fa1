use async_trait::async_trait;
use flux_core::entity::alerts;
use flux_core::{FluxError, Result};
use flux_types::{Alert, AlertStatus, Severity};
use sea_orm::sea_query::OnConflict;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// 告警查询条件
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertFilter {
    pub status: Option<AlertStatus>,
    pub rule_id: Option<String>,
    pub limit: Option<usize>,
}

impl AlertFilter {
    pub fn firing() -> Self {
        Self {
            status: Some(AlertStatus::Firing),
            ..Default::default()
        }
    }

    fn matches(&self, alert: &Alert) -> bool {
        self.status.map_or(true, |s| alert.status == s)
            && self.rule_id.as_ref().map_or(true, |id| &alert.rule_id == id)
    }
}

/// 告警持久化
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// 保存（插入或覆盖）
    async fn save(&self, alert: &Alert) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Alert>>;

    /// 按开始时间倒序
    async fn list(&self, filter: &AlertFilter) -> Result<Vec<Alert>>;
}

/// 内存告警存储
#[derive(Default)]
pub struct MemoryAlertStore {
    alerts: RwLock<HashMap<String, Alert>>,
}

impl MemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AlertStore for MemoryAlertStore {
    async fn save(&self, alert: &Alert) -> Result<()> {
        self.alerts
            .write()
            .await
            .insert(alert.id.clone(), alert.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Alert>> {
        Ok(self.alerts.read().await.get(id).cloned())
    }

    async fn list(&self, filter: &AlertFilter) -> Result<Vec<Alert>> {
        let alerts = self.alerts.read().await;
        let mut matched: Vec<Alert> = alerts.values().filter(|a| filter.matches(a)).cloned().collect();
        matched.sort_by(|a, b| b.starts_at.cmp(&a.starts_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }
}

/// 基于 sea-orm 的告警存储
pub struct DbAlertStore {
    db: Arc<DatabaseConnection>,
}

impl DbAlertStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

fn to_active_model(alert: &Alert) -> Result<alerts::ActiveModel> {
    Ok(alerts::ActiveModel {
        id: Set(alert.id.clone()),
        rule_id: Set(alert.rule_id.clone()),
        rule_name: Set(alert.rule_name.clone()),
        fingerprint: Set(alert.fingerprint.clone()),
        status: Set(alert.status.to_string()),
        severity: Set(alert.severity.to_string()),
        value: Set(alert.value),
        labels: Set(serde_json::to_value(&alert.labels)?),
        annotations: Set(serde_json::to_value(&alert.annotations)?),
        starts_at: Set(alert.starts_at),
        ends_at: Set(alert.ends_at),
        updated_at: Set(alert.updated_at),
        suppressed: Set(alert.suppressed),
        correlation_key: Set(alert.correlation_key.clone()),
    })
}

fn from_model(model: alerts::Model) -> Result<Alert> {
    Ok(Alert {
        status: model
            .status
            .parse::<AlertStatus>()
            .map_err(|e| FluxError::Internal(format!("corrupt alert status: {e}")))?,
        severity: model
            .severity
            .parse::<Severity>()
            .map_err(|e| FluxError::Internal(format!("corrupt alert severity: {e}")))?,
        labels: serde_json::from_value(model.labels)?,
        annotations: serde_json::from_value(model.annotations)?,
        id: model.id,
        rule_id: model.rule_id,
        rule_name: model.rule_name,
        fingerprint: model.fingerprint,
        value: model.value,
        starts_at: model.starts_at,
        ends_at: model.ends_at,
        updated_at: model.updated_at,
        suppressed: model.suppressed,
        correlation_key: model.correlation_key,
    })
}

#[async_trait]
impl AlertStore for DbAlertStore {
    async fn save(&self, alert: &Alert) -> Result<()> {
        alerts::Entity::insert(to_active_model(alert)?)
            .on_conflict(
                OnConflict::column(alerts::Column::Id)
                    .update_columns([
                        alerts::Column::Status,
                        alerts::Column::Value,
                        alerts::Column::Annotations,
                        alerts::Column::EndsAt,
                        alerts::Column::UpdatedAt,
                        alerts::Column::Suppressed,
                        alerts::Column::CorrelationKey,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await?;

        debug!(alert_id = %alert.id, status = %alert.status, "Alert saved to database");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Alert>> {
        alerts::Entity::find_by_id(id.to_string())
            .one(&*self.db)
            .await?
            .map(from_model)
            .transpose()
    }

    async fn list(&self, filter: &AlertFilter) -> Result<Vec<Alert>> {
        let mut query = alerts::Entity::find();
        if let Some(status) = filter.status {
            query = query.filter(alerts::Column::Status.eq(status.to_string()));
        }
        if let Some(rule_id) = &filter.rule_id {
            query = query.filter(alerts::Column::RuleId.eq(rule_id.clone()));
        }
        query = query
            .order_by_desc(alerts::Column::StartsAt)
            .order_by_asc(alerts::Column::Id);
        if let Some(limit) = filter.limit {
            query = query.limit(limit as u64);
        }

        query
            .all(&*self.db)
            .await?
            .into_iter()
            .map(from_model)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use flux_types::Labels;
    use sea_orm::Database;

    async fn exercise(store: &dyn AlertStore) {
        let now = Utc::now();
        let mut labels = Labels::new();
        labels.insert("service".to_string(), "api".to_string());

        let mut older = Alert::firing("r1", "high_cpu", Severity::Warning, 0.9, labels.clone(), now - Duration::minutes(5));
        let newer = Alert::firing("r2", "high_mem", Severity::Critical, 0.95, labels, now);
        store.save(&older).await.unwrap();
        store.save(&newer).await.unwrap();

        older.resolve(now);
        store.save(&older).await.unwrap();

        let all = store.list(&AlertFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, newer.id);

        let firing = store.list(&AlertFilter::firing()).await.unwrap();
        assert_eq!(firing.len(), 1);
        assert_eq!(firing[0].rule_name, "high_mem");

        let resolved = store.get(&older.id).await.unwrap().unwrap();
        assert_eq!(resolved.status, AlertStatus::Resolved);
        assert!(resolved.ends_at.is_some());
        assert_eq!(resolved.labels.get("service").map(String::as_str), Some("api"));

        let by_rule = store
            .list(&AlertFilter {
                rule_id: Some("r1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_rule.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_alert_store() {
        exercise(&MemoryAlertStore::new()).await;
    }

    #[tokio::test]
    async fn test_db_alert_store() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        flux_core::entity::create_tables(&db).await.unwrap();
        exercise(&DbAlertStore::new(Arc::new(db))).await;
    }
}
