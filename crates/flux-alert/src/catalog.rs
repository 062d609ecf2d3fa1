//! 告警规则目录：校验与持久化

use async_trait::async_trait;
use chrono::Utc;
use flux_core::entity::alert_rules;
use flux_core::{FluxError, Result};
use flux_timeseries::Selector;
use flux_types::{is_valid_label_name, AlertRule, Condition, Labels, Severity, ThresholdOperator};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// 创建或更新规则的请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    pub query: String,
    pub condition: Condition,
    #[serde(default = "default_severity")]
    pub severity: Severity,

    /// 持续时间（秒）
    #[serde(default)]
    pub duration: i64,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub correlation_group: Option<String>,
}

fn default_severity() -> Severity {
    Severity::Warning
}

fn default_enabled() -> bool {
    true
}

impl RuleSpec {
    pub fn new(name: impl Into<String>, query: impl Into<String>, condition: Condition) -> Self {
        Self {
            name: name.into(),
            query: query.into(),
            condition,
            severity: default_severity(),
            duration: 0,
            enabled: true,
            labels: Labels::new(),
            annotations: BTreeMap::new(),
            channels: Vec::new(),
            correlation_group: None,
        }
    }

    /// 校验规则定义
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(FluxError::invalid_field("name", "rule name must not be empty"));
        }

        Selector::parse(&self.query).map_err(|e| FluxError::invalid_field("query", e.to_string()))?;

        match self.condition {
            Condition::Threshold { operator, threshold } => {
                if operator == ThresholdOperator::Unknown {
                    return Err(FluxError::invalid_field(
                        "condition",
                        "operator must be one of gt, gte, lt, lte, eq, ne",
                    ));
                }
                if !threshold.is_finite() {
                    return Err(FluxError::invalid_field("condition", "threshold must be a finite number"));
                }
            }
            Condition::Anomaly { sensitivity } => {
                if !(0.0..=1.0).contains(&sensitivity) {
                    return Err(FluxError::invalid_field(
                        "condition",
                        "sensitivity must be between 0 and 1",
                    ));
                }
            }
        }

        if self.duration < 0 {
            return Err(FluxError::invalid_field("duration", "duration must not be negative"));
        }

        if let Some(bad) = self.labels.keys().find(|k| !is_valid_label_name(k)) {
            return Err(FluxError::invalid_field("labels", format!("invalid label name '{bad}'")));
        }
        Ok(())
    }

    fn apply_to(self, rule: &mut AlertRule) {
        rule.name = self.name.trim().to_string();
        rule.query = self.query;
        rule.condition = self.condition;
        rule.severity = self.severity;
        rule.duration_secs = self.duration.max(0) as u64;
        rule.enabled = self.enabled;
        rule.labels = self.labels;
        rule.annotations = self.annotations;
        rule.channels = self.channels;
        rule.correlation_group = self.correlation_group;
    }
}

/// 规则持久化
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// 新建规则，名称重复时返回 `Conflict`
    async fn create(&self, rule: &AlertRule) -> Result<()>;

    /// 覆盖已有规则
    async fn update(&self, rule: &AlertRule) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<AlertRule>>;

    async fn find_by_name(&self, name: &str) -> Result<Option<AlertRule>>;

    /// 按创建时间排序
    async fn list(&self) -> Result<Vec<AlertRule>>;

    async fn delete(&self, id: &str) -> Result<bool>;
}

fn name_conflict(name: &str) -> FluxError {
    FluxError::Conflict(format!("rule named '{name}' already exists"))
}

/// 内存规则存储
#[derive(Default)]
pub struct MemoryRuleStore {
    rules: RwLock<HashMap<String, AlertRule>>,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn create(&self, rule: &AlertRule) -> Result<()> {
        let mut rules = self.rules.write().await;
        if rules.values().any(|r| r.name == rule.name) {
            return Err(name_conflict(&rule.name));
        }
        rules.insert(rule.id.clone(), rule.clone());
        Ok(())
    }

    async fn update(&self, rule: &AlertRule) -> Result<()> {
        let mut rules = self.rules.write().await;
        if !rules.contains_key(&rule.id) {
            return Err(FluxError::NotFound(format!("rule {}", rule.id)));
        }
        if rules.values().any(|r| r.name == rule.name && r.id != rule.id) {
            return Err(name_conflict(&rule.name));
        }
        rules.insert(rule.id.clone(), rule.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<AlertRule>> {
        Ok(self.rules.read().await.get(id).cloned())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<AlertRule>> {
        Ok(self.rules.read().await.values().find(|r| r.name == name).cloned())
    }

    async fn list(&self) -> Result<Vec<AlertRule>> {
        let mut rules: Vec<AlertRule> = self.rules.read().await.values().cloned().collect();
        rules.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        Ok(rules)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.rules.write().await.remove(id).is_some())
    }
}

/// 基于 sea-orm 的规则存储
pub struct DbRuleStore {
    db: Arc<DatabaseConnection>,
}

impl DbRuleStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

fn to_active_model(rule: &AlertRule) -> Result<alert_rules::ActiveModel> {
    Ok(alert_rules::ActiveModel {
        id: Set(rule.id.clone()),
        name: Set(rule.name.clone()),
        query: Set(rule.query.clone()),
        condition: Set(serde_json::to_value(&rule.condition)?),
        severity: Set(rule.severity.to_string()),
        duration_secs: Set(rule.duration_secs as i64),
        enabled: Set(rule.enabled),
        labels: Set(serde_json::to_value(&rule.labels)?),
        annotations: Set(serde_json::to_value(&rule.annotations)?),
        channels: Set(serde_json::to_value(&rule.channels)?),
        correlation_group: Set(rule.correlation_group.clone()),
        created_at: Set(rule.created_at),
        updated_at: Set(rule.updated_at),
    })
}

fn from_model(model: alert_rules::Model) -> Result<AlertRule> {
    Ok(AlertRule {
        severity: model
            .severity
            .parse::<Severity>()
            .map_err(|e| FluxError::Internal(format!("corrupt rule severity: {e}")))?,
        condition: serde_json::from_value(model.condition)?,
        labels: serde_json::from_value(model.labels)?,
        annotations: serde_json::from_value(model.annotations)?,
        channels: serde_json::from_value(model.channels)?,
        id: model.id,
        name: model.name,
        query: model.query,
        duration_secs: model.duration_secs.max(0) as u64,
        enabled: model.enabled,
        correlation_group: model.correlation_group,
        created_at: model.created_at,
        updated_at: model.updated_at,
    })
}

#[async_trait]
impl RuleStore for DbRuleStore {
    async fn create(&self, rule: &AlertRule) -> Result<()> {
        if self.find_by_name(&rule.name).await?.is_some() {
            return Err(name_conflict(&rule.name));
        }
        alert_rules::Entity::insert(to_active_model(rule)?)
            .exec_without_returning(&*self.db)
            .await?;
        Ok(())
    }

    async fn update(&self, rule: &AlertRule) -> Result<()> {
        if let Some(existing) = self.find_by_name(&rule.name).await? {
            if existing.id != rule.id {
                return Err(name_conflict(&rule.name));
            }
        }
        let result = alert_rules::Entity::update_many()
            .set(to_active_model(rule)?)
            .filter(alert_rules::Column::Id.eq(rule.id.clone()))
            .exec(&*self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(FluxError::NotFound(format!("rule {}", rule.id)));
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<AlertRule>> {
        alert_rules::Entity::find_by_id(id.to_string())
            .one(&*self.db)
            .await?
            .map(from_model)
            .transpose()
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<AlertRule>> {
        alert_rules::Entity::find()
            .filter(alert_rules::Column::Name.eq(name))
            .one(&*self.db)
            .await?
            .map(from_model)
            .transpose()
    }

    async fn list(&self) -> Result<Vec<AlertRule>> {
        alert_rules::Entity::find()
            .order_by_asc(alert_rules::Column::CreatedAt)
            .order_by_asc(alert_rules::Column::Name)
            .all(&*self.db)
            .await?
            .into_iter()
            .map(from_model)
            .collect()
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let result = alert_rules::Entity::delete_by_id(id.to_string())
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }
}

/// 规则目录
#[derive(Clone)]
pub struct RuleCatalog {
    store: Arc<dyn RuleStore>,
}

impl RuleCatalog {
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        Self { store }
    }

    pub async fn create(&self, spec: RuleSpec) -> Result<AlertRule> {
        spec.validate()?;

        let mut rule = AlertRule::new(String::new(), String::new(), spec.condition.clone());
        spec.apply_to(&mut rule);
        self.store.create(&rule).await?;

        info!(rule_id = %rule.id, rule = %rule.name, "Alert rule created");
        Ok(rule)
    }

    pub async fn update(&self, id: &str, spec: RuleSpec) -> Result<AlertRule> {
        spec.validate()?;

        let mut rule = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| FluxError::NotFound(format!("rule {id}")))?;
        spec.apply_to(&mut rule);
        rule.updated_at = Utc::now();
        self.store.update(&rule).await?;

        info!(rule_id = %rule.id, rule = %rule.name, "Alert rule updated");
        Ok(rule)
    }

    pub async fn delete(&self, id: &str) -> Result<AlertRule> {
        let rule = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| FluxError::NotFound(format!("rule {id}")))?;
        if !self.store.delete(id).await? {
            return Err(FluxError::NotFound(format!("rule {id}")));
        }

        info!(rule_id = %rule.id, rule = %rule.name, "Alert rule deleted");
        Ok(rule)
    }

    pub async fn get(&self, id: &str) -> Result<AlertRule> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| FluxError::NotFound(format!("rule {id}")))
    }

    pub async fn list(&self) -> Result<Vec<AlertRule>> {
        self.store.list().await
    }

    /// 本轮评估使用的启用规则快照
    pub async fn enabled_rules(&self) -> Result<Vec<AlertRule>> {
        Ok(self.store.list().await?.into_iter().filter(|r| r.enabled).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::Database;

    fn threshold_spec(name: &str) -> RuleSpec {
        RuleSpec::new(name, "error_rate", Condition::threshold(ThresholdOperator::Gt, 0.05))
    }

    #[test]
    fn test_validation() {
        assert!(threshold_spec("ok").validate().is_ok());

        let err = threshold_spec("  ").validate().unwrap_err();
        assert_eq!(err.field(), Some("name"));

        let mut spec = threshold_spec("q");
        spec.query = "avg(error_rate".to_string();
        assert_eq!(spec.validate().unwrap_err().field(), Some("query"));

        let spec = RuleSpec::new("op", "m", Condition::threshold(ThresholdOperator::Unknown, 1.0));
        assert_eq!(spec.validate().unwrap_err().field(), Some("condition"));

        let spec = RuleSpec::new("nan", "m", Condition::threshold(ThresholdOperator::Gt, f64::NAN));
        assert_eq!(spec.validate().unwrap_err().field(), Some("condition"));

        let spec = RuleSpec::new("sens", "m", Condition::anomaly(1.5));
        assert_eq!(spec.validate().unwrap_err().field(), Some("condition"));

        let mut spec = threshold_spec("dur");
        spec.duration = -1;
        assert_eq!(spec.validate().unwrap_err().field(), Some("duration"));
    }

    #[test]
    fn test_spec_deserialize_defaults() {
        let spec: RuleSpec = serde_json::from_str(
            r#"{"name":"HighErrorRate","query":"error_rate{service=\"checkout\"}","condition":{"operator":"gt","threshold":0.05}}"#,
        )
        .unwrap();
        assert!(spec.enabled);
        assert_eq!(spec.severity, Severity::Warning);
        assert_eq!(spec.duration, 0);
    }

    async fn exercise(catalog: RuleCatalog) {
        let rule = catalog.create(threshold_spec("HighErrorRate")).await.unwrap();
        assert!(rule.enabled);

        let err = catalog.create(threshold_spec("HighErrorRate")).await.unwrap_err();
        assert_eq!(err.status_code(), 409);

        let mut disabled = threshold_spec("Quiet");
        disabled.enabled = false;
        let quiet = catalog.create(disabled).await.unwrap();
        assert_eq!(catalog.list().await.unwrap().len(), 2);
        assert_eq!(catalog.enabled_rules().await.unwrap().len(), 1);

        let mut spec = threshold_spec("HighErrorRate");
        spec.severity = Severity::Critical;
        spec.duration = 120;
        let updated = catalog.update(&rule.id, spec).await.unwrap();
        assert_eq!(updated.id, rule.id);
        assert_eq!(updated.created_at.timestamp(), rule.created_at.timestamp());
        assert_eq!(updated.duration_secs, 120);
        assert_eq!(catalog.get(&rule.id).await.unwrap().severity, Severity::Critical);

        let err = catalog.update(&quiet.id, threshold_spec("HighErrorRate")).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");

        catalog.delete(&rule.id).await.unwrap();
        assert_eq!(catalog.get(&rule.id).await.unwrap_err().status_code(), 404);
        assert_eq!(catalog.delete(&rule.id).await.unwrap_err().status_code(), 404);
    }

    #[tokio::test]
    async fn test_memory_catalog() {
        exercise(RuleCatalog::new(Arc::new(MemoryRuleStore::new()))).await;
    }

    #[tokio::test]
    async fn test_db_catalog() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        flux_core::entity::create_tables(&db).await.unwrap();
        exercise(RuleCatalog::new(Arc::new(DbRuleStore::new(Arc::new(db))))).await;
    }
}
