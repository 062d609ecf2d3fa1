use crate::model::{from_millis, Rollup, WriteSummary};
use crate::store::{check_sample, TimeSeriesStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flux_core::entity::{metric_definitions, rollups, samples};
use flux_core::{FluxError, Result};
use flux_types::{
    labels_key, matches_filter, Labels, MetricDefinition, MetricSample, MetricType,
    RetentionPolicy, SamplePoint,
};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, Database, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 单条 INSERT 语句最多包含的行数
const INSERT_CHUNK: usize = 100;

/// 基于 sea-orm 的持久化存储（SQLite / PostgreSQL）
pub struct DbStore {
    db: Arc<DatabaseConnection>,
    retention: RetentionPolicy,
}

impl DbStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            db,
            retention: RetentionPolicy::default(),
        }
    }

    /// 连接数据库并创建表
    pub async fn connect(database_url: &str) -> Result<Self> {
        let db = Database::connect(database_url).await?;
        flux_core::entity::create_tables(&db).await?;

        info!(database_url = %database_url, "Connected to time-series database");
        Ok(Self::new(Arc::new(db)))
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// 注册指标定义，已存在时保持不变
    async fn register(&self, first_samples: &[&MetricSample]) -> Result<()> {
        if first_samples.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let models = first_samples
            .iter()
            .map(|s| metric_definitions::ActiveModel {
                name: Set(s.metric.clone()),
                metric_type: Set(s.metric_type.as_str().to_string()),
                unit: Set(s.unit.clone()),
                raw_days: Set(self.retention.raw_days),
                downsampled_days: Set(self.retention.downsampled_days),
                created_at: Set(now),
            })
            .collect::<Vec<_>>();

        metric_definitions::Entity::insert_many(models)
            .on_conflict(
                OnConflict::column(metric_definitions::Column::Name)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await?;
        Ok(())
    }

    async fn upsert_samples(&self, batch: &[&MetricSample]) -> Result<()> {
        for chunk in batch.chunks(INSERT_CHUNK) {
            let models = chunk
                .iter()
                .map(|s| sample_model(s))
                .collect::<Result<Vec<_>>>()?;

            samples::Entity::insert_many(models)
                .on_conflict(
                    OnConflict::columns([
                        samples::Column::Metric,
                        samples::Column::Ts,
                        samples::Column::LabelsKey,
                    ])
                    .update_columns([samples::Column::Value, samples::Column::Labels])
                    .to_owned(),
                )
                .exec_without_returning(&*self.db)
                .await?;
        }
        Ok(())
    }
}

fn sample_model(sample: &MetricSample) -> Result<samples::ActiveModel> {
    Ok(samples::ActiveModel {
        metric: Set(sample.metric.clone()),
        ts: Set(sample.timestamp.timestamp_millis()),
        labels_key: Set(labels_key(&sample.labels)),
        labels: Set(serde_json::to_value(&sample.labels)?),
        value: Set(sample.value),
    })
}

fn definition_from_model(model: metric_definitions::Model) -> MetricDefinition {
    MetricDefinition {
        metric_type: model.metric_type.parse().unwrap_or(MetricType::Gauge),
        name: model.name,
        unit: model.unit,
        retention: RetentionPolicy {
            raw_days: model.raw_days,
            downsampled_days: model.downsampled_days,
        },
        created_at: model.created_at,
    }
}

fn rollup_from_model(model: rollups::Model) -> Result<Rollup> {
    Ok(Rollup {
        labels: serde_json::from_value(model.labels)?,
        metric: model.metric,
        bucket: from_millis(model.bucket),
        avg: model.avg,
        min: model.min,
        max: model.max,
        sum: model.sum,
        count: model.count.max(0) as u64,
    })
}

#[async_trait]
impl TimeSeriesStore for DbStore {
    async fn write(&self, sample: &MetricSample) -> Result<()> {
        check_sample(sample)?;
        self.register(&[sample]).await?;
        self.upsert_samples(&[sample]).await?;

        debug!(metric = %sample.metric, "Sample written to database");
        Ok(())
    }

    async fn write_batch(&self, batch: &[MetricSample]) -> Result<WriteSummary> {
        let mut summary = WriteSummary::default();

        // 同一批次内相同键只保留最后一条，避免 ON CONFLICT 在同一语句中重复命中
        let mut latest: HashMap<(String, i64, String), &MetricSample> = HashMap::new();
        let mut order: Vec<(String, i64, String)> = Vec::new();
        for sample in batch {
            if let Err(e) = check_sample(sample) {
                warn!(metric = %sample.metric, error = %e, "Sample rejected by store");
                summary.rejected += 1;
                continue;
            }
            summary.accepted += 1;
            let key = (
                sample.metric.clone(),
                sample.timestamp.timestamp_millis(),
                labels_key(&sample.labels),
            );
            if latest.insert(key.clone(), sample).is_none() {
                order.push(key);
            }
        }

        let valid: Vec<&MetricSample> = order.iter().filter_map(|k| latest.get(k).copied()).collect();

        let mut first_per_metric: BTreeMap<&str, &MetricSample> = BTreeMap::new();
        for sample in &valid {
            first_per_metric.entry(sample.metric.as_str()).or_insert(*sample);
        }
        let firsts: Vec<&MetricSample> = first_per_metric.into_values().collect();

        self.register(&firsts).await?;
        self.upsert_samples(&valid).await?;

        debug!(
            accepted = summary.accepted,
            rejected = summary.rejected,
            "Sample batch written to database"
        );
        Ok(summary)
    }

    async fn query(
        &self,
        metric: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &Labels,
    ) -> Result<Vec<SamplePoint>> {
        let models = samples::Entity::find()
            .filter(samples::Column::Metric.eq(metric))
            .filter(samples::Column::Ts.between(start.timestamp_millis(), end.timestamp_millis()))
            .order_by_asc(samples::Column::Ts)
            .order_by_asc(samples::Column::LabelsKey)
            .all(&*self.db)
            .await?;

        let mut points = Vec::with_capacity(models.len());
        for model in models {
            let labels: Labels = serde_json::from_value(model.labels)?;
            if !matches_filter(&labels, filter) {
                continue;
            }
            points.push(SamplePoint {
                timestamp: from_millis(model.ts),
                value: model.value,
                labels,
            });
        }

        debug!(metric = %metric, count = points.len(), "Queried samples from database");
        Ok(points)
    }

    async fn query_rollups(
        &self,
        metric: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &Labels,
    ) -> Result<Vec<Rollup>> {
        let models = rollups::Entity::find()
            .filter(rollups::Column::Metric.eq(metric))
            .filter(rollups::Column::Bucket.between(start.timestamp_millis(), end.timestamp_millis()))
            .order_by_asc(rollups::Column::Bucket)
            .order_by_asc(rollups::Column::LabelsKey)
            .all(&*self.db)
            .await?;

        let mut result = Vec::with_capacity(models.len());
        for model in models {
            let rollup = rollup_from_model(model)?;
            if matches_filter(&rollup.labels, filter) {
                result.push(rollup);
            }
        }
        Ok(result)
    }

    async fn metric(&self, name: &str) -> Result<Option<MetricDefinition>> {
        let model = metric_definitions::Entity::find_by_id(name.to_string())
            .one(&*self.db)
            .await?;
        Ok(model.map(definition_from_model))
    }

    async fn metrics(&self) -> Result<Vec<MetricDefinition>> {
        let models = metric_definitions::Entity::find()
            .order_by_asc(metric_definitions::Column::Name)
            .all(&*self.db)
            .await?;
        Ok(models.into_iter().map(definition_from_model).collect())
    }

    async fn write_rollups(&self, batch: &[Rollup]) -> Result<usize> {
        for chunk in batch.chunks(INSERT_CHUNK) {
            let models = chunk
                .iter()
                .map(|r| {
                    Ok(rollups::ActiveModel {
                        metric: Set(r.metric.clone()),
                        bucket: Set(r.bucket.timestamp_millis()),
                        labels_key: Set(labels_key(&r.labels)),
                        labels: Set(serde_json::to_value(&r.labels)?),
                        avg: Set(r.avg),
                        min: Set(r.min),
                        max: Set(r.max),
                        sum: Set(r.sum),
                        count: Set(r.count as i64),
                    })
                })
                .collect::<std::result::Result<Vec<_>, FluxError>>()?;

            rollups::Entity::insert_many(models)
                .on_conflict(
                    OnConflict::columns([
                        rollups::Column::Metric,
                        rollups::Column::Bucket,
                        rollups::Column::LabelsKey,
                    ])
                    .update_columns([
                        rollups::Column::Avg,
                        rollups::Column::Min,
                        rollups::Column::Max,
                        rollups::Column::Sum,
                        rollups::Column::Count,
                    ])
                    .to_owned(),
                )
                .exec_without_returning(&*self.db)
                .await?;
        }
        Ok(batch.len())
    }

    async fn delete_before(&self, metric: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        let result = samples::Entity::delete_many()
            .filter(samples::Column::Metric.eq(metric))
            .filter(samples::Column::Ts.lt(cutoff.timestamp_millis()))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected as usize)
    }

    async fn delete_rollups_before(&self, metric: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        let result = rollups::Entity::delete_many()
            .filter(rollups::Column::Metric.eq(metric))
            .filter(rollups::Column::Bucket.lt(cutoff.timestamp_millis()))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AggregationType;
    use chrono::{Duration, TimeZone};

    async fn create_test_store() -> DbStore {
        DbStore::connect("sqlite::memory:")
            .await
            .expect("Failed to create test database")
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_db_idempotent_write() {
        let store = create_test_store().await;
        let sample = MetricSample::new("error_rate", 0.02)
            .with_label("service", "checkout")
            .with_timestamp(ts(0));

        store.write(&sample).await.unwrap();
        store.write(&MetricSample { value: 0.08, ..sample.clone() }).await.unwrap();

        let points = store.query("error_rate", ts(-1), ts(1), &Labels::new()).await.unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 0.08);
        assert_eq!(points[0].labels.get("service").map(String::as_str), Some("checkout"));
    }

    #[tokio::test]
    async fn test_db_batch_dedup_and_definitions() {
        let store = create_test_store().await;
        let batch = vec![
            MetricSample::new("cpu", 1.0).with_timestamp(ts(0)).with_type(MetricType::Gauge),
            MetricSample::new("cpu", 2.0).with_timestamp(ts(0)),
            MetricSample::new("cpu", f64::INFINITY).with_timestamp(ts(1)),
            MetricSample::new("requests", 5.0)
                .with_timestamp(ts(0))
                .with_type(MetricType::Counter),
        ];

        let summary = store.write_batch(&batch).await.unwrap();
        assert_eq!(summary, WriteSummary { accepted: 3, rejected: 1 });

        let points = store.query("cpu", ts(0), ts(5), &Labels::new()).await.unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 2.0);

        let defs = store.metrics().await.unwrap();
        assert_eq!(defs.len(), 2);
        assert_eq!(
            store.metric("requests").await.unwrap().unwrap().metric_type,
            MetricType::Counter
        );
    }

    #[tokio::test]
    async fn test_db_aggregate_and_delete() {
        let store = create_test_store().await;
        for i in 0..6 {
            let sample = MetricSample::new("latency", i as f64)
                .with_label("service", if i % 2 == 0 { "api" } else { "web" })
                .with_timestamp(ts(i * 10));
            store.write(&sample).await.unwrap();
        }

        let series = store
            .aggregate_query("latency", AggregationType::Max, ts(0), ts(60), Duration::hours(1), &Labels::new())
            .await
            .unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].points[0].value, 4.0);
        assert_eq!(series[1].points[0].value, 5.0);

        assert_eq!(store.delete_before("latency", ts(30)).await.unwrap(), 3);
        assert_eq!(store.query("latency", ts(0), ts(60), &Labels::new()).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_db_rollup_upsert() {
        let store = create_test_store().await;
        let bucket = Utc.timestamp_opt(1_699_999_200, 0).unwrap();
        let mut rollup = Rollup::from_values("cpu", Labels::new(), bucket, &[1.0, 2.0]);
        store.write_rollups(&[rollup.clone()]).await.unwrap();

        rollup.merge(&Rollup::from_values("cpu", Labels::new(), bucket, &[6.0]));
        store.write_rollups(&[rollup]).await.unwrap();

        let stored = store.query_rollups("cpu", bucket, bucket, &Labels::new()).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].count, 3);
        assert_eq!(stored[0].max, 6.0);
        assert_eq!(stored[0].avg, 3.0);
    }
}
