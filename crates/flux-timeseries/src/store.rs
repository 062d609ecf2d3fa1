use crate::model::{
    bucket_start, from_millis, Accumulator, AggregatedPoint, AggregatedSeries, AggregationType,
    Rollup, WriteSummary,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use flux_core::{FluxError, Result};
use flux_types::{
    is_valid_metric_name, labels_key, matches_filter, Labels, MetricDefinition, MetricSample,
    RetentionPolicy, SamplePoint,
};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// 时序数据存储 trait
///
/// 写入以 `(metric, timestamp_ms, labels)` 为键做幂等 upsert，后写覆盖先写。
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// 写入单个样本
    async fn write(&self, sample: &MetricSample) -> Result<()>;

    /// 批量写入，校验失败的样本计入 `rejected`，不影响其他样本
    async fn write_batch(&self, samples: &[MetricSample]) -> Result<WriteSummary> {
        let mut summary = WriteSummary::default();
        for sample in samples {
            match self.write(sample).await {
                Ok(()) => summary.accepted += 1,
                Err(FluxError::Validation { message, .. }) => {
                    warn!(metric = %sample.metric, error = %message, "Sample rejected by store");
                    summary.rejected += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(summary)
    }

    /// 查询原始样本，按时间排序（同一时间按标签集合排序），区间为闭区间
    async fn query(
        &self,
        metric: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &Labels,
    ) -> Result<Vec<SamplePoint>>;

    /// 查询降采样数据，按桶时间排序
    async fn query_rollups(
        &self,
        metric: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &Labels,
    ) -> Result<Vec<Rollup>>;

    /// 按标签分组、按 `step` 对齐分桶的聚合查询
    ///
    /// 已降采样的时间段读取小时级数据参与聚合。
    async fn aggregate_query(
        &self,
        metric: &str,
        aggregation: AggregationType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
        filter: &Labels,
    ) -> Result<Vec<AggregatedSeries>> {
        let step_ms = step.num_milliseconds();
        if step_ms <= 0 {
            return Err(FluxError::Query("step must be positive".to_string()));
        }

        let raw = self.query(metric, start, end, filter).await?;
        let rollups = self.query_rollups(metric, start, end, filter).await?;
        Ok(aggregate_points(metric, aggregation, step_ms, &raw, &rollups))
    }

    /// 获取指标定义
    async fn metric(&self, name: &str) -> Result<Option<MetricDefinition>>;

    /// 列出所有指标定义
    async fn metrics(&self) -> Result<Vec<MetricDefinition>>;

    /// 写入（覆盖）降采样数据
    async fn write_rollups(&self, rollups: &[Rollup]) -> Result<usize>;

    /// 删除早于 `cutoff` 的原始样本
    async fn delete_before(&self, metric: &str, cutoff: DateTime<Utc>) -> Result<usize>;

    /// 删除早于 `cutoff` 的降采样数据
    async fn delete_rollups_before(&self, metric: &str, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// 存储层最后一道校验
pub(crate) fn check_sample(sample: &MetricSample) -> Result<()> {
    if !is_valid_metric_name(&sample.metric) {
        return Err(FluxError::invalid_field(
            "name",
            format!("invalid metric name '{}'", sample.metric),
        ));
    }
    if !sample.value.is_finite() {
        return Err(FluxError::invalid_field(
            "value",
            format!("value for '{}' must be finite", sample.metric),
        ));
    }
    Ok(())
}

pub(crate) fn aggregate_points(
    metric: &str,
    aggregation: AggregationType,
    step_ms: i64,
    raw: &[SamplePoint],
    rollups: &[Rollup],
) -> Vec<AggregatedSeries> {
    let mut groups: BTreeMap<String, (Labels, BTreeMap<i64, Accumulator>)> = BTreeMap::new();

    for rollup in rollups {
        let (_, buckets) = groups
            .entry(labels_key(&rollup.labels))
            .or_insert_with(|| (rollup.labels.clone(), BTreeMap::new()));
        buckets
            .entry(bucket_start(rollup.bucket.timestamp_millis(), step_ms))
            .or_default()
            .push_rollup(rollup);
    }

    for point in raw {
        let ts = point.timestamp.timestamp_millis();
        let (_, buckets) = groups
            .entry(labels_key(&point.labels))
            .or_insert_with(|| (point.labels.clone(), BTreeMap::new()));
        buckets
            .entry(bucket_start(ts, step_ms))
            .or_default()
            .push(ts, point.value);
    }

    groups
        .into_values()
        .map(|(labels, buckets)| AggregatedSeries {
            metric: metric.to_string(),
            labels,
            points: buckets
                .into_iter()
                .filter_map(|(bucket, acc)| {
                    acc.finish(aggregation).map(|value| AggregatedPoint {
                        timestamp: from_millis(bucket),
                        value,
                    })
                })
                .collect(),
        })
        .filter(|series| !series.points.is_empty())
        .collect()
}

struct SeriesData {
    labels: Labels,
    points: BTreeMap<i64, f64>,
}

struct RollupSeries {
    buckets: BTreeMap<i64, Rollup>,
}

struct MetricData {
    definition: MetricDefinition,
    series: HashMap<String, SeriesData>,
    rollups: HashMap<String, RollupSeries>,
}

impl MetricData {
    fn new(definition: MetricDefinition) -> Self {
        Self {
            definition,
            series: HashMap::new(),
            rollups: HashMap::new(),
        }
    }
}

/// 内存存储
///
/// 每个指标一个分片条目，序列内部使用 `BTreeMap<i64, f64>` 按时间排序。
pub struct MemoryStore {
    metrics: DashMap<String, MetricData>,
    retention: RetentionPolicy,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            metrics: DashMap::new(),
            retention: RetentionPolicy::default(),
        }
    }

    /// 新指标使用的默认保留策略
    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    fn definition_for(&self, sample: &MetricSample) -> MetricDefinition {
        let mut definition = MetricDefinition::new(sample.metric.clone(), sample.metric_type);
        definition.unit = sample.unit.clone();
        definition.retention = self.retention;
        definition
    }

    /// 原始样本总数
    pub fn sample_count(&self) -> usize {
        self.metrics
            .iter()
            .map(|entry| entry.series.values().map(|s| s.points.len()).sum::<usize>())
            .sum()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TimeSeriesStore for MemoryStore {
    async fn write(&self, sample: &MetricSample) -> Result<()> {
        check_sample(sample)?;

        let key = labels_key(&sample.labels);
        let mut entry = self
            .metrics
            .entry(sample.metric.clone())
            .or_insert_with(|| {
                debug!(metric = %sample.metric, "Registering new metric");
                MetricData::new(self.definition_for(sample))
            });

        entry
            .series
            .entry(key)
            .or_insert_with(|| SeriesData {
                labels: sample.labels.clone(),
                points: BTreeMap::new(),
            })
            .points
            .insert(sample.timestamp.timestamp_millis(), sample.value);

        Ok(())
    }

    async fn query(
        &self,
        metric: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &Labels,
    ) -> Result<Vec<SamplePoint>> {
        let (start_ms, end_ms) = (start.timestamp_millis(), end.timestamp_millis());
        if start_ms > end_ms {
            return Ok(Vec::new());
        }
        let Some(data) = self.metrics.get(metric) else {
            return Ok(Vec::new());
        };

        let mut rows: Vec<(i64, &str, f64, &Labels)> = Vec::new();
        for (key, series) in data.series.iter() {
            if !matches_filter(&series.labels, filter) {
                continue;
            }
            for (ts, value) in series.points.range(start_ms..=end_ms) {
                rows.push((*ts, key.as_str(), *value, &series.labels));
            }
        }
        rows.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));

        Ok(rows
            .into_iter()
            .map(|(ts, _, value, labels)| SamplePoint {
                timestamp: from_millis(ts),
                value,
                labels: labels.clone(),
            })
            .collect())
    }

    async fn query_rollups(
        &self,
        metric: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &Labels,
    ) -> Result<Vec<Rollup>> {
        let (start_ms, end_ms) = (start.timestamp_millis(), end.timestamp_millis());
        if start_ms > end_ms {
            return Ok(Vec::new());
        }
        let Some(data) = self.metrics.get(metric) else {
            return Ok(Vec::new());
        };

        let mut rollups: Vec<Rollup> = data
            .rollups
            .values()
            .flat_map(|series| series.buckets.range(start_ms..=end_ms).map(|(_, r)| r))
            .filter(|r| matches_filter(&r.labels, filter))
            .cloned()
            .collect();
        rollups.sort_by(|a, b| {
            a.bucket
                .cmp(&b.bucket)
                .then_with(|| labels_key(&a.labels).cmp(&labels_key(&b.labels)))
        });
        Ok(rollups)
    }

    async fn metric(&self, name: &str) -> Result<Option<MetricDefinition>> {
        Ok(self.metrics.get(name).map(|data| data.definition.clone()))
    }

    async fn metrics(&self) -> Result<Vec<MetricDefinition>> {
        let mut definitions: Vec<MetricDefinition> = self
            .metrics
            .iter()
            .map(|entry| entry.definition.clone())
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(definitions)
    }

    async fn write_rollups(&self, rollups: &[Rollup]) -> Result<usize> {
        for rollup in rollups {
            let mut entry = self.metrics.entry(rollup.metric.clone()).or_insert_with(|| {
                let mut definition = MetricDefinition::new(rollup.metric.clone(), Default::default());
                definition.retention = self.retention;
                MetricData::new(definition)
            });
            entry
                .rollups
                .entry(labels_key(&rollup.labels))
                .or_insert_with(|| RollupSeries {
                    buckets: BTreeMap::new(),
                })
                .buckets
                .insert(rollup.bucket.timestamp_millis(), rollup.clone());
        }
        Ok(rollups.len())
    }

    async fn delete_before(&self, metric: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        let Some(mut data) = self.metrics.get_mut(metric) else {
            return Ok(0);
        };
        let cutoff_ms = cutoff.timestamp_millis();

        let mut removed = 0;
        for series in data.series.values_mut() {
            let kept = series.points.split_off(&cutoff_ms);
            removed += series.points.len();
            series.points = kept;
        }
        data.series.retain(|_, series| !series.points.is_empty());
        Ok(removed)
    }

    async fn delete_rollups_before(&self, metric: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        let Some(mut data) = self.metrics.get_mut(metric) else {
            return Ok(0);
        };
        let cutoff_ms = cutoff.timestamp_millis();

        let mut removed = 0;
        for series in data.rollups.values_mut() {
            let kept = series.buckets.split_off(&cutoff_ms);
            removed += series.buckets.len();
            series.buckets = kept;
        }
        data.rollups.retain(|_, series| !series.buckets.is_empty());
        Ok(removed)
    }
}
