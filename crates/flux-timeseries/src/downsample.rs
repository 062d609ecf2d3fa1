use crate::model::{bucket_start, from_millis, Rollup, HOUR_MS};
use crate::store::TimeSeriesStore;
use chrono::{DateTime, Duration, Utc};
use flux_core::Result;
use flux_types::{labels_key, Labels};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 降采样策略
#[derive(Debug, Clone)]
pub struct DownsamplePolicy {
    /// 早于该时长的原始样本会被降采样
    pub threshold: Duration,

    /// 时间桶大小（毫秒）
    pub bucket_ms: i64,
}

impl DownsamplePolicy {
    pub fn hourly() -> Self {
        Self {
            threshold: Duration::hours(2),
            bucket_ms: HOUR_MS,
        }
    }

    pub fn with_threshold(mut self, threshold: Duration) -> Self {
        self.threshold = threshold;
        self
    }
}

impl Default for DownsamplePolicy {
    fn default() -> Self {
        Self::hourly()
    }
}

/// 降采样统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownsampleStats {
    pub metrics: usize,
    pub rollups_written: usize,
    pub samples_removed: usize,
    pub failed_metrics: usize,
}

/// 降采样管理器
///
/// 只处理完整的桶：截止时间为 `now - threshold` 向下对齐到桶边界，
/// 同一桶内晚到的数据与已有的降采样结果合并。
pub struct DownsampleManager {
    store: Arc<dyn TimeSeriesStore>,
    policy: DownsamplePolicy,
}

impl DownsampleManager {
    pub fn new(store: Arc<dyn TimeSeriesStore>, policy: DownsamplePolicy) -> Self {
        Self { store, policy }
    }

    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let edge = (now - self.policy.threshold).timestamp_millis();
        from_millis(bucket_start(edge, self.policy.bucket_ms))
    }

    /// 执行一轮降采样
    pub async fn run(&self, now: DateTime<Utc>) -> Result<DownsampleStats> {
        let cutoff = self.cutoff(now);
        let mut stats = DownsampleStats::default();

        for definition in self.store.metrics().await? {
            stats.metrics += 1;
            match self.downsample_metric(&definition.name, cutoff).await {
                Ok((written, removed)) => {
                    stats.rollups_written += written;
                    stats.samples_removed += removed;
                }
                Err(e) => {
                    stats.failed_metrics += 1;
                    warn!(metric = %definition.name, error = %e, "Downsampling failed");
                }
            }
        }

        flux_metrics::record_rollups_written(stats.rollups_written);
        info!(
            cutoff = %cutoff,
            rollups = stats.rollups_written,
            removed = stats.samples_removed,
            "Downsampling completed"
        );
        Ok(stats)
    }

    async fn downsample_metric(&self, metric: &str, cutoff: DateTime<Utc>) -> Result<(usize, usize)> {
        let empty = Labels::new();
        let end = cutoff - Duration::milliseconds(1);
        let raw = self
            .store
            .query(metric, DateTime::<Utc>::MIN_UTC, end, &empty)
            .await?;
        if raw.is_empty() {
            return Ok((0, 0));
        }

        let mut buckets: BTreeMap<(String, i64), (Labels, Vec<f64>)> = BTreeMap::new();
        for point in &raw {
            let bucket = bucket_start(point.timestamp.timestamp_millis(), self.policy.bucket_ms);
            buckets
                .entry((labels_key(&point.labels), bucket))
                .or_insert_with(|| (point.labels.clone(), Vec::new()))
                .1
                .push(point.value);
        }

        let first_bucket = buckets.keys().map(|(_, b)| *b).min().unwrap_or(0);
        let existing: HashMap<(String, i64), Rollup> = self
            .store
            .query_rollups(metric, from_millis(first_bucket), end, &empty)
            .await?
            .into_iter()
            .map(|r| ((labels_key(&r.labels), r.bucket.timestamp_millis()), r))
            .collect();

        let rollups: Vec<Rollup> = buckets
            .into_iter()
            .map(|(key, (labels, values))| {
                let fresh = Rollup::from_values(metric, labels, from_millis(key.1), &values);
                match existing.get(&key) {
                    Some(previous) => {
                        let mut merged = previous.clone();
                        merged.merge(&fresh);
                        merged
                    }
                    None => fresh,
                }
            })
            .collect();

        let written = self.store.write_rollups(&rollups).await?;
        let removed = self.store.delete_before(metric, cutoff).await?;

        debug!(metric = %metric, rollups = written, removed = removed, "Metric downsampled");
        Ok((written, removed))
    }
}
