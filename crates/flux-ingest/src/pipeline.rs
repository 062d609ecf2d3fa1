use crate::input::MetricInput;
use crate::validate::{Validator, DEFAULT_MAX_LABELS};
use chrono::Utc;
use flux_core::{FluxError, Result};
use flux_timeseries::TimeSeriesStore;
use flux_types::MetricSample;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 摄取配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// 缓冲达到该数量时立即刷新
    pub batch_size: usize,

    /// 定时刷新间隔（秒）
    pub flush_interval_secs: u64,

    /// 缓冲上限，超过后拒绝提交
    pub max_buffered: usize,

    pub max_labels: usize,
}

impl IngestConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            flush_interval_secs: 10,
            max_buffered: 100_000,
            max_labels: DEFAULT_MAX_LABELS,
        }
    }
}

/// 单条拒绝原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitError {
    pub index: usize,
    pub message: String,
}

/// 批量提交结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitSummary {
    pub accepted: usize,
    pub rejected: usize,
    pub errors: Vec<SubmitError>,
}

impl SubmitSummary {
    fn reject(&mut self, index: usize, error: &FluxError) {
        self.rejected += 1;
        self.errors.push(SubmitError {
            index,
            message: error.to_string(),
        });
    }
}

/// 摄取管道
///
/// 校验通过的样本进入内存缓冲，按批量大小或定时刷新到存储。
/// 写入失败的批次放回缓冲头部，下次刷新重试。
pub struct IngestPipeline {
    store: Arc<dyn TimeSeriesStore>,
    config: IngestConfig,
    validator: Validator,
    buffer: Mutex<VecDeque<MetricSample>>,
    flush_lock: Mutex<()>,
    batch_ready: Notify,
}

impl IngestPipeline {
    pub fn new(store: Arc<dyn TimeSeriesStore>, config: IngestConfig) -> Self {
        let validator = Validator::new(config.max_labels);
        Self {
            store,
            config,
            validator,
            buffer: Mutex::new(VecDeque::new()),
            flush_lock: Mutex::new(()),
            batch_ready: Notify::new(),
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub async fn buffered(&self) -> usize {
        self.buffer.lock().await.len()
    }

    /// 提交单个样本
    pub async fn submit(&self, sample: MetricSample) -> Result<()> {
        let result = self.enqueue(sample).await;
        if result.is_err() {
            flux_metrics::record_samples_rejected(1);
        }
        result
    }

    async fn enqueue(&self, sample: MetricSample) -> Result<()> {
        self.validator.validate(&sample)?;

        let len = {
            let mut buffer = self.buffer.lock().await;
            if buffer.len() >= self.config.max_buffered {
                return Err(FluxError::validation(format!(
                    "ingest buffer full ({} samples), retry later",
                    self.config.max_buffered
                )));
            }
            buffer.push_back(sample);
            buffer.len()
        };

        flux_metrics::record_samples_accepted(1);
        flux_metrics::set_ingest_buffered(len);
        if len >= self.config.batch_size {
            self.batch_ready.notify_one();
        }
        Ok(())
    }

    /// 批量提交，单条失败不影响其余样本
    pub async fn submit_batch(&self, samples: Vec<MetricSample>) -> SubmitSummary {
        let mut summary = SubmitSummary::default();
        for (index, sample) in samples.into_iter().enumerate() {
            match self.submit(sample).await {
                Ok(()) => summary.accepted += 1,
                Err(e) => summary.reject(index, &e),
            }
        }
        if summary.rejected > 0 {
            debug!(
                accepted = summary.accepted,
                rejected = summary.rejected,
                "Batch partially rejected"
            );
        }
        summary
    }

    /// 提交原始 JSON 条目
    pub async fn submit_entries(&self, entries: Vec<Value>) -> SubmitSummary {
        let now = Utc::now();
        let mut summary = SubmitSummary::default();
        for (index, entry) in entries.into_iter().enumerate() {
            match MetricInput::from_value(entry).and_then(|input| input.into_sample(now)) {
                Ok(sample) => match self.submit(sample).await {
                    Ok(()) => summary.accepted += 1,
                    Err(e) => summary.reject(index, &e),
                },
                Err(e) => {
                    flux_metrics::record_samples_rejected(1);
                    summary.reject(index, &e);
                }
            }
        }
        summary
    }

    /// 刷新全部缓冲，返回写入的样本数
    pub async fn flush(&self) -> Result<usize> {
        let _guard = self.flush_lock.lock().await;
        let mut written = 0;

        loop {
            let batch: Vec<MetricSample> = {
                let mut buffer = self.buffer.lock().await;
                let n = buffer.len().min(self.config.batch_size.max(1));
                buffer.drain(..n).collect()
            };
            if batch.is_empty() {
                break;
            }

            match self.store.write_batch(&batch).await {
                Ok(summary) => {
                    written += summary.accepted;
                    if summary.rejected > 0 {
                        warn!(rejected = summary.rejected, "Store rejected samples during flush");
                    }
                }
                Err(e) => {
                    let len = {
                        let mut buffer = self.buffer.lock().await;
                        for sample in batch.into_iter().rev() {
                            buffer.push_front(sample);
                        }
                        buffer.len()
                    };
                    flux_metrics::record_flush_failed();
                    flux_metrics::set_ingest_buffered(len);
                    if written > 0 {
                        flux_metrics::record_samples_flushed(written);
                    }
                    error!(error = %e, buffered = len, "Flush failed, batch requeued");
                    return Err(e);
                }
            }
        }

        flux_metrics::set_ingest_buffered(self.buffered().await);
        if written > 0 {
            flux_metrics::record_samples_flushed(written);
            debug!(written, "Flushed samples");
        }
        Ok(written)
    }

    /// 启动后台刷新任务
    pub fn start(self: &Arc<Self>) -> PipelineHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let pipeline = Arc::clone(self);
        let interval_duration = self.config.flush_interval();

        let join_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_duration);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            info!(
                interval_secs = interval_duration.as_secs(),
                batch_size = pipeline.config.batch_size,
                "Ingest flush loop started"
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let _ = pipeline.flush().await;
                    }
                    _ = pipeline.batch_ready.notified() => {
                        let _ = pipeline.flush().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            match pipeline.flush().await {
                Ok(written) => info!(written, "Ingest flush loop stopped after final flush"),
                Err(e) => warn!(error = %e, "Final flush failed, buffered samples dropped"),
            }
        });

        PipelineHandle {
            shutdown_tx,
            join_handle,
        }
    }
}

/// 刷新任务句柄
pub struct PipelineHandle {
    shutdown_tx: watch::Sender<bool>,
    join_handle: JoinHandle<()>,
}

impl PipelineHandle {
    /// 停止刷新循环并执行最后一次刷新
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.join_handle.await;
    }

    pub fn abort(self) {
        self.join_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration};
    use flux_timeseries::{MemoryStore, Rollup};
    use flux_types::{Labels, MetricDefinition, SamplePoint};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// 可切换为故障状态的存储
    struct FlakyStore {
        inner: MemoryStore,
        failing: AtomicBool,
    }

    impl FlakyStore {
        fn new(failing: bool) -> Self {
            Self {
                inner: MemoryStore::new(),
                failing: AtomicBool::new(failing),
            }
        }
    }

    #[async_trait]
    impl TimeSeriesStore for FlakyStore {
        async fn write(&self, sample: &MetricSample) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(FluxError::Internal("storage unavailable".to_string()));
            }
            self.inner.write(sample).await
        }

        async fn query(
            &self,
            metric: &str,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
            filter: &Labels,
        ) -> Result<Vec<SamplePoint>> {
            self.inner.query(metric, start, end, filter).await
        }

        async fn query_rollups(
            &self,
            metric: &str,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
            filter: &Labels,
        ) -> Result<Vec<Rollup>> {
            self.inner.query_rollups(metric, start, end, filter).await
        }

        async fn metric(&self, name: &str) -> Result<Option<MetricDefinition>> {
            self.inner.metric(name).await
        }

        async fn metrics(&self) -> Result<Vec<MetricDefinition>> {
            self.inner.metrics().await
        }

        async fn write_rollups(&self, rollups: &[Rollup]) -> Result<usize> {
            self.inner.write_rollups(rollups).await
        }

        async fn delete_before(&self, metric: &str, cutoff: DateTime<Utc>) -> Result<usize> {
            self.inner.delete_before(metric, cutoff).await
        }

        async fn delete_rollups_before(&self, metric: &str, cutoff: DateTime<Utc>) -> Result<usize> {
            self.inner.delete_rollups_before(metric, cutoff).await
        }
    }

    fn pipeline(store: Arc<dyn TimeSeriesStore>, config: IngestConfig) -> Arc<IngestPipeline> {
        Arc::new(IngestPipeline::new(store, config))
    }

    #[tokio::test]
    async fn test_partial_batch_rejection() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(store.clone(), IngestConfig::default());

        let summary = pipeline
            .submit_entries(vec![
                json!({"name": "cpu_usage", "value": 0.5, "labels": {"host": "a"}}),
                json!({"name": "123bad", "value": 1.0}),
                json!({"name": "cpu_usage", "value": 0.7, "labels": {"host": "b"}}),
            ])
            .await;

        assert_eq!(summary.accepted, 2);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.errors[0].index, 1);

        assert_eq!(pipeline.flush().await.unwrap(), 2);
        assert_eq!(store.sample_count(), 2);
        assert!(store.metric("123bad").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_requeue_on_store_failure() {
        let store = Arc::new(FlakyStore::new(true));
        let pipeline = pipeline(store.clone(), IngestConfig::default());

        let base = Utc::now();
        for i in 0..3 {
            pipeline
                .submit(MetricSample::new("queue_depth", i as f64).with_timestamp(base + ChronoDuration::seconds(i)))
                .await
                .unwrap();
        }

        assert!(pipeline.flush().await.is_err());
        assert_eq!(pipeline.buffered().await, 3);
        assert_eq!(store.inner.sample_count(), 0);

        store.failing.store(false, Ordering::SeqCst);
        assert_eq!(pipeline.flush().await.unwrap(), 3);
        assert_eq!(pipeline.buffered().await, 0);

        let points = store
            .query("queue_depth", base - ChronoDuration::seconds(1), base + ChronoDuration::seconds(5), &Labels::new())
            .await
            .unwrap();
        let values: Vec<f64> = points.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![0.0, 1.0, 2.0]);
    }

    #[tokio::test]
    async fn test_buffer_full_back_pressure() {
        let store = Arc::new(MemoryStore::new());
        let config = IngestConfig {
            max_buffered: 2,
            ..Default::default()
        };
        let pipeline = pipeline(store, config);

        pipeline.submit(MetricSample::new("a", 1.0)).await.unwrap();
        pipeline.submit(MetricSample::new("b", 1.0)).await.unwrap();
        let err = pipeline.submit(MetricSample::new("c", 1.0)).await.unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert!(err.to_string().contains("buffer full"));

        pipeline.flush().await.unwrap();
        assert!(pipeline.submit(MetricSample::new("c", 1.0)).await.is_ok());
    }

    #[tokio::test]
    async fn test_submit_batch_validates_each_sample() {
        let store = Arc::new(MemoryStore::new());
        let config = IngestConfig {
            max_labels: 1,
            ..Default::default()
        };
        let pipeline = pipeline(store, config);

        let summary = pipeline
            .submit_batch(vec![
                MetricSample::new("ok", 1.0),
                MetricSample::new("nan", f64::NAN),
                MetricSample::new("crowded", 1.0).with_label("a", "1").with_label("b", "2"),
            ])
            .await;
        assert_eq!(summary.accepted, 1);
        assert_eq!(summary.rejected, 2);
        let indexes: Vec<usize> = summary.errors.iter().map(|e| e.index).collect();
        assert_eq!(indexes, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_batch_size_triggers_flush() {
        let store = Arc::new(MemoryStore::new());
        let config = IngestConfig {
            batch_size: 2,
            flush_interval_secs: 3600,
            ..Default::default()
        };
        let pipeline = pipeline(store.clone(), config);
        let handle = pipeline.start();

        pipeline.submit(MetricSample::new("a", 1.0)).await.unwrap();
        pipeline.submit(MetricSample::new("b", 1.0)).await.unwrap();

        for _ in 0..100 {
            if store.sample_count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.sample_count(), 2);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_performs_final_flush() {
        let store = Arc::new(MemoryStore::new());
        let config = IngestConfig {
            flush_interval_secs: 3600,
            ..Default::default()
        };
        let pipeline = pipeline(store.clone(), config);
        let handle = pipeline.start();

        pipeline.submit(MetricSample::new("late_sample", 1.0)).await.unwrap();
        handle.shutdown().await;

        assert_eq!(store.sample_count(), 1);
        assert_eq!(pipeline.buffered().await, 0);
    }
}
