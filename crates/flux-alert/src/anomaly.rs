//! 统计异常检测
//!
//! 每个指标一个模型，用最近 30 天的历史值计算均值和总体标准差。
//! 检测从不等待训练：模型缺失或过期时在后台重新训练，当前调用使用旧模型。

use chrono::{DateTime, Duration, Utc};
use dashmap::{DashMap, DashSet};
use flux_core::Result;
use flux_timeseries::QueryEngine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 置信度达到 1 所需的样本数
const FULL_CONFIDENCE_SAMPLES: f64 = 1000.0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    pub training_window_days: i64,
    pub retrain_after_hours: i64,

    /// 少于该样本数时使用不告警的简单模型
    pub min_samples: usize,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            training_window_days: 30,
            retrain_after_hours: 24,
            min_samples: 100,
        }
    }
}

/// 检测结果
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnomalyResult {
    pub is_anomaly: bool,
    pub score: f64,
    pub predicted_value: f64,
    pub confidence: f64,
}

impl AnomalyResult {
    fn normal(current: f64) -> Self {
        Self {
            is_anomaly: false,
            score: 0.0,
            predicted_value: current,
            confidence: 0.0,
        }
    }
}

/// 检测模型
#[derive(Debug, Clone, PartialEq)]
pub enum AnomalyModel {
    /// 样本不足，永不告警
    Simple { trained_at: DateTime<Utc> },
    Statistical {
        mean: f64,
        stddev: f64,
        samples: usize,
        trained_at: DateTime<Utc>,
    },
}

impl AnomalyModel {
    pub fn fit(values: &[f64], min_samples: usize, now: DateTime<Utc>) -> Self {
        if values.len() < min_samples || values.is_empty() {
            return Self::Simple { trained_at: now };
        }

        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

        Self::Statistical {
            mean,
            stddev: variance.sqrt(),
            samples: values.len(),
            trained_at: now,
        }
    }

    pub fn trained_at(&self) -> DateTime<Utc> {
        match self {
            Self::Simple { trained_at } | Self::Statistical { trained_at, .. } => *trained_at,
        }
    }

    pub fn score(&self, current: f64, sensitivity: f64) -> AnomalyResult {
        match self {
            Self::Simple { .. } => AnomalyResult::normal(current),
            Self::Statistical {
                mean,
                stddev,
                samples,
                ..
            } => {
                let score = if *stddev == 0.0 {
                    if current == *mean {
                        0.0
                    } else {
                        1.0
                    }
                } else {
                    ((current - mean).abs() / stddev / 3.0).min(1.0)
                };

                AnomalyResult {
                    is_anomaly: score > sensitivity,
                    score,
                    predicted_value: *mean,
                    confidence: (*samples as f64 / FULL_CONFIDENCE_SAMPLES).min(1.0),
                }
            }
        }
    }
}

struct DetectorInner {
    engine: QueryEngine,
    config: AnomalyConfig,
    models: DashMap<String, AnomalyModel>,
    training: DashSet<String>,
}

/// 异常检测器
#[derive(Clone)]
pub struct AnomalyDetector {
    inner: Arc<DetectorInner>,
}

impl AnomalyDetector {
    pub fn new(engine: QueryEngine, config: AnomalyConfig) -> Self {
        Self {
            inner: Arc::new(DetectorInner {
                engine,
                config,
                models: DashMap::new(),
                training: DashSet::new(),
            }),
        }
    }

    /// 检测当前值是否异常
    pub async fn detect_anomaly(&self, metric: &str, current: f64, sensitivity: f64) -> AnomalyResult {
        let now = Utc::now();
        let model = self.inner.models.get(metric).map(|m| m.clone());

        let stale = match &model {
            None => true,
            Some(m) => now - m.trained_at() > Duration::hours(self.inner.config.retrain_after_hours),
        };
        if stale {
            self.spawn_training(metric);
        }

        match model {
            Some(m) => m.score(current, sensitivity),
            None => AnomalyResult::normal(current),
        }
    }

    /// 立即训练并替换模型
    pub async fn train(&self, metric: &str) -> Result<AnomalyModel> {
        let now = Utc::now();
        let start = now - Duration::days(self.inner.config.training_window_days);
        let history = self.inner.engine.history(metric, start, now).await?;

        let model = AnomalyModel::fit(&history, self.inner.config.min_samples, now);
        flux_metrics::record_anomaly_training();
        match &model {
            AnomalyModel::Simple { .. } => debug!(
                metric = %metric,
                samples = history.len(),
                "Not enough history, using simple model"
            ),
            AnomalyModel::Statistical { mean, stddev, samples, .. } => info!(
                metric = %metric,
                mean,
                stddev,
                samples,
                "Anomaly model trained"
            ),
        }

        self.inner.models.insert(metric.to_string(), model.clone());
        Ok(model)
    }

    pub fn model(&self, metric: &str) -> Option<AnomalyModel> {
        self.inner.models.get(metric).map(|m| m.clone())
    }

    /// 后台训练，同一指标同时最多一个
    fn spawn_training(&self, metric: &str) {
        if !self.inner.training.insert(metric.to_string()) {
            return;
        }

        let detector = self.clone();
        let metric = metric.to_string();
        tokio::spawn(async move {
            let _training = TrainingGuard {
                detector: detector.clone(),
                metric: metric.clone(),
            };
            if let Err(e) = detector.train(&metric).await {
                warn!(metric = %metric, error = %e, "Anomaly model training failed");
            }
        });
    }
}

/// 训练结束（含 panic）时清除进行中标记
struct TrainingGuard {
    detector: AnomalyDetector,
    metric: String,
}

impl Drop for TrainingGuard {
    fn drop(&mut self) {
        self.detector.inner.training.remove(&self.metric);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flux_timeseries::{MemoryStore, Rollup, TimeSeriesStore};
    use flux_types::{Labels, MetricDefinition, MetricSample, SamplePoint};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// 第一次读取降采样数据时 panic
    struct PanicOnceStore {
        inner: MemoryStore,
        panicked: AtomicBool,
    }

    #[async_trait]
    impl TimeSeriesStore for PanicOnceStore {
        async fn write(&self, sample: &MetricSample) -> Result<()> {
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
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("storage backend crashed");
            }
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

    fn alternating(n: usize) -> Vec<f64> {
        (0..n).map(|i| if i % 2 == 0 { 9.0 } else { 11.0 }).collect()
    }

    #[test]
    fn test_statistical_scoring() {
        let model = AnomalyModel::fit(&alternating(200), 100, Utc::now());

        let spike = model.score(13.0, 0.8);
        assert!(spike.is_anomaly);
        assert_eq!(spike.score, 1.0);
        assert_eq!(spike.predicted_value, 10.0);
        assert!((spike.confidence - 0.2).abs() < 1e-9);

        let normal = model.score(11.0, 0.8);
        assert!(!normal.is_anomaly);
        assert!((normal.score - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_stddev() {
        let model = AnomalyModel::fit(&vec![5.0; 150], 100, Utc::now());
        assert_eq!(model.score(5.0, 0.5).score, 0.0);
        assert_eq!(model.score(5.1, 0.5).score, 1.0);
        assert!(model.score(5.1, 0.5).is_anomaly);
    }

    #[test]
    fn test_confidence_caps_at_one() {
        let model = AnomalyModel::fit(&alternating(4000), 100, Utc::now());
        assert_eq!(model.score(10.0, 0.5).confidence, 1.0);
    }

    async fn detector_with_samples(metric: &str, values: &[f64]) -> AnomalyDetector {
        let store = Arc::new(MemoryStore::new());
        let base = Utc::now() - Duration::hours(1);
        for (i, v) in values.iter().enumerate() {
            store
                .write(&MetricSample::new(metric, *v).with_timestamp(base + Duration::seconds(i as i64)))
                .await
                .unwrap();
        }
        AnomalyDetector::new(QueryEngine::new(store), AnomalyConfig::default())
    }

    #[tokio::test]
    async fn test_fallback_under_min_samples() {
        let detector = detector_with_samples("latency", &alternating(50)).await;

        let model = detector.train("latency").await.unwrap();
        assert!(matches!(model, AnomalyModel::Simple { .. }));

        let result = detector.detect_anomaly("latency", 1000.0, 0.1).await;
        assert!(!result.is_anomaly);
        assert_eq!(result.score, 0.0);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.predicted_value, 1000.0);
    }

    #[tokio::test]
    async fn test_detect_trains_in_background() {
        let detector = detector_with_samples("latency", &alternating(200)).await;

        // 首次检测没有模型，不等待训练
        let first = detector.detect_anomaly("latency", 100.0, 0.5).await;
        assert!(!first.is_anomaly);

        for _ in 0..200 {
            if detector.model("latency").is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(matches!(detector.model("latency"), Some(AnomalyModel::Statistical { .. })));

        let second = detector.detect_anomaly("latency", 100.0, 0.5).await;
        assert!(second.is_anomaly);
        assert_eq!(second.predicted_value, 10.0);
    }

    #[tokio::test]
    async fn test_training_retried_after_panic() {
        let store = Arc::new(PanicOnceStore {
            inner: MemoryStore::new(),
            panicked: AtomicBool::new(false),
        });
        let base = Utc::now() - Duration::hours(1);
        for (i, v) in alternating(200).iter().enumerate() {
            store
                .write(&MetricSample::new("latency", *v).with_timestamp(base + Duration::seconds(i as i64)))
                .await
                .unwrap();
        }
        let detector = AnomalyDetector::new(QueryEngine::new(store), AnomalyConfig::default());

        detector.detect_anomaly("latency", 100.0, 0.5).await;
        for _ in 0..200 {
            if !detector.inner.training.contains("latency") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(!detector.inner.training.contains("latency"));
        assert!(detector.model("latency").is_none());

        detector.detect_anomaly("latency", 100.0, 0.5).await;
        for _ in 0..200 {
            if detector.model("latency").is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(matches!(detector.model("latency"), Some(AnomalyModel::Statistical { .. })));
    }
}
