use crate::anomaly::{AnomalyDetector, AnomalyResult};
use chrono::{DateTime, Utc};
use flux_core::Result;
use flux_timeseries::{QueryEngine, Selector};
use flux_types::{AlertRule, Condition, Labels, ThresholdOperator};
use serde::Serialize;
use tracing::{debug, error};

/// 单个序列的评估结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesEvaluation {
    pub labels: Labels,
    pub value: f64,
    pub should_alert: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anomaly: Option<AnomalyResult>,
}

/// 告警评估器
#[derive(Clone)]
pub struct AlertEvaluator {
    engine: QueryEngine,
    detector: AnomalyDetector,
}

impl AlertEvaluator {
    pub fn new(engine: QueryEngine, detector: AnomalyDetector) -> Self {
        Self { engine, detector }
    }

    pub fn detector(&self) -> &AnomalyDetector {
        &self.detector
    }

    /// 执行规则查询，逐序列判断是否满足告警条件
    pub async fn evaluate(&self, rule: &AlertRule, now: DateTime<Utc>) -> Result<Vec<SeriesEvaluation>> {
        let selector = Selector::parse(&rule.query)?;
        let series = self.engine.instant_selector(&selector, now).await?;

        if let Condition::Threshold {
            operator: ThresholdOperator::Unknown,
            ..
        } = rule.condition
        {
            error!(
                rule_id = %rule.id,
                rule = %rule.name,
                "Rule has an unknown threshold operator, it will never alert"
            );
        }

        let mut evaluations = Vec::with_capacity(series.len());
        for s in series {
            let (should_alert, anomaly) = match &rule.condition {
                Condition::Threshold { operator, threshold } => {
                    (operator.compare(s.value, *threshold).unwrap_or(false), None)
                }
                Condition::Anomaly { sensitivity } => {
                    let result = self
                        .detector
                        .detect_anomaly(&selector.metric, s.value, *sensitivity)
                        .await;
                    (result.is_anomaly, Some(result))
                }
            };

            evaluations.push(SeriesEvaluation {
                labels: s.labels,
                value: s.value,
                should_alert,
                anomaly,
            });
        }

        debug!(
            rule_id = %rule.id,
            series = evaluations.len(),
            alerting = evaluations.iter().filter(|e| e.should_alert).count(),
            "Rule evaluated"
        );
        Ok(evaluations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::AnomalyConfig;
    use chrono::Duration;
    use flux_timeseries::{MemoryStore, TimeSeriesStore};
    use flux_types::MetricSample;
    use std::sync::Arc;

    async fn evaluator(samples: &[(&str, f64)], now: DateTime<Utc>) -> AlertEvaluator {
        let store = Arc::new(MemoryStore::new());
        for (host, value) in samples {
            store
                .write(
                    &MetricSample::new("cpu_usage", *value)
                        .with_label("host", *host)
                        .with_timestamp(now - Duration::seconds(10)),
                )
                .await
                .unwrap();
        }
        let engine = QueryEngine::new(store);
        let detector = AnomalyDetector::new(engine.clone(), AnomalyConfig::default());
        AlertEvaluator::new(engine, detector)
    }

    #[tokio::test]
    async fn test_threshold_boundaries() {
        let now = Utc::now();
        let evaluator = evaluator(&[("a", 5.0), ("b", 5.0001), ("c", 4.9999)], now).await;
        let rule = AlertRule::new("cpu_high", "cpu_usage", Condition::threshold(ThresholdOperator::Gt, 5.0));

        let results = evaluator.evaluate(&rule, now).await.unwrap();
        let flags: Vec<(String, bool)> = results
            .iter()
            .map(|r| (r.labels["host"].clone(), r.should_alert))
            .collect();
        assert_eq!(
            flags,
            vec![
                ("a".to_string(), false),
                ("b".to_string(), true),
                ("c".to_string(), false)
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_operator_never_alerts() {
        let now = Utc::now();
        let evaluator = evaluator(&[("a", 100.0)], now).await;
        let rule = AlertRule::new(
            "broken",
            "cpu_usage",
            Condition::threshold(ThresholdOperator::Unknown, 0.0),
        );

        let results = evaluator.evaluate(&rule, now).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(!results[0].should_alert);
    }

    #[tokio::test]
    async fn test_anomaly_rule_without_history_is_quiet() {
        let now = Utc::now();
        let evaluator = evaluator(&[("a", 1e9)], now).await;
        let rule = AlertRule::new("cpu_weird", "cpu_usage", Condition::anomaly(0.5));

        let results = evaluator.evaluate(&rule, now).await.unwrap();
        assert!(!results[0].should_alert);
        assert_eq!(results[0].anomaly.map(|a| a.score), Some(0.0));
    }

    #[tokio::test]
    async fn test_bad_query_is_query_error() {
        let now = Utc::now();
        let evaluator = evaluator(&[], now).await;
        let rule = AlertRule::new("bad", "avg(cpu_usage", Condition::threshold(ThresholdOperator::Gt, 1.0));
        assert_eq!(evaluator.evaluate(&rule, now).await.unwrap_err().kind(), "query");
    }
}
