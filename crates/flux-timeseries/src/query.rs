use crate::model::{from_millis, Accumulator, AggregatedSeries, AggregationType, SeriesValue};
use crate::selector::Selector;
use crate::store::TimeSeriesStore;
use chrono::{DateTime, Duration, Utc};
use flux_core::{FluxError, Result};
use flux_types::{labels_key, Labels};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// 单次范围查询允许的最大桶数
pub const MAX_POINTS_PER_SERIES: i64 = 11_000;

/// 查询引擎
///
/// 评估器与外部查询 API 共用。
#[derive(Clone)]
pub struct QueryEngine {
    store: Arc<dyn TimeSeriesStore>,
}

impl QueryEngine {
    pub fn new(store: Arc<dyn TimeSeriesStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn TimeSeriesStore> {
        &self.store
    }

    /// 即时查询：每个序列在 `[at - range, at]` 内归约为一个值
    pub async fn instant(&self, expr: &str, at: DateTime<Utc>) -> Result<Vec<SeriesValue>> {
        let selector = Selector::parse(expr)?;
        self.instant_selector(&selector, at).await
    }

    pub async fn instant_selector(&self, selector: &Selector, at: DateTime<Utc>) -> Result<Vec<SeriesValue>> {
        let started = Instant::now();
        let start = at - selector.range_or_default();
        let aggregation = selector.aggregation.unwrap_or(AggregationType::Last);

        let raw = self
            .store
            .query(&selector.metric, start, at, &selector.matchers)
            .await?;
        let rollups = self
            .store
            .query_rollups(&selector.metric, start, at, &selector.matchers)
            .await?;

        let mut groups: BTreeMap<String, (Labels, Accumulator)> = BTreeMap::new();
        for rollup in &rollups {
            groups
                .entry(labels_key(&rollup.labels))
                .or_insert_with(|| (rollup.labels.clone(), Accumulator::default()))
                .1
                .push_rollup(rollup);
        }
        for point in &raw {
            groups
                .entry(labels_key(&point.labels))
                .or_insert_with(|| (point.labels.clone(), Accumulator::default()))
                .1
                .push(point.timestamp.timestamp_millis(), point.value);
        }

        let values: Vec<SeriesValue> = groups
            .into_values()
            .filter_map(|(labels, acc)| {
                let value = acc.finish(aggregation)?;
                let timestamp = match selector.aggregation {
                    None => acc.last_timestamp().map(from_millis).unwrap_or(at),
                    Some(_) => at,
                };
                Some(SeriesValue {
                    labels,
                    value,
                    timestamp,
                })
            })
            .collect();

        flux_metrics::record_query(started.elapsed().as_secs_f64());
        debug!(
            query = %selector,
            series = values.len(),
            "Instant query executed"
        );
        Ok(values)
    }

    /// 范围查询，未指定聚合时每个桶取最新值
    pub async fn range(
        &self,
        expr: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> Result<Vec<AggregatedSeries>> {
        let selector = Selector::parse(expr)?;
        if start > end {
            return Err(FluxError::Query("start must not be after end".to_string()));
        }
        let step_ms = step.num_milliseconds();
        if step_ms <= 0 {
            return Err(FluxError::Query("step must be positive".to_string()));
        }
        let buckets = (end - start).num_milliseconds() / step_ms;
        if buckets > MAX_POINTS_PER_SERIES {
            return Err(FluxError::Query(format!(
                "range of {} steps exceeds the limit of {}",
                buckets, MAX_POINTS_PER_SERIES
            )));
        }

        let started = Instant::now();
        let series = self
            .store
            .aggregate_query(
                &selector.metric,
                selector.aggregation.unwrap_or(AggregationType::Last),
                start,
                end,
                step,
                &selector.matchers,
            )
            .await?;

        flux_metrics::record_query(started.elapsed().as_secs_f64());
        debug!(query = %selector, series = series.len(), "Range query executed");
        Ok(series)
    }

    /// 历史数值（按时间排序），已降采样的时间段以小时均值代替
    pub async fn history(&self, metric: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<f64>> {
        let empty = Labels::new();
        let rollups = self.store.query_rollups(metric, start, end, &empty).await?;
        let raw = self.store.query(metric, start, end, &empty).await?;

        let mut values: Vec<(i64, f64)> = rollups
            .iter()
            .map(|r| (r.bucket.timestamp_millis(), r.avg))
            .chain(raw.iter().map(|p| (p.timestamp.timestamp_millis(), p.value)))
            .collect();
        values.sort_by_key(|(ts, _)| *ts);

        Ok(values.into_iter().map(|(_, v)| v).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Rollup;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use flux_types::MetricSample;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    async fn engine_with_data() -> QueryEngine {
        let store = Arc::new(MemoryStore::new());
        let samples = [
            ("checkout", -400, 0.50),
            ("checkout", -120, 0.02),
            ("checkout", -60, 0.08),
            ("cart", -30, 0.01),
        ];
        for (service, at, value) in samples {
            store
                .write(
                    &MetricSample::new("error_rate", value)
                        .with_label("service", service)
                        .with_timestamp(ts(at)),
                )
                .await
                .unwrap();
        }
        QueryEngine::new(store)
    }

    #[tokio::test]
    async fn test_instant_latest_per_series() {
        let engine = engine_with_data().await;
        let values = engine.instant("error_rate", ts(0)).await.unwrap();

        assert_eq!(values.len(), 2);
        assert_eq!(values[0].labels.get("service").map(String::as_str), Some("cart"));
        assert_eq!(values[0].value, 0.01);
        assert_eq!(values[1].value, 0.08);
        assert_eq!(values[1].timestamp, ts(-60));
    }

    #[tokio::test]
    async fn test_instant_aggregation_over_window() {
        let engine = engine_with_data().await;

        // 默认 5 分钟窗口不包含 -400s 的样本
        let values = engine
            .instant(r#"max(error_rate{service="checkout"})"#, ts(0))
            .await
            .unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].value, 0.08);
        assert_eq!(values[0].timestamp, ts(0));

        let values = engine
            .instant(r#"max(error_rate{service="checkout"})[10m]"#, ts(0))
            .await
            .unwrap();
        assert_eq!(values[0].value, 0.50);

        let values = engine.instant("count(error_rate)", ts(0)).await.unwrap();
        let counts: Vec<f64> = values.iter().map(|v| v.value).collect();
        assert_eq!(counts, vec![1.0, 2.0]);
    }

    #[tokio::test]
    async fn test_instant_unknown_metric_is_empty() {
        let engine = engine_with_data().await;
        assert!(engine.instant("missing_metric", ts(0)).await.unwrap().is_empty());

        let err = engine.instant("avg(error_rate", ts(0)).await.unwrap_err();
        assert_eq!(err.kind(), "query");
    }

    #[tokio::test]
    async fn test_range_query() {
        let engine = engine_with_data().await;
        let series = engine
            .range(r#"avg(error_rate{service="checkout"})"#, ts(-600), ts(0), Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(series.len(), 1);
        let total: usize = series[0].points.len();
        assert!(total >= 1);

        let err = engine
            .range("error_rate", ts(0), ts(-600), Duration::minutes(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "query");

        let err = engine
            .range("error_rate", ts(-86_400 * 30), ts(0), Duration::seconds(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "query");
    }

    #[tokio::test]
    async fn test_history_includes_rollups() {
        let store = Arc::new(MemoryStore::new());
        let bucket = Utc.timestamp_opt(1_699_992_000, 0).unwrap();
        store
            .write_rollups(&[Rollup::from_values("cpu", Labels::new(), bucket, &[1.0, 3.0])])
            .await
            .unwrap();
        store
            .write(&MetricSample::new("cpu", 5.0).with_timestamp(ts(0)))
            .await
            .unwrap();

        let engine = QueryEngine::new(store);
        let history = engine.history("cpu", ts(-86_400), ts(1)).await.unwrap();
        assert_eq!(history, vec![2.0, 5.0]);
    }
}
