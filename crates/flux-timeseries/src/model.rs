use chrono::{DateTime, TimeZone, Utc};
use flux_types::Labels;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 一小时（毫秒）
pub const HOUR_MS: i64 = 3_600_000;

/// 聚合类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AggregationType {
    Avg,
    Sum,
    Min,
    Max,
    Count,
    /// 总体标准差
    Stddev,
    /// 最新值
    Last,
}

impl AggregationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Avg => "avg",
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
            Self::Count => "count",
            Self::Stddev => "stddev",
            Self::Last => "last",
        }
    }
}

impl fmt::Display for AggregationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "avg" => Ok(Self::Avg),
            "sum" => Ok(Self::Sum),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "count" => Ok(Self::Count),
            "stddev" => Ok(Self::Stddev),
            "last" => Ok(Self::Last),
            _ => Err(format!("unknown aggregation: {s}")),
        }
    }
}

/// 增量聚合器
///
/// 均值与方差使用 Welford 算法累积，合并降采样数据时按 Chan 公式合并（小时内方差视为 0）。
#[derive(Debug, Clone)]
pub struct Accumulator {
    count: u64,
    sum: f64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
    last: Option<(i64, f64)>,
}

impl Default for Accumulator {
    fn default() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            mean: 0.0,
            m2: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            last: None,
        }
    }
}

impl Accumulator {
    pub fn push(&mut self, ts: i64, value: f64) {
        self.count += 1;
        self.sum += value;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.track_last(ts, value);
    }

    pub fn push_rollup(&mut self, rollup: &Rollup) {
        if rollup.count == 0 {
            return;
        }
        let na = self.count as f64;
        let nb = rollup.count as f64;
        let n = na + nb;
        let delta = rollup.avg - self.mean;

        self.mean += delta * nb / n;
        self.m2 += delta * delta * na * nb / n;
        self.count += rollup.count;
        self.sum += rollup.sum;
        self.min = self.min.min(rollup.min);
        self.max = self.max.max(rollup.max);
        self.track_last(rollup.bucket.timestamp_millis(), rollup.avg);
    }

    fn track_last(&mut self, ts: i64, value: f64) {
        match self.last {
            Some((last_ts, _)) if last_ts > ts => {}
            _ => self.last = Some((ts, value)),
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// 最新数据点的时间（毫秒）
    pub fn last_timestamp(&self) -> Option<i64> {
        self.last.map(|(ts, _)| ts)
    }

    /// 计算聚合结果，没有数据时返回 `None`
    pub fn finish(&self, aggregation: AggregationType) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let value = match aggregation {
            AggregationType::Avg => self.sum / self.count as f64,
            AggregationType::Sum => self.sum,
            AggregationType::Min => self.min,
            AggregationType::Max => self.max,
            AggregationType::Count => self.count as f64,
            AggregationType::Stddev => (self.m2 / self.count as f64).max(0.0).sqrt(),
            AggregationType::Last => self.last.map(|(_, v)| v)?,
        };
        Some(value)
    }
}

/// 计算桶起始时间 `floor(ts / step) * step`
pub fn bucket_start(ts_ms: i64, step_ms: i64) -> i64 {
    if step_ms <= 0 {
        return ts_ms;
    }
    ts_ms.div_euclid(step_ms) * step_ms
}

pub fn from_millis(ts_ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ts_ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// 聚合后的数据点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// 按标签分组的聚合序列
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedSeries {
    pub metric: String,
    pub labels: Labels,
    pub points: Vec<AggregatedPoint>,
}

/// 即时查询结果：每个序列一个值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesValue {
    pub labels: Labels,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// 小时级降采样数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rollup {
    pub metric: String,
    pub labels: Labels,
    pub bucket: DateTime<Utc>,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub count: u64,
}

impl Rollup {
    pub fn from_values(metric: &str, labels: Labels, bucket: DateTime<Utc>, values: &[f64]) -> Self {
        let count = values.len() as u64;
        let sum: f64 = values.iter().sum();
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Self {
            metric: metric.to_string(),
            labels,
            bucket,
            avg: if count > 0 { sum / count as f64 } else { 0.0 },
            min,
            max,
            sum,
            count,
        }
    }

    /// 合并同一桶中晚到的数据
    pub fn merge(&mut self, other: &Rollup) {
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        if self.count > 0 {
            self.avg = self.sum / self.count as f64;
        }
    }
}

/// 批量写入结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteSummary {
    pub accepted: usize,
    pub rejected: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accumulate(values: &[f64]) -> Accumulator {
        let mut acc = Accumulator::default();
        for (i, v) in values.iter().enumerate() {
            acc.push(i as i64, *v);
        }
        acc
    }

    #[test]
    fn test_aggregations() {
        let acc = accumulate(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);

        assert_eq!(acc.finish(AggregationType::Avg), Some(5.0));
        assert_eq!(acc.finish(AggregationType::Sum), Some(40.0));
        assert_eq!(acc.finish(AggregationType::Min), Some(2.0));
        assert_eq!(acc.finish(AggregationType::Max), Some(9.0));
        assert_eq!(acc.finish(AggregationType::Count), Some(8.0));
        assert_eq!(acc.finish(AggregationType::Last), Some(9.0));

        let stddev = acc.finish(AggregationType::Stddev).unwrap();
        assert!((stddev - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_accumulator() {
        let acc = Accumulator::default();
        assert_eq!(acc.finish(AggregationType::Count), None);
        assert_eq!(acc.finish(AggregationType::Avg), None);
    }

    #[test]
    fn test_rollup_merge_matches_raw() {
        let raw = accumulate(&[1.0, 2.0, 3.0, 10.0, 20.0]);

        let mut merged = Accumulator::default();
        merged.push(0, 1.0);
        merged.push(1, 2.0);
        merged.push(2, 3.0);
        let rollup = Rollup::from_values("m", Labels::new(), from_millis(HOUR_MS), &[10.0, 20.0]);
        merged.push_rollup(&rollup);

        assert_eq!(merged.finish(AggregationType::Count), raw.finish(AggregationType::Count));
        assert_eq!(merged.finish(AggregationType::Sum), raw.finish(AggregationType::Sum));
        assert_eq!(merged.finish(AggregationType::Max), Some(20.0));
        assert_eq!(merged.finish(AggregationType::Last), Some(15.0));
    }

    #[test]
    fn test_bucket_start() {
        assert_eq!(bucket_start(125_000, 60_000), 120_000);
        assert_eq!(bucket_start(120_000, 60_000), 120_000);
        assert_eq!(bucket_start(-1, 60_000), -60_000);
    }

    #[test]
    fn test_aggregation_parse() {
        assert_eq!("stddev".parse::<AggregationType>(), Ok(AggregationType::Stddev));
        assert!("p99".parse::<AggregationType>().is_err());
    }
}
