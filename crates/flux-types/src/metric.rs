use crate::labels::Labels;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 检查指标名是否符合 `[a-zA-Z_:][a-zA-Z0-9_:]*`
pub fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

/// 检查标签名是否符合 `[a-zA-Z_][a-zA-Z0-9_]*`
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// 指标类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Counter,
    #[default]
    Gauge,
    Histogram,
    Summary,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
            Self::Summary => "summary",
        }
    }
}

impl std::str::FromStr for MetricType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counter" => Ok(Self::Counter),
            "gauge" => Ok(Self::Gauge),
            "histogram" => Ok(Self::Histogram),
            "summary" => Ok(Self::Summary),
            _ => Err(format!("unknown metric type: {s}")),
        }
    }
}

/// 数据保留策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// 原始精度数据保留天数
    pub raw_days: i64,

    /// 降采样数据保留天数
    pub downsampled_days: i64,
}

impl RetentionPolicy {
    pub fn raw(&self) -> Duration {
        Duration::days(self.raw_days)
    }

    pub fn downsampled(&self) -> Duration {
        Duration::days(self.downsampled_days)
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            raw_days: 90,
            downsampled_days: 730,
        }
    }
}

/// 指标定义（首次写入新指标名时创建，不会自动删除）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub name: String,
    pub metric_type: MetricType,
    pub unit: Option<String>,
    pub retention: RetentionPolicy,
    pub created_at: DateTime<Utc>,
}

impl MetricDefinition {
    pub fn new(name: impl Into<String>, metric_type: MetricType) -> Self {
        Self {
            name: name.into(),
            metric_type,
            unit: None,
            retention: RetentionPolicy::default(),
            created_at: Utc::now(),
        }
    }
}

/// 指标样本
///
/// 存储键为 `(metric, timestamp, labels)`，相同键的重复写入会覆盖旧值。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub metric: String,
    #[serde(default)]
    pub metric_type: MetricType,
    pub value: f64,
    #[serde(default)]
    pub labels: Labels,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl MetricSample {
    pub fn new(metric: impl Into<String>, value: f64) -> Self {
        Self {
            metric: metric.into(),
            metric_type: MetricType::Gauge,
            value,
            labels: Labels::new(),
            timestamp: Utc::now(),
            unit: None,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_type(mut self, metric_type: MetricType) -> Self {
        self.metric_type = metric_type;
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }
}

/// 查询返回的数据点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplePoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub labels: Labels,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_sample_builder() {
        let sample = MetricSample::new("http_requests_total", 42.0)
            .with_type(MetricType::Counter)
            .with_label("service", "checkout")
            .with_unit("requests");

        assert_eq!(sample.metric, "http_requests_total");
        assert_eq!(sample.metric_type, MetricType::Counter);
        assert_eq!(sample.labels.get("service").map(String::as_str), Some("checkout"));
        assert_eq!(sample.unit, Some("requests".to_string()));
    }

    #[test]
    fn test_name_validation() {
        assert!(is_valid_metric_name("http_requests_total"));
        assert!(is_valid_metric_name("node:cpu:ratio"));
        assert!(!is_valid_metric_name("123bad"));
        assert!(!is_valid_metric_name(""));
        assert!(!is_valid_metric_name("cpu-usage"));

        assert!(is_valid_label_name("_host"));
        assert!(!is_valid_label_name("a:b"));
        assert!(!is_valid_label_name("1st"));
    }

    #[test]
    fn test_default_retention() {
        let def = MetricDefinition::new("cpu_usage", MetricType::Gauge);
        assert_eq!(def.retention.raw(), Duration::days(90));
        assert_eq!(def.retention.downsampled(), Duration::days(730));
    }
}
