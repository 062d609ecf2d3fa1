use chrono::{DateTime, TimeZone, Utc};
use flux_core::{FluxError, Result};
use flux_types::{Labels, MetricSample, MetricType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// 写入请求体：`{"metrics": [...]}` 或直接数组
///
/// 每个条目保持为原始 JSON，单条格式错误只拒绝该条。
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IngestRequest {
    Wrapped { metrics: Vec<Value> },
    Bare(Vec<Value>),
}

impl IngestRequest {
    pub fn into_entries(self) -> Vec<Value> {
        match self {
            Self::Wrapped { metrics } => metrics,
            Self::Bare(entries) => entries,
        }
    }
}

/// 外部提交的单个指标
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricInput {
    pub name: String,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub metric_type: Option<String>,

    pub value: Value,

    #[serde(default)]
    pub labels: BTreeMap<String, Value>,

    /// 数字为 Unix 毫秒，字符串为 RFC3339
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl MetricInput {
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| FluxError::validation(format!("malformed metric: {e}")))
    }

    /// 转换为样本，缺省时间戳取 `now`
    pub fn into_sample(self, now: DateTime<Utc>) -> Result<MetricSample> {
        let metric_type = match self.metric_type.as_deref() {
            None => MetricType::default(),
            Some(raw) => raw
                .parse::<MetricType>()
                .map_err(|e| FluxError::invalid_field("type", e))?,
        };

        let value = self.value.as_f64().ok_or_else(|| {
            FluxError::invalid_field("value", format!("value for '{}' must be a number", self.name))
        })?;

        let mut labels = Labels::new();
        for (key, raw) in self.labels {
            let text = match raw {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                other => {
                    return Err(FluxError::invalid_field(
                        "labels",
                        format!("label '{key}' must be a scalar, got {other}"),
                    ))
                }
            };
            labels.insert(key, text);
        }

        let timestamp = match self.timestamp {
            None | Some(Value::Null) => now,
            Some(raw) => parse_timestamp(&raw)?,
        };

        Ok(MetricSample {
            metric: self.name,
            metric_type,
            value,
            labels,
            timestamp,
            unit: self.unit,
        })
    }
}

pub fn parse_timestamp(raw: &Value) -> Result<DateTime<Utc>> {
    let parsed = match raw {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64))
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    };
    parsed.ok_or_else(|| FluxError::invalid_field("timestamp", format!("invalid timestamp: {raw}")))
}
