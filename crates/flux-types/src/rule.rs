use crate::alert::Severity;
use crate::labels::Labels;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 等值比较使用的容差
pub const EQUALITY_EPSILON: f64 = 1e-4;

/// 阈值比较运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdOperator {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Ne,
    /// 无法识别的运算符，规则校验时拒绝，评估时视为不告警
    #[serde(other)]
    Unknown,
}

impl ThresholdOperator {
    /// 比较当前值与阈值，`Unknown` 返回 `None`
    pub fn compare(&self, value: f64, threshold: f64) -> Option<bool> {
        let approx_eq = (value - threshold).abs() < EQUALITY_EPSILON;
        let result = match self {
            Self::Gt => value > threshold,
            Self::Gte => value > threshold || approx_eq,
            Self::Lt => value < threshold,
            Self::Lte => value < threshold || approx_eq,
            Self::Eq => approx_eq,
            Self::Ne => !approx_eq,
            Self::Unknown => return None,
        };
        Some(result)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Unknown => "unknown",
        }
    }
}

/// 告警条件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    /// 阈值条件
    Threshold {
        #[serde(alias = "op")]
        operator: ThresholdOperator,
        threshold: f64,
    },
    /// 异常检测条件，`sensitivity` 取值 [0, 1]
    Anomaly { sensitivity: f64 },
}

impl Condition {
    pub fn threshold(operator: ThresholdOperator, threshold: f64) -> Self {
        Self::Threshold {
            operator,
            threshold,
        }
    }

    pub fn anomaly(sensitivity: f64) -> Self {
        Self::Anomaly { sensitivity }
    }
}

/// 告警规则
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    pub query: String,
    pub condition: Condition,
    pub severity: Severity,

    /// 条件需要持续满足的时间（秒），0 表示首次满足即触发
    #[serde(default, rename = "duration")]
    pub duration_secs: u64,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub labels: Labels,

    /// 注解模板
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    /// 通知渠道 ID，为空时发送到所有启用的渠道
    #[serde(default)]
    pub channels: Vec<String>,

    /// 显式关联分组
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_group: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

impl AlertRule {
    pub fn new(name: impl Into<String>, query: impl Into<String>, condition: Condition) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            query: query.into(),
            condition,
            severity: Severity::Warning,
            duration_secs: 0,
            enabled: true,
            labels: Labels::new(),
            annotations: BTreeMap::new(),
            channels: Vec::new(),
            correlation_group: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_duration(mut self, secs: u64) -> Self {
        self.duration_secs = secs;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, template: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), template.into());
        self
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channels.push(channel_id.into());
        self
    }

    pub fn with_correlation_group(mut self, group: impl Into<String>) -> Self {
        self.correlation_group = Some(group.into());
        self
    }
}
