use crate::labels::Labels;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// 告警级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("unknown severity: {s}")),
        }
    }
}

/// 告警状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Firing,
    Resolved,
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Firing => write!(f, "firing"),
            Self::Resolved => write!(f, "resolved"),
        }
    }
}

impl FromStr for AlertStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "firing" => Ok(Self::Firing),
            "resolved" => Ok(Self::Resolved),
            _ => Err(format!("unknown alert status: {s}")),
        }
    }
}

/// 通知动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertAction {
    Firing,
    Resolved,
}

impl fmt::Display for AlertAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Firing => write!(f, "firing"),
            Self::Resolved => write!(f, "resolved"),
        }
    }
}

impl FromStr for AlertAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "firing" => Ok(Self::Firing),
            "resolved" => Ok(Self::Resolved),
            _ => Err(format!("unknown alert action: {s}")),
        }
    }
}

/// 告警实例
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub fingerprint: String,
    pub status: AlertStatus,
    pub severity: Severity,
    pub value: f64,
    pub labels: Labels,
    pub annotations: BTreeMap<String, String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,

    /// 通知被关联分组抑制
    #[serde(default)]
    pub suppressed: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_key: Option<String>,
}

impl Alert {
    pub fn firing(
        rule_id: impl Into<String>,
        rule_name: impl Into<String>,
        severity: Severity,
        value: f64,
        labels: Labels,
        now: DateTime<Utc>,
    ) -> Self {
        let rule_name = rule_name.into();
        let fingerprint = fingerprint(&rule_name, &labels);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            rule_id: rule_id.into(),
            rule_name,
            fingerprint,
            status: AlertStatus::Firing,
            severity,
            value,
            labels,
            annotations: BTreeMap::new(),
            starts_at: now,
            ends_at: None,
            updated_at: now,
            suppressed: false,
            correlation_key: None,
        }
    }

    pub fn is_firing(&self) -> bool {
        self.status == AlertStatus::Firing
    }

    /// 更新当前值（告警持续触发）
    pub fn touch(&mut self, value: f64, now: DateTime<Utc>) {
        self.value = value;
        self.updated_at = now;
    }

    /// 解决告警，重复调用不会改变 `ends_at`
    pub fn resolve(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == AlertStatus::Resolved {
            return false;
        }
        self.status = AlertStatus::Resolved;
        self.ends_at = Some(now);
        self.updated_at = now;
        true
    }
}

/// 计算告警指纹：规则名 + 排序后的标签集合的 SHA-256
pub fn fingerprint(rule_name: &str, labels: &Labels) -> String {
    let mut hasher = Sha256::new();
    hasher.update(rule_name.as_bytes());
    for (k, v) in labels {
        hasher.update([0u8]);
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
    }
    hex::encode(hasher.finalize())
}
