use crate::alert::AlertAction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// 通知渠道类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    /// 邮件
    Email,
    /// Slack
    Slack,
    /// Webhook
    Webhook,
    /// 短信
    Sms,
    /// 仅写日志
    Log,
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Email => "email",
            Self::Slack => "slack",
            Self::Webhook => "webhook",
            Self::Sms => "sms",
            Self::Log => "log",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ChannelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(Self::Email),
            "slack" => Ok(Self::Slack),
            "webhook" => Ok(Self::Webhook),
            "sms" => Ok(Self::Sms),
            "log" => Ok(Self::Log),
            _ => Err(format!("unknown channel type: {s}")),
        }
    }
}

/// 通知渠道配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,

    /// 接收方：邮箱地址、手机号、Webhook URL 等
    pub recipient: String,

    /// 渠道相关设置（smtp_host、gateway_url 等）
    #[serde(default)]
    pub settings: BTreeMap<String, String>,

    /// 每分钟最多发送次数
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_rate_limit() -> u32 {
    10
}

fn default_enabled() -> bool {
    true
}

impl ChannelConfig {
    pub fn new(id: impl Into<String>, channel_type: ChannelType, recipient: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            channel_type,
            recipient: recipient.into(),
            settings: BTreeMap::new(),
            rate_limit_per_minute: default_rate_limit(),
            enabled: true,
        }
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    pub fn with_rate_limit(mut self, per_minute: u32) -> Self {
        self.rate_limit_per_minute = per_minute;
        self
    }

    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(String::as_str)
    }
}

/// 通知状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
    /// 被限流，不会重试
    Suppressed,
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Suppressed => "suppressed",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for NotificationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "suppressed" => Ok(Self::Suppressed),
            _ => Err(format!("unknown notification status: {s}")),
        }
    }
}

/// 通知记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub alert_id: String,
    pub channel_id: String,
    pub channel_type: ChannelType,
    pub recipient: String,
    pub action: AlertAction,
    pub status: NotificationStatus,
    pub retry_count: u32,
    pub sent_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn pending(alert_id: impl Into<String>, channel: &ChannelConfig, action: AlertAction) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            alert_id: alert_id.into(),
            channel_id: channel.id.clone(),
            channel_type: channel.channel_type,
            recipient: channel.recipient.clone(),
            action,
            status: NotificationStatus::Pending,
            retry_count: 0,
            sent_at: None,
            failed_at: None,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    pub fn mark_sent(&mut self, now: DateTime<Utc>) {
        self.status = NotificationStatus::Sent;
        self.sent_at = Some(now);
        self.last_error = None;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = NotificationStatus::Failed;
        self.failed_at = Some(now);
        self.retry_count += 1;
        self.last_error = Some(error.into());
    }
}
