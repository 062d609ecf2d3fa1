use anyhow::{anyhow, Result};
use config::{Config, Environment, File, FileFormat};
use flux_alert::{AlertingConfig, AnomalyConfig};
use flux_ingest::IngestConfig;
use flux_notify::RetryPolicy;
use flux_types::{ChannelConfig, RetentionPolicy};
use serde::Deserialize;
use std::net::SocketAddr;

/// 环境变量前缀，例如 `FLUX_MONITOR__SERVER__PORT=9000`
pub const ENV_PREFIX: &str = "FLUX_MONITOR";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub alerting: AlertingConfig,
    #[serde(default)]
    pub anomaly: AnomalyConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl AppConfig {
    /// 加载配置文件（不存在时使用默认值），再叠加环境变量
    pub fn load(path: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::new(path, FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let app_config: AppConfig = config.try_deserialize()?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.backend == StorageBackend::Database && self.storage.url.is_empty() {
            return Err(anyhow!("storage.url is required for the database backend"));
        }
        if self.ingest.batch_size == 0 {
            return Err(anyhow!("ingest.batch_size must be greater than 0"));
        }
        if self.storage.retention.raw_days <= 0 || self.storage.retention.downsampled_days < self.storage.retention.raw_days {
            return Err(anyhow!(
                "storage.retention must keep downsampled data ({} days) at least as long as raw data ({} days)",
                self.storage.retention.downsampled_days,
                self.storage.retention.raw_days
            ));
        }
        self.server.socket_addr()?;
        self.metrics.listen_addr()?;
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_eventbus_capacity")]
    pub eventbus_capacity: usize,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| anyhow!("Invalid server address {}:{}: {}", self.host, self.port, e))
    }
}

/// 存储后端
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Database,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// sea-orm 连接串（sqlite:// 或 postgres://）
    #[serde(default = "default_database_url")]
    pub url: String,

    #[serde(default)]
    pub retention: RetentionPolicy,

    /// 早于该时长的原始样本降采样为小时数据
    #[serde(default = "default_downsample_after_hours")]
    pub downsample_after_hours: i64,

    #[serde(default = "default_downsample_cron")]
    pub downsample_cron: String,

    #[serde(default = "default_retention_cron")]
    pub retention_cron: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotifyConfig {
    #[serde(default)]
    pub retry: RetryPolicy,

    /// 内存中保留的通知记录数
    #[serde(default = "default_notification_capacity")]
    pub history_capacity: usize,

    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

/// 日志格式
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MetricsConfig {
    /// Prometheus exporter 监听地址，未设置时不启动
    #[serde(default)]
    pub listen: Option<String>,
}

impl MetricsConfig {
    pub fn listen_addr(&self) -> Result<Option<SocketAddr>> {
        self.listen
            .as_deref()
            .map(|addr| {
                addr.parse()
                    .map_err(|e| anyhow!("Invalid metrics.listen address {}: {}", addr, e))
            })
            .transpose()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ShutdownConfig {
    #[serde(default = "default_shutdown_timeout")]
    pub timeout_secs: u64,
}

// 默认值函数
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_eventbus_capacity() -> usize {
    1024
}

fn default_database_url() -> String {
    "sqlite::memory:".to_string()
}

fn default_downsample_after_hours() -> i64 {
    2
}

fn default_downsample_cron() -> String {
    "0 5 * * * *".to_string()
}

fn default_retention_cron() -> String {
    "0 0 1 * * *".to_string()
}

fn default_notification_capacity() -> usize {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_shutdown_timeout() -> u64 {
    30
}

// Default trait 实现
impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            eventbus_capacity: default_eventbus_capacity(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            url: default_database_url(),
            retention: RetentionPolicy::default(),
            downsample_after_hours: default_downsample_after_hours(),
            downsample_cron: default_downsample_cron(),
            retention_cron: default_retention_cron(),
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            history_capacity: default_notification_capacity(),
            channels: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_shutdown_timeout(),
        }
    }
}
