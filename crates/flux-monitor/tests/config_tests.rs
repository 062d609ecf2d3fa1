use flux_monitor::config::{AppConfig, LogFormat, StorageBackend};
use std::io::Write;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_missing_file_uses_defaults() {
    let config = AppConfig::load("/nonexistent/flux-monitor.toml").unwrap();

    assert_eq!(config.server.port, 8080);
    assert_eq!(config.storage.backend, StorageBackend::Memory);
    assert_eq!(config.storage.retention.raw_days, 90);
    assert_eq!(config.ingest.batch_size, 500);
    assert_eq!(config.alerting.evaluation_interval_secs, 30);
    assert_eq!(config.alerting.rule_timeout_ms, 10_000);
    assert_eq!(config.notify.retry.max_attempts, 5);
    assert!(config.metrics.listen_addr().unwrap().is_none());
}

#[test]
fn test_load_file_sections() {
    let file = write_config(
        r#"
[server]
host = "127.0.0.1"
port = 9100

[storage]
backend = "database"
url = "sqlite::memory:"

[storage.retention]
raw_days = 30
downsampled_days = 365

[alerting]
evaluation_interval_secs = 15
correlation_labels = ["cluster", "service"]

[logging]
level = "debug"
format = "json"

[metrics]
listen = "127.0.0.1:9464"

[[notify.channels]]
id = "ops-slack"
name = "Ops"
type = "slack"
recipient = "https://hooks.slack.com/services/T000/B000/XXX"
rate_limit_per_minute = 5
"#,
    );

    let config = AppConfig::load(file.path().to_str().unwrap()).unwrap();

    assert_eq!(config.server.socket_addr().unwrap().port(), 9100);
    assert_eq!(config.storage.backend, StorageBackend::Database);
    assert_eq!(config.storage.retention.downsampled_days, 365);
    assert_eq!(config.alerting.evaluation_interval_secs, 15);
    assert_eq!(config.alerting.rule_timeout_ms, 10_000);
    assert_eq!(config.alerting.correlation_labels, vec!["cluster", "service"]);
    assert_eq!(config.logging.format, LogFormat::Json);
    assert!(config.metrics.listen_addr().unwrap().is_some());
    assert_eq!(config.notify.channels.len(), 1);
    assert_eq!(config.notify.channels[0].rate_limit_per_minute, 5);
}

#[test]
fn test_env_overrides_file() {
    let file = write_config("[server]\neventbus_capacity = 64\n");
    std::env::set_var("FLUX_MONITOR__SERVER__EVENTBUS_CAPACITY", "2048");

    let config = AppConfig::load(file.path().to_str().unwrap()).unwrap();
    std::env::remove_var("FLUX_MONITOR__SERVER__EVENTBUS_CAPACITY");

    assert_eq!(config.server.eventbus_capacity, 2048);
}

#[test]
fn test_invalid_config_rejected() {
    let file = write_config("[storage.retention]\nraw_days = 90\ndownsampled_days = 30\n");
    assert!(AppConfig::load(file.path().to_str().unwrap()).is_err());

    let file = write_config("[metrics]\nlisten = \"not-an-address\"\n");
    assert!(AppConfig::load(file.path().to_str().unwrap()).is_err());
}
