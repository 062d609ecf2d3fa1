pub mod api;
pub mod config;
pub mod logging;

use anyhow::Result;
use chrono::{DateTime, Utc};
use flux_alert::{
    ActiveAlerts, AlertEvaluator, AlertManager, AlertStore, AnomalyDetector, DbAlertStore, DbRuleStore,
    MemoryAlertStore, MemoryRuleStore, RuleCatalog, RuleStore,
};
use flux_core::{EventBus, SharedEventBus};
use flux_ingest::IngestPipeline;
use flux_notify::{DbNotificationStore, MemoryNotificationStore, NotificationManager, NotificationStore};
use flux_shutdown::ShutdownPhase;
use flux_timeseries::{DbStore, MemoryStore, QueryEngine, TimeSeriesStore};
use sea_orm::{Database, DatabaseConnection};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

pub use config::AppConfig;
use config::StorageBackend;

/// HTTP 处理器共享的状态
pub struct AppState {
    pub pipeline: Arc<IngestPipeline>,
    pub engine: QueryEngine,
    pub alerts: AlertManager,
    pub notifications: NotificationManager,
    pub bus: SharedEventBus,
    pub phase: watch::Receiver<ShutdownPhase>,
    pub started_at: DateTime<Utc>,
}

/// 组装完成、尚未启动后台任务的服务
pub struct App {
    pub state: Arc<AppState>,
    pub store: Arc<dyn TimeSeriesStore>,
    pub db: Option<Arc<DatabaseConnection>>,
}

struct Backends {
    samples: Arc<dyn TimeSeriesStore>,
    rules: Arc<dyn RuleStore>,
    alerts: Arc<dyn AlertStore>,
    notifications: Arc<dyn NotificationStore>,
    db: Option<Arc<DatabaseConnection>>,
}

async fn open_backends(config: &AppConfig) -> Result<Backends> {
    let retention = config.storage.retention;
    match config.storage.backend {
        StorageBackend::Memory => {
            info!("Using in-memory storage backend");
            Ok(Backends {
                samples: Arc::new(MemoryStore::new().with_retention(retention)),
                rules: Arc::new(MemoryRuleStore::new()),
                alerts: Arc::new(MemoryAlertStore::new()),
                notifications: Arc::new(MemoryNotificationStore::with_capacity(config.notify.history_capacity)),
                db: None,
            })
        }
        StorageBackend::Database => {
            let db = Arc::new(Database::connect(&config.storage.url).await?);
            flux_core::entity::create_tables(&db).await?;
            info!("Using database storage backend");

            Ok(Backends {
                samples: Arc::new(DbStore::new(db.clone()).with_retention(retention)),
                rules: Arc::new(DbRuleStore::new(db.clone())),
                alerts: Arc::new(DbAlertStore::new(db.clone())),
                notifications: Arc::new(DbNotificationStore::new(db.clone())),
                db: Some(db),
            })
        }
    }
}

/// 根据配置创建存储与各组件
pub async fn build(config: &AppConfig, phase: watch::Receiver<ShutdownPhase>) -> Result<App> {
    let backends = open_backends(config).await?;
    let bus: SharedEventBus = Arc::new(EventBus::new(config.server.eventbus_capacity));

    let pipeline = Arc::new(IngestPipeline::new(backends.samples.clone(), config.ingest.clone()));
    let engine = QueryEngine::new(backends.samples.clone());

    let notifications = NotificationManager::new(backends.notifications, bus.clone(), config.notify.retry.clone());
    notifications.register_default_adapters().await;
    for channel in &config.notify.channels {
        notifications.add_channel(channel.clone()).await;
    }

    let detector = AnomalyDetector::new(engine.clone(), config.anomaly.clone());
    let alerts = AlertManager::new(
        RuleCatalog::new(backends.rules),
        AlertEvaluator::new(engine.clone(), detector),
        Arc::new(ActiveAlerts::new()),
        backends.alerts,
        Arc::new(notifications.clone()),
        bus.clone(),
        config.alerting.clone(),
    );

    let state = Arc::new(AppState {
        pipeline,
        engine,
        alerts,
        notifications,
        bus,
        phase,
        started_at: Utc::now(),
    });

    Ok(App {
        state,
        store: backends.samples,
        db: backends.db,
    })
}
