use anyhow::Result;
use chrono::Duration;
use clap::Parser;
use flux_monitor::{api, build, config::AppConfig, logging};
use flux_shutdown::{ResourceError, ShutdownCoordinator, SignalHandler, TaskResource};
use flux_timeseries::{DownsamplePolicy, ScheduledTask, TaskScheduler, TaskType};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = AppConfig::load(&args.config)?;
    logging::init_logging(&config.logging)?;
    info!(config = %args.config, "Starting FLUX Monitor");

    if let Some(addr) = config.metrics.listen_addr()? {
        flux_metrics::init_exporter(addr)?;
    }

    let (signal_handler, _) = SignalHandler::new();
    let mut coordinator = ShutdownCoordinator::builder()
        .with_signal_handler(signal_handler.clone())
        .with_shutdown_timeout(std::time::Duration::from_secs(config.shutdown.timeout_secs))
        .build();

    let app = build(&config, coordinator.phase()).await?;

    // 维护任务
    let mut scheduler = TaskScheduler::new(app.store.clone()).await?;
    let policy = DownsamplePolicy::hourly().with_threshold(Duration::hours(config.storage.downsample_after_hours));
    scheduler
        .add_task(ScheduledTask::new(
            "Hourly Downsample".to_string(),
            config.storage.downsample_cron.clone(),
            TaskType::Downsample(policy),
        ))
        .await?;
    scheduler
        .add_task(ScheduledTask::new(
            "Daily Retention".to_string(),
            config.storage.retention_cron.clone(),
            TaskType::Retention,
        ))
        .await?;
    scheduler.start().await?;

    let pipeline_handle = app.state.pipeline.start();
    let alert_handle = app.state.alerts.start();

    // 先停止评估，再做最后一次刷写
    let resources = coordinator.resources_mut();
    resources.register(Arc::new(TaskResource::new("alert-manager", 10, move || async move {
        alert_handle.shutdown().await;
        Ok(())
    })));
    resources.register(Arc::new(TaskResource::new("ingest-pipeline", 20, move || async move {
        pipeline_handle.shutdown().await;
        Ok(())
    })));
    resources.register(Arc::new(TaskResource::new("scheduler", 30, move || async move {
        let mut scheduler = scheduler;
        scheduler
            .shutdown()
            .await
            .map_err(|e| ResourceError::CleanupFailed(e.to_string()))
    })));

    let addr = config.server.socket_addr()?;
    let router = api::create_router(app.state.clone());
    let mut shutdown_rx = signal_handler.subscribe();
    let server = tokio::spawn(async move {
        info!(addr = %addr, "HTTP server listening");
        axum::Server::bind(&addr)
            .serve(router.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await
    });

    let report = coordinator.run().await;
    if report.failed > 0 || report.timed_out > 0 {
        error!(failed = report.failed, timed_out = report.timed_out, "Shutdown finished with errors");
    }

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "HTTP server error"),
        Err(e) => error!(error = %e, "HTTP server task failed"),
    }

    info!("FLUX Monitor stopped");
    Ok(())
}
