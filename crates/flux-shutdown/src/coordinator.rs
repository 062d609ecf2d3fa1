use crate::resource::{CleanupReport, ResourceManager};
use crate::signal::SignalHandler;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{info, warn};

/// 关闭阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    Draining,
    Complete,
}

impl ShutdownPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Complete => "complete",
        }
    }
}

/// 关闭协调器
pub struct ShutdownCoordinator {
    signal_handler: SignalHandler,
    resource_manager: ResourceManager,
    shutdown_timeout: Duration,
    phase_tx: watch::Sender<ShutdownPhase>,
}

impl ShutdownCoordinator {
    pub fn builder() -> ShutdownCoordinatorBuilder {
        ShutdownCoordinatorBuilder::new()
    }

    pub fn signal_handler(&self) -> &SignalHandler {
        &self.signal_handler
    }

    /// 当前阶段的订阅，健康检查据此报告 draining
    pub fn phase(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase_tx.subscribe()
    }

    pub fn resources_mut(&mut self) -> &mut ResourceManager {
        &mut self.resource_manager
    }

    /// 等待关闭信号后按优先级清理资源
    pub async fn run(mut self) -> CleanupReport {
        info!("Shutdown coordinator started, waiting for signal");

        let signal = self.signal_handler.wait_for_shutdown().await;
        info!(signal = ?signal, "Received shutdown signal");

        self.shutdown().await
    }

    /// 立即执行清理
    pub async fn shutdown(&mut self) -> CleanupReport {
        let start = std::time::Instant::now();
        self.phase_tx.send_replace(ShutdownPhase::Draining);

        let report = match timeout(self.shutdown_timeout, self.resource_manager.cleanup_all()).await {
            Ok(report) => report,
            Err(_) => {
                warn!(
                    timeout_secs = self.shutdown_timeout.as_secs(),
                    "Graceful shutdown timed out"
                );
                CleanupReport {
                    timed_out: self.resource_manager.count(),
                    ..Default::default()
                }
            }
        };

        self.phase_tx.send_replace(ShutdownPhase::Complete);
        info!(elapsed_ms = start.elapsed().as_millis() as u64, "Graceful shutdown complete");
        report
    }
}

/// 关闭协调器构建器
pub struct ShutdownCoordinatorBuilder {
    signal_handler: Option<SignalHandler>,
    resource_manager: Option<ResourceManager>,
    shutdown_timeout: Duration,
}

impl ShutdownCoordinatorBuilder {
    pub fn new() -> Self {
        Self {
            signal_handler: None,
            resource_manager: None,
            shutdown_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_signal_handler(mut self, handler: SignalHandler) -> Self {
        self.signal_handler = Some(handler);
        self
    }

    pub fn with_resource_manager(mut self, manager: ResourceManager) -> Self {
        self.resource_manager = Some(manager);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn build(self) -> ShutdownCoordinator {
        let (phase_tx, _) = watch::channel(ShutdownPhase::Running);
        ShutdownCoordinator {
            signal_handler: self.signal_handler.unwrap_or_default(),
            resource_manager: self.resource_manager.unwrap_or_default(),
            shutdown_timeout: self.shutdown_timeout,
            phase_tx,
        }
    }
}

impl Default for ShutdownCoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::TaskResource;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_run_cleans_up_after_trigger() {
        let (handler, _rx) = SignalHandler::new();
        let flushed = Arc::new(AtomicBool::new(false));

        let mut manager = ResourceManager::new();
        let flag = flushed.clone();
        manager.register(Arc::new(TaskResource::new("ingest-pipeline", 20, move || async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })));

        let coordinator = ShutdownCoordinator::builder()
            .with_signal_handler(handler.clone())
            .with_resource_manager(manager)
            .with_shutdown_timeout(Duration::from_secs(5))
            .build();
        let mut phase = coordinator.phase();
        assert_eq!(*phase.borrow(), ShutdownPhase::Running);

        let run = tokio::spawn(coordinator.run());
        tokio::time::sleep(Duration::from_millis(10)).await;
        handler.trigger_shutdown();

        let report = run.await.unwrap();
        assert_eq!(report.cleaned, 1);
        assert!(flushed.load(Ordering::SeqCst));

        phase.changed().await.ok();
        assert_eq!(*phase.borrow(), ShutdownPhase::Complete);
    }

    #[tokio::test]
    async fn test_overall_timeout() {
        let mut manager = ResourceManager::new();
        manager.register(Arc::new(TaskResource::new("stuck", 1, || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })));

        let mut coordinator = ShutdownCoordinator::builder()
            .with_resource_manager(manager)
            .with_shutdown_timeout(Duration::from_millis(20))
            .build();

        let report = coordinator.shutdown().await;
        assert_eq!(report.timed_out, 1);
        assert_eq!(*coordinator.phase().borrow(), ShutdownPhase::Complete);
    }
}
