use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Cleanup failed: {0}")]
    CleanupFailed(String),
}

/// 需要在退出前释放的组件
#[async_trait]
pub trait Resource: Send + Sync {
    async fn cleanup(&self) -> Result<(), ResourceError>;

    fn name(&self) -> &str;

    /// 清理优先级（数字越小越先清理）
    fn priority(&self) -> u32 {
        100
    }
}

type CleanupFuture = Pin<Box<dyn Future<Output = Result<(), ResourceError>> + Send>>;
type CleanupFn = Box<dyn FnOnce() -> CleanupFuture + Send>;

/// 以一次性闭包实现的资源，用于后台任务句柄
///
/// 重复清理是空操作。
pub struct TaskResource {
    name: String,
    priority: u32,
    cleanup: Mutex<Option<CleanupFn>>,
}

impl TaskResource {
    pub fn new<F, Fut>(name: impl Into<String>, priority: u32, cleanup: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ResourceError>> + Send + 'static,
    {
        let cleanup: CleanupFn = Box::new(move || Box::pin(cleanup()));
        Self {
            name: name.into(),
            priority,
            cleanup: Mutex::new(Some(cleanup)),
        }
    }
}

#[async_trait]
impl Resource for TaskResource {
    async fn cleanup(&self) -> Result<(), ResourceError> {
        let cleanup = match self.cleanup.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => return Err(ResourceError::CleanupFailed("cleanup lock poisoned".to_string())),
        };
        match cleanup {
            Some(cleanup) => cleanup().await,
            None => Ok(()),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u32 {
        self.priority
    }
}

/// 清理结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub cleaned: usize,
    pub failed: usize,
    pub timed_out: usize,
}

/// 资源管理器
pub struct ResourceManager {
    resources: Vec<Arc<dyn Resource>>,
    resource_timeout: Duration,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self {
            resources: Vec::new(),
            resource_timeout: Duration::from_secs(30),
        }
    }

    /// 单个资源的清理超时
    pub fn with_resource_timeout(mut self, resource_timeout: Duration) -> Self {
        self.resource_timeout = resource_timeout;
        self
    }

    pub fn register(&mut self, resource: Arc<dyn Resource>) {
        info!(resource = %resource.name(), priority = resource.priority(), "Registering resource");
        self.resources.push(resource);
    }

    /// 按优先级依次清理，单个失败或超时不影响后续资源
    pub async fn cleanup_all(&mut self) -> CleanupReport {
        self.resources.sort_by_key(|r| r.priority());
        info!(count = self.resources.len(), "Cleaning up resources");

        let mut report = CleanupReport::default();
        for resource in &self.resources {
            match timeout(self.resource_timeout, resource.cleanup()).await {
                Ok(Ok(())) => {
                    report.cleaned += 1;
                    info!(resource = %resource.name(), "Resource cleaned up");
                }
                Ok(Err(e)) => {
                    report.failed += 1;
                    error!(resource = %resource.name(), error = %e, "Resource cleanup failed");
                }
                Err(_) => {
                    report.timed_out += 1;
                    warn!(
                        resource = %resource.name(),
                        timeout_secs = self.resource_timeout.as_secs(),
                        "Resource cleanup timed out"
                    );
                }
            }
        }

        info!(
            cleaned = report.cleaned,
            failed = report.failed,
            timed_out = report.timed_out,
            "Resource cleanup complete"
        );
        report
    }

    pub fn count(&self) -> usize {
        self.resources.len()
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}
