use crate::cleanup::CleanupManager;
use crate::downsample::{DownsampleManager, DownsamplePolicy};
use crate::store::TimeSeriesStore;
use chrono::Utc;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

/// 任务类型
#[derive(Debug, Clone)]
pub enum TaskType {
    /// 降采样任务
    Downsample(DownsamplePolicy),
    /// 保留期清理任务
    Retention,
}

/// 调度任务
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    /// 任务名称
    pub name: String,

    /// Cron 表达式（含秒）
    pub cron_expression: String,

    /// 任务类型
    pub task_type: TaskType,

    /// 是否启用
    pub enabled: bool,
}

impl ScheduledTask {
    pub fn new(name: String, cron_expression: String, task_type: TaskType) -> Self {
        Self {
            name,
            cron_expression,
            task_type,
            enabled: true,
        }
    }

    /// 每小时第 5 分钟执行降采样
    pub fn hourly_downsample(policy: DownsamplePolicy) -> Self {
        Self::new(
            "Hourly Downsample".to_string(),
            "0 5 * * * *".to_string(),
            TaskType::Downsample(policy),
        )
    }

    /// 每天凌晨 1 点执行保留期清理
    pub fn daily_retention() -> Self {
        Self::new(
            "Daily Retention".to_string(),
            "0 0 1 * * *".to_string(),
            TaskType::Retention,
        )
    }
}

/// 执行一次任务，失败只记录日志
pub async fn run_task(store: Arc<dyn TimeSeriesStore>, task_name: &str, task_type: &TaskType) {
    info!(task = %task_name, "Executing scheduled task");

    match task_type {
        TaskType::Downsample(policy) => {
            let manager = DownsampleManager::new(store, policy.clone());
            match manager.run(Utc::now()).await {
                Ok(stats) => {
                    info!(
                        task = %task_name,
                        rollups = stats.rollups_written,
                        removed = stats.samples_removed,
                        "Downsample task completed"
                    );
                }
                Err(e) => {
                    error!(task = %task_name, error = %e, "Downsample task failed");
                }
            }
        }
        TaskType::Retention => {
            let manager = CleanupManager::new(store);
            match manager.cleanup(Utc::now()).await {
                Ok(stats) => {
                    info!(
                        task = %task_name,
                        samples_deleted = stats.samples_deleted,
                        rollups_deleted = stats.rollups_deleted,
                        "Retention task completed"
                    );
                }
                Err(e) => {
                    error!(task = %task_name, error = %e, "Retention task failed");
                }
            }
        }
    }
}

/// 任务调度器
pub struct TaskScheduler {
    scheduler: JobScheduler,
    store: Arc<dyn TimeSeriesStore>,
}

impl TaskScheduler {
    /// 创建新的任务调度器
    pub async fn new(store: Arc<dyn TimeSeriesStore>) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;

        Ok(Self { scheduler, store })
    }

    /// 添加任务
    pub async fn add_task(&self, task: ScheduledTask) -> anyhow::Result<uuid::Uuid> {
        if !task.enabled {
            info!(task_name = %task.name, "Task is disabled, skipping");
            return Ok(uuid::Uuid::nil());
        }

        let store = self.store.clone();
        let task_name = task.name.clone();
        let task_type = task.task_type.clone();

        let job = Job::new_async(task.cron_expression.as_str(), move |_uuid, _l| {
            let store = store.clone();
            let task_name = task_name.clone();
            let task_type = task_type.clone();

            Box::pin(async move {
                run_task(store, &task_name, &task_type).await;
            })
        })?;

        let job_id = self.scheduler.add(job).await?;

        info!(
            task_name = %task.name,
            cron = %task.cron_expression,
            job_id = %job_id,
            "Task scheduled"
        );

        Ok(job_id)
    }

    /// 启动调度器
    pub async fn start(&mut self) -> anyhow::Result<()> {
        self.scheduler.start().await?;
        info!("Task scheduler started");
        Ok(())
    }

    /// 停止调度器
    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.scheduler.shutdown().await?;
        info!("Task scheduler stopped");
        Ok(())
    }
}
