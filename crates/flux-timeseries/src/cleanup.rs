use crate::store::TimeSeriesStore;
use chrono::{DateTime, Utc};
use flux_core::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// 清理统计
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupStats {
    pub metrics: usize,
    pub samples_deleted: usize,
    pub rollups_deleted: usize,
    pub execution_time_ms: i64,
    pub executed_at: DateTime<Utc>,
}

/// 清理管理器：按每个指标的保留策略删除过期数据
pub struct CleanupManager {
    store: Arc<dyn TimeSeriesStore>,
}

impl CleanupManager {
    pub fn new(store: Arc<dyn TimeSeriesStore>) -> Self {
        Self { store }
    }

    /// 执行清理任务
    pub async fn cleanup(&self, now: DateTime<Utc>) -> Result<CleanupStats> {
        let start_time = std::time::Instant::now();
        let mut stats = CleanupStats {
            metrics: 0,
            samples_deleted: 0,
            rollups_deleted: 0,
            execution_time_ms: 0,
            executed_at: now,
        };

        for definition in self.store.metrics().await? {
            stats.metrics += 1;
            let raw_cutoff = now - definition.retention.raw();
            let rollup_cutoff = now - definition.retention.downsampled();

            match self.store.delete_before(&definition.name, raw_cutoff).await {
                Ok(n) => stats.samples_deleted += n,
                Err(e) => warn!(metric = %definition.name, error = %e, "Raw retention cleanup failed"),
            }
            match self
                .store
                .delete_rollups_before(&definition.name, rollup_cutoff)
                .await
            {
                Ok(n) => stats.rollups_deleted += n,
                Err(e) => warn!(metric = %definition.name, error = %e, "Rollup retention cleanup failed"),
            }
        }

        stats.execution_time_ms = start_time.elapsed().as_millis() as i64;
        flux_metrics::record_retention_deleted(stats.samples_deleted + stats.rollups_deleted);

        info!(
            metrics = stats.metrics,
            samples_deleted = stats.samples_deleted,
            rollups_deleted = stats.rollups_deleted,
            "Cleanup completed"
        );
        Ok(stats)
    }
}
