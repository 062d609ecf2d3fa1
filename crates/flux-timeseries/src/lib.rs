pub mod cleanup;
pub mod db;
pub mod downsample;
pub mod model;
pub mod query;
pub mod scheduler;
pub mod selector;
pub mod store;

pub use cleanup::{CleanupManager, CleanupStats};
pub use db::DbStore;
pub use downsample::{DownsampleManager, DownsamplePolicy, DownsampleStats};
pub use model::{AggregatedPoint, AggregatedSeries, AggregationType, Rollup, SeriesValue, WriteSummary};
pub use query::QueryEngine;
pub use scheduler::{run_task, ScheduledTask, TaskScheduler, TaskType};
pub use selector::{parse_duration, Selector};
pub use store::{MemoryStore, TimeSeriesStore};
