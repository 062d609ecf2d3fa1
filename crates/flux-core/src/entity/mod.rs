pub mod alert_rules;
pub mod alerts;
pub mod metric_definitions;
pub mod notifications;
pub mod rollups;
pub mod samples;

mod schema;

pub use schema::create_tables;
