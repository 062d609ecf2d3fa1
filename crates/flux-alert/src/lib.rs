pub mod anomaly;
pub mod catalog;
pub mod correlation;
pub mod evaluator;
pub mod manager;
pub mod state;
pub mod store;

pub use anomaly::{AnomalyConfig, AnomalyDetector, AnomalyModel, AnomalyResult};
pub use catalog::{DbRuleStore, MemoryRuleStore, RuleCatalog, RuleSpec, RuleStore};
pub use correlation::{correlation_key, CorrelationIndex, Membership};
pub use evaluator::{AlertEvaluator, SeriesEvaluation};
pub use manager::{AlertManager, AlertManagerHandle, AlertNotifier, AlertingConfig, CycleStats};
pub use state::{ActiveAlerts, AlertSlot, PendingAlert, SlotGuard};
pub use store::{AlertFilter, AlertStore, DbAlertStore, MemoryAlertStore};
