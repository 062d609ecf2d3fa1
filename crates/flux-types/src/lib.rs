pub mod alert;
pub mod labels;
pub mod message;
pub mod metric;
pub mod notification;
pub mod rule;

pub use alert::{fingerprint, Alert, AlertAction, AlertStatus, Severity};
pub use labels::{labels_key, matches_filter, Labels};
pub use message::{Message, MonitorEvent};
pub use metric::{
    is_valid_label_name, is_valid_metric_name, MetricDefinition, MetricSample, MetricType, RetentionPolicy,
    SamplePoint,
};
pub use notification::{ChannelConfig, ChannelType, Notification, NotificationStatus};
pub use rule::{AlertRule, Condition, ThresholdOperator};
