pub mod manager;
pub mod message;
pub mod notifier;
pub mod providers;
pub mod rate_limit;
pub mod retry;
pub mod store;
pub mod template;

pub use manager::NotificationManager;
pub use message::RenderedContent;
pub use notifier::ChannelAdapter;
pub use providers::{EmailAdapter, LogAdapter, SlackAdapter, SmsAdapter, WebhookAdapter};
pub use rate_limit::RateLimiter;
pub use retry::RetryPolicy;
pub use store::{DbNotificationStore, MemoryNotificationStore, NotificationStore};
pub use template::{render, NotificationTemplate, Template, TemplateRegistry};
