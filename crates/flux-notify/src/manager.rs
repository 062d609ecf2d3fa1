use crate::message::RenderedContent;
use crate::notifier::ChannelAdapter;
use crate::providers::{EmailAdapter, LogAdapter, SlackAdapter, SmsAdapter, WebhookAdapter};
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;
use crate::store::NotificationStore;
use crate::template::{NotificationTemplate, TemplateRegistry};
use chrono::Utc;
use flux_core::{FluxError, Result, SharedEventBus};
use flux_types::{Alert, AlertAction, ChannelConfig, ChannelType, MonitorEvent, Notification, NotificationStatus};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

struct Inner {
    adapters: RwLock<HashMap<ChannelType, Arc<dyn ChannelAdapter>>>,
    channels: RwLock<BTreeMap<String, ChannelConfig>>,
    templates: RwLock<TemplateRegistry>,
    rate_limiter: RateLimiter,
    retry: RetryPolicy,
    store: Arc<dyn NotificationStore>,
    bus: SharedEventBus,
}

/// 通知管理器
///
/// 限流 → 模板渲染 → 适配器发送 → 记录。发送失败在后台按退避重试，
/// 重试耗尽后发布 `DeliveryFailed` 事件。
#[derive(Clone)]
pub struct NotificationManager {
    inner: Arc<Inner>,
}

impl NotificationManager {
    pub fn new(store: Arc<dyn NotificationStore>, bus: SharedEventBus, retry: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                adapters: RwLock::new(HashMap::new()),
                channels: RwLock::new(BTreeMap::new()),
                templates: RwLock::new(TemplateRegistry::new()),
                rate_limiter: RateLimiter::default(),
                retry,
                store,
                bus,
            }),
        }
    }

    /// 注册内置的全部适配器
    pub async fn register_default_adapters(&self) {
        self.register_adapter(Arc::new(WebhookAdapter::new())).await;
        self.register_adapter(Arc::new(SlackAdapter::new())).await;
        self.register_adapter(Arc::new(EmailAdapter::new())).await;
        self.register_adapter(Arc::new(SmsAdapter::new())).await;
        self.register_adapter(Arc::new(LogAdapter)).await;
    }

    /// 注册适配器，同类型的旧适配器被替换
    pub async fn register_adapter(&self, adapter: Arc<dyn ChannelAdapter>) {
        info!("Registered notification adapter: {}", adapter.name());
        self.inner
            .adapters
            .write()
            .await
            .insert(adapter.channel_type(), adapter);
    }

    pub async fn register_template(&self, channel_type: ChannelType, action: AlertAction, template: NotificationTemplate) {
        self.inner
            .templates
            .write()
            .await
            .register(channel_type, action, template);
    }

    pub async fn add_channel(&self, channel: ChannelConfig) {
        debug!(channel = %channel.id, channel_type = %channel.channel_type, "Channel configured");
        self.inner
            .channels
            .write()
            .await
            .insert(channel.id.clone(), channel);
    }

    pub async fn channels(&self) -> Vec<ChannelConfig> {
        self.inner.channels.read().await.values().cloned().collect()
    }

    /// 解析规则的渠道列表：空列表表示所有启用的渠道
    pub async fn resolve_channels(&self, ids: &[String]) -> Vec<ChannelConfig> {
        let channels = self.inner.channels.read().await;
        if ids.is_empty() {
            return channels.values().filter(|c| c.enabled).cloned().collect();
        }

        ids.iter()
            .filter_map(|id| match channels.get(id) {
                Some(c) if c.enabled => Some(c.clone()),
                Some(_) => None,
                None => {
                    warn!(channel = %id, "Unknown notification channel");
                    None
                }
            })
            .collect()
    }

    /// 向规则配置的全部渠道发送，单个渠道失败只记录日志
    pub async fn notify(&self, alert: &Alert, action: AlertAction, channel_ids: &[String]) -> Vec<Notification> {
        let mut sent = Vec::new();
        for channel in self.resolve_channels(channel_ids).await {
            match self.send(&channel, alert, action).await {
                Ok(notification) => sent.push(notification),
                Err(e) => error!(
                    channel = %channel.id,
                    fingerprint = %alert.fingerprint,
                    error = %e,
                    "Failed to record notification"
                ),
            }
        }
        sent
    }

    /// 发送一条通知
    ///
    /// 返回首次尝试后的记录；失败的投递在后台继续重试。
    pub async fn send(&self, channel: &ChannelConfig, alert: &Alert, action: AlertAction) -> Result<Notification> {
        let channel_label = channel.channel_type.to_string();
        let mut notification = Notification::pending(&alert.id, channel, action);

        if !self
            .inner
            .rate_limiter
            .try_acquire(&channel.id, channel.rate_limit_per_minute, Utc::now())
        {
            notification.status = NotificationStatus::Suppressed;
            flux_metrics::record_notification_rate_limited(&channel_label);
            warn!(
                channel = %channel.id,
                fingerprint = %alert.fingerprint,
                limit = channel.rate_limit_per_minute,
                "Notification rate limited"
            );
            self.inner.store.save(&notification).await?;
            return Ok(notification);
        }

        let content = self
            .inner
            .templates
            .read()
            .await
            .lookup(channel.channel_type, action)
            .render(alert);

        let retry_needed = match self.deliver(channel, &content).await {
            Ok(()) => {
                notification.mark_sent(Utc::now());
                flux_metrics::record_notification_sent(&channel_label);
                info!(
                    channel = %channel.id,
                    fingerprint = %alert.fingerprint,
                    action = %action,
                    "Notification sent"
                );
                false
            }
            Err(e) => {
                notification.mark_failed(e.to_string(), Utc::now());
                flux_metrics::record_notification_failed(&channel_label);
                warn!(
                    channel = %channel.id,
                    fingerprint = %alert.fingerprint,
                    attempt = notification.retry_count,
                    error = %e,
                    "Notification delivery failed"
                );
                let retry = e.is_retryable() && self.inner.retry.should_retry(notification.retry_count);
                if !retry {
                    self.give_up(&notification);
                }
                retry
            }
        };

        self.inner.store.save(&notification).await?;
        if retry_needed {
            self.schedule_retry(channel.clone(), content, notification.clone());
        }
        Ok(notification)
    }

    /// 记录送达回执
    pub async fn mark_delivered(&self, id: &str) -> Result<Notification> {
        let mut notification = self
            .inner
            .store
            .get(id)
            .await?
            .ok_or_else(|| FluxError::NotFound(format!("notification {id}")))?;

        notification.status = NotificationStatus::Delivered;
        self.inner.store.save(&notification).await?;
        Ok(notification)
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<Notification>> {
        self.inner.store.list(limit).await
    }

    pub async fn for_alert(&self, alert_id: &str) -> Result<Vec<Notification>> {
        self.inner.store.list_for_alert(alert_id).await
    }

    async fn deliver(&self, channel: &ChannelConfig, content: &RenderedContent) -> Result<()> {
        let adapter = self
            .inner
            .adapters
            .read()
            .await
            .get(&channel.channel_type)
            .cloned()
            .ok_or_else(|| {
                FluxError::Config(format!("no adapter registered for channel type {}", channel.channel_type))
            })?;
        adapter.send(channel, content).await
    }

    fn schedule_retry(&self, channel: ChannelConfig, content: RenderedContent, mut notification: Notification) {
        let manager = self.clone();
        let channel_label = channel.channel_type.to_string();

        tokio::spawn(async move {
            loop {
                let delay = manager.inner.retry.backoff(notification.retry_count);
                tokio::time::sleep(delay).await;

                match manager.deliver(&channel, &content).await {
                    Ok(()) => {
                        notification.mark_sent(Utc::now());
                        flux_metrics::record_notification_sent(&channel_label);
                        info!(
                            channel = %channel.id,
                            notification_id = %notification.id,
                            retries = notification.retry_count,
                            "Notification sent after retry"
                        );
                        manager.persist(&notification).await;
                        return;
                    }
                    Err(e) => {
                        notification.mark_failed(e.to_string(), Utc::now());
                        flux_metrics::record_notification_failed(&channel_label);
                        warn!(
                            channel = %channel.id,
                            notification_id = %notification.id,
                            attempt = notification.retry_count,
                            error = %e,
                            "Notification retry failed"
                        );
                        manager.persist(&notification).await;

                        if !(e.is_retryable() && manager.inner.retry.should_retry(notification.retry_count)) {
                            manager.give_up(&notification);
                            return;
                        }
                    }
                }
            }
        });
    }

    async fn persist(&self, notification: &Notification) {
        if let Err(e) = self.inner.store.save(notification).await {
            error!(notification_id = %notification.id, error = %e, "Failed to save notification");
        }
    }

    fn give_up(&self, notification: &Notification) {
        flux_metrics::record_delivery_failure();
        error!(
            notification_id = %notification.id,
            alert_id = %notification.alert_id,
            channel = %notification.channel_id,
            attempts = notification.retry_count,
            error = notification.last_error.as_deref().unwrap_or(""),
            "Notification delivery failed permanently"
        );
        self.inner.bus.emit(MonitorEvent::DeliveryFailed {
            notification: notification.clone(),
        });
    }
}
