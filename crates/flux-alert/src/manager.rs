use crate::catalog::{RuleCatalog, RuleSpec};
use crate::correlation::{correlation_key, CorrelationIndex, Membership};
use crate::evaluator::AlertEvaluator;
use crate::state::{ActiveAlerts, AlertSlot, PendingAlert};
use crate::store::{AlertFilter, AlertStore};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use flux_core::{Result, SharedEventBus};
use flux_notify::NotificationManager;
use flux_types::{fingerprint, Alert, AlertAction, AlertRule, Labels, Message, MonitorEvent, Notification};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// 告警配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    pub evaluation_interval_secs: u64,

    /// 单条规则评估超时（毫秒）
    pub rule_timeout_ms: u64,

    /// 按顺序取第一个存在的标签作为关联键
    pub correlation_labels: Vec<String>,
}

impl AlertingConfig {
    pub fn evaluation_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.evaluation_interval_secs.max(1))
    }

    pub fn rule_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.rule_timeout_ms.max(1))
    }
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_secs: 30,
            rule_timeout_ms: 10_000,
            correlation_labels: vec!["service".to_string()],
        }
    }
}

/// 告警通知出口
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn dispatch(&self, alert: &Alert, action: AlertAction, channels: &[String]);
}

#[async_trait]
impl AlertNotifier for NotificationManager {
    async fn dispatch(&self, alert: &Alert, action: AlertAction, channels: &[String]) {
        self.notify(alert, action, channels).await;
    }
}

/// 一轮评估的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleStats {
    pub rules: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub panicked: usize,
}

struct Inner {
    catalog: RuleCatalog,
    evaluator: AlertEvaluator,
    active: Arc<ActiveAlerts>,
    correlation: CorrelationIndex,
    store: Arc<dyn AlertStore>,
    notifier: Arc<dyn AlertNotifier>,
    bus: SharedEventBus,
    config: AlertingConfig,
    delivery_failures: DashMap<String, u32>,

    /// 每个指纹最近一次提交的通知任务
    dispatches: DashMap<String, JoinHandle<()>>,
}

/// 关联组成员资格，未提交前释放时自动退出分组
struct PendingMembership<'a> {
    index: &'a CorrelationIndex,
    key: String,
    fingerprint: String,
    committed: bool,
}

impl PendingMembership<'_> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PendingMembership<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.index.leave(&self.key, &self.fingerprint);
        }
    }
}

/// 告警管理器
///
/// 每轮对启用的规则并发评估，按指纹维护 pending → firing → resolved 状态。
#[derive(Clone)]
pub struct AlertManager {
    inner: Arc<Inner>,
}

impl AlertManager {
    pub fn new(
        catalog: RuleCatalog,
        evaluator: AlertEvaluator,
        active: Arc<ActiveAlerts>,
        store: Arc<dyn AlertStore>,
        notifier: Arc<dyn AlertNotifier>,
        bus: SharedEventBus,
        config: AlertingConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                catalog,
                evaluator,
                active,
                correlation: CorrelationIndex::new(),
                store,
                notifier,
                bus,
                config,
                delivery_failures: DashMap::new(),
                dispatches: DashMap::new(),
            }),
        }
    }

    pub fn catalog(&self) -> &RuleCatalog {
        &self.inner.catalog
    }

    pub fn active_alerts(&self) -> &Arc<ActiveAlerts> {
        &self.inner.active
    }

    pub fn correlation(&self) -> &CorrelationIndex {
        &self.inner.correlation
    }

    pub async fn alerts(&self, filter: &AlertFilter) -> Result<Vec<Alert>> {
        self.inner.store.list(filter).await
    }

    /// 告警的最终投递失败次数
    pub fn delivery_failures(&self, alert_id: &str) -> u32 {
        self.inner
            .delivery_failures
            .get(alert_id)
            .map(|n| *n)
            .unwrap_or(0)
    }

    /// 删除规则并解决其活动告警
    pub async fn delete_rule(&self, id: &str, now: DateTime<Utc>) -> Result<AlertRule> {
        let rule = self.inner.catalog.delete(id).await?;
        self.retire_alerts(&rule, now).await?;
        Ok(rule)
    }

    /// 更新规则
    ///
    /// 停用规则或修改名称、查询后，旧定义产生的活动告警立即解决。
    pub async fn update_rule(&self, id: &str, spec: RuleSpec, now: DateTime<Utc>) -> Result<AlertRule> {
        let previous = self.inner.catalog.get(id).await?;
        let updated = self.inner.catalog.update(id, spec).await?;

        let redefined = previous.name != updated.name || previous.query != updated.query;
        if !updated.enabled || redefined {
            self.retire_alerts(&previous, now).await?;
        }
        Ok(updated)
    }

    async fn retire_alerts(&self, rule: &AlertRule, now: DateTime<Utc>) -> Result<()> {
        for fp in self.inner.active.fingerprints_for_rule(&rule.id) {
            self.resolve_fingerprint(rule, &fp, now).await?;
        }
        Ok(())
    }

    /// 等待已提交的通知全部发送完成
    pub async fn flush_dispatches(&self) {
        let fingerprints: Vec<String> = self.inner.dispatches.iter().map(|e| e.key().clone()).collect();
        for fp in fingerprints {
            if let Some((_, handle)) = self.inner.dispatches.remove(&fp) {
                if let Err(e) = handle.await {
                    error!(fingerprint = %fp, error = %e, "Notification dispatch task failed");
                }
            }
        }
    }

    /// 在评估路径之外发送通知，同一指纹按提交顺序投递
    fn spawn_dispatch(&self, alert: Alert, action: AlertAction, channels: Vec<String>) {
        let notifier = self.inner.notifier.clone();
        let fingerprint = alert.fingerprint.clone();
        let previous = self.inner.dispatches.remove(&fingerprint).map(|(_, handle)| handle);

        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            notifier.dispatch(&alert, action, &channels).await;
        });
        self.inner.dispatches.insert(fingerprint, handle);
    }

    /// 执行一轮评估
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> CycleStats {
        let started = Instant::now();
        let rules = match self.inner.catalog.enabled_rules().await {
            Ok(rules) => rules,
            Err(e) => {
                error!(error = %e, "Failed to load alert rules");
                return CycleStats::default();
            }
        };

        let mut stats = CycleStats {
            rules: rules.len(),
            ..Default::default()
        };
        let rule_timeout = self.inner.config.rule_timeout();

        let mut tasks = JoinSet::new();
        for rule in rules {
            let manager = self.clone();
            tasks.spawn(async move {
                let result = tokio::time::timeout(rule_timeout, manager.evaluate_rule(&rule, now)).await;
                (rule, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(Ok(())))) => stats.succeeded += 1,
                Ok((rule, Ok(Err(e)))) => {
                    stats.failed += 1;
                    flux_metrics::record_rule_evaluation_failure("error");
                    warn!(rule_id = %rule.id, rule = %rule.name, error = %e, "Rule evaluation failed");
                }
                Ok((rule, Err(_))) => {
                    stats.timed_out += 1;
                    flux_metrics::record_rule_evaluation_failure("timeout");
                    warn!(
                        rule_id = %rule.id,
                        rule = %rule.name,
                        timeout_ms = rule_timeout.as_millis() as u64,
                        "Rule evaluation timed out"
                    );
                }
                Err(e) => {
                    stats.panicked += 1;
                    flux_metrics::record_rule_evaluation_failure("panic");
                    error!(error = %e, "Rule evaluation task panicked");
                }
            }
        }

        self.inner.dispatches.retain(|_, handle| !handle.is_finished());
        flux_metrics::record_evaluation_duration(started.elapsed().as_secs_f64());
        flux_metrics::set_alerts_firing(self.inner.active.firing_count().await);
        debug!(
            rules = stats.rules,
            failed = stats.failed,
            timed_out = stats.timed_out,
            "Evaluation cycle completed"
        );
        stats
    }

    /// 评估单条规则并推进其告警状态
    pub async fn evaluate_rule(&self, rule: &AlertRule, now: DateTime<Utc>) -> Result<()> {
        flux_metrics::record_rule_evaluation();
        let evaluations = self.inner.evaluator.evaluate(rule, now).await?;

        let mut seen = HashSet::new();
        let mut first_error = None;
        for evaluation in evaluations {
            let mut labels = evaluation.labels;
            labels.extend(rule.labels.clone());
            let fp = fingerprint(&rule.name, &labels);
            if !seen.insert(fp.clone()) {
                continue;
            }

            if let Err(e) = self
                .apply(rule, &fp, labels, evaluation.value, evaluation.should_alert, now)
                .await
            {
                warn!(rule_id = %rule.id, fingerprint = %fp, error = %e, "Failed to update alert");
                first_error.get_or_insert(e);
            }
        }

        // 序列消失的告警视为恢复
        for fp in self.inner.active.fingerprints_for_rule(&rule.id) {
            if !seen.contains(&fp) {
                if let Err(e) = self.resolve_fingerprint(rule, &fp, now).await {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn apply(
        &self,
        rule: &AlertRule,
        fp: &str,
        labels: Labels,
        value: f64,
        should_alert: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut slot = self.inner.active.lock(fp, &rule.id).await;
        let required = Duration::seconds(rule.duration_secs as i64);

        // 槽位在成功后才替换，评估被取消时保持原状态
        let (next, result) = match (should_alert, (*slot).clone()) {
            (true, None) if rule.duration_secs == 0 => match self.fire(rule, labels, value, now).await {
                Ok(alert) => (Some(AlertSlot::Firing(alert)), Ok(())),
                Err(e) => (None, Err(e)),
            },
            (true, None) => {
                debug!(rule_id = %rule.id, fingerprint = %fp, "Alert pending");
                let pending = PendingAlert {
                    rule_id: rule.id.clone(),
                    since: now,
                    value,
                };
                (Some(AlertSlot::Pending(pending)), Ok(()))
            }
            (true, Some(AlertSlot::Pending(pending))) => {
                if now - pending.since >= required {
                    match self.fire(rule, labels, value, now).await {
                        Ok(alert) => (Some(AlertSlot::Firing(alert)), Ok(())),
                        Err(e) => (Some(AlertSlot::Pending(pending)), Err(e)),
                    }
                } else {
                    (Some(AlertSlot::Pending(PendingAlert { value, ..pending })), Ok(()))
                }
            }
            (true, Some(AlertSlot::Firing(alert))) => match self.refresh(rule, alert.clone(), value, now).await {
                Ok(updated) => (Some(AlertSlot::Firing(updated)), Ok(())),
                Err(e) => (Some(AlertSlot::Firing(alert)), Err(e)),
            },
            (false, Some(AlertSlot::Firing(alert))) => match self.resolve(rule, alert.clone(), now).await {
                Ok(_) => (None, Ok(())),
                Err(e) => (Some(AlertSlot::Firing(alert)), Err(e)),
            },
            (false, Some(AlertSlot::Pending(_))) => {
                debug!(rule_id = %rule.id, fingerprint = %fp, "Pending alert cleared");
                (None, Ok(()))
            }
            (false, None) => (None, Ok(())),
        };

        *slot = next;
        self.inner.active.release(slot);
        result
    }

    async fn resolve_fingerprint(&self, rule: &AlertRule, fp: &str, now: DateTime<Utc>) -> Result<()> {
        let mut slot = self.inner.active.lock(fp, &rule.id).await;
        let result = match (*slot).clone() {
            Some(AlertSlot::Firing(alert)) => self.resolve(rule, alert, now).await.map(|_| ()),
            _ => Ok(()),
        };
        if result.is_ok() {
            *slot = None;
        }
        self.inner.active.release(slot);
        result
    }

    fn render_annotations(rule: &AlertRule, alert: &mut Alert) {
        let rendered: BTreeMap<String, String> = rule
            .annotations
            .iter()
            .map(|(key, template)| (key.clone(), flux_notify::render(template, alert)))
            .collect();
        alert.annotations = rendered;
    }

    async fn fire(&self, rule: &AlertRule, labels: Labels, value: f64, now: DateTime<Utc>) -> Result<Alert> {
        let mut alert = Alert::firing(&rule.id, &rule.name, rule.severity, value, labels, now);
        Self::render_annotations(rule, &mut alert);

        let mut membership = None;
        if let Some(key) = correlation_key(rule, &alert.labels, &self.inner.config.correlation_labels) {
            if let Membership::Member { leader } = self.inner.correlation.join(&key, &alert.fingerprint) {
                alert.suppressed = true;
                debug!(fingerprint = %alert.fingerprint, leader = %leader, key = %key, "Alert correlated");
            }
            alert.correlation_key = Some(key.clone());
            membership = Some(PendingMembership {
                index: &self.inner.correlation,
                key,
                fingerprint: alert.fingerprint.clone(),
                committed: false,
            });
        }

        // 保存失败或被取消时 membership 释放并退出分组
        self.inner.store.save(&alert).await?;
        if let Some(membership) = membership {
            membership.commit();
        }

        flux_metrics::record_alert_created();
        info!(
            rule_id = %rule.id,
            fingerprint = %alert.fingerprint,
            severity = %alert.severity,
            value = alert.value,
            suppressed = alert.suppressed,
            "Alert firing"
        );
        self.inner.bus.emit(MonitorEvent::AlertFiring { alert: alert.clone() });

        if alert.suppressed {
            flux_metrics::record_alert_suppressed();
        } else {
            self.spawn_dispatch(alert.clone(), AlertAction::Firing, rule.channels.clone());
        }
        Ok(alert)
    }

    async fn refresh(&self, rule: &AlertRule, mut alert: Alert, value: f64, now: DateTime<Utc>) -> Result<Alert> {
        alert.touch(value, now);
        Self::render_annotations(rule, &mut alert);
        self.inner.store.save(&alert).await?;
        Ok(alert)
    }

    async fn resolve(&self, rule: &AlertRule, mut alert: Alert, now: DateTime<Utc>) -> Result<Alert> {
        if !alert.resolve(now) {
            return Ok(alert);
        }
        Self::render_annotations(rule, &mut alert);
        self.inner.store.save(&alert).await?;

        if let Some(key) = &alert.correlation_key {
            if let Some(promoted) = self.inner.correlation.leave(key, &alert.fingerprint) {
                debug!(key = %key, leader = %promoted, "Incident leader promoted");
            }
        }
        self.inner.delivery_failures.remove(&alert.id);

        flux_metrics::record_alert_resolved();
        info!(
            rule_id = %rule.id,
            fingerprint = %alert.fingerprint,
            duration_secs = (now - alert.starts_at).num_seconds(),
            "Alert resolved"
        );
        self.inner.bus.emit(MonitorEvent::AlertResolved { alert: alert.clone() });

        if !alert.suppressed {
            self.spawn_dispatch(alert.clone(), AlertAction::Resolved, rule.channels.clone());
        }
        Ok(alert)
    }

    /// 记录最终投递失败，不改变告警状态
    pub fn handle_delivery_failure(&self, notification: &Notification) -> u32 {
        let mut count = self
            .inner
            .delivery_failures
            .entry(notification.alert_id.clone())
            .or_insert(0);
        *count += 1;

        warn!(
            alert_id = %notification.alert_id,
            channel = %notification.channel_id,
            attempts = notification.retry_count,
            failures = *count,
            "Alert notification could not be delivered"
        );
        *count
    }

    /// 启动评估循环与投递失败监听
    pub fn start(&self) -> AlertManagerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let events = self.inner.bus.subscribe();

        let evaluation = tokio::spawn(self.clone().evaluation_loop(shutdown_rx.clone()));
        let listener = tokio::spawn(self.clone().delivery_failure_loop(events, shutdown_rx));

        AlertManagerHandle {
            manager: self.clone(),
            shutdown_tx,
            join_handles: vec![evaluation, listener],
        }
    }

    async fn evaluation_loop(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.inner.config.evaluation_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            interval_secs = self.inner.config.evaluation_interval_secs,
            "Alert evaluation loop started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_cycle(Utc::now()).await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Alert evaluation loop stopped");
    }

    async fn delivery_failure_loop(self, mut events: broadcast::Receiver<Message>, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(Message { event: MonitorEvent::DeliveryFailed { notification }, .. }) => {
                        self.handle_delivery_failure(&notification);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Delivery failure listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

/// 告警管理器后台任务句柄
pub struct AlertManagerHandle {
    manager: AlertManager,
    shutdown_tx: watch::Sender<bool>,
    join_handles: Vec<JoinHandle<()>>,
}

impl AlertManagerHandle {
    /// 通知停止，等待当前评估与未完成的通知
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.join_handles {
            let _ = handle.await;
        }
        self.manager.flush_dispatches().await;
    }

    pub fn abort(self) {
        for handle in self.join_handles {
            handle.abort();
        }
    }
}
