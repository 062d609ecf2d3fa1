use chrono::{DateTime, Utc};
use dashmap::DashMap;
use flux_types::Alert;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// 等待持续时间满足的告警
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAlert {
    pub rule_id: String,
    pub since: DateTime<Utc>,
    pub value: f64,
}

/// 指纹对应的活动状态
#[derive(Debug, Clone, PartialEq)]
pub enum AlertSlot {
    Pending(PendingAlert),
    Firing(Alert),
}

impl AlertSlot {
    pub fn rule_id(&self) -> &str {
        match self {
            Self::Pending(p) => &p.rule_id,
            Self::Firing(a) => &a.rule_id,
        }
    }
}

type Slot = Arc<Mutex<Option<AlertSlot>>>;

struct SlotEntry {
    rule_id: String,
    slot: Slot,
}

/// 活动告警表：指纹 → 槽位
///
/// 每个指纹一把异步锁，不同指纹互不阻塞。槽位清空后由 [`ActiveAlerts::release`] 移除。
#[derive(Default)]
pub struct ActiveAlerts {
    slots: DashMap<String, SlotEntry>,
}

/// 持有某个指纹的独占访问
pub struct SlotGuard {
    fingerprint: String,
    slot: Slot,
    guard: OwnedMutexGuard<Option<AlertSlot>>,
}

impl SlotGuard {
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl Deref for SlotGuard {
    type Target = Option<AlertSlot>;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for SlotGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl ActiveAlerts {
    pub fn new() -> Self {
        Self::default()
    }

    /// 锁定指纹槽位，不存在时创建
    pub async fn lock(&self, fingerprint: &str, rule_id: &str) -> SlotGuard {
        loop {
            let slot = self
                .slots
                .entry(fingerprint.to_string())
                .or_insert_with(|| SlotEntry {
                    rule_id: rule_id.to_string(),
                    slot: Arc::new(Mutex::new(None)),
                })
                .slot
                .clone();

            let guard = slot.clone().lock_owned().await;

            // 等待期间槽位可能已被移除并重建
            if self.is_current(fingerprint, &slot) {
                return SlotGuard {
                    fingerprint: fingerprint.to_string(),
                    slot,
                    guard,
                };
            }
        }
    }

    /// 释放槽位，空槽位从表中移除
    pub fn release(&self, guard: SlotGuard) {
        if guard.guard.is_none() {
            self.slots
                .remove_if(&guard.fingerprint, |_, entry| Arc::ptr_eq(&entry.slot, &guard.slot));
        }
    }

    fn is_current(&self, fingerprint: &str, slot: &Slot) -> bool {
        self.slots
            .get(fingerprint)
            .map(|entry| Arc::ptr_eq(&entry.slot, slot))
            .unwrap_or(false)
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.slots.contains_key(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn fingerprints_for_rule(&self, rule_id: &str) -> Vec<String> {
        self.slots
            .iter()
            .filter(|entry| entry.rule_id == rule_id)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// 当前所有触发中的告警
    pub async fn firing(&self) -> Vec<Alert> {
        let slots: Vec<Slot> = self.slots.iter().map(|e| e.slot.clone()).collect();
        let mut alerts = Vec::new();
        for slot in slots {
            if let Some(AlertSlot::Firing(alert)) = &*slot.lock().await {
                alerts.push(alert.clone());
            }
        }
        alerts
    }

    pub async fn firing_count(&self) -> usize {
        self.firing().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux_types::{Labels, Severity};
    use std::time::Duration;

    fn alert(rule_id: &str) -> Alert {
        Alert::firing(rule_id, "high_cpu", Severity::Warning, 1.0, Labels::new(), Utc::now())
    }

    #[tokio::test]
    async fn test_slot_lifecycle() {
        let active = ActiveAlerts::new();

        let mut guard = active.lock("fp1", "r1").await;
        assert!(guard.is_none());
        *guard = Some(AlertSlot::Firing(alert("r1")));
        active.release(guard);

        assert!(active.contains("fp1"));
        assert_eq!(active.fingerprints_for_rule("r1"), vec!["fp1".to_string()]);
        assert_eq!(active.firing_count().await, 1);

        let mut guard = active.lock("fp1", "r1").await;
        assert_eq!(guard.as_ref().map(|s| s.rule_id().to_string()), Some("r1".to_string()));
        *guard = None;
        active.release(guard);
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn test_per_fingerprint_exclusion() {
        let active = Arc::new(ActiveAlerts::new());
        let held = active.lock("fp1", "r1").await;

        // 其他指纹不受影响
        let other = tokio::time::timeout(Duration::from_millis(100), active.lock("fp2", "r2")).await;
        assert!(other.is_ok());

        let waiter = {
            let active = active.clone();
            tokio::spawn(async move {
                let guard = active.lock("fp1", "r1").await;
                guard.is_some()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let mut held = held;
        *held = Some(AlertSlot::Pending(PendingAlert {
            rule_id: "r1".to_string(),
            since: Utc::now(),
            value: 1.0,
        }));
        active.release(held);

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_waiter_survives_eviction() {
        let active = Arc::new(ActiveAlerts::new());
        let held = active.lock("fp1", "r1").await;

        let waiter = {
            let active = active.clone();
            tokio::spawn(async move {
                let mut guard = active.lock("fp1", "r1").await;
                *guard = Some(AlertSlot::Firing(alert("r1")));
                active.release(guard);
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // 空槽位被移除，等待者需要在新槽位上写入
        active.release(held);
        waiter.await.unwrap();

        assert_eq!(active.firing_count().await, 1);
    }
}
