use dashmap::DashMap;
use flux_types::{AlertRule, Labels};

/// 计算关联键：规则显式分组优先，否则取第一个存在的关联标签
pub fn correlation_key(rule: &AlertRule, labels: &Labels, correlation_labels: &[String]) -> Option<String> {
    if let Some(group) = &rule.correlation_group {
        return Some(format!("group:{group}"));
    }
    correlation_labels
        .iter()
        .find_map(|name| labels.get(name).map(|value| format!("{name}={value}")))
}

/// 告警在事件组中的角色
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Membership {
    /// 组内首个告警，负责通知
    Leader,
    /// 被归入已有事件组，通知被抑制
    Member { leader: String },
}

#[derive(Debug, Clone)]
struct IncidentGroup {
    leader: String,
    /// 按加入顺序排列
    members: Vec<String>,
}

/// 关联索引：关联键 → 事件组（按指纹记录成员）
#[derive(Debug, Default)]
pub struct CorrelationIndex {
    groups: DashMap<String, IncidentGroup>,
}

impl CorrelationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// 加入事件组，重复加入返回已有角色
    pub fn join(&self, key: &str, fingerprint: &str) -> Membership {
        let mut group = self
            .groups
            .entry(key.to_string())
            .or_insert_with(|| IncidentGroup {
                leader: fingerprint.to_string(),
                members: Vec::new(),
            });

        if group.leader == fingerprint {
            return Membership::Leader;
        }
        if !group.members.iter().any(|m| m == fingerprint) {
            group.members.push(fingerprint.to_string());
        }
        Membership::Member {
            leader: group.leader.clone(),
        }
    }

    /// 离开事件组；领导者离开时提升最早的成员并返回其指纹
    pub fn leave(&self, key: &str, fingerprint: &str) -> Option<String> {
        let mut promoted = None;
        self.groups.remove_if_mut(key, |_, group| {
            if group.leader == fingerprint {
                if group.members.is_empty() {
                    return true;
                }
                let next = group.members.remove(0);
                group.leader = next.clone();
                promoted = Some(next);
            } else {
                group.members.retain(|m| m != fingerprint);
            }
            false
        });
        promoted
    }

    pub fn leader(&self, key: &str) -> Option<String> {
        self.groups.get(key).map(|g| g.leader.clone())
    }

    pub fn members(&self, key: &str) -> Vec<String> {
        self.groups
            .get(key)
            .map(|g| g.members.clone())
            .unwrap_or_default()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}
