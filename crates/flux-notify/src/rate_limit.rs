use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;

/// 按渠道的滑动窗口限流器
///
/// 检查与记录在同一个分片锁内完成，同一渠道的并发发送不会超出限额。
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    sends: DashMap<String, VecDeque<DateTime<Utc>>>,
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            sends: DashMap::new(),
        }
    }

    /// 尝试占用一次发送额度，`limit == 0` 表示不限流
    pub fn try_acquire(&self, channel_id: &str, limit: u32, now: DateTime<Utc>) -> bool {
        if limit == 0 {
            return true;
        }

        let mut sends = self.sends.entry(channel_id.to_string()).or_default();
        let cutoff = now - self.window;
        while sends.front().is_some_and(|t| *t <= cutoff) {
            sends.pop_front();
        }

        if sends.len() >= limit as usize {
            return false;
        }
        sends.push_back(now);
        true
    }

    /// 当前窗口内剩余额度
    pub fn remaining(&self, channel_id: &str, limit: u32, now: DateTime<Utc>) -> u32 {
        let cutoff = now - self.window;
        let used = self
            .sends
            .get(channel_id)
            .map(|sends| sends.iter().filter(|t| **t > cutoff).count())
            .unwrap_or(0);
        limit.saturating_sub(used as u32)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Duration::seconds(60))
    }
}
