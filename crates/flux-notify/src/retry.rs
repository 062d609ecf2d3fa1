use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 投递重试策略：指数退避 `base * 2^(n-1)`，封顶 `max_backoff`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_backoff_secs: u64,

    /// 总尝试次数（含首次发送）
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// 第 `attempt` 次失败后的等待时间
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay).min(Duration::from_secs(self.max_backoff_secs))
    }

    /// 已失败 `failures` 次后是否还能再试
    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_backoff_secs: 60,
            max_attempts: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
        assert_eq!(policy.backoff(7), Duration::from_secs(60));
        assert_eq!(policy.backoff(100), Duration::from_secs(60));
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
    }
}
