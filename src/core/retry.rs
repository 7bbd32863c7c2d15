//! 重试退避：显式状态机，脱离网络即可单测

use std::time::Duration;

/// 退避策略：`base_delay * 2^attempt`，重试次数有上限
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// 最大重试次数（不含首次尝试）
    pub max_retries: u32,
    /// 重试基础延迟
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    /// 第 attempt 次失败后的下一次延迟；重试耗尽返回 None
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        Some(self.base_delay * 2u32.saturating_pow(attempt))
    }
}

/// 单个动作的重试状态
#[derive(Debug, Default)]
pub struct RetryState {
    attempt: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// 记录一次失败，返回重试前应等待的延迟；耗尽返回 None
    pub fn record_failure(&mut self, policy: &RetryPolicy) -> Option<Duration> {
        let delay = policy.next_delay(self.attempt);
        self.attempt += 1;
        delay
    }
}
