//! 重试策略与全局调用限速
//!
//! 远程执行器与面板客户端共用，所有调用点按同一套规则重试

use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

use crate::error::{FleetError, FleetResult};

/// 两次尝试之间的延迟增长方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    Linear,
    Exponential,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: delay,
            backoff: Backoff::Fixed,
        }
    }

    /// 只尝试一次，不等待
    pub fn once() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// 第 `attempt` 次（从 1 开始）失败后、下一次尝试前的延迟
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let n = attempt.max(1);
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Linear => self.base_delay.saturating_mul(n),
            Backoff::Exponential => self
                .base_delay
                .saturating_mul(2u32.saturating_pow(n - 1)),
        }
    }

    /// 反复执行 `op`，直到成功、次数用尽或 `retryable` 判定错误不可重试
    ///
    /// 返回最终结果与实际尝试次数
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        retryable: impl Fn(&FleetError) -> bool,
        mut op: F,
    ) -> (FleetResult<T>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = FleetResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return (Ok(value), attempt),
                Err(e) if attempt < self.max_attempts && retryable(&e) => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        operation = %label,
                        attempt = attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, will retry"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return (Err(e), attempt),
            }
        }
    }
}

impl Default for RetryPolicy {
    /// 3 次尝试，固定间隔 5 秒
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(5))
    }
}

/// 所有调用方共享的最小调用间隔
///
/// 等待期间持有锁，并发的 worker 依次排队
pub struct RateLimiter {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub async fn acquire(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.min_interval;
            let now = Instant::now();
            if ready_at > now {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}
