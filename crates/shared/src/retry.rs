//! 重试策略与执行器
//!
//! 生产端用它包裹发布调用，消费端用它计算处理器瞬时失败后的退避间隔。
//! 非瞬时错误（校验失败、永久性处理失败）不重试，由 `is_retryable` 判定。

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::{ConsumerConfig, KafkaConfig};
use crate::error::OrderError;

/// 指数退避策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最大重试次数（不含首次执行）
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// 不重试，首次失败即返回
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// 发布端的重试预算，订单生产者与死信发布器共用
    pub fn from_kafka_config(config: &KafkaConfig) -> Self {
        Self {
            max_retries: config.publish_max_retries,
            initial_delay: Duration::from_millis(config.publish_retry_initial_delay_ms),
            max_delay: Duration::from_millis(config.publish_retry_max_delay_ms),
            multiplier: 2.0,
        }
    }

    /// 消费端处理器的重试预算
    pub fn from_consumer_config(config: &ConsumerConfig) -> Self {
        Self {
            max_retries: config.max_handler_retries,
            initial_delay: Duration::from_millis(config.retry_initial_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            multiplier: 2.0,
        }
    }

    /// 第 N 次重试前的等待时间（attempt 从 0 开始），不超过 max_delay
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// attempt 为已经失败的重试轮次
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// 对异步操作应用重试策略，仅在 `is_retryable` 返回 true 时重试
pub async fn retry_with_policy<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: impl Fn(&OrderError) -> bool,
    mut operation: F,
) -> Result<T, OrderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, OrderError>>,
{
    let mut attempt: u32 = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(operation = operation_name, attempt, "操作在重试后成功");
                }
                return Ok(value);
            }
            Err(err) if !is_retryable(&err) => {
                warn!(operation = operation_name, error = %err, "操作失败且不可重试");
                return Err(err);
            }
            Err(err) if !policy.should_retry(attempt) => {
                warn!(
                    operation = operation_name,
                    attempt,
                    max_retries = policy.max_retries,
                    error = %err,
                    "已达最大重试次数，放弃重试"
                );
                return Err(err);
            }
            Err(err) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "操作失败，将在退避后重试"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
