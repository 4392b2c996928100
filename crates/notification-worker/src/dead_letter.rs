//! 死信路由
//!
//! 无法处理的记录原样（key、负载、原有记录头）写入死信 topic，
//! 额外附加 `dlt-*` 诊断头，方便排查后重放。

use std::sync::Arc;

use order_shared::broker::{ConsumerMessage, OutboundRecord, RecordPosition, RecordPublisher};
use order_shared::config::AppConfig;
use order_shared::error::OrderError;
use order_shared::observability::metrics;
use order_shared::retry::{RetryPolicy, retry_with_policy};
use tracing::warn;

pub const DLT_ORIGINAL_TOPIC: &str = "dlt-original-topic";
pub const DLT_ORIGINAL_PARTITION: &str = "dlt-original-partition";
pub const DLT_ORIGINAL_OFFSET: &str = "dlt-original-offset";
pub const DLT_REASON: &str = "dlt-reason";
pub const DLT_ATTEMPTS: &str = "dlt-attempts";

/// 进入死信的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterReason {
    pub code: String,
    pub message: String,
}

impl DeadLetterReason {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

pub struct DeadLetterPublisher {
    publisher: Arc<dyn RecordPublisher>,
    topic: String,
    retry: RetryPolicy,
}

impl DeadLetterPublisher {
    pub fn new(publisher: Arc<dyn RecordPublisher>, topic: impl Into<String>) -> Self {
        Self {
            publisher,
            topic: topic.into(),
            retry: RetryPolicy::default(),
        }
    }

    /// 死信 topic 与发布重试预算都取自配置
    pub fn from_config(publisher: Arc<dyn RecordPublisher>, config: &AppConfig) -> Self {
        Self::new(publisher, config.topics.orders_dlt.clone())
            .with_retry_policy(RetryPolicy::from_kafka_config(&config.kafka))
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// 构造死信记录，不做任何网络交互
    pub fn build_record(
        &self,
        record: &ConsumerMessage,
        reason: &DeadLetterReason,
        attempts: u32,
    ) -> OutboundRecord {
        let mut outbound = OutboundRecord::new(self.topic.clone(), record.payload.clone());
        outbound.key = record.key.clone();

        // HashMap 无序，排序后写入便于比对
        let mut original: Vec<_> = record
            .headers
            .iter()
            .filter(|(name, _)| !name.starts_with("dlt-"))
            .collect();
        original.sort();
        for (name, value) in original {
            outbound = outbound.with_header(name.clone(), value.clone());
        }

        outbound
            .with_header(DLT_ORIGINAL_TOPIC, record.topic.clone())
            .with_header(DLT_ORIGINAL_PARTITION, record.partition.to_string())
            .with_header(DLT_ORIGINAL_OFFSET, record.offset.to_string())
            .with_header(DLT_REASON, reason.to_string())
            .with_header(DLT_ATTEMPTS, attempts.to_string())
    }

    /// 把记录写入死信 topic，broker 确认后返回位置
    pub async fn route(
        &self,
        record: &ConsumerMessage,
        reason: &DeadLetterReason,
        attempts: u32,
    ) -> Result<RecordPosition, OrderError> {
        let outbound = self.build_record(record, reason, attempts);

        let position = retry_with_policy(
            &self.retry,
            "publish_dead_letter",
            OrderError::is_retryable,
            || self.publisher.publish(outbound.clone()),
        )
        .await?;

        metrics::record_dead_lettered(&reason.code);
        warn!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            correlation_id = ?record.correlation_id().map(|c| c.into_inner()),
            dead_letter_topic = %self.topic,
            dead_letter_offset = position.offset,
            reason = %reason,
            attempts,
            "记录已写入死信 topic"
        );
        Ok(position)
    }
}
