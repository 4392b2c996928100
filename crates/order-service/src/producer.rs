//! 订单事件生产者
//!
//! 把订单包装为 Pending 事件，铸造关联 ID，以 orderId 为 key 追加到主 topic。
//! 同一订单的事件总是落在同一分区，分区内有序。

use std::sync::Arc;

use order_shared::broker::{OutboundRecord, RecordPublisher};
use order_shared::config::AppConfig;
use order_shared::error::OrderError;
use order_shared::events::{CORRELATION_ID_HEADER, CorrelationId, Order, OrderEvent};
use order_shared::observability::metrics;
use order_shared::retry::{RetryPolicy, retry_with_policy};
use tracing::{info, instrument};

pub struct OrderProducer {
    publisher: Arc<dyn RecordPublisher>,
    topic: String,
    retry: RetryPolicy,
}

impl OrderProducer {
    pub fn new(publisher: Arc<dyn RecordPublisher>, topic: impl Into<String>) -> Self {
        Self {
            publisher,
            topic: topic.into(),
            retry: RetryPolicy::default(),
        }
    }

    /// 主 topic 与发布重试预算都取自配置
    pub fn from_config(publisher: Arc<dyn RecordPublisher>, config: &AppConfig) -> Self {
        Self::new(publisher, config.topics.orders.clone())
            .with_retry_policy(RetryPolicy::from_kafka_config(&config.kafka))
    }

    /// 覆盖发布重试预算
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// 发布订单的 Pending 事件，broker 确认写入后返回本次调用的关联 ID
    ///
    /// 校验失败在任何网络交互之前返回 `Validation`；
    /// 重试预算耗尽后返回 `Publish`，不会静默丢弃。
    #[instrument(skip(self, order), fields(order_id = %order.order_id, topic = %self.topic))]
    pub async fn publish(&self, order: &Order) -> Result<CorrelationId, OrderError> {
        order.ensure_valid()?;

        let event = OrderEvent::pending(order.clone());
        let correlation_id = CorrelationId::generate();
        let record = OutboundRecord::new(self.topic.clone(), event.to_bytes()?)
            .with_key(event.partition_key())
            .with_header(CORRELATION_ID_HEADER, correlation_id.as_str());

        let position = retry_with_policy(
            &self.retry,
            "publish_order_event",
            OrderError::is_retryable,
            || self.publisher.publish(record.clone()),
        )
        .await
        .map_err(|e| match e {
            publish @ OrderError::Publish { .. } => publish,
            other => OrderError::Publish {
                topic: self.topic.clone(),
                reason: other.to_string(),
            },
        })?;

        metrics::record_event_published(&self.topic);
        info!(
            correlation_id = %correlation_id,
            partition = position.partition,
            offset = position.offset,
            "订单事件已发布"
        );
        Ok(correlation_id)
    }

    /// broker 元数据是否可达
    pub async fn health_check(&self) -> Result<(), OrderError> {
        self.publisher.health_check().await
    }
}
