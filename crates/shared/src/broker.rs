//! 日志代理抽象
//!
//! 生产端和消费端只依赖这里的 trait：`RecordPublisher` 负责追加记录，
//! `RecordSource` 负责拉取记录与分区分配事件，`OffsetCommitter` 负责推进消费组位点。
//! `kafka` 模块基于 rdkafka 实现它们，`memory` 模块提供进程内实现供测试使用。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::OrderError;
use crate::events::{CORRELATION_ID_HEADER, CorrelationId};

// ---------------------------------------------------------------------------
// TopicPartition
// ---------------------------------------------------------------------------

/// topic 内的一个分区，是并行与排序的最小单位
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl std::fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

// ---------------------------------------------------------------------------
// ConsumerMessage
// ---------------------------------------------------------------------------

/// 消费到的记录的统一表示
///
/// 拥有全部字段的所有权，可以安全地跨 await 点传递给分区 worker。
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

impl ConsumerMessage {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// 生产端写入的关联 ID，旧记录可能没有
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.header(CORRELATION_ID_HEADER).map(CorrelationId::from)
    }
}

// ---------------------------------------------------------------------------
// OutboundRecord
// ---------------------------------------------------------------------------

/// 待追加到日志的记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl OutboundRecord {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            payload,
            headers: Vec::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// broker 确认写入后的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordPosition {
    pub partition: i32,
    pub offset: i64,
}

// ---------------------------------------------------------------------------
// SourceEvent
// ---------------------------------------------------------------------------

/// 一次拉取的结果
///
/// 分区分配由 broker 侧的组协调器决定，消费者只对分配/回收做出反应。
#[derive(Debug, Clone)]
pub enum SourceEvent {
    Assigned(Vec<TopicPartition>),
    Revoked(Vec<TopicPartition>),
    Record(ConsumerMessage),
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// 记录发布者
#[async_trait]
pub trait RecordPublisher: Send + Sync {
    /// 追加一条记录，返回 broker 确认后的位置
    async fn publish(&self, record: OutboundRecord) -> Result<RecordPosition, OrderError>;

    /// broker 是否可达，用于就绪探针
    async fn health_check(&self) -> Result<(), OrderError> {
        Ok(())
    }
}

/// 消费组成员的记录来源
#[async_trait]
pub trait RecordSource: Send {
    /// 等待下一个事件，超时内没有任何事件时返回 `None`
    async fn poll(&mut self, timeout: Duration) -> Result<Option<SourceEvent>, OrderError>;

    /// 确认 `Revoked` 中的分区已收尾：worker 已停止，不会再有提交
    ///
    /// 回收要等这个确认才能完成的实现（如 Kafka）在这里放行再均衡。
    async fn partitions_released(
        &mut self,
        _partitions: &[TopicPartition],
    ) -> Result<(), OrderError> {
        Ok(())
    }

    /// 停止拉取并释放分区分配
    async fn close(&mut self) -> Result<(), OrderError>;
}

/// 消费组位点提交
#[async_trait]
pub trait OffsetCommitter: Send + Sync {
    /// 提交下一条待消费记录的位点（即已处理记录的 offset + 1）
    async fn commit(&self, partition: &TopicPartition, next_offset: i64) -> Result<(), OrderError>;
}
