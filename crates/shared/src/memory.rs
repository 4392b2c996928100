//! 进程内日志代理
//!
//! 实现 `broker` 与 `topology` 中的全部 trait，语义与 Kafka 对齐：
//! - 按 key 哈希选择分区，同一 key 始终落在同一分区，分区内严格有序
//! - 位点按消费组记录，重新分配后从已提交位点继续，未提交的记录会被重复投递
//! - 副本数超过 broker 数量时拒绝创建 topic
//!
//! 用于单元测试与端到端测试，不需要外部 Kafka。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::broker::{
    ConsumerMessage, OffsetCommitter, OutboundRecord, RecordPosition, RecordPublisher,
    RecordSource, SourceEvent, TopicPartition,
};
use crate::error::OrderError;
use crate::topology::{TopicAdmin, TopicCreation, TopicDescriptor};

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<String>,
    payload: Vec<u8>,
    headers: Vec<(String, String)>,
    timestamp: i64,
}

#[derive(Debug)]
struct TopicLog {
    descriptor: TopicDescriptor,
    partitions: Vec<Vec<StoredRecord>>,
    /// 无 key 记录的轮询游标
    round_robin: usize,
}

impl TopicLog {
    fn message(&self, partition: i32, offset: i64) -> Option<ConsumerMessage> {
        let record = self
            .partitions
            .get(partition as usize)?
            .get(offset as usize)?;
        Some(ConsumerMessage {
            topic: self.descriptor.name.clone(),
            partition,
            offset,
            key: record.key.clone(),
            payload: record.payload.clone(),
            timestamp: Some(record.timestamp),
            headers: record.headers.iter().cloned().collect(),
        })
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    brokers: i32,
    topics: HashMap<String, TopicLog>,
    /// (group, topic-partition) -> 下一条待消费的 offset
    committed: HashMap<(String, TopicPartition), i64>,
    /// 每个消费组的分配代数，递增即触发再均衡
    generations: HashMap<String, u64>,
    failing_publishes: u32,
    publish_attempts: u64,
}

/// FNV-1a，保证同一 key 在进程重启后仍映射到同一分区
fn partition_for_key(key: &str, partitions: usize) -> usize {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in key.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash as usize % partitions
}

/// 进程内日志代理，Clone 后共享同一份状态
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// 单 broker 集群
    pub fn new() -> Self {
        Self::with_brokers(1)
    }

    pub fn with_brokers(brokers: i32) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                brokers,
                ..Default::default()
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    /// 接下来的 `count` 次发布返回瞬时错误，模拟 broker 短暂不可用
    pub fn fail_next_publishes(&self, count: u32) {
        self.state.lock().failing_publishes = count;
    }

    /// 累计发布尝试次数（含失败的）
    pub fn publish_attempts(&self) -> u64 {
        self.state.lock().publish_attempts
    }

    /// topic 中的全部记录，按分区、offset 排列
    pub fn records(&self, topic: &str) -> Vec<ConsumerMessage> {
        let state = self.state.lock();
        let Some(log) = state.topics.get(topic) else {
            return Vec::new();
        };
        (0..log.partitions.len() as i32)
            .flat_map(|p| {
                (0..log.partitions[p as usize].len() as i64).filter_map(move |o| log.message(p, o))
            })
            .collect()
    }

    pub fn partition_records(&self, topic: &str, partition: i32) -> Vec<ConsumerMessage> {
        self.records(topic)
            .into_iter()
            .filter(|m| m.partition == partition)
            .collect()
    }

    pub fn committed_offset(&self, group: &str, partition: &TopicPartition) -> Option<i64> {
        self.state
            .lock()
            .committed
            .get(&(group.to_string(), partition.clone()))
            .copied()
    }

    /// 以消费组成员身份订阅 topic；每个消费组只建模一个成员，它获得全部分区
    pub fn subscribe(&self, group: &str, topic: &str) -> InMemorySource {
        let generation = self
            .state
            .lock()
            .generations
            .get(group)
            .copied()
            .unwrap_or_default();
        InMemorySource {
            broker: self.clone(),
            group: group.to_string(),
            topic: topic.to_string(),
            generation,
            assigned: None,
            positions: HashMap::new(),
            cursor: 0,
            closed: false,
        }
    }

    pub fn committer(&self, group: &str) -> InMemoryCommitter {
        InMemoryCommitter {
            broker: self.clone(),
            group: group.to_string(),
        }
    }

    /// 触发消费组再均衡：成员先收到回收事件，再按已提交位点重新分配
    pub fn trigger_rebalance(&self, group: &str) {
        *self
            .state
            .lock()
            .generations
            .entry(group.to_string())
            .or_default() += 1;
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl RecordPublisher for InMemoryBroker {
    async fn publish(&self, record: OutboundRecord) -> Result<RecordPosition, OrderError> {
        let position = {
            let mut state = self.state.lock();
            state.publish_attempts += 1;

            if state.failing_publishes > 0 {
                state.failing_publishes -= 1;
                return Err(OrderError::Publish {
                    topic: record.topic,
                    reason: "broker 暂时不可用".to_string(),
                });
            }

            let Some(log) = state.topics.get_mut(&record.topic) else {
                return Err(OrderError::Publish {
                    reason: format!("topic {} 不存在", record.topic),
                    topic: record.topic,
                });
            };

            let partition = match &record.key {
                Some(key) => partition_for_key(key, log.partitions.len()),
                None => {
                    log.round_robin = (log.round_robin + 1) % log.partitions.len();
                    log.round_robin
                }
            };
            let records = &mut log.partitions[partition];
            records.push(StoredRecord {
                key: record.key,
                payload: record.payload,
                headers: record.headers,
                timestamp: chrono::Utc::now().timestamp_millis(),
            });

            RecordPosition {
                partition: partition as i32,
                offset: records.len() as i64 - 1,
            }
        };

        self.notify.notify_waiters();
        Ok(position)
    }
}

#[async_trait]
impl TopicAdmin for InMemoryBroker {
    async fn create_topic(&self, topic: &TopicDescriptor) -> Result<TopicCreation, OrderError> {
        let mut state = self.state.lock();

        if topic.replicas > state.brokers {
            return Err(OrderError::Provisioning {
                topic: topic.name.clone(),
                reason: format!(
                    "replication factor {} > brokers {}",
                    topic.replicas, state.brokers
                ),
            });
        }
        if state.topics.contains_key(&topic.name) {
            return Ok(TopicCreation::AlreadyExists);
        }

        state.topics.insert(
            topic.name.clone(),
            TopicLog {
                descriptor: topic.clone(),
                partitions: vec![Vec::new(); topic.partitions.max(1) as usize],
                round_robin: 0,
            },
        );
        Ok(TopicCreation::Created)
    }

    async fn describe_topic(&self, name: &str) -> Result<Option<TopicDescriptor>, OrderError> {
        Ok(self
            .state
            .lock()
            .topics
            .get(name)
            .map(|log| log.descriptor.clone()))
    }
}

/// 进程内消费组成员的记录来源
pub struct InMemorySource {
    broker: InMemoryBroker,
    group: String,
    topic: String,
    generation: u64,
    assigned: Option<Vec<TopicPartition>>,
    /// 分区 -> 下一条要投递的 offset
    positions: HashMap<i32, i64>,
    cursor: usize,
    closed: bool,
}

impl InMemorySource {
    fn next_event(&mut self) -> Result<Option<SourceEvent>, OrderError> {
        let state = self.broker.state.lock();
        let current = state.generations.get(&self.group).copied().unwrap_or_default();
        if current != self.generation {
            self.generation = current;
            if let Some(revoked) = self.assigned.take() {
                self.positions.clear();
                return Ok(Some(SourceEvent::Revoked(revoked)));
            }
        }

        let Some(log) = state.topics.get(&self.topic) else {
            return Err(OrderError::Kafka(format!("订阅的 topic {} 不存在", self.topic)));
        };

        if self.assigned.is_none() {
            let partitions: Vec<TopicPartition> = (0..log.partitions.len() as i32)
                .map(|p| TopicPartition::new(self.topic.clone(), p))
                .collect();
            for tp in &partitions {
                let committed = state
                    .committed
                    .get(&(self.group.clone(), tp.clone()))
                    .copied()
                    .unwrap_or_default();
                self.positions.insert(tp.partition, committed);
            }
            self.assigned = Some(partitions.clone());
            return Ok(Some(SourceEvent::Assigned(partitions)));
        }

        let assigned = self.assigned.as_deref().unwrap_or_default();
        // 分区间轮询，避免某个分区饿死其他分区
        let count = assigned.len();
        for step in 0..count {
            let index = (self.cursor + step) % count;
            let partition = assigned[index].partition;
            let offset = self.positions.get(&partition).copied().unwrap_or_default();
            if let Some(msg) = log.message(partition, offset) {
                self.positions.insert(partition, offset + 1);
                self.cursor = (index + 1) % count;
                return Ok(Some(SourceEvent::Record(msg)));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl RecordSource for InMemorySource {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<SourceEvent>, OrderError> {
        if self.closed {
            return Ok(None);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let notify = Arc::clone(&self.broker.notify);
            // 先注册等待再检查状态，避免错过检查与等待之间的唤醒
            let notified = notify.notified();

            if let Some(event) = self.next_event()? {
                return Ok(Some(event));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn close(&mut self) -> Result<(), OrderError> {
        self.closed = true;
        self.assigned = None;
        Ok(())
    }
}

/// 进程内位点提交器
#[derive(Clone)]
pub struct InMemoryCommitter {
    broker: InMemoryBroker,
    group: String,
}

#[async_trait]
impl OffsetCommitter for InMemoryCommitter {
    async fn commit(&self, partition: &TopicPartition, next_offset: i64) -> Result<(), OrderError> {
        let mut state = self.broker.state.lock();
        let entry = state
            .committed
            .entry((self.group.clone(), partition.clone()))
            .or_default();
        // 位点只前进不后退
        *entry = (*entry).max(next_offset);
        Ok(())
    }
}
