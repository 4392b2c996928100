//! Kafka 基础设施封装
//!
//! 将 rdkafka 的底层 API 适配为 `broker` 模块定义的 trait：
//! - `KafkaProducer` 实现 `RecordPublisher`，负责带 key 和记录头的追加写入
//! - `KafkaConsumer` 拆分为 `KafkaRecordSource`（拉取 + 分区分配事件）和
//!   `KafkaOffsetCommitter`（手动提交位点），关闭自动提交，位点只在结果落定后推进
//! - `KafkaTopicAdmin` 实现 `TopicAdmin`，用于启动时声明拓扑
//!
//! 消费端的提交顺序：librdkafka 在独立的拉取线程上触发回收回调，回调把
//! `Revoked` 事件交给消费组成员后阻塞，直到成员停止相关分区 worker 并调用
//! `partitions_released`（或等待超过收尾时限）。被回收分区的所有提交都发生在
//! 回调返回之前，新的持有者拿到分区时旧 worker 已不再处理或提交。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::{ClientContext, DefaultClientContext};
use rdkafka::config::ClientConfig;
use parking_lot::Mutex;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::{
    ConsumerMessage, OffsetCommitter, OutboundRecord, RecordPosition, RecordPublisher,
    RecordSource, SourceEvent, TopicPartition,
};
use crate::config::{ConsumerConfig, KafkaConfig};
use crate::error::OrderError;
use crate::topology::{TopicAdmin, TopicCreation, TopicDescriptor};

/// 从 rdkafka 的借用消息构造，提取并拥有所有字段
fn owned_message(msg: &BorrowedMessage<'_>) -> ConsumerMessage {
    let key = msg
        .key()
        .and_then(|k| std::str::from_utf8(k).ok())
        .map(String::from);

    let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();

    let mut headers = HashMap::new();
    if let Some(h) = msg.headers() {
        for idx in 0..h.count() {
            let header = h.get(idx);
            if let Some(value) = header.value.and_then(|v| std::str::from_utf8(v).ok()) {
                headers.insert(header.key.to_string(), value.to_string());
            }
        }
    }

    ConsumerMessage {
        topic: msg.topic().to_string(),
        partition: msg.partition(),
        offset: msg.offset(),
        key,
        payload,
        timestamp: msg.timestamp().to_millis(),
        headers,
    }
}

fn partitions_of(tpl: &TopicPartitionList) -> Vec<TopicPartition> {
    tpl.elements()
        .iter()
        .map(|e| TopicPartition::new(e.topic(), e.partition()))
        .collect()
}

// ---------------------------------------------------------------------------
// KafkaProducer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 生产者
///
/// `acks=all` + 幂等生产者：librdkafka 内部重试不会打乱同一分区内的顺序，
/// 也不会产生重复写入。`FutureProducer` 内部是 Arc 包装的，Clone 成本很低。
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
    delivery_timeout: Duration,
    metadata_timeout: Duration,
}

impl KafkaProducer {
    pub fn new(config: &KafkaConfig) -> Result<Self, OrderError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| OrderError::Kafka(format!("创建生产者失败: {e}")))?;

        info!(brokers = %config.brokers, "Kafka 生产者已初始化");
        Ok(Self {
            producer,
            delivery_timeout: config.message_timeout(),
            metadata_timeout: config.operation_timeout(),
        })
    }
}

#[async_trait]
impl RecordPublisher for KafkaProducer {
    async fn publish(&self, record: OutboundRecord) -> Result<RecordPosition, OrderError> {
        let mut headers = OwnedHeaders::new();
        for (name, value) in &record.headers {
            headers = headers.insert(Header {
                key: name.as_str(),
                value: Some(value.as_str()),
            });
        }

        let mut future_record = FutureRecord::to(&record.topic)
            .payload(&record.payload)
            .headers(headers);
        if let Some(key) = &record.key {
            future_record = future_record.key(key.as_str());
        }

        let delivery = self
            .producer
            .send(future_record, self.delivery_timeout)
            .await
            .map_err(|(e, _)| OrderError::Publish {
                topic: record.topic.clone(),
                reason: e.to_string(),
            })?;

        debug!(
            topic = %record.topic,
            key = ?record.key,
            partition = delivery.partition,
            offset = delivery.offset,
            "记录已写入"
        );
        Ok(RecordPosition {
            partition: delivery.partition,
            offset: delivery.offset,
        })
    }

    async fn health_check(&self) -> Result<(), OrderError> {
        let producer = self.producer.clone();
        let timeout = self.metadata_timeout;
        tokio::task::spawn_blocking(move || producer.client().fetch_metadata(None, timeout))
            .await
            .map_err(|e| OrderError::Internal(format!("元数据查询任务异常: {e}")))??;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// GroupContext 分区分配回调
// ---------------------------------------------------------------------------

/// 拉取线程与消费组成员之间的队列容量，队列满时拉取线程等待
const FETCH_QUEUE_CAPACITY: usize = 1024;

/// 消费组上下文
///
/// librdkafka 在拉取线程上同步触发分配/回收回调。回收回调在这里阻塞，
/// 直到消费组成员确认被回收分区的 worker 已收尾，或超过 `drain_timeout`。
pub struct GroupContext {
    events: mpsc::Sender<SourceEvent>,
    released: Mutex<std_mpsc::Receiver<Vec<TopicPartition>>>,
    drain_timeout: Duration,
}

impl GroupContext {
    /// 把回收事件交给消费组成员并等待确认，返回是否在时限内收到确认
    fn await_drain(&self, partitions: Vec<TopicPartition>) -> bool {
        // 运行时内部（例如消费者在异步任务中被释放）不能阻塞
        if self.events.is_closed() || tokio::runtime::Handle::try_current().is_ok() {
            return false;
        }

        let released = self.released.lock();
        // 丢弃上一次超时后迟到的确认
        while released.try_recv().is_ok() {}

        if self.events.blocking_send(SourceEvent::Revoked(partitions.clone())).is_err() {
            return false;
        }
        match released.recv_timeout(self.drain_timeout) {
            Ok(_) => {
                debug!(?partitions, "被回收分区已收尾");
                true
            }
            Err(_) => {
                warn!(
                    ?partitions,
                    timeout_ms = self.drain_timeout.as_millis() as u64,
                    "等待分区收尾超时，继续回收"
                );
                false
            }
        }
    }
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(tpl) = rebalance {
            let partitions = partitions_of(tpl);
            info!(?partitions, "分区即将被回收");
            self.await_drain(partitions);
        }
    }

    fn post_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                let partitions = partitions_of(tpl);
                info!(?partitions, "分区已分配");
                if !self.events.is_closed() && tokio::runtime::Handle::try_current().is_err() {
                    let _ = self.events.blocking_send(SourceEvent::Assigned(partitions));
                }
            }
            Rebalance::Error(e) => warn!(error = %e, "消费组再均衡出错"),
            Rebalance::Revoke(_) => {}
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        if let Err(e) = result {
            warn!(error = %e, partitions = ?partitions_of(offsets), "位点提交失败");
        }
    }
}

type GroupConsumer = BaseConsumer<GroupContext>;

// ---------------------------------------------------------------------------
// KafkaConsumer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 消费者
///
/// 关闭自动提交：位点只在记录的处理结果（成功或已写入死信）落定后才由
/// `KafkaOffsetCommitter` 显式提交，进程在提交前崩溃只会导致重复投递。
pub struct KafkaConsumer {
    consumer: Arc<GroupConsumer>,
    events_tx: mpsc::Sender<SourceEvent>,
    events: mpsc::Receiver<SourceEvent>,
    released: std_mpsc::Sender<Vec<TopicPartition>>,
    poll_interval: Duration,
}

impl KafkaConsumer {
    /// 回收回调最多等待 `shutdown_grace + poll_timeout`：
    /// 成员在下一次拉取时看到事件，再用宽限期停止 worker
    pub fn new(
        config: &KafkaConfig,
        group_id: &str,
        consumer_config: &ConsumerConfig,
    ) -> Result<Self, OrderError> {
        let (events_tx, events) = mpsc::channel(FETCH_QUEUE_CAPACITY);
        let (released, released_rx) = std_mpsc::channel();
        let context = GroupContext {
            events: events_tx.clone(),
            released: Mutex::new(released_rx),
            drain_timeout: consumer_config.shutdown_grace() + consumer_config.poll_timeout(),
        };

        let consumer: GroupConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", group_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .create_with_context(context)
            .map_err(|e| OrderError::Kafka(format!("创建消费者失败: {e}")))?;

        info!(brokers = %config.brokers, group_id, "Kafka 消费者已初始化");
        Ok(Self {
            consumer: Arc::new(consumer),
            events_tx,
            events,
            released,
            poll_interval: consumer_config.poll_timeout(),
        })
    }

    /// 订阅指定的 topic 列表
    pub fn subscribe(&self, topics: &[&str]) -> Result<(), OrderError> {
        self.consumer
            .subscribe(topics)
            .map_err(|e| OrderError::Kafka(format!("订阅 topic 失败: {e}")))?;

        info!(?topics, "已订阅 Kafka topics");
        Ok(())
    }

    /// 拆分为记录来源与位点提交器，二者共享同一个底层消费者
    ///
    /// 同时启动拉取线程：记录与分配/回收事件按 librdkafka 交付的顺序进入同一个队列。
    pub fn split(self) -> Result<(KafkaRecordSource, KafkaOffsetCommitter), OrderError> {
        let running = Arc::new(AtomicBool::new(true));
        let fetcher = spawn_fetch_loop(
            Arc::clone(&self.consumer),
            self.events_tx,
            Arc::clone(&running),
            self.poll_interval,
        )?;

        let committer = KafkaOffsetCommitter {
            consumer: Arc::clone(&self.consumer),
        };
        let source = KafkaRecordSource {
            consumer: self.consumer,
            events: self.events,
            released: self.released,
            running,
            fetcher: Some(fetcher),
        };
        Ok((source, committer))
    }
}

/// 拉取线程：驱动 librdkafka 的 poll，再均衡回调也在这个线程上执行
fn spawn_fetch_loop(
    consumer: Arc<GroupConsumer>,
    events: mpsc::Sender<SourceEvent>,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
) -> Result<JoinHandle<()>, OrderError> {
    std::thread::Builder::new()
        .name("kafka-fetch".to_string())
        .spawn(move || {
            while running.load(Ordering::Acquire) {
                match consumer.poll(poll_interval) {
                    None => {}
                    Some(Ok(message)) => {
                        let msg = owned_message(&message);
                        if events.blocking_send(SourceEvent::Record(msg)).is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => warn!(error = %e, "拉取失败，稍后重试"),
                }
            }
            debug!("拉取线程已退出");
        })
        .map_err(|e| OrderError::Internal(format!("启动拉取线程失败: {e}")))
}

/// 基于 rdkafka 的记录来源
pub struct KafkaRecordSource {
    consumer: Arc<GroupConsumer>,
    events: mpsc::Receiver<SourceEvent>,
    released: std_mpsc::Sender<Vec<TopicPartition>>,
    running: Arc<AtomicBool>,
    fetcher: Option<JoinHandle<()>>,
}

#[async_trait]
impl RecordSource for KafkaRecordSource {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<SourceEvent>, OrderError> {
        match tokio::time::timeout(timeout, self.events.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(event)) => Ok(Some(event)),
            Ok(None) => Err(OrderError::Kafka("拉取线程已退出".to_string())),
        }
    }

    async fn partitions_released(
        &mut self,
        partitions: &[TopicPartition],
    ) -> Result<(), OrderError> {
        // 回收回调已超时返回时没有等待方，确认在下一次回收前被丢弃
        self.released
            .send(partitions.to_vec())
            .map_err(|_| OrderError::Internal("再均衡回调已释放".to_string()))
    }

    async fn close(&mut self) -> Result<(), OrderError> {
        self.running.store(false, Ordering::Release);
        // 关闭队列，阻塞在发送上的拉取线程随即返回
        self.events.close();
        if let Some(fetcher) = self.fetcher.take() {
            tokio::task::spawn_blocking(move || fetcher.join())
                .await
                .map_err(|e| OrderError::Internal(format!("拉取线程回收异常: {e}")))?
                .map_err(|_| OrderError::Internal("拉取线程异常退出".to_string()))?;
        }
        self.consumer.unsubscribe();
        info!("已退订并释放分区分配");
        Ok(())
    }
}

/// 基于 rdkafka 的位点提交器
#[derive(Clone)]
pub struct KafkaOffsetCommitter {
    consumer: Arc<GroupConsumer>,
}

#[async_trait]
impl OffsetCommitter for KafkaOffsetCommitter {
    async fn commit(&self, partition: &TopicPartition, next_offset: i64) -> Result<(), OrderError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&partition.topic, partition.partition, Offset::Offset(next_offset))?;

        // 同步提交会阻塞当前线程直到 broker 确认
        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await
            .map_err(|e| OrderError::Internal(format!("位点提交任务异常: {e}")))??;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// KafkaTopicAdmin
// ---------------------------------------------------------------------------

/// 基于 rdkafka Admin API 的拓扑管理
pub struct KafkaTopicAdmin {
    admin: Arc<AdminClient<DefaultClientContext>>,
    timeout: Duration,
}

impl KafkaTopicAdmin {
    pub fn new(config: &KafkaConfig) -> Result<Self, OrderError> {
        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .create()
            .map_err(|e| OrderError::Kafka(format!("创建 Admin 客户端失败: {e}")))?;

        Ok(Self {
            admin: Arc::new(admin),
            timeout: config.operation_timeout(),
        })
    }
}

#[async_trait]
impl TopicAdmin for KafkaTopicAdmin {
    async fn create_topic(&self, topic: &TopicDescriptor) -> Result<TopicCreation, OrderError> {
        let new_topic = NewTopic::new(
            &topic.name,
            topic.partitions,
            TopicReplication::Fixed(topic.replicas),
        );
        let options = AdminOptions::new().operation_timeout(Some(self.timeout));

        let results = self
            .admin
            .create_topics(&[new_topic], &options)
            .await
            .map_err(|e| OrderError::Provisioning {
                topic: topic.name.clone(),
                reason: e.to_string(),
            })?;

        let mut creation = TopicCreation::Created;
        for result in results {
            match result {
                Ok(_) => {}
                Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    creation = TopicCreation::AlreadyExists;
                }
                Err((name, code)) => {
                    return Err(OrderError::Provisioning {
                        topic: name,
                        reason: code.to_string(),
                    });
                }
            }
        }
        Ok(creation)
    }

    async fn describe_topic(&self, name: &str) -> Result<Option<TopicDescriptor>, OrderError> {
        let admin = Arc::clone(&self.admin);
        let timeout = self.timeout;
        let topic_name = name.to_string();

        tokio::task::spawn_blocking(move || {
            let metadata = admin
                .inner()
                .fetch_metadata(Some(&topic_name), timeout)
                .map_err(|e| OrderError::Provisioning {
                    topic: topic_name.clone(),
                    reason: format!("查询元数据失败: {e}"),
                })?;

            let descriptor = metadata
                .topics()
                .iter()
                .find(|t| t.name() == topic_name && t.error().is_none())
                .filter(|t| !t.partitions().is_empty())
                .map(|t| {
                    let replicas = t
                        .partitions()
                        .first()
                        .map(|p| p.replicas().len() as i32)
                        .unwrap_or_default();
                    TopicDescriptor::new(t.name(), t.partitions().len() as i32, replicas)
                });
            Ok(descriptor)
        })
        .await
        .map_err(|e| OrderError::Internal(format!("元数据查询任务异常: {e}")))?
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------
