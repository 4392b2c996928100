//! 测试环境管理

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use notification_worker::{
    ConsumerGroupMember, DeadLetterPublisher, FailurePolicy, OrderEventSink, WorkerContext,
    WorkerError,
};
use order_service::{AppState, OrderProducer, app};
use order_shared::broker::{ConsumerMessage, TopicPartition};
use order_shared::config::{ConsumerConfig, TopicsConfig};
use order_shared::memory::InMemoryBroker;
use order_shared::retry::RetryPolicy;
use order_shared::topology::{Topology, ensure_topology};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::super::helpers::ApiClient;

pub const CONSUMER_GROUP: &str = "notification-worker";

/// 测试环境
pub struct TestEnvironment {
    pub broker: InMemoryBroker,
    pub api: ApiClient,
    pub topics: TopicsConfig,
    pub consumer: ConsumerConfig,
}

impl TestEnvironment {
    /// 声明拓扑并构建网关
    pub async fn setup() -> Result<Self> {
        let broker = InMemoryBroker::new();
        let topics = TopicsConfig::default();
        ensure_topology(&broker, &Topology::from_config(&topics)).await?;

        let producer = OrderProducer::new(Arc::new(broker.clone()), topics.orders.clone());
        let api = ApiClient::new(app(AppState::new(Arc::new(producer), "order-service")));

        // 缩短轮询和退避，让测试在毫秒级完成
        let consumer = ConsumerConfig {
            max_handler_retries: 2,
            retry_initial_delay_ms: 5,
            retry_max_delay_ms: 20,
            shutdown_grace_ms: 2000,
            poll_timeout_ms: 20,
            ..Default::default()
        };

        Ok(Self {
            broker,
            api,
            topics,
            consumer,
        })
    }

    /// 以给定处理器启动一个消费组成员
    pub fn start_worker(&self, sink: Arc<dyn OrderEventSink>) -> RunningWorker {
        let ctx = WorkerContext::new(
            sink,
            Arc::new(self.broker.committer(CONSUMER_GROUP)),
            DeadLetterPublisher::new(Arc::new(self.broker.clone()), self.topics.orders_dlt.clone())
                .with_retry_policy(RetryPolicy::none()),
            FailurePolicy::from_config(&self.consumer),
            RetryPolicy::from_consumer_config(&self.consumer),
        );
        let member = ConsumerGroupMember::new(
            CONSUMER_GROUP,
            Box::new(self.broker.subscribe(CONSUMER_GROUP, &self.topics.orders)),
            ctx,
            &self.consumer,
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        RunningWorker {
            shutdown,
            task: tokio::spawn(member.run(shutdown_rx)),
        }
    }

    pub fn orders(&self) -> Vec<ConsumerMessage> {
        self.broker.records(&self.topics.orders)
    }

    pub fn dead_letters(&self) -> Vec<ConsumerMessage> {
        self.broker.records(&self.topics.orders_dlt)
    }

    pub fn committed(&self, partition: &TopicPartition) -> Option<i64> {
        self.broker.committed_offset(CONSUMER_GROUP, partition)
    }

    /// 所有已发布的订单记录都已提交位点
    pub fn all_committed(&self) -> bool {
        self.orders()
            .iter()
            .all(|m| self.committed(&m.topic_partition()).is_some_and(|c| c > m.offset))
    }

    /// 轮询等待条件成立
    pub async fn wait_for(&self, what: &str, mut condition: impl FnMut() -> bool) -> Result<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            if tokio::time::Instant::now() >= deadline {
                bail!("等待超时: {what}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }
}

/// 运行中的消费组成员
pub struct RunningWorker {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<(), WorkerError>>,
}

impl RunningWorker {
    /// 发送关闭信号并等待排空
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.task.await??;
        Ok(())
    }
}
