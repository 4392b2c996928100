//! 消费组成员
//!
//! 每个被分配的分区由一个独立的 worker 顺序处理，分区之间并发。
//! 单条记录的生命周期：
//!
//! ```text
//! Polling -> Processing -> Committing -> Polling
//! Processing -> DeadLettering -> Committing      （处理失败）
//! Polling -> Idle                                （分区回收 / 关闭）
//! ```
//!
//! 位点只在结果落定（处理成功或死信写入确认）后提交。提交前崩溃只会导致重复投递，
//! 不会丢失记录；下游处理器需要幂等。
//!
//! 分区回收时先停止对应 worker（宽限期内等待手头记录落定，超时则中止），
//! 再通过 `RecordSource::partitions_released` 放行回收，之后该分区不会再有提交。
//! 处理器 panic 按永久失败处理：记录进入死信，分区继续消费。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use order_shared::broker::{ConsumerMessage, OffsetCommitter, RecordSource, SourceEvent, TopicPartition};
use order_shared::config::ConsumerConfig;
use order_shared::events::OrderEvent;
use order_shared::observability::metrics;
use order_shared::retry::RetryPolicy;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::dead_letter::{DeadLetterPublisher, DeadLetterReason};
use crate::error::{Result, WorkerError};
use crate::policy::{Disposition, FailurePolicy};
use crate::sink::{DeliveryContext, HandleOutcome, OrderEventSink};

/// 分区 worker 的待处理队列容量，队列满时拉取循环等待
const PARTITION_QUEUE_CAPACITY: usize = 256;

/// 处理器 panic 时写入死信的失败码
pub const HANDLER_PANIC_CODE: &str = "HANDLER_PANIC";

/// worker 被中止时一并中止正在执行的处理器调用
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// 分区处理状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Idle,
    Polling,
    Processing,
    DeadLettering,
    Committing,
}

/// 单条记录的最终结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// 处理成功并已提交
    Handled,
    /// 已写入死信并已提交
    DeadLettered,
    /// 收到停止信号，未提交，等待重新投递
    Abandoned,
}

impl RecordOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Handled => "success",
            Self::DeadLettered => "dead_lettered",
            Self::Abandoned => "abandoned",
        }
    }
}

// ---------------------------------------------------------------------------
// WorkerContext
// ---------------------------------------------------------------------------

/// 所有分区 worker 共享的只读依赖
pub struct WorkerContext {
    pub sink: Arc<dyn OrderEventSink>,
    pub committer: Arc<dyn OffsetCommitter>,
    pub dead_letter: DeadLetterPublisher,
    pub policy: FailurePolicy,
    /// 瞬时失败的重试预算与退避
    pub retry: RetryPolicy,
}

impl WorkerContext {
    pub fn new(
        sink: Arc<dyn OrderEventSink>,
        committer: Arc<dyn OffsetCommitter>,
        dead_letter: DeadLetterPublisher,
        policy: FailurePolicy,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            sink,
            committer,
            dead_letter,
            policy,
            retry,
        }
    }
}

// ---------------------------------------------------------------------------
// PartitionWorker
// ---------------------------------------------------------------------------

/// 单个分区的顺序处理器
pub struct PartitionWorker {
    partition: TopicPartition,
    state: PartitionState,
    ctx: Arc<WorkerContext>,
    stop: watch::Receiver<bool>,
}

impl PartitionWorker {
    pub fn new(partition: TopicPartition, ctx: Arc<WorkerContext>, stop: watch::Receiver<bool>) -> Self {
        Self {
            partition,
            state: PartitionState::Idle,
            ctx,
            stop,
        }
    }

    pub fn state(&self) -> PartitionState {
        self.state
    }

    fn transition(&mut self, next: PartitionState) {
        if self.state != next {
            debug!(partition = %self.partition, from = ?self.state, to = ?next, "分区状态迁移");
            self.state = next;
        }
    }

    fn stopping(&self) -> bool {
        *self.stop.borrow()
    }

    /// 等待 `delay`；期间收到停止信号返回 true
    async fn pause(&mut self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            changed = self.stop.changed() => changed.is_err() || *self.stop.borrow(),
            _ = tokio::time::sleep(delay) => false,
        }
    }

    /// 按顺序处理队列中的记录，直到队列关闭或收到停止信号
    pub async fn run(mut self, mut records: mpsc::Receiver<ConsumerMessage>) {
        self.transition(PartitionState::Polling);
        info!(partition = %self.partition, "分区 worker 已启动");

        loop {
            let next = tokio::select! {
                biased;
                changed = self.stop.changed() => {
                    if changed.is_err() || *self.stop.borrow() {
                        None
                    } else {
                        continue;
                    }
                }
                msg = records.recv() => msg,
            };

            let Some(msg) = next else { break };
            if self.process_record(&msg).await == RecordOutcome::Abandoned {
                break;
            }
        }

        self.transition(PartitionState::Idle);
        info!(partition = %self.partition, "分区 worker 已停止");
    }

    /// 处理一条记录：调用处理器，瞬时失败原地重试，无法处理的写入死信，最后提交位点
    pub async fn process_record(&mut self, msg: &ConsumerMessage) -> RecordOutcome {
        if self.stopping() {
            return self.abandon(msg, "分区已停止");
        }

        let started = std::time::Instant::now();
        self.transition(PartitionState::Processing);

        let correlation_id = msg.correlation_id();
        let decoded = OrderEvent::from_bytes(&msg.payload);
        if let Err(e) = &decoded {
            warn!(
                partition = %self.partition,
                offset = msg.offset,
                correlation_id = ?correlation_id.as_ref().map(|c| c.as_str()),
                error = %e,
                "记录无法解码"
            );
        }

        let mut attempt: u32 = 0;
        let dead_letter = loop {
            attempt += 1;

            let disposition = match &decoded {
                Err(e) => self.ctx.policy.classify_error(e),
                Ok(event) => {
                    let delivery = DeliveryContext {
                        correlation_id: correlation_id.clone(),
                        partition: self.partition.clone(),
                        offset: msg.offset,
                        attempt,
                    };
                    let outcome = self.invoke_sink(event, delivery).await;
                    self.ctx.policy.classify(&outcome)
                }
            };

            match disposition {
                Disposition::Commit => break None,
                Disposition::DeadLetter { code, message } => {
                    break Some(DeadLetterReason::new(code, message));
                }
                Disposition::Retry { code, message } if self.ctx.retry.should_retry(attempt - 1) => {
                    let delay = self.ctx.retry.delay_for_attempt(attempt - 1);
                    warn!(
                        partition = %self.partition,
                        offset = msg.offset,
                        attempt,
                        code = %code,
                        error = %message,
                        delay_ms = delay.as_millis() as u64,
                        "处理失败，退避后重试"
                    );
                    if self.pause(delay).await {
                        return self.abandon(msg, "重试等待期间收到停止信号");
                    }
                }
                Disposition::Retry { code, message } => {
                    warn!(
                        partition = %self.partition,
                        offset = msg.offset,
                        attempt,
                        code = %code,
                        "重试次数耗尽，升级为死信"
                    );
                    break Some(DeadLetterReason::new(
                        code,
                        format!("{message} (重试 {} 次后仍失败)", attempt - 1),
                    ));
                }
            }
        };

        let outcome = match dead_letter {
            None => RecordOutcome::Handled,
            Some(reason) => {
                self.transition(PartitionState::DeadLettering);
                if !self.route_to_dead_letter(msg, &reason, attempt).await {
                    return self.abandon(msg, "死信写入期间收到停止信号");
                }
                RecordOutcome::DeadLettered
            }
        };

        self.commit(msg).await;
        metrics::record_event_consumed(outcome.as_str(), started.elapsed().as_secs_f64());
        info!(
            partition = %self.partition,
            offset = msg.offset,
            correlation_id = ?correlation_id.as_ref().map(|c| c.as_str()),
            outcome = outcome.as_str(),
            attempts = attempt,
            "记录处理完成"
        );
        outcome
    }

    /// 在独立任务中调用处理器，panic 不会带走分区 worker
    async fn invoke_sink(&self, event: &OrderEvent, delivery: DeliveryContext) -> HandleOutcome {
        let sink = Arc::clone(&self.ctx.sink);
        let event = event.clone();
        let mut call = AbortOnDrop(tokio::spawn(async move { sink.handle(&event, &delivery).await }));

        match (&mut call.0).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(partition = %self.partition, error = %e, "处理器异常退出");
                HandleOutcome::permanent(HANDLER_PANIC_CODE, e.to_string())
            }
        }
    }

    /// 死信写入失败时不提交位点，持续退避重试直到成功或收到停止信号
    async fn route_to_dead_letter(
        &mut self,
        msg: &ConsumerMessage,
        reason: &DeadLetterReason,
        attempts: u32,
    ) -> bool {
        let mut round: u32 = 0;
        loop {
            match self.ctx.dead_letter.route(msg, reason, attempts).await {
                Ok(_) => return true,
                Err(e) => {
                    let delay = self.ctx.retry.delay_for_attempt(round);
                    error!(
                        partition = %self.partition,
                        offset = msg.offset,
                        dead_letter_topic = %self.ctx.dead_letter.topic(),
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "死信写入失败，位点不推进"
                    );
                    if self.pause(delay).await {
                        return false;
                    }
                    round = round.saturating_add(1);
                }
            }
        }
    }

    async fn commit(&mut self, msg: &ConsumerMessage) {
        self.transition(PartitionState::Committing);
        if let Err(e) = self.ctx.committer.commit(&self.partition, msg.offset + 1).await {
            // 结果已落定，提交失败只会导致重复投递
            warn!(
                partition = %self.partition,
                offset = msg.offset,
                error = %e,
                "位点提交失败，记录可能被重复投递"
            );
        }
        self.transition(PartitionState::Polling);
    }

    fn abandon(&mut self, msg: &ConsumerMessage, reason: &str) -> RecordOutcome {
        info!(
            partition = %self.partition,
            offset = msg.offset,
            reason,
            "记录未提交，将在重新分配后投递"
        );
        self.transition(PartitionState::Idle);
        RecordOutcome::Abandoned
    }
}

// ---------------------------------------------------------------------------
// ConsumerGroupMember
// ---------------------------------------------------------------------------

struct WorkerHandle {
    records: mpsc::Sender<ConsumerMessage>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

fn spawn_worker(partition: TopicPartition, ctx: Arc<WorkerContext>) -> WorkerHandle {
    let (records_tx, records_rx) = mpsc::channel(PARTITION_QUEUE_CAPACITY);
    let (stop_tx, stop_rx) = watch::channel(false);
    let worker = PartitionWorker::new(partition, ctx, stop_rx);
    WorkerHandle {
        records: records_tx,
        stop: stop_tx,
        task: tokio::spawn(worker.run(records_rx)),
    }
}

/// 消费组成员
///
/// 拉取循环只负责分发：记录按分区送入对应 worker，分配/回收事件启停 worker。
pub struct ConsumerGroupMember {
    group_id: String,
    source: Box<dyn RecordSource>,
    ctx: Arc<WorkerContext>,
    workers: HashMap<TopicPartition, WorkerHandle>,
    poll_timeout: Duration,
    shutdown_grace: Duration,
}

impl ConsumerGroupMember {
    pub fn new(
        group_id: impl Into<String>,
        source: Box<dyn RecordSource>,
        ctx: WorkerContext,
        config: &ConsumerConfig,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            source,
            ctx: Arc::new(ctx),
            workers: HashMap::new(),
            poll_timeout: config.poll_timeout(),
            shutdown_grace: config.shutdown_grace(),
        }
    }

    /// 当前持有 worker 的分区
    pub fn assigned_partitions(&self) -> Vec<TopicPartition> {
        let mut partitions: Vec<_> = self.workers.keys().cloned().collect();
        partitions.sort();
        partitions
    }

    /// 运行拉取循环，直到 shutdown 变为 true（或发送端被丢弃）
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(group_id = %self.group_id, "消费组成员已启动");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let polled = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                polled = self.source.poll(self.poll_timeout) => polled,
            };

            match polled {
                Ok(None) => {}
                Ok(Some(SourceEvent::Assigned(partitions))) => {
                    info!(group_id = %self.group_id, ?partitions, "收到分区分配");
                    for partition in partitions {
                        self.ensure_worker(partition);
                    }
                }
                Ok(Some(SourceEvent::Revoked(partitions))) => {
                    info!(group_id = %self.group_id, ?partitions, "收到分区回收");
                    self.stop_workers(partitions.clone()).await;
                    if let Err(e) = self.source.partitions_released(&partitions).await {
                        warn!(group_id = %self.group_id, error = %e, "确认分区回收失败");
                    }
                }
                Ok(Some(SourceEvent::Record(msg))) => {
                    if !self.dispatch(msg, &mut shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!(group_id = %self.group_id, error = %e, "拉取失败，稍后重试");
                    tokio::time::sleep(self.poll_timeout).await;
                }
            }
        }

        self.shutdown().await
    }

    fn ensure_worker(&mut self, partition: TopicPartition) -> &WorkerHandle {
        let ctx = &self.ctx;
        self.workers
            .entry(partition.clone())
            .or_insert_with(|| spawn_worker(partition, Arc::clone(ctx)))
    }

    /// 把记录送入分区 worker；等待队列空位期间收到关闭信号时返回 false
    async fn dispatch(&mut self, msg: ConsumerMessage, shutdown: &mut watch::Receiver<bool>) -> bool {
        let partition = msg.topic_partition();
        let records = self.ensure_worker(partition.clone()).records.clone();

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return false;
                    }
                }
                permit = records.reserve() => {
                    match permit {
                        Ok(permit) => permit.send(msg),
                        // worker 已退出：不提交即不会跳过，记录在重新分配后投递
                        Err(_) => error!(
                            partition = %partition,
                            offset = msg.offset,
                            "分区 worker 已退出，记录留待重新分配后投递"
                        ),
                    }
                    return true;
                }
            }
        }
    }

    /// 停止指定分区的 worker，在宽限期内等待它们完成手头的记录
    async fn stop_workers(&mut self, partitions: Vec<TopicPartition>) {
        let deadline = Instant::now() + self.shutdown_grace;

        let handles: Vec<_> = partitions
            .into_iter()
            .filter_map(|p| self.workers.remove(&p).map(|h| (p, h)))
            .collect();
        for (_, handle) in &handles {
            let _ = handle.stop.send(true);
        }

        for (partition, handle) in handles {
            let WorkerHandle {
                records,
                stop,
                mut task,
            } = handle;
            drop(records);

            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => debug!(partition = %partition, "分区 worker 已释放"),
                Ok(Err(e)) => {
                    let err = WorkerError::PartitionWorker {
                        partition,
                        reason: e.to_string(),
                    };
                    error!(error = %err, "分区 worker 异常");
                }
                Err(_) => {
                    warn!(partition = %partition, "宽限期内未完成，强制中止分区 worker");
                    task.abort();
                    // 等待中止生效，之后该分区不会再有提交
                    let _ = task.await;
                }
            }
            drop(stop);
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        info!(group_id = %self.group_id, "消费组成员正在关闭");

        let partitions = self.assigned_partitions();
        self.stop_workers(partitions).await;
        self.source.close().await?;

        info!(group_id = %self.group_id, "消费组成员已停止");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------
