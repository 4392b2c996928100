//! 订单事件下游处理器
//!
//! `OrderEventSink` 抽象下游副作用（邮件、推送等）。同一条记录可能被重复投递，
//! 实现必须是幂等的；天然不幂等的实现可以用 `DedupSink` 包一层。

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use order_shared::broker::TopicPartition;
use order_shared::events::{CorrelationId, OrderEvent};
use parking_lot::Mutex;
use tracing::{debug, info};

/// 单次投递的上下文
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    pub correlation_id: Option<CorrelationId>,
    pub partition: TopicPartition,
    pub offset: i64,
    /// 本条记录第几次交给处理器，从 1 开始
    pub attempt: u32,
}

/// 处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    Success,
    /// 瞬时失败，稍后重试可能成功
    RetryableFailure { code: String, message: String },
    /// 重试也不会成功，直接进入死信
    PermanentFailure { code: String, message: String },
}

impl HandleOutcome {
    pub fn retryable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RetryableFailure {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PermanentFailure {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// 下游处理器
#[async_trait]
pub trait OrderEventSink: Send + Sync {
    /// 每条投递的记录调用一次
    async fn handle(&self, event: &OrderEvent, ctx: &DeliveryContext) -> HandleOutcome;
}

// ---------------------------------------------------------------------------
// EmailSink
// ---------------------------------------------------------------------------

/// 模拟邮件通知
///
/// 只记录日志；接入真实邮件服务时实现同一 trait 即可。
pub struct EmailSink;

#[async_trait]
impl OrderEventSink for EmailSink {
    async fn handle(&self, event: &OrderEvent, ctx: &DeliveryContext) -> HandleOutcome {
        info!(
            correlation_id = ?ctx.correlation_id.as_ref().map(CorrelationId::as_str),
            status = %event.status,
            "sending to {} for order {}",
            event.order.name,
            event.order.order_id
        );
        HandleOutcome::Success
    }
}

// ---------------------------------------------------------------------------
// DedupSink
// ---------------------------------------------------------------------------

/// 按关联 ID 去重的处理器包装
///
/// 只记住成功处理过的关联 ID，窗口满后淘汰最早的。
/// 没有关联 ID 的记录直接透传给内层处理器。
pub struct DedupSink {
    inner: Arc<dyn OrderEventSink>,
    window: Mutex<DedupWindow>,
}

struct DedupWindow {
    capacity: usize,
    seen: HashSet<CorrelationId>,
    order: VecDeque<CorrelationId>,
}

impl DedupWindow {
    fn insert(&mut self, id: CorrelationId) {
        if self.capacity == 0 || !self.seen.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
    }
}

impl DedupSink {
    pub fn new(inner: Arc<dyn OrderEventSink>, capacity: usize) -> Self {
        Self {
            inner,
            window: Mutex::new(DedupWindow {
                capacity,
                seen: HashSet::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn remembered(&self) -> usize {
        self.window.lock().order.len()
    }
}

#[async_trait]
impl OrderEventSink for DedupSink {
    async fn handle(&self, event: &OrderEvent, ctx: &DeliveryContext) -> HandleOutcome {
        let Some(correlation_id) = &ctx.correlation_id else {
            return self.inner.handle(event, ctx).await;
        };

        if self.window.lock().seen.contains(correlation_id) {
            debug!(
                correlation_id = %correlation_id,
                order_id = %event.order.order_id,
                offset = ctx.offset,
                "重复投递，跳过处理"
            );
            return HandleOutcome::Success;
        }

        let outcome = self.inner.handle(event, ctx).await;
        if outcome.is_success() {
            self.window.lock().insert(correlation_id.clone());
        }
        outcome
    }
}
