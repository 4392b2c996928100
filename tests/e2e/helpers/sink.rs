//! 可编排的订单事件处理器

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use notification_worker::{DeliveryContext, HandleOutcome, OrderEventSink};
use order_shared::events::{CorrelationId, OrderEvent};
use parking_lot::Mutex;

/// 一次处理器调用
#[derive(Debug, Clone)]
pub struct Delivery {
    pub event: OrderEvent,
    pub correlation_id: Option<CorrelationId>,
    pub attempt: u32,
}

/// 记录所有调用；可按 orderId 预置结果序列，用完后返回成功
#[derive(Default)]
pub struct RecordingSink {
    deliveries: Mutex<Vec<Delivery>>,
    script: Mutex<HashMap<String, VecDeque<HandleOutcome>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, order_id: &str, outcomes: impl IntoIterator<Item = HandleOutcome>) -> Self {
        self.script
            .lock()
            .insert(order_id.to_string(), outcomes.into_iter().collect());
        self
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.deliveries.lock().len()
    }

    pub fn count_for(&self, order_id: &str) -> usize {
        self.deliveries
            .lock()
            .iter()
            .filter(|d| d.event.order.order_id == order_id)
            .count()
    }
}

#[async_trait]
impl OrderEventSink for RecordingSink {
    async fn handle(&self, event: &OrderEvent, ctx: &DeliveryContext) -> HandleOutcome {
        self.deliveries.lock().push(Delivery {
            event: event.clone(),
            correlation_id: ctx.correlation_id.clone(),
            attempt: ctx.attempt,
        });
        self.script
            .lock()
            .get_mut(&event.order.order_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(HandleOutcome::Success)
    }
}
