//! 订单事件通知 worker
//!
//! 作为消费组成员消费订单 topic，每个分区由独立 worker 顺序处理。
//! 处理成功或写入死信 topic 之后才提交位点，保证至少一次投递。

pub mod consumer;
pub mod dead_letter;
pub mod error;
pub mod policy;
pub mod sink;

pub use consumer::{
    ConsumerGroupMember, HANDLER_PANIC_CODE, PartitionState, PartitionWorker, RecordOutcome,
    WorkerContext,
};
pub use dead_letter::{DeadLetterPublisher, DeadLetterReason};
pub use error::{Result, WorkerError};
pub use policy::{Disposition, FailurePolicy};
pub use sink::{DedupSink, DeliveryContext, EmailSink, HandleOutcome, OrderEventSink};
