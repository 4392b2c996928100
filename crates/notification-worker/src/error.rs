//! 通知 worker 错误类型

use order_shared::broker::TopicPartition;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("分区 worker 异常退出: {partition} - {reason}")]
    PartitionWorker {
        partition: TopicPartition,
        reason: String,
    },

    #[error(transparent)]
    Shared(#[from] order_shared::error::OrderError),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
