//! 统一错误处理模块
//!
//! 定义订单事件管道中所有共享的错误类型，使用 thiserror 提供良好的错误信息。
//! 错误分类与事件的去向一一对应：要么同步返回给调用方，要么路由到死信 topic，
//! 不存在静默丢弃事件的错误路径。

use thiserror::Error;

/// 系统错误类型
#[derive(Debug, Error)]
pub enum OrderError {
    // ==================== 输入校验 ====================
    /// 订单不满足约束，在任何网络交互之前同步拒绝
    #[error("订单校验失败: {0}")]
    Validation(String),

    // ==================== 拓扑 ====================
    /// 启动阶段 topic 声明失败，对进程是致命的
    #[error("topic 拓扑声明失败: {topic} - {reason}")]
    Provisioning { topic: String, reason: String },

    // ==================== 发布 ====================
    /// broker 在重试预算耗尽后仍未确认写入
    #[error("事件发布失败: topic={topic}, 原因={reason}")]
    Publish { topic: String, reason: String },

    // ==================== 消费 ====================
    /// 消费到的记录无法解码，总是路由到死信 topic
    #[error("事件反序列化失败: {0}")]
    Deserialization(String),

    // ==================== 基础设施 ====================
    #[error("Kafka 错误: {0}")]
    Kafka(String),

    #[error("配置错误: {0}")]
    Config(#[from] config::ConfigError),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, OrderError>;

impl OrderError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Provisioning { .. } => "PROVISIONING_ERROR",
            Self::Publish { .. } => "PUBLISH_ERROR",
            Self::Deserialization(_) => "DESERIALIZATION_ERROR",
            Self::Kafka(_) => "KAFKA_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 校验和解码错误重试也不会成功；broker 侧的瞬时故障才值得重试。
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Publish { .. } | Self::Kafka(_) => true,
            _ => false,
        }
    }
}

impl From<validator::ValidationErrors> for OrderError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::Validation(errors.to_string())
    }
}

impl From<rdkafka::error::KafkaError> for OrderError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        Self::Kafka(err.to_string())
    }
}
