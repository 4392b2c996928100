//! 订单事件模型与编解码
//!
//! 定义订单值对象、生命周期状态、事件信封以及关联 ID。
//! 事件以 JSON 写入日志：读取时忽略未知字段，缺失的可选字段取文档约定的默认值，
//! 使新旧版本的生产者与消费者可以混跑。

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::error::OrderError;

/// 关联 ID 在记录头中的键名
pub const CORRELATION_ID_HEADER: &str = "correlationId";

/// 新建订单事件的默认描述
pub const PENDING_MESSAGE: &str = "Order is Pending";

// ---------------------------------------------------------------------------
// Order 订单值对象
// ---------------------------------------------------------------------------

/// 订单
///
/// 由调用方提供 `order_id`，系统不生成也不改写它。
/// 构造后不再修改，`validate` 通过才允许进入事件管道。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    #[validate(custom(function = "not_blank", message = "orderId 不能为空"))]
    pub order_id: String,
    #[validate(custom(function = "not_blank", message = "name 不能为空"))]
    pub name: String,
    #[validate(range(min = 1, message = "quantity 必须为正整数"))]
    pub quantity: i32,
    /// 以精确的 JSON 数值写出，不经过 f64
    #[validate(custom(function = "non_negative", message = "price 不能为负数"))]
    #[serde(with = "rust_decimal::serde::arbitrary_precision")]
    pub price: Decimal,
}

impl Order {
    pub fn new(
        order_id: impl Into<String>,
        name: impl Into<String>,
        quantity: i32,
        price: Decimal,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            name: name.into(),
            quantity,
            price,
        }
    }

    /// 校验订单约束，失败时返回 `OrderError::Validation`
    pub fn ensure_valid(&self) -> Result<(), OrderError> {
        self.validate().map_err(OrderError::from)
    }
}

fn not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("blank"));
    }
    Ok(())
}

fn non_negative(value: &Decimal) -> Result<(), ValidationError> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(ValidationError::new("negative"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// OrderStatus 生命周期状态
// ---------------------------------------------------------------------------

/// 订单生命周期状态
///
/// 线上格式是普通字符串。无法识别的状态落到 `Other`，
/// 保证旧版本消费者读到新状态时不会解码失败；生产者只会写入已识别的状态。
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OrderStatus {
    #[default]
    Pending,
    Shipped,
    Failed,
    Other(String),
}

impl OrderStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "Pending",
            Self::Shipped => "Shipped",
            Self::Failed => "Failed",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for OrderStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Pending" => Self::Pending,
            "Shipped" => Self::Shipped,
            "Failed" => Self::Failed,
            _ => Self::Other(value),
        }
    }
}

impl From<OrderStatus> for String {
    fn from(status: OrderStatus) -> Self {
        match status {
            OrderStatus::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// OrderEvent 事件信封
// ---------------------------------------------------------------------------

/// 订单生命周期事件
///
/// 缺省值约定：
/// - `status` 缺失时为 `Pending`
/// - `message` 缺失时为空字符串
///
/// `order.quantity` 与 `order.price` 为必填字段，缺失或非数值都视为损坏记录。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderEvent {
    pub order: Order,
    #[serde(default)]
    pub status: OrderStatus,
    #[serde(default)]
    pub message: String,
}

impl OrderEvent {
    /// 为新订单构建 Pending 事件
    pub fn pending(order: Order) -> Self {
        Self {
            order,
            status: OrderStatus::Pending,
            message: PENDING_MESSAGE.to_string(),
        }
    }

    /// 分区键：同一订单的所有事件落在同一分区，保证按 key 全序
    pub fn partition_key(&self) -> &str {
        &self.order.order_id
    }

    /// 序列化为日志存储用的 JSON 字节
    pub fn to_bytes(&self) -> Result<Vec<u8>, OrderError> {
        serde_json::to_vec(self)
            .map_err(|e| OrderError::Internal(format!("事件序列化失败: {e}")))
    }

    /// 从日志记录解码
    ///
    /// 除了 JSON 结构错误外，嵌套订单违反约束同样视为损坏记录，
    /// 保证消费端拿到的事件永远满足订单不变量。
    pub fn from_bytes(payload: &[u8]) -> Result<Self, OrderError> {
        let event: Self = serde_json::from_slice(payload)
            .map_err(|e| OrderError::Deserialization(e.to_string()))?;

        event
            .order
            .validate()
            .map_err(|e| OrderError::Deserialization(format!("订单字段非法: {e}")))?;

        Ok(event)
    }
}

// ---------------------------------------------------------------------------
// CorrelationId 关联 ID
// ---------------------------------------------------------------------------

/// 关联 ID
///
/// 每次发布调用生成一个新值，只作为记录头传递，不进入负载，
/// 用于在生产端和消费端日志之间串联同一次请求。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
