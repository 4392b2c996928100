//! HTTP 处理器

use axum::{Json, extract::State, http::StatusCode};
use order_shared::events::Order;
use serde_json::{Value, json};
use tracing::info;

use crate::error::{GatewayError, Result};
use crate::state::AppState;

/// 受理订单
///
/// POST /orders
///
/// 事件确认写入主 topic 后返回 202；下游通知异步完成。
pub async fn create_order(
    State(state): State<AppState>,
    Json(order): Json<Order>,
) -> Result<(StatusCode, String)> {
    let correlation_id = state.producer.publish(&order).await?;

    info!(
        order_id = %order.order_id,
        correlation_id = %correlation_id,
        "订单已受理"
    );
    Ok((
        StatusCode::ACCEPTED,
        format!("Order accepted: {}", order.order_id),
    ))
}

/// 存活探针
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": state.service_name,
    }))
}

/// 就绪探针：broker 元数据可达才接收流量
pub async fn readiness_check(State(state): State<AppState>) -> Result<Json<Value>> {
    state
        .producer
        .health_check()
        .await
        .map_err(|e| GatewayError::NotReady(e.to_string()))?;

    Ok(Json(json!({
        "status": "ok",
        "service": state.service_name,
        "checks": { "broker": "ok" }
    })))
}
