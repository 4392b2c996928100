//! 网关错误类型
//!
//! 把共享错误映射为 HTTP 状态码与统一的 JSON 错误体。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use order_shared::error::OrderError;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Order(#[from] OrderError),

    #[error("服务未就绪: {0}")]
    NotReady(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Order(OrderError::Validation(_)) => StatusCode::BAD_REQUEST,
            Self::Order(OrderError::Publish { .. } | OrderError::Kafka(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Order(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Order(e) => e.code(),
            Self::NotReady(_) => "NOT_READY",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // broker 细节只写日志，不回传给调用方
        let message = match &self {
            Self::Order(OrderError::Validation(_)) => self.to_string(),
            Self::Order(e @ (OrderError::Publish { .. } | OrderError::Kafka(_))) => {
                tracing::error!(error = %e, "订单事件发布失败");
                "订单暂时无法受理，请稍后重试".to_string()
            }
            Self::NotReady(reason) => {
                tracing::warn!(reason = %reason, "就绪检查失败");
                self.to_string()
            }
            Self::Order(e) => {
                tracing::error!(error = %e, "内部错误");
                "服务内部错误，请稍后重试".to_string()
            }
        };

        let body = json!({
            "success": false,
            "code": self.error_code(),
            "message": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
