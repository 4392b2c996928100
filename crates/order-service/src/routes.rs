//! 路由配置

use std::time::Duration;

use axum::{
    Router,
    http::StatusCode,
    middleware,
    routing::{get, post},
};
use order_shared::observability::middleware as obs_middleware;
use tower_http::timeout::TimeoutLayer;

use crate::{handlers, state::AppState};

/// 单个请求的上限，覆盖发布重试的最长耗时
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub fn api_routes() -> Router<AppState> {
    Router::new().route("/orders", post(handlers::create_order))
}

/// 完整的应用路由，含探针与可观测性中间件
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(api_routes())
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            REQUEST_TIMEOUT,
        ))
        .layer(middleware::from_fn(obs_middleware::http_tracing))
        .layer(middleware::from_fn(obs_middleware::request_id))
        .with_state(state)
}
