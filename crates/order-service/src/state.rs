//! 应用状态

use std::sync::Arc;

use crate::producer::OrderProducer;

/// Axum 路由共享状态
#[derive(Clone)]
pub struct AppState {
    pub producer: Arc<OrderProducer>,
    pub service_name: String,
}

impl AppState {
    pub fn new(producer: Arc<OrderProducer>, service_name: impl Into<String>) -> Self {
        Self {
            producer,
            service_name: service_name.into(),
        }
    }
}
