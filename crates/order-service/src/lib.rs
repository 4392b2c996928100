//! 订单网关服务
//!
//! 接收 `POST /orders`，校验后由 `OrderProducer` 发布 Pending 事件到主 topic。

pub mod error;
pub mod handlers;
pub mod producer;
pub mod routes;
pub mod state;

pub use error::GatewayError;
pub use producer::OrderProducer;
pub use routes::app;
pub use state::AppState;
