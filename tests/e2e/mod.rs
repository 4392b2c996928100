//! 订单事件管道端到端测试
//!
//! 全部在进程内运行：axum 路由 + 真实的 `OrderProducer` + 内存分区日志 +
//! `ConsumerGroupMember`，不需要外部 broker。覆盖：
//! - 网关受理与校验
//! - 生产到消费的全链路
//! - 失败分类、重试与死信
//! - 重新分配与优雅关闭

pub mod helpers;
pub mod setup;
pub mod suites;

pub use setup::TestEnvironment;
