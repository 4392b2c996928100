//! 测试环境设置模块
//!
//! 组装网关、内存 broker 与消费组成员。

mod environment;

pub use environment::{CONSUMER_GROUP, RunningWorker, TestEnvironment};
