//! 共享库
//!
//! 订单事件管道各服务共用的事件模型、配置、错误处理、日志代理抽象、
//! Kafka 适配、进程内代理、拓扑声明、重试与可观测性。

pub mod broker;
pub mod config;
pub mod error;
pub mod events;
pub mod kafka;
pub mod memory;
pub mod observability;
pub mod retry;
pub mod topology;
