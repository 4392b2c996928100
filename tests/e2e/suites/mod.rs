//! 测试套件模块

pub mod failure_handling;
pub mod order_gateway;
pub mod pipeline;
