//! 测试辅助工具模块
//!
//! 提供网关调用封装、可编排的处理器与断言宏。

mod api_client;
mod assertions;
mod sink;

pub use api_client::*;
pub use sink::*;
