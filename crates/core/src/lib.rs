//! 核心类型模块
//!
//! 包含纯数据类型（models）与日志配置（logger）。
//!
//! 本 crate 不包含任何 I/O 或业务逻辑，只提供基础类型定义。

pub mod logger;
pub mod models;

// 重新导出常用类型
pub use logger::{init_tracing, sanitize_log_message, LogLevel};
pub use models::*;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
