//! 终端核心模块
//!
//! 管理一个本地 Shell 与任意数量的 SSH 远程 Shell，所有输出汇入同一条事件通道。
//!
//! ## 模块结构
//! - `error` - 错误类型定义
//! - `config` - 终端配置
//! - `events` - 事件定义与事件多路复用器
//! - `exec` - 一次性执行的公共类型
//! - `adapter` - 会话适配器 trait 与默认工厂
//! - `connections` - 连接模块（本地 PTY、SSH、错误分类）
//! - `session_registry` - 会话注册表
//! - `command_executor` - 一次性命令执行器
//! - `command_blocks` - `[EXECUTE]` 命令块解析
//! - `system_info` - 本地与远程系统信息
//!
//! ## 使用示例
//! ```ignore
//! use shellmux::terminal::{EventMultiplexer, SessionRegistry, TerminalConfig};
//!
//! let (events, mut stream) = EventMultiplexer::new();
//! let registry = SessionRegistry::new(Arc::new(TerminalConfig::from_env()?), events);
//! let session_id = registry.create_local(None).await?;
//! registry.write(&session_id, b"ls -la\n").await;
//! ```

pub mod adapter;
pub mod command_blocks;
pub mod command_executor;
pub mod config;
pub mod connections;
pub mod error;
pub mod events;
pub mod exec;
pub mod session_registry;
pub mod system_info;

// 重新导出常用类型
pub use adapter::{AdapterFactory, SessionAdapter, SessionKind, SystemAdapterFactory};
pub use command_blocks::{execute_blocks, extract_commands, EXECUTE_CLOSE, EXECUTE_OPEN};
pub use command_executor::CommandExecutor;
pub use config::{TerminalConfig, DEFAULT_COLS, DEFAULT_EXEC_COLS, DEFAULT_EXEC_ROWS, DEFAULT_ROWS};
pub use connections::{ConnectionState, TransportErrorKind, TransportFailure};
pub use error::TerminalError;
pub use events::{
    AdapterEvent, AdapterReport, AdapterSink, EventMultiplexer, EventStream, ExecTarget,
    SessionId, SessionStatus, TerminalEvent,
};
pub use exec::{
    discard_chunks, ChunkCallback, ExecOutcome, ExecResult, OutputBuffer, TIMEOUT_MARKER,
    TRUNCATED_MARKER,
};
pub use session_registry::{SessionRegistry, SessionSnapshot};
pub use system_info::{LocalSystemInfo, RemoteSystemInfo};
