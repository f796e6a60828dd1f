//! shellmux
//!
//! 本地 Shell 与 SSH 远程 Shell 的会话编排核心。
//!
//! ## 模块
//! - `terminal` - 会话注册表、适配器、事件多路复用、一次性执行
//! - `agent` - 围绕外部文本生成器的 Agent 对话轮次
//! - `commands` - 外部意图到核心调用的边界层

pub mod agent;
pub mod commands;
pub mod terminal;

pub use shellmux_core::{
    init_tracing, sanitize_log_message, AuthConfig, AuthType, ConnectionProfile, LogLevel,
    ProfileError, RemoteConfig,
};
pub use terminal::{
    CommandExecutor, EventMultiplexer, EventStream, ExecResult, ExecTarget, SessionRegistry,
    SessionStatus, TerminalConfig, TerminalError, TerminalEvent,
};
