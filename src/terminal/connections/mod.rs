//! 连接模块
//!
//! 提供不同类型的终端连接实现：本地 PTY、SSH。
//!
//! ## 模块结构
//! - `local_pty` - 本地 PTY 连接与一次性本地执行
//! - `ssh_connection` - SSH 远程连接（交互式 Shell 与执行通道）
//! - `transport_error` - 传输层错误分类
//!
//! ## 功能
//! - 本地 PTY 进程管理
//! - SSH 远程连接和认证
//! - SSH 远程 PTY 创建和数据转发
//! - 传输错误归类为固定的小分类

pub mod local_pty;
pub mod ssh_connection;
pub mod transport_error;

pub use local_pty::{probe_pty, run_local_once, LocalExecSettings, LocalShell, ShellSpawnOptions};
pub use ssh_connection::{
    host_key_fingerprint, AlgorithmPreferences, ConnectionState, SshConn, SshOptions,
};
pub use transport_error::{TransportErrorKind, TransportFailure};
