//! 会话适配器 trait 定义
//!
//! 定义统一的适配器接口，本地 Shell 和 SSH 连接都必须实现此 trait。
//!
//! ## 功能
//! - 定义 `SessionAdapter` trait（写入、调整大小、关闭、一次性执行）
//! - 定义 `AdapterFactory` trait，注册表通过它创建适配器
//! - 提供基于真实 PTY / SSH 的默认工厂 `SystemAdapterFactory`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shellmux_core::RemoteConfig;

use super::config::TerminalConfig;
use super::connections::local_pty::{LocalExecSettings, LocalShell, ShellSpawnOptions};
use super::connections::ssh_connection::{SshConn, SshOptions};
use super::error::TerminalError;
use super::events::AdapterSink;
use super::exec::{ChunkCallback, ExecOutcome};

/// 会话类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Local,
    Remote,
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// 会话适配器 trait
///
/// 适配器只拥有自己的内部状态，所有事件经 `AdapterSink` 上报。
#[async_trait]
pub trait SessionAdapter: Send + Sync {
    fn kind(&self) -> SessionKind;

    /// 写入输入（fire-and-forget）
    fn write(&self, data: &[u8]);

    /// 调整终端大小（尽力而为）
    fn resize(&self, cols: u16, rows: u16);

    /// 关闭适配器（幂等）
    fn close(&self);

    /// 一次性执行命令，不影响交互式通道
    async fn exec_once(
        &self,
        command: &str,
        timeout: Duration,
        on_chunk: ChunkCallback,
    ) -> Result<ExecOutcome, TerminalError>;
}

/// 适配器工厂
pub trait AdapterFactory: Send + Sync {
    /// 创建本地 Shell 适配器
    fn spawn_local(&self, sink: AdapterSink) -> Result<Arc<dyn SessionAdapter>, TerminalError>;

    /// 创建远程适配器，立即返回，连接结果异步上报
    fn spawn_remote(&self, config: RemoteConfig, sink: AdapterSink) -> Arc<dyn SessionAdapter>;
}

/// 默认工厂（真实 PTY 与 SSH）
#[derive(Debug, Clone)]
pub struct SystemAdapterFactory {
    config: Arc<TerminalConfig>,
}

impl SystemAdapterFactory {
    pub fn new(config: Arc<TerminalConfig>) -> Self {
        Self { config }
    }
}

impl AdapterFactory for SystemAdapterFactory {
    fn spawn_local(&self, sink: AdapterSink) -> Result<Arc<dyn SessionAdapter>, TerminalError> {
        let shell = LocalShell::spawn(
            ShellSpawnOptions::interactive(&self.config),
            sink,
            LocalExecSettings {
                config: self.config.clone(),
            },
        )?;
        Ok(Arc::new(shell))
    }

    fn spawn_remote(&self, config: RemoteConfig, sink: AdapterSink) -> Arc<dyn SessionAdapter> {
        Arc::new(SshConn::connect(
            config,
            SshOptions::from_config(&self.config),
            sink,
        ))
    }
}
