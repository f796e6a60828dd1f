//! 命令执行器
//!
//! 在本地或已连接会话上一次性执行命令，实时推送输出，同时缓冲完整输出。
//!
//! ## 功能
//! - 本地：独立的一次性 PTY 进程（`shell -c command`），与交互式 Shell 无关
//! - 远程：会话适配器上的独立执行通道
//! - 超时：杀掉进程或放弃通道，结果为失败并带超时标记
//! - 同一目标上的并发执行互不影响

use std::sync::Arc;
use std::time::Duration;

use shellmux_core::sanitize_log_message;

use super::config::TerminalConfig;
use super::connections::local_pty::{run_local_once, ShellSpawnOptions};
use super::error::TerminalError;
use super::events::ExecTarget;
use super::exec::{ChunkCallback, ExecOutcome, ExecResult};
use super::session_registry::SessionRegistry;

/// 命令执行器
#[derive(Clone)]
pub struct CommandExecutor {
    registry: Arc<SessionRegistry>,
}

impl CommandExecutor {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    fn config(&self) -> &TerminalConfig {
        self.registry.config()
    }

    /// 目标的默认超时（本地 60s，远程 30s）
    pub fn default_timeout(&self, target: &ExecTarget) -> Duration {
        match target {
            ExecTarget::Local => self.config().local_exec_timeout(),
            ExecTarget::Session { .. } => self.config().remote_exec_timeout(),
        }
    }

    /// 执行命令
    ///
    /// 从不返回错误：无法开始执行时结果为 `success=false`、`exit_code=-1`，输出为错误信息。
    pub async fn run(
        &self,
        target: &ExecTarget,
        command: &str,
        timeout: Option<Duration>,
    ) -> ExecResult {
        let timeout = timeout.unwrap_or_else(|| self.default_timeout(target));
        tracing::info!(
            "[Executor] 执行命令: target={}, timeout={:?}, command={}",
            target,
            timeout,
            sanitize_log_message(command)
        );

        let events = self.registry.events().clone();
        let streamed = target.clone();
        let on_chunk: ChunkCallback = Arc::new(move |chunk| events.emit_agent_output(&streamed, chunk));

        let outcome = match target {
            ExecTarget::Local => {
                let config = self.config();
                run_local_once(
                    ShellSpawnOptions::one_off(config, command),
                    timeout,
                    config.max_exec_output_bytes,
                    on_chunk,
                )
                .await
            }
            ExecTarget::Session { session_id } => {
                self.registry.exec(session_id, command, timeout, on_chunk).await
            }
        };

        let result = match outcome {
            Ok(outcome) => ExecResult::from_outcome(command, outcome),
            Err(TerminalError::ExecTimeout) => {
                ExecResult::from_outcome(command, ExecOutcome::timed_out(String::new()))
            }
            Err(e) => {
                tracing::warn!("[Executor] 执行失败: target={}, error={}", target, e);
                ExecResult::failed(command, e.to_string())
            }
        };

        tracing::debug!(
            "[Executor] 执行完成: target={}, success={}, exit_code={}, timed_out={}, truncated={}",
            target,
            result.success,
            result.exit_code,
            result.timed_out,
            result.truncated
        );
        result
    }
}
