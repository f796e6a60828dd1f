//! 本地 PTY 连接实现
//!
//! 封装本地 PTY 进程，提供 `LocalShell` 结构体供会话注册表使用。
//!
//! ## 功能
//! - 创建和管理本地 PTY 子进程
//! - 在独立线程中读取 PTY 输出并通过 `AdapterSink` 上报
//! - 处理 PTY 输入写入与终端大小调整
//! - 监控进程退出状态
//! - 一次性命令执行（`run_local_once`），与交互式 PTY 相互独立

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use shellmux_core::sanitize_log_message;
use tokio::sync::{mpsc, oneshot};

use crate::terminal::adapter::{SessionAdapter, SessionKind};
use crate::terminal::config::TerminalConfig;
use crate::terminal::error::TerminalError;
use crate::terminal::events::AdapterSink;
use crate::terminal::exec::{ChunkCallback, ExecOutcome, OutputBuffer, FAILED_EXIT_CODE};

/// 读缓冲大小
const READ_BUFFER_SIZE: usize = 4096;

/// 本地进程启动参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellSpawnOptions {
    pub shell_path: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// 追加到继承环境之上的变量
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
}

impl ShellSpawnOptions {
    /// 交互式 Shell（默认 80x24，主目录）
    pub fn interactive(config: &TerminalConfig) -> Self {
        Self {
            shell_path: config.shell_path.clone(),
            args: Vec::new(),
            cwd: config.working_dir(),
            env: Vec::new(),
            cols: config.local_cols,
            rows: config.local_rows,
        }
    }

    /// 一次性命令（`shell -c command`，默认 120x30）
    pub fn one_off(config: &TerminalConfig, command: &str) -> Self {
        Self {
            shell_path: config.shell_path.clone(),
            args: one_off_args(&config.shell_path, command),
            cwd: config.working_dir(),
            env: Vec::new(),
            cols: config.exec_cols,
            rows: config.exec_rows,
        }
    }
}

fn one_off_args(shell_path: &str, command: &str) -> Vec<String> {
    let is_cmd = shell_path.to_lowercase().ends_with("cmd.exe");
    let flag = if is_cmd { "/C" } else { "-c" };
    vec![flag.to_string(), command.to_string()]
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// 构建命令
fn build_command(opts: &ShellSpawnOptions) -> CommandBuilder {
    let mut cmd = CommandBuilder::new(&opts.shell_path);
    for arg in &opts.args {
        cmd.arg(arg);
    }
    cmd.cwd(&opts.cwd);
    cmd.env("TERM", "xterm-256color");
    cmd.env("COLORTERM", "truecolor");
    for (key, value) in &opts.env {
        cmd.env(key, value);
    }
    cmd
}

/// 探测本地 PTY 是否可用
///
/// 注册表构造时调用一次，结果缓存。
pub fn probe_pty() -> Result<(), String> {
    native_pty_system()
        .openpty(pty_size(1, 1))
        .map(drop)
        .map_err(|e| e.to_string())
}

/// 本地一次性执行的默认参数
#[derive(Debug, Clone)]
pub struct LocalExecSettings {
    pub config: Arc<TerminalConfig>,
}

/// 本地 Shell 进程封装
///
/// 封装 PTY 进程，提供输入输出和生命周期管理。
pub struct LocalShell {
    session_id: String,
    /// PTY 写入器
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    /// PTY Master（用于调整大小）
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    /// 关闭标志
    shutdown_flag: Arc<AtomicBool>,
    /// 是否已退出
    exited: Arc<AtomicBool>,
    exec_settings: LocalExecSettings,
}

impl LocalShell {
    /// 创建新的 Shell 进程
    ///
    /// PTY 分配或进程启动失败时返回 `SpawnFailed`，不重试。
    pub fn spawn(
        opts: ShellSpawnOptions,
        sink: AdapterSink,
        exec_settings: LocalExecSettings,
    ) -> Result<Self, TerminalError> {
        let session_id = sink.session_id().to_string();
        tracing::info!(
            "[LocalShell] 创建进程: session_id={}, shell={}, size={}x{}",
            session_id,
            opts.shell_path,
            opts.cols,
            opts.rows
        );

        let pair = native_pty_system()
            .openpty(pty_size(opts.cols, opts.rows))
            .map_err(|e| TerminalError::SpawnFailed(e.to_string()))?;

        let child = pair
            .slave
            .spawn_command(build_command(&opts))
            .map_err(|e| TerminalError::SpawnFailed(e.to_string()))?;
        // 释放 slave 端，子进程退出后读端才能得到 EOF
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TerminalError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| TerminalError::SpawnFailed(e.to_string()))?;
        let killer = child.clone_killer();

        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let exited = Arc::new(AtomicBool::new(false));

        Self::spawn_output_reader(reader, child, sink, shutdown_flag.clone(), exited.clone())?;

        tracing::info!("[LocalShell] 进程已创建: session_id={}", session_id);

        Ok(Self {
            session_id,
            writer: Arc::new(Mutex::new(writer)),
            master: Arc::new(Mutex::new(pair.master)),
            killer: Mutex::new(killer),
            shutdown_flag,
            exited,
            exec_settings,
        })
    }

    /// 启动输出读取线程
    ///
    /// 先上报 `Data`，读到 EOF 后等待子进程并上报一次 `Exit`。
    fn spawn_output_reader(
        mut reader: Box<dyn Read + Send>,
        mut child: Box<dyn portable_pty::Child + Send + Sync>,
        sink: AdapterSink,
        shutdown_flag: Arc<AtomicBool>,
        exited: Arc<AtomicBool>,
    ) -> Result<(), TerminalError> {
        let thread_name = format!("local-pty-{}", sink.session_id());
        std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let mut buffer = [0u8; READ_BUFFER_SIZE];
                loop {
                    match reader.read(&mut buffer) {
                        Ok(0) => break,
                        Ok(n) => sink.data(&buffer[..n]),
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            // Linux 上子进程退出后读 master 返回 EIO
                            if !shutdown_flag.load(Ordering::Relaxed) {
                                tracing::debug!(
                                    "[LocalShell] 读取结束: session_id={}, error={}",
                                    sink.session_id(),
                                    e
                                );
                            }
                            break;
                        }
                    }
                }

                let code = match child.wait() {
                    Ok(status) => Some(status.exit_code() as i32),
                    Err(e) => {
                        tracing::warn!(
                            "[LocalShell] 获取退出码失败: session_id={}, error={}",
                            sink.session_id(),
                            e
                        );
                        None
                    }
                };
                exited.store(true, Ordering::SeqCst);
                tracing::info!(
                    "[LocalShell] 进程已退出: session_id={}, exit_code={:?}",
                    sink.session_id(),
                    code
                );
                sink.exit(code);
            })
            .map(drop)
            .map_err(|e| TerminalError::SpawnFailed(format!("启动读取线程失败: {}", e)))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// 检查进程是否已退出
    pub fn is_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// 写入数据到 PTY（失败只记录日志）
    pub fn write(&self, data: &[u8]) {
        let mut writer = self.writer.lock();
        if let Err(e) = writer.write_all(data).and_then(|_| writer.flush()) {
            tracing::warn!(
                "[LocalShell] 写入失败: session_id={}, error={}",
                self.session_id,
                e
            );
        }
    }

    /// 调整 PTY 大小（尽力而为，错误被吞掉）
    pub fn resize(&self, cols: u16, rows: u16) {
        let master = self.master.lock();
        match master.resize(pty_size(cols, rows)) {
            Ok(()) => tracing::debug!(
                "[LocalShell] 调整大小: session_id={}, size={}x{}",
                self.session_id,
                cols,
                rows
            ),
            Err(e) => tracing::debug!(
                "[LocalShell] 调整大小失败（忽略）: session_id={}, error={}",
                self.session_id,
                e
            ),
        }
    }

    /// 终止进程（幂等）
    pub fn kill(&self) {
        if self.shutdown_flag.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("[LocalShell] 终止进程: session_id={}", self.session_id);
        if let Err(e) = self.killer.lock().kill() {
            tracing::debug!(
                "[LocalShell] 终止进程失败（可能已退出）: session_id={}, error={}",
                self.session_id,
                e
            );
        }
    }
}

impl Drop for LocalShell {
    fn drop(&mut self) {
        self.kill();
        tracing::debug!("[LocalShell] 进程已销毁: session_id={}", self.session_id);
    }
}

#[async_trait]
impl SessionAdapter for LocalShell {
    fn kind(&self) -> SessionKind {
        SessionKind::Local
    }

    fn write(&self, data: &[u8]) {
        LocalShell::write(self, data);
    }

    fn resize(&self, cols: u16, rows: u16) {
        LocalShell::resize(self, cols, rows);
    }

    fn close(&self) {
        self.kill();
    }

    async fn exec_once(
        &self,
        command: &str,
        timeout: Duration,
        on_chunk: ChunkCallback,
    ) -> Result<ExecOutcome, TerminalError> {
        let config = &self.exec_settings.config;
        run_local_once(
            ShellSpawnOptions::one_off(config, command),
            timeout,
            config.max_exec_output_bytes,
            on_chunk,
        )
        .await
    }
}

/// 运行一次性本地命令
///
/// 使用独立的 PTY 进程，与交互式 Shell 互不影响；多次调用可并发。
/// 超时后杀掉进程并返回已收集的输出。
pub async fn run_local_once(
    opts: ShellSpawnOptions,
    timeout: Duration,
    output_limit: usize,
    on_chunk: ChunkCallback,
) -> Result<ExecOutcome, TerminalError> {
    tracing::debug!(
        "[LocalShell] 一次性执行: args={}",
        sanitize_log_message(&opts.args.join(" "))
    );

    let pair = native_pty_system()
        .openpty(pty_size(opts.cols, opts.rows))
        .map_err(|e| TerminalError::SpawnFailed(e.to_string()))?;
    let mut child = pair
        .slave
        .spawn_command(build_command(&opts))
        .map_err(|e| TerminalError::SpawnFailed(e.to_string()))?;
    drop(pair.slave);

    let mut killer = child.clone_killer();
    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| TerminalError::SpawnFailed(e.to_string()))?;
    // master 需存活到执行结束，否则子进程收到 SIGHUP
    let _master = pair.master;

    let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (exit_tx, exit_rx) = oneshot::channel::<Option<i32>>();

    std::thread::Builder::new()
        .name("local-exec".to_string())
        .spawn(move || {
            let mut buffer = [0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        if chunk_tx.send(buffer[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            drop(chunk_tx);
            let code = child.wait().ok().map(|status| status.exit_code() as i32);
            let _ = exit_tx.send(code);
        })
        .map_err(|e| TerminalError::SpawnFailed(format!("启动读取线程失败: {}", e)))?;

    let mut output = OutputBuffer::new(output_limit);
    let collect = async {
        while let Some(chunk) = chunk_rx.recv().await {
            on_chunk(&chunk);
            output.push(&chunk);
        }
        exit_rx.await.ok().flatten()
    };
    let result = tokio::time::timeout(timeout, collect).await;

    match result {
        Ok(code) => Ok(output.into_finished(code.unwrap_or(FAILED_EXIT_CODE))),
        Err(_) => {
            tracing::warn!("[LocalShell] 一次性执行超时 ({:?})，终止进程", timeout);
            if let Err(e) = killer.kill() {
                tracing::debug!("[LocalShell] 终止超时进程失败: {}", e);
            }
            Ok(output.into_timed_out())
        }
    }
}
