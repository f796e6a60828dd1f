//! SSH 远程连接模块
//!
//! 每个 `SshConn` 拥有一条 SSH 传输、一个交互式 Shell 通道，以及任意数量的一次性执行通道。
//!
//! ## 功能
//! - 连接状态管理（connecting → connected → closed，失败进入 error）
//! - 算法协商白名单（kex / hostkey / cipher / mac，强度从高到低）
//! - 密码、私钥认证，键盘交互认证自动应答（从不阻塞等待人工输入）
//! - 就绪超时（握手 + 认证 + 打开 Shell）
//! - keep-alive 探测，连续失败达到上限后放弃连接
//! - TCP 层存活检测（Linux）：对端失联时内核在 `间隔 × 上限` 内断开连接
//! - 远程 PTY 输出转发（stdout 与 stderr 合并）
//! - 一次性执行通道（与交互式通道互不影响，可并发）
//!
//! libssh2 的调用都是阻塞式的，连接与数据泵在独立线程中运行，
//! 连接建立后会话切换为非阻塞模式，由交互泵与执行通道共享。

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shellmux_core::{sanitize_log_message, AuthConfig, RemoteConfig};
use ssh2::{Channel, KeyboardInteractivePrompt as SshKeyboardInteractivePrompt, MethodType, Session};
use tokio::sync::mpsc;

use crate::terminal::adapter::{SessionAdapter, SessionKind};
use crate::terminal::config::{expand_home, TerminalConfig};
use crate::terminal::error::TerminalError;
use crate::terminal::events::AdapterSink;
use crate::terminal::exec::{ChunkCallback, ExecOutcome, OutputBuffer, FAILED_EXIT_CODE};

use super::transport_error::{is_would_block, TransportErrorKind, TransportFailure};

/// 终端类型
const TERM_TYPE: &str = "xterm-256color";
/// 读缓冲大小
const READ_BUFFER_SIZE: usize = 4096;
/// 空闲轮询间隔
const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// 一次性执行在自身截止时间之外的宽限
const EXEC_GRACE: Duration = Duration::from_secs(2);

// ============================================================================
// 连接选项
// ============================================================================

/// SSH 连接选项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshOptions {
    pub ready_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_max_missed: u32,
    /// 交互式 Shell 的初始大小
    pub cols: u16,
    pub rows: u16,
    /// 一次性执行的输出缓冲上限
    pub output_limit: usize,
}

impl SshOptions {
    pub fn from_config(config: &TerminalConfig) -> Self {
        Self {
            ready_timeout: config.ready_timeout(),
            keepalive_interval: config.keepalive_interval(),
            keepalive_max_missed: config.keepalive_max_missed,
            cols: config.local_cols,
            rows: config.local_rows,
            output_limit: config.max_exec_output_bytes,
        }
    }
}

impl Default for SshOptions {
    fn default() -> Self {
        Self::from_config(&TerminalConfig::default())
    }
}

// ============================================================================
// 算法白名单
// ============================================================================

/// 算法协商偏好（强度从高到低）
///
/// 兼顾老旧服务器，同时把最弱的算法排在最后。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlgorithmPreferences {
    pub kex: &'static [&'static str],
    pub host_key: &'static [&'static str],
    pub ciphers: &'static [&'static str],
    pub macs: &'static [&'static str],
}

impl AlgorithmPreferences {
    pub const DEFAULT: Self = Self {
        kex: &[
            "ecdh-sha2-nistp521",
            "ecdh-sha2-nistp384",
            "ecdh-sha2-nistp256",
            "diffie-hellman-group-exchange-sha256",
            "diffie-hellman-group14-sha256",
            "diffie-hellman-group14-sha1",
            "diffie-hellman-group1-sha1",
        ],
        host_key: &[
            "ssh-ed25519",
            "ecdsa-sha2-nistp521",
            "ecdsa-sha2-nistp384",
            "ecdsa-sha2-nistp256",
            "rsa-sha2-512",
            "rsa-sha2-256",
            "ssh-rsa",
        ],
        ciphers: &[
            "aes256-gcm@openssh.com",
            "aes128-gcm@openssh.com",
            "aes256-gcm",
            "aes128-gcm",
            "aes256-ctr",
            "aes192-ctr",
            "aes128-ctr",
        ],
        macs: &["hmac-sha2-512", "hmac-sha2-256", "hmac-sha1"],
    };

    fn entries(&self) -> [(MethodType, &'static str, &'static [&'static str]); 6] {
        [
            (MethodType::Kex, "kex", self.kex),
            (MethodType::HostKey, "hostkey", self.host_key),
            (MethodType::CryptCs, "cipher c2s", self.ciphers),
            (MethodType::CryptSc, "cipher s2c", self.ciphers),
            (MethodType::MacCs, "mac c2s", self.macs),
            (MethodType::MacSc, "mac s2c", self.macs),
        ]
    }

    /// 应用到会话（库不接受的列表记录日志后跳过）
    pub fn apply(&self, session: &Session) {
        for (method, name, list) in self.entries() {
            if let Err(e) = session.method_pref(method, &list.join(",")) {
                tracing::warn!("[SshConn] 忽略算法偏好 {}: {}", name, e);
            }
        }
    }
}

impl Default for AlgorithmPreferences {
    fn default() -> Self {
        Self::DEFAULT
    }
}

// ============================================================================
// 连接状态
// ============================================================================

/// 连接状态枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// 正在连接（握手、认证、打开 Shell）
    Connecting,
    /// 已连接
    Connected,
    /// 已关闭
    Closed,
    /// 错误状态
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Closed => write!(f, "closed"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl ConnectionState {
    /// 检查状态转换是否有效
    ///
    /// 有效的状态转换：
    /// - connecting → connected / error / closed
    /// - connected → closed / error
    ///
    /// closed 与 error 为终态。
    pub fn can_transition_to(&self, new_state: ConnectionState) -> bool {
        matches!(
            (self, new_state),
            (Self::Connecting, Self::Connected)
                | (Self::Connecting, Self::Error)
                | (Self::Connecting, Self::Closed)
                | (Self::Connected, Self::Closed)
                | (Self::Connected, Self::Error)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }
}

// ============================================================================
// keep-alive
// ============================================================================

/// keep-alive 计数器
#[derive(Debug, Clone)]
pub(crate) struct KeepAlive {
    interval: Duration,
    max_missed: u32,
    missed: u32,
    last_probe: Instant,
}

impl KeepAlive {
    pub(crate) fn new(interval: Duration, max_missed: u32, now: Instant) -> Self {
        Self {
            interval,
            max_missed: max_missed.max(1),
            missed: 0,
            last_probe: now,
        }
    }

    pub(crate) fn is_due(&self, now: Instant) -> bool {
        !self.interval.is_zero() && now.duration_since(self.last_probe) >= self.interval
    }

    pub(crate) fn record_success(&mut self, now: Instant) {
        self.missed = 0;
        self.last_probe = now;
    }

    /// 记录一次失败，返回是否应放弃连接
    pub(crate) fn record_failure(&mut self, now: Instant) -> bool {
        self.missed += 1;
        self.last_probe = now;
        self.missed >= self.max_missed
    }

    /// 对端允许失联的最长时间
    pub(crate) fn window(&self) -> Duration {
        self.interval * self.max_missed
    }
}

/// 到期时发送一次 keep-alive，返回放弃连接的原因
///
/// 发送缓冲区已满（would-block）同样算作一次未送达。
pub(crate) fn keepalive_tick<F>(keepalive: &mut KeepAlive, now: Instant, send: F) -> Option<String>
where
    F: FnOnce() -> Result<u32, ssh2::Error>,
{
    if !keepalive.is_due(now) {
        return None;
    }
    let error = match send() {
        Ok(_) => {
            keepalive.record_success(now);
            return None;
        }
        Err(e) if is_would_block(&e) => "发送缓冲区已满".to_string(),
        Err(e) => e.to_string(),
    };
    tracing::warn!("[SshConn] keep-alive 未送达: missed={}, error={}", keepalive.missed + 1, error);
    keepalive
        .record_failure(now)
        .then(|| format!("keep-alive 连续 {} 次失败: {}", keepalive.max_missed, error))
}

/// 为 TCP 连接开启内核存活检测
///
/// 空闲时发送 TCP keep-alive；已发送的数据超过 `window` 未被确认时内核断开连接，
/// 之后的读写立即报错。
#[cfg(target_os = "linux")]
fn configure_liveness(stream: &TcpStream, interval: Duration, window: Duration) -> io::Result<()> {
    use nix::sys::socket::{setsockopt, sockopt};

    if interval.is_zero() {
        return Ok(());
    }
    let interval_secs = u32::try_from(interval.as_secs()).unwrap_or(u32::MAX).max(1);
    let count = u32::try_from(window.as_secs() / u64::from(interval_secs))
        .unwrap_or(u32::MAX)
        .max(1);
    setsockopt(stream, sockopt::KeepAlive, &true)?;
    setsockopt(stream, sockopt::TcpKeepIdle, &interval_secs)?;
    setsockopt(stream, sockopt::TcpKeepInterval, &interval_secs)?;
    setsockopt(stream, sockopt::TcpKeepCount, &count)?;
    setsockopt(stream, sockopt::TcpUserTimeout, &timeout_ms(window))?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn configure_liveness(_stream: &TcpStream, _interval: Duration, _window: Duration) -> io::Result<()> {
    Ok(())
}

// ============================================================================
// 认证
// ============================================================================

/// 键盘交互认证自动应答
///
/// 每个提示都回答同一个值（密码或空字符串）。
struct KeyboardInteractivePrompt {
    answer: String,
}

impl KeyboardInteractivePrompt {
    fn answering(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
        }
    }

    fn empty() -> Self {
        Self {
            answer: String::new(),
        }
    }
}

impl SshKeyboardInteractivePrompt for KeyboardInteractivePrompt {
    fn prompt<'a>(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[ssh2::Prompt<'a>],
    ) -> Vec<String> {
        tracing::debug!("[SshConn] 键盘交互认证: {} 个提示", prompts.len());
        prompts.iter().map(|_| self.answer.clone()).collect()
    }
}

fn authenticate(session: &Session, config: &RemoteConfig) -> Result<(), TransportFailure> {
    let username = config.username.as_str();
    match &config.auth {
        AuthConfig::Password { password } => {
            tracing::debug!("[SshConn] 尝试密码认证: user={}", username);
            if let Err(e) = session.userauth_password(username, password) {
                tracing::debug!("[SshConn] 密码认证失败，尝试键盘交互: {}", e);
                let mut prompt = KeyboardInteractivePrompt::answering(password);
                if session
                    .userauth_keyboard_interactive(username, &mut prompt)
                    .is_err()
                {
                    return Err(TransportFailure::from_auth(&e));
                }
            }
        }
        AuthConfig::PrivateKey {
            private_key_path,
            passphrase,
        } => {
            let key_path = expand_home(private_key_path);
            if !key_path.is_file() {
                return Err(TransportFailure::new(
                    TransportErrorKind::MalformedKey,
                    format!("私钥文件不存在: {}", key_path.display()),
                ));
            }
            tracing::debug!("[SshConn] 尝试私钥认证: {:?}", key_path);
            if let Err(e) =
                session.userauth_pubkey_file(username, None, &key_path, passphrase.as_deref())
            {
                tracing::debug!("[SshConn] 私钥认证失败，尝试键盘交互: {}", e);
                let mut prompt = KeyboardInteractivePrompt::empty();
                if session
                    .userauth_keyboard_interactive(username, &mut prompt)
                    .is_err()
                {
                    return Err(TransportFailure::from_auth(&e));
                }
            }
        }
    }

    if session.authenticated() {
        Ok(())
    } else {
        Err(TransportFailure::new(
            TransportErrorKind::AuthFailed,
            "认证未完成",
        ))
    }
}

/// 计算主机密钥指纹
pub fn host_key_fingerprint(key: &[u8]) -> String {
    let digest = Sha256::digest(key);
    format!("SHA256:{}", BASE64.encode(digest))
}

fn host_key_type_name(key_type: ssh2::HostKeyType) -> &'static str {
    match key_type {
        ssh2::HostKeyType::Rsa => "ssh-rsa",
        ssh2::HostKeyType::Dss => "ssh-dss",
        ssh2::HostKeyType::Ecdsa256 => "ecdsa-sha2-nistp256",
        ssh2::HostKeyType::Ecdsa384 => "ecdsa-sha2-nistp384",
        ssh2::HostKeyType::Ecdsa521 => "ecdsa-sha2-nistp521",
        ssh2::HostKeyType::Ed25519 => "ssh-ed25519",
        ssh2::HostKeyType::Unknown => "unknown",
    }
}

// ============================================================================
// 共享状态
// ============================================================================

/// 交互式通道的输入
#[derive(Debug, Clone, PartialEq, Eq)]
enum ShellInput {
    Data(Vec<u8>),
    Resize { cols: u16, rows: u16 },
}

/// 连接线程、watchdog 与句柄共享的状态
struct ConnShared {
    sink: AdapterSink,
    display_name: String,
    state: Mutex<ConnectionState>,
    /// 连接建立后才有值（非阻塞模式）
    session: Mutex<Option<Session>>,
    shutdown_flag: AtomicBool,
}

impl ConnShared {
    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::SeqCst)
    }

    /// 状态变更与上报在同一把锁内完成，保证上报顺序与状态一致
    fn transition(&self, to: ConnectionState, report: impl FnOnce(&AdapterSink)) -> bool {
        let mut state = self.state.lock();
        if !state.can_transition_to(to) {
            return false;
        }
        tracing::debug!(
            "[SshConn] 状态变更: session_id={}, {} -> {}",
            self.sink.session_id(),
            *state,
            to
        );
        *state = to;
        report(&self.sink);
        true
    }

    fn mark_connected(&self) -> bool {
        self.transition(ConnectionState::Connected, |sink| sink.connected())
    }

    fn mark_closed(&self) -> bool {
        self.transition(ConnectionState::Closed, |sink| sink.closed())
    }

    fn fail(&self, failure: &TransportFailure) -> bool {
        let failed = self.transition(ConnectionState::Error, |sink| {
            sink.failed(failure.status_message())
        });
        if failed {
            tracing::error!(
                "[SshConn] 连接失败: session_id={}, host={}, kind={}, detail={}",
                self.sink.session_id(),
                self.display_name,
                failure.kind,
                failure.detail
            );
        }
        failed
    }

    /// 仅在仍处于 connecting 时失败（就绪超时）
    fn fail_if_connecting(&self, failure: &TransportFailure) -> bool {
        let mut state = self.state.lock();
        if *state != ConnectionState::Connecting {
            return false;
        }
        *state = ConnectionState::Error;
        self.sink.failed(failure.status_message());
        drop(state);
        tracing::error!(
            "[SshConn] 就绪超时: session_id={}, host={}",
            self.sink.session_id(),
            self.display_name
        );
        true
    }
}

// ============================================================================
// SSH 连接
// ============================================================================

/// SSH 连接
///
/// 创建即开始连接，结果通过 `AdapterSink` 异步上报。
pub struct SshConn {
    shared: Arc<ConnShared>,
    input_tx: mpsc::UnboundedSender<ShellInput>,
    opts: SshOptions,
}

impl SshConn {
    /// 开始连接（立即返回）
    ///
    /// 必须在 tokio 运行时中调用（就绪超时 watchdog 为异步任务）。
    pub fn connect(config: RemoteConfig, opts: SshOptions, sink: AdapterSink) -> Self {
        let shared = Arc::new(ConnShared {
            display_name: config.display_name(),
            sink,
            state: Mutex::new(ConnectionState::Connecting),
            session: Mutex::new(None),
            shutdown_flag: AtomicBool::new(false),
        });
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        tracing::info!(
            "[SshConn] 正在连接: session_id={}, host={}",
            shared.sink.session_id(),
            shared.display_name
        );

        let watchdog = shared.clone();
        let ready_timeout = opts.ready_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(ready_timeout).await;
            watchdog.fail_if_connecting(&TransportFailure::timeout(format!(
                "{:?} 内未就绪",
                ready_timeout
            )));
        });

        let worker = shared.clone();
        let worker_opts = opts.clone();
        let thread_name = format!("ssh-{}", shared.sink.session_id());
        let spawned = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || run_connection(worker, config, worker_opts, input_rx));
        if let Err(e) = spawned {
            shared.fail(&TransportFailure::new(
                TransportErrorKind::Other,
                format!("启动连接线程失败: {}", e),
            ));
        }

        Self {
            shared,
            input_tx,
            opts,
        }
    }

    pub fn session_id(&self) -> &str {
        self.shared.sink.session_id()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn send_input(&self, input: ShellInput) {
        if self.state().is_terminal() {
            return;
        }
        if self.input_tx.send(input).is_err() {
            tracing::debug!("[SshConn] 数据泵已退出: session_id={}", self.session_id());
        }
    }

    /// 关闭连接（幂等）
    pub fn shutdown(&self) {
        if self.shared.shutdown_flag.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(
            "[SshConn] 关闭连接: session_id={}, host={}",
            self.session_id(),
            self.shared.display_name
        );
        self.shared.mark_closed();
    }
}

impl Drop for SshConn {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl SessionAdapter for SshConn {
    fn kind(&self) -> SessionKind {
        SessionKind::Remote
    }

    fn write(&self, data: &[u8]) {
        self.send_input(ShellInput::Data(data.to_vec()));
    }

    fn resize(&self, cols: u16, rows: u16) {
        self.send_input(ShellInput::Resize { cols, rows });
    }

    fn close(&self) {
        self.shutdown();
    }

    async fn exec_once(
        &self,
        command: &str,
        timeout: Duration,
        on_chunk: ChunkCallback,
    ) -> Result<ExecOutcome, TerminalError> {
        let session = match (self.state(), self.shared.session.lock().clone()) {
            (ConnectionState::Connected, Some(session)) => session,
            _ => return Err(TerminalError::NoActiveSession(self.session_id().to_string())),
        };

        tracing::info!(
            "[SshConn] 一次性执行: session_id={}, command={}",
            self.session_id(),
            sanitize_log_message(command)
        );

        let command = command.to_string();
        let limit = self.opts.output_limit;
        let deadline = Instant::now() + timeout;
        let task = tokio::task::spawn_blocking(move || {
            run_exec_channel(&session, &command, deadline, limit, on_chunk)
        });

        match tokio::time::timeout(timeout + EXEC_GRACE, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(TerminalError::Internal(format!("执行任务异常: {}", e))),
            Err(_) => Err(TerminalError::ExecTimeout),
        }
    }
}

// ============================================================================
// 连接线程
// ============================================================================

fn remaining(deadline: Instant) -> Result<Duration, TransportFailure> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        Err(TransportFailure::timeout("就绪超时"))
    } else {
        Ok(left)
    }
}

fn timeout_ms(left: Duration) -> u32 {
    u32::try_from(left.as_millis()).unwrap_or(u32::MAX).max(1)
}

fn resolve(config: &RemoteConfig) -> Result<Vec<SocketAddr>, TransportFailure> {
    let addrs: Vec<SocketAddr> = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| {
            TransportFailure::new(
                TransportErrorKind::HostUnreachable,
                format!("解析主机失败 {}: {}", config.host, e),
            )
        })?
        .collect();
    if addrs.is_empty() {
        return Err(TransportFailure::new(
            TransportErrorKind::HostUnreachable,
            format!("主机没有可用地址: {}", config.host),
        ));
    }
    Ok(addrs)
}

fn connect_tcp(config: &RemoteConfig, deadline: Instant) -> Result<TcpStream, TransportFailure> {
    let mut last_error = None;
    for addr in resolve(config)? {
        let left = remaining(deadline)?;
        match TcpStream::connect_timeout(&addr, left) {
            Ok(stream) => {
                tracing::debug!("[SshConn] TCP 已连接: {}", addr);
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!("[SshConn] TCP 连接 {} 失败: {}", addr, e);
                last_error = Some(TransportFailure::from_io(&e));
            }
        }
    }
    Err(last_error.unwrap_or_else(|| {
        TransportFailure::new(TransportErrorKind::HostUnreachable, "没有可连接的地址")
    }))
}

/// 握手、认证并打开交互式 Shell 通道
fn establish(
    config: &RemoteConfig,
    opts: &SshOptions,
    deadline: Instant,
) -> Result<(Session, Channel), TransportFailure> {
    let tcp = connect_tcp(config, deadline)?;
    let window = KeepAlive::new(opts.keepalive_interval, opts.keepalive_max_missed, Instant::now()).window();
    if let Err(e) = configure_liveness(&tcp, opts.keepalive_interval, window) {
        tracing::warn!("[SshConn] 设置 TCP 存活检测失败（忽略）: {}", e);
    }

    let mut session = Session::new().map_err(|e| TransportFailure::from_ssh(&e))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(timeout_ms(remaining(deadline)?));
    AlgorithmPreferences::DEFAULT.apply(&session);
    session
        .handshake()
        .map_err(|e| TransportFailure::from_ssh(&e))?;

    if let Some((key, key_type)) = session.host_key() {
        tracing::info!(
            "[SshConn] 主机密钥: host={}, type={}, fingerprint={}",
            config.display_name(),
            host_key_type_name(key_type),
            host_key_fingerprint(key)
        );
    }

    session.set_timeout(timeout_ms(remaining(deadline)?));
    authenticate(&session, config)?;
    tracing::info!("[SshConn] 认证成功: {}", config.display_name());

    session.set_timeout(timeout_ms(remaining(deadline)?));
    let mut channel = session
        .channel_session()
        .map_err(|e| TransportFailure::from_ssh(&e))?;
    channel
        .request_pty(
            TERM_TYPE,
            None,
            Some((opts.cols as u32, opts.rows as u32, 0, 0)),
        )
        .map_err(|e| TransportFailure::from_ssh(&e))?;
    channel.shell().map_err(|e| TransportFailure::from_ssh(&e))?;

    // 0 表示不限时
    session.set_timeout(0);
    Ok((session, channel))
}

fn run_connection(
    shared: Arc<ConnShared>,
    config: RemoteConfig,
    opts: SshOptions,
    input_rx: mpsc::UnboundedReceiver<ShellInput>,
) {
    let deadline = Instant::now() + opts.ready_timeout;
    let (session, channel) = match establish(&config, &opts, deadline) {
        Ok(established) => established,
        Err(failure) => {
            if !shared.is_shutdown() {
                shared.fail(&failure);
            }
            return;
        }
    };

    session.set_blocking(false);
    *shared.session.lock() = Some(session.clone());

    if shared.is_shutdown() || !shared.mark_connected() {
        tracing::debug!(
            "[SshConn] 连接建立时已关闭或超时，丢弃: session_id={}",
            shared.sink.session_id()
        );
        teardown(&shared, &session);
        return;
    }

    tracing::info!(
        "[SshConn] 远程 Shell 已就绪: session_id={}, host={}",
        shared.sink.session_id(),
        shared.display_name
    );

    pump(&shared, &session, channel, input_rx, &opts);
    teardown(&shared, &session);
}

fn teardown(shared: &ConnShared, session: &Session) {
    shared.session.lock().take();
    if let Err(e) = session.disconnect(None, "closed", None) {
        tracing::debug!("[SshConn] 断开时出错（忽略）: {}", e);
    }
}

enum ReadStatus {
    Idle,
    Data,
    Failed(io::Error),
}

fn read_into(stream: &mut dyn Read, buffer: &mut [u8], on_data: impl FnOnce(&[u8])) -> ReadStatus {
    match stream.read(buffer) {
        Ok(0) => ReadStatus::Idle,
        Ok(n) => {
            on_data(&buffer[..n]);
            ReadStatus::Data
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => ReadStatus::Idle,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => ReadStatus::Idle,
        Err(e) => ReadStatus::Failed(e),
    }
}

/// 非阻塞写入全部数据
fn write_all_nonblocking(channel: &mut Channel, mut data: &[u8], shared: &ConnShared) -> io::Result<()> {
    while !data.is_empty() {
        if shared.is_shutdown() {
            return Ok(());
        }
        match channel.write(data) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "通道不再接受数据")),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::sleep(Duration::from_millis(1)),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    loop {
        match channel.flush() {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::sleep(Duration::from_millis(1)),
            Err(e) => return Err(e),
        }
    }
}

/// 在非阻塞会话上重试 EAGAIN，截止时间到达返回 `Ok(None)`
fn retry_would_block<T>(
    deadline: Instant,
    mut op: impl FnMut() -> Result<T, ssh2::Error>,
) -> Result<Option<T>, ssh2::Error> {
    loop {
        match op() {
            Ok(value) => return Ok(Some(value)),
            Err(e) if is_would_block(&e) => {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => return Err(e),
        }
    }
}

/// 交互式通道数据泵
fn pump(
    shared: &ConnShared,
    session: &Session,
    mut channel: Channel,
    mut input_rx: mpsc::UnboundedReceiver<ShellInput>,
    opts: &SshOptions,
) {
    let session_id = shared.sink.session_id().to_string();
    let mut keepalive = KeepAlive::new(opts.keepalive_interval, opts.keepalive_max_missed, Instant::now());
    session.set_keepalive(true, opts.keepalive_interval.as_secs().max(1) as u32);
    let mut buffer = [0u8; READ_BUFFER_SIZE];

    loop {
        if shared.is_shutdown() {
            tracing::debug!("[SshConn] 收到关闭信号: session_id={}", session_id);
            let _ = channel.close();
            return;
        }

        let mut busy = false;

        {
            let mut stdout = channel.stream(0);
            let mut stderr = channel.stderr();
            for stream in [&mut stdout as &mut dyn Read, &mut stderr as &mut dyn Read] {
                match read_into(stream, &mut buffer, |data| shared.sink.data(data)) {
                    ReadStatus::Data => busy = true,
                    ReadStatus::Idle => {}
                    ReadStatus::Failed(e) => {
                        if !shared.is_shutdown() {
                            shared.fail(&TransportFailure::from_io(&e));
                        }
                        return;
                    }
                }
            }
        }

        if !busy && channel.eof() {
            tracing::info!("[SshConn] 远程 Shell 已关闭: session_id={}", session_id);
            shared.mark_closed();
            return;
        }

        while let Ok(input) = input_rx.try_recv() {
            busy = true;
            match input {
                ShellInput::Data(data) => {
                    if let Err(e) = write_all_nonblocking(&mut channel, &data, shared) {
                        tracing::warn!("[SshConn] 写入失败: session_id={}, error={}", session_id, e);
                    }
                }
                ShellInput::Resize { cols, rows } => {
                    let deadline = Instant::now() + Duration::from_secs(1);
                    let resized = retry_would_block(deadline, || {
                        channel.request_pty_size(cols as u32, rows as u32, Some(0), Some(0))
                    });
                    match resized {
                        Ok(Some(())) => tracing::debug!(
                            "[SshConn] 调整大小: session_id={}, size={}x{}",
                            session_id,
                            cols,
                            rows
                        ),
                        Ok(None) | Err(_) => tracing::debug!(
                            "[SshConn] 调整大小失败（忽略）: session_id={}",
                            session_id
                        ),
                    }
                }
            }
        }

        if let Some(reason) = keepalive_tick(&mut keepalive, Instant::now(), || session.keepalive_send()) {
            tracing::warn!("[SshConn] 放弃连接: session_id={}, reason={}", session_id, reason);
            shared.fail(&TransportFailure::new(TransportErrorKind::ConnectionReset, reason));
            return;
        }

        if !busy {
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

/// 在独立通道上执行一次命令（阻塞，运行于 `spawn_blocking`）
fn run_exec_channel(
    session: &Session,
    command: &str,
    deadline: Instant,
    limit: usize,
    on_chunk: ChunkCallback,
) -> Result<ExecOutcome, TerminalError> {
    let to_error = |e: ssh2::Error| TerminalError::from(TransportFailure::from_ssh(&e));

    let mut channel = match retry_would_block(deadline, || session.channel_session()).map_err(to_error)? {
        Some(channel) => channel,
        None => return Ok(ExecOutcome::timed_out(String::new())),
    };
    if retry_would_block(deadline, || channel.exec(command))
        .map_err(to_error)?
        .is_none()
    {
        let _ = channel.close();
        return Ok(ExecOutcome::timed_out(String::new()));
    }

    let mut output = OutputBuffer::new(limit);
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    loop {
        if Instant::now() >= deadline {
            // 尽力关闭，不等待
            let _ = channel.close();
            return Ok(output.into_timed_out());
        }

        let mut busy = false;
        {
            let mut stdout = channel.stream(0);
            let mut stderr = channel.stderr();
            for stream in [&mut stdout as &mut dyn Read, &mut stderr as &mut dyn Read] {
                let status = read_into(stream, &mut buffer, |data| {
                    on_chunk(data);
                    output.push(data);
                });
                match status {
                    ReadStatus::Data => busy = true,
                    ReadStatus::Idle => {}
                    ReadStatus::Failed(e) => {
                        return Err(TransportFailure::from_io(&e).into());
                    }
                }
            }
        }

        if !busy {
            if channel.eof() {
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    let closed = retry_would_block(deadline, || channel.close())
        .ok()
        .flatten()
        .and_then(|_| retry_would_block(deadline, || channel.wait_close()).ok().flatten());
    let exit_code = match closed {
        Some(()) => channel.exit_status().unwrap_or(FAILED_EXIT_CODE),
        None => FAILED_EXIT_CODE,
    };

    tracing::debug!("[SshConn] 一次性执行完成: exit_code={}", exit_code);
    Ok(output.into_finished(exit_code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use ConnectionState::*;
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connecting.can_transition_to(Error));
        assert!(Connected.can_transition_to(Closed));
        assert!(Connected.can_transition_to(Error));

        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Closed.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Connected));
        assert!(!Error.can_transition_to(Closed));
        assert!(Closed.is_terminal() && Error.is_terminal());
    }

    #[test]
    fn test_keepalive_gives_up_after_max_missed() {
        let start = Instant::now();
        let interval = Duration::from_secs(10);
        let mut keepalive = KeepAlive::new(interval, 3, start);

        assert!(!keepalive.is_due(start));
        assert!(keepalive.is_due(start + interval));

        assert!(!keepalive.record_failure(start + interval));
        assert!(!keepalive.record_failure(start + interval * 2));
        assert!(keepalive.record_failure(start + interval * 3));
    }

    #[test]
    fn test_keepalive_success_resets_counter() {
        let start = Instant::now();
        let interval = Duration::from_secs(1);
        let mut keepalive = KeepAlive::new(interval, 2, start);

        assert!(!keepalive.record_failure(start + interval));
        keepalive.record_success(start + interval * 2);
        assert!(!keepalive.record_failure(start + interval * 3));
        assert!(!keepalive.is_due(start + interval * 3));
    }

    use crate::terminal::connections::transport_error::libssh2_code;

    fn send_failed() -> Result<u32, ssh2::Error> {
        Err(ssh2::Error::new(
            ssh2::ErrorCode::Session(libssh2_code::SOCKET_SEND),
            "Unable to send keepalive message",
        ))
    }

    #[test]
    fn test_keepalive_tick_gives_up_on_undelivered_sends() {
        let start = Instant::now();
        let interval = Duration::from_secs(10);
        let mut keepalive = KeepAlive::new(interval, 3, start);

        assert!(keepalive_tick(&mut keepalive, start, || panic!("未到期不应发送")).is_none());
        assert!(keepalive_tick(&mut keepalive, start + interval, send_failed).is_none());
        let would_block = || -> Result<u32, ssh2::Error> {
            Err(ssh2::Error::new(
                ssh2::ErrorCode::Session(libssh2_code::EAGAIN),
                "Would block",
            ))
        };
        assert!(keepalive_tick(&mut keepalive, start + interval * 2, would_block).is_none());
        let reason = keepalive_tick(&mut keepalive, start + interval * 3, send_failed).unwrap();
        assert!(reason.contains("连续 3 次"), "{}", reason);
    }

    #[test]
    fn test_keepalive_tick_success_keeps_connection() {
        let start = Instant::now();
        let interval = Duration::from_secs(5);
        let mut keepalive = KeepAlive::new(interval, 2, start);

        assert!(keepalive_tick(&mut keepalive, start + interval, send_failed).is_none());
        assert!(keepalive_tick(&mut keepalive, start + interval * 2, || Ok(5)).is_none());
        assert!(keepalive_tick(&mut keepalive, start + interval * 3, send_failed).is_none());
        assert_eq!(keepalive.window(), interval * 2);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_configure_liveness_sets_socket_options() {
        use nix::sys::socket::{getsockopt, sockopt};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        configure_liveness(&stream, Duration::from_secs(10), Duration::from_secs(30)).unwrap();

        assert!(getsockopt(&stream, sockopt::KeepAlive).unwrap());
        assert_eq!(getsockopt(&stream, sockopt::TcpKeepIdle).unwrap(), 10);
        assert_eq!(getsockopt(&stream, sockopt::TcpKeepCount).unwrap(), 3);
        assert_eq!(getsockopt(&stream, sockopt::TcpUserTimeout).unwrap(), 30_000);
    }

    #[test]
    fn test_algorithm_preferences_strongest_first() {
        let prefs = AlgorithmPreferences::default();
        assert_eq!(prefs.kex.first(), Some(&"ecdh-sha2-nistp521"));
        assert_eq!(prefs.kex.last(), Some(&"diffie-hellman-group1-sha1"));
        assert_eq!(prefs.host_key.first(), Some(&"ssh-ed25519"));
        assert_eq!(prefs.host_key.last(), Some(&"ssh-rsa"));
        assert_eq!(prefs.ciphers.last(), Some(&"aes128-ctr"));
        assert_eq!(prefs.macs, &["hmac-sha2-512", "hmac-sha2-256", "hmac-sha1"]);
        assert!(!prefs.ciphers.iter().any(|c| c.contains("cbc") || c.contains("arcfour")));
    }

    #[test]
    fn test_keyboard_interactive_answers_every_prompt() {
        let prompts = [
            ssh2::Prompt {
                text: "Password: ".into(),
                echo: false,
            },
            ssh2::Prompt {
                text: "Code: ".into(),
                echo: true,
            },
        ];
        let mut prompt = KeyboardInteractivePrompt::answering("secret");
        assert_eq!(prompt.prompt("u", "", &prompts), vec!["secret", "secret"]);

        let mut empty = KeyboardInteractivePrompt::empty();
        assert_eq!(empty.prompt("u", "", &prompts), vec!["", ""]);
    }

    #[test]
    fn test_host_key_fingerprint_format() {
        let fingerprint = host_key_fingerprint(b"key");
        assert!(fingerprint.starts_with("SHA256:"));
        // 32 字节摘要的 Base64 长度为 44
        assert_eq!(fingerprint.len(), "SHA256:".len() + 44);
    }

    #[test]
    fn test_timeout_ms_is_never_zero() {
        assert_eq!(timeout_ms(Duration::from_micros(10)), 1);
        assert_eq!(timeout_ms(Duration::from_secs(2)), 2000);
    }

    #[test]
    fn test_options_from_config() {
        let opts = SshOptions::default();
        assert_eq!(opts.ready_timeout, Duration::from_secs(30));
        assert_eq!(opts.keepalive_interval, Duration::from_secs(10));
        assert_eq!(opts.keepalive_max_missed, 3);
        assert_eq!((opts.cols, opts.rows), (80, 24));
    }
}
