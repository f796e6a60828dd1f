//! 事件定义与事件多路复用器
//!
//! 所有适配器的输出统一汇入一条向外的事件通道，按会话 ID 打标签。
//!
//! ## 结构
//! - `TerminalEvent`: 向消费方（UI）推送的事件
//! - `EventMultiplexer` / `EventStream`: 向外通道的发送端与接收端
//! - `AdapterSink` / `AdapterReport`: 适配器向注册表上报的内部通道，
//!   每条上报都带有绑定纪元（epoch），注册表据此丢弃过期适配器的事件
//!
//! ## 顺序保证
//! 同一适配器的事件按发出顺序投递；不同会话之间不保证顺序。

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::mpsc;

/// 会话 ID
pub type SessionId = String;

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// 一次性执行的目标
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ExecTarget {
    /// 本地一次性进程
    Local,
    /// 已连接会话上的独立执行通道
    #[serde(rename_all = "camelCase")]
    Session { session_id: SessionId },
}

impl ExecTarget {
    pub fn session(id: impl Into<SessionId>) -> Self {
        Self::Session {
            session_id: id.into(),
        }
    }
}

impl std::fmt::Display for ExecTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Session { session_id } => write!(f, "session:{}", session_id),
        }
    }
}

/// 向消费方推送的事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TerminalEvent {
    /// 会话输出（stdout/stderr 合并）
    #[serde(rename_all = "camelCase")]
    SessionData {
        session_id: SessionId,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// 会话状态变更
    #[serde(rename_all = "camelCase")]
    SessionStatus {
        session_id: SessionId,
        status: SessionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// 本地进程退出
    #[serde(rename_all = "camelCase")]
    SessionExit {
        session_id: SessionId,
        exit_code: Option<i32>,
    },
    /// 本地 Shell 就绪
    #[serde(rename_all = "camelCase")]
    LocalShellReady { session_id: SessionId },
    /// 本地 Shell 不可用或启动失败
    LocalShellError { message: String },
    /// 一次性执行的实时输出
    AgentOutput {
        target: ExecTarget,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
}

impl TerminalEvent {
    /// 事件所属会话（全局事件返回 None）
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SessionData { session_id, .. }
            | Self::SessionStatus { session_id, .. }
            | Self::SessionExit { session_id, .. }
            | Self::LocalShellReady { session_id } => Some(session_id),
            Self::AgentOutput {
                target: ExecTarget::Session { session_id },
                ..
            } => Some(session_id),
            _ => None,
        }
    }
}

/// 事件多路复用器（发送端）
///
/// 可克隆；消费方慢时事件在通道中排队，由底层传输的流控限制生产速度。
#[derive(Debug, Clone)]
pub struct EventMultiplexer {
    tx: mpsc::UnboundedSender<TerminalEvent>,
}

/// 事件流（接收端）
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<TerminalEvent>,
}

impl EventMultiplexer {
    /// 创建多路复用器和唯一的事件流
    pub fn new() -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, EventStream { rx })
    }

    /// 推送事件（消费方已断开时静默丢弃）
    pub fn emit(&self, event: TerminalEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("[EventMux] 消费方已断开，丢弃事件");
        }
    }

    pub fn emit_status(&self, session_id: &str, status: SessionStatus, message: Option<String>) {
        self.emit(TerminalEvent::SessionStatus {
            session_id: session_id.to_string(),
            status,
            message,
        });
    }

    pub fn emit_data(&self, session_id: &str, data: Vec<u8>) {
        self.emit(TerminalEvent::SessionData {
            session_id: session_id.to_string(),
            data,
        });
    }

    pub fn emit_agent_output(&self, target: &ExecTarget, data: &[u8]) {
        self.emit(TerminalEvent::AgentOutput {
            target: target.clone(),
            data: data.to_vec(),
        });
    }
}

impl EventStream {
    /// 等待下一个事件；所有发送端关闭后返回 None
    pub async fn recv(&mut self) -> Option<TerminalEvent> {
        self.rx.recv().await
    }

    /// 非阻塞地取出一个事件
    pub fn try_recv(&mut self) -> Option<TerminalEvent> {
        self.rx.try_recv().ok()
    }
}

// ============================================================================
// 适配器上报通道
// ============================================================================

/// 适配器事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    /// 输出数据
    Data(Vec<u8>),
    /// 远程连接就绪
    Connected,
    /// 传输失败（消息已分类）
    Failed(String),
    /// 连接正常关闭
    Closed,
    /// 本地进程退出
    Exit(Option<i32>),
}

/// 带会话 ID 与纪元的上报
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterReport {
    pub session_id: SessionId,
    pub epoch: u64,
    pub event: AdapterEvent,
}

/// 适配器持有的上报句柄
///
/// 适配器只通过它对外汇报，从不直接访问注册表。
#[derive(Debug, Clone)]
pub struct AdapterSink {
    session_id: SessionId,
    epoch: u64,
    tx: mpsc::UnboundedSender<AdapterReport>,
}

impl AdapterSink {
    pub fn new(
        session_id: impl Into<SessionId>,
        epoch: u64,
        tx: mpsc::UnboundedSender<AdapterReport>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            epoch,
            tx,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn report(&self, event: AdapterEvent) {
        let report = AdapterReport {
            session_id: self.session_id.clone(),
            epoch: self.epoch,
            event,
        };
        if self.tx.send(report).is_err() {
            tracing::trace!("[AdapterSink] 注册表已关闭: session_id={}", self.session_id);
        }
    }

    pub fn data(&self, data: &[u8]) {
        self.report(AdapterEvent::Data(data.to_vec()));
    }

    pub fn connected(&self) {
        self.report(AdapterEvent::Connected);
    }

    pub fn failed(&self, message: impl Into<String>) {
        self.report(AdapterEvent::Failed(message.into()));
    }

    pub fn closed(&self) {
        self.report(AdapterEvent::Closed);
    }

    pub fn exit(&self, code: Option<i32>) {
        self.report(AdapterEvent::Exit(code));
    }
}

/// 字节数据以 Base64 字符串序列化
mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}
