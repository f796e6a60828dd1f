//! 会话注册表
//!
//! 会话 ID 到会话记录的唯一映射，管理所有适配器的绑定与生命周期。
//!
//! ## 功能
//! - 创建本地会话、连接远程会话（立即返回，状态异步上报）
//! - 写入、调整大小（无适配器时静默忽略）
//! - 断开（解绑适配器，保留记录）与销毁（删除记录）
//! - 一次性执行委托给已绑定的适配器
//! - 按连接配置 ID 获取或创建会话
//!
//! ## 绑定纪元
//! 每次绑定分配一个全局递增的纪元，解绑时纪元也会前进。
//! 适配器的上报带有纪元，上报泵只处理当前纪元的事件，
//! 因此同一会话不会同时存在两个活跃适配器的状态事件。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shellmux_core::RemoteConfig;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::adapter::{AdapterFactory, SessionAdapter, SessionKind, SystemAdapterFactory};
use super::config::TerminalConfig;
use super::connections::local_pty::probe_pty;
use super::error::TerminalError;
use super::events::{
    AdapterEvent, AdapterReport, AdapterSink, EventMultiplexer, SessionId, SessionStatus,
    TerminalEvent,
};
use super::exec::{ChunkCallback, ExecOutcome};

/// 会话快照（对外展示）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub kind: Option<SessionKind>,
    pub status: SessionStatus,
    pub message: Option<String>,
    pub profile_id: Option<String>,
    /// 远程会话的 `user@host:port`
    pub target: Option<String>,
    pub has_adapter: bool,
    /// 创建时间（Unix 时间戳，毫秒）
    pub created_at: i64,
}

/// 会话记录
struct SessionRecord {
    id: SessionId,
    kind: Option<SessionKind>,
    remote: Option<RemoteConfig>,
    profile_id: Option<String>,
    status: SessionStatus,
    message: Option<String>,
    adapter: Option<Arc<dyn SessionAdapter>>,
    epoch: u64,
    created_at: i64,
}

impl SessionRecord {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            kind: None,
            remote: None,
            profile_id: None,
            status: SessionStatus::Disconnected,
            message: None,
            adapter: None,
            epoch: 0,
            created_at: Utc::now().timestamp_millis(),
        }
    }

    /// 关闭并解绑适配器，纪元前进
    fn unbind(&mut self, epoch: u64) -> bool {
        self.epoch = epoch;
        match self.adapter.take() {
            Some(adapter) => {
                adapter.close();
                true
            }
            None => false,
        }
    }

    /// 适配器自行结束后释放（纪元不变，后续上报因无适配器而被丢弃）
    fn release(&mut self) {
        if let Some(adapter) = self.adapter.take() {
            adapter.close();
        }
    }

    fn set_status(&mut self, events: &EventMultiplexer, status: SessionStatus, message: Option<String>) {
        self.status = status;
        self.message = message.clone();
        events.emit_status(&self.id, status, message);
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            kind: self.kind,
            status: self.status,
            message: self.message.clone(),
            profile_id: self.profile_id.clone(),
            target: self.remote.as_ref().map(RemoteConfig::display_name),
            has_adapter: self.adapter.is_some(),
            created_at: self.created_at,
        }
    }
}

type SessionMap = Arc<RwLock<HashMap<SessionId, SessionRecord>>>;

/// 会话注册表
///
/// 由宿主进程构造并持有，关闭时调用 `shutdown` 关闭所有适配器。
/// 必须在 tokio 运行时中构造（上报泵为异步任务）。
pub struct SessionRegistry {
    sessions: SessionMap,
    config: Arc<TerminalConfig>,
    factory: Arc<dyn AdapterFactory>,
    events: EventMultiplexer,
    report_tx: mpsc::UnboundedSender<AdapterReport>,
    next_epoch: AtomicU64,
    /// 本地 PTY 探测结果（启动时一次）
    pty_status: Result<(), String>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SessionRegistry {
    /// 使用真实 PTY / SSH 适配器创建注册表
    pub fn new(config: Arc<TerminalConfig>, events: EventMultiplexer) -> Self {
        let factory = Arc::new(SystemAdapterFactory::new(config.clone()));
        Self::with_factory(config, events, factory, probe_pty())
    }

    /// 使用自定义适配器工厂创建注册表
    pub fn with_factory(
        config: Arc<TerminalConfig>,
        events: EventMultiplexer,
        factory: Arc<dyn AdapterFactory>,
        pty_status: Result<(), String>,
    ) -> Self {
        let sessions: SessionMap = Arc::new(RwLock::new(HashMap::new()));
        let (report_tx, report_rx) = mpsc::unbounded_channel();

        if let Err(reason) = &pty_status {
            tracing::error!("[SessionRegistry] 本地 PTY 不可用: {}", reason);
            events.emit(TerminalEvent::LocalShellError {
                message: format!("本地终端不可用: {}", reason),
            });
        }

        let pump = tokio::spawn(run_report_pump(sessions.clone(), events.clone(), report_rx));

        tracing::info!(
            "[SessionRegistry] 已初始化: max_sessions={}, shell={}",
            config.max_sessions,
            config.shell_path
        );

        Self {
            sessions,
            config,
            factory,
            events,
            report_tx,
            next_epoch: AtomicU64::new(1),
            pty_status,
            pump: Mutex::new(Some(pump)),
        }
    }

    pub fn config(&self) -> &Arc<TerminalConfig> {
        &self.config
    }

    pub fn events(&self) -> &EventMultiplexer {
        &self.events
    }

    /// 本地 PTY 是否可用
    pub fn local_available(&self) -> bool {
        self.pty_status.is_ok()
    }

    fn next_epoch(&self) -> u64 {
        self.next_epoch.fetch_add(1, Ordering::SeqCst)
    }

    fn sink(&self, session_id: &str, epoch: u64) -> AdapterSink {
        AdapterSink::new(session_id, epoch, self.report_tx.clone())
    }

    fn ensure_capacity(
        &self,
        sessions: &HashMap<SessionId, SessionRecord>,
        session_id: &str,
    ) -> Result<(), TerminalError> {
        if !sessions.contains_key(session_id) && sessions.len() >= self.config.max_sessions {
            tracing::warn!(
                "[SessionRegistry] 会话数量已达上限: {}",
                self.config.max_sessions
            );
            return Err(TerminalError::SessionLimitReached(self.config.max_sessions));
        }
        Ok(())
    }

    /// 创建本地会话
    ///
    /// 未指定 ID 时生成新的 UUID。已有适配器会先被关闭。
    pub async fn create_local(&self, session_id: Option<SessionId>) -> Result<SessionId, TerminalError> {
        if let Err(reason) = &self.pty_status {
            return Err(TerminalError::AdapterUnavailable(reason.clone()));
        }

        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut sessions = self.sessions.write().await;
        self.ensure_capacity(&sessions, &session_id)?;

        let epoch = self.next_epoch();
        let record = sessions
            .entry(session_id.clone())
            .or_insert_with(|| SessionRecord::new(session_id.clone()));
        if record.unbind(epoch) {
            tracing::info!("[SessionRegistry] 替换已有适配器: session_id={}", session_id);
            record.set_status(&self.events, SessionStatus::Disconnected, None);
        }
        record.kind = Some(SessionKind::Local);
        record.remote = None;

        match self.factory.spawn_local(self.sink(&session_id, epoch)) {
            Ok(adapter) => {
                record.adapter = Some(adapter);
                record.set_status(&self.events, SessionStatus::Connected, None);
                self.events.emit(TerminalEvent::LocalShellReady {
                    session_id: session_id.clone(),
                });
                tracing::info!("[SessionRegistry] 本地会话已创建: session_id={}", session_id);
                Ok(session_id)
            }
            Err(e) => {
                tracing::error!(
                    "[SessionRegistry] 本地会话创建失败: session_id={}, error={}",
                    session_id,
                    e
                );
                record.set_status(&self.events, SessionStatus::Error, Some(e.to_string()));
                self.events.emit(TerminalEvent::LocalShellError {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// 连接远程会话
    ///
    /// 凭据缺失时在任何网络动作之前拒绝。旧适配器的关闭先于新连接开始。
    pub async fn connect_remote(
        &self,
        session_id: &str,
        config: RemoteConfig,
    ) -> Result<(), TerminalError> {
        self.bind_remote(session_id, config, None).await
    }

    /// 按连接配置连接远程会话
    ///
    /// 同一连接配置同一时刻只属于一个会话：其他持有该配置的会话先被断开，
    /// 并失去与该配置的关联。
    pub async fn connect_profile(
        &self,
        session_id: &str,
        config: RemoteConfig,
        profile_id: &str,
    ) -> Result<(), TerminalError> {
        self.bind_remote(session_id, config, Some(profile_id)).await
    }

    async fn bind_remote(
        &self,
        session_id: &str,
        config: RemoteConfig,
        profile_id: Option<&str>,
    ) -> Result<(), TerminalError> {
        config.validate()?;

        let mut sessions = self.sessions.write().await;
        self.ensure_capacity(&sessions, session_id)?;

        if let Some(profile_id) = profile_id {
            for other in sessions
                .values_mut()
                .filter(|r| r.id != session_id && r.profile_id.as_deref() == Some(profile_id))
            {
                other.profile_id = None;
                if other.unbind(self.next_epoch()) {
                    tracing::info!(
                        "[SessionRegistry] 连接配置转移，断开旧会话: profile_id={}, session_id={}",
                        profile_id,
                        other.id
                    );
                    other.set_status(&self.events, SessionStatus::Disconnected, None);
                }
            }
        }

        let epoch = self.next_epoch();
        let record = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionRecord::new(session_id.to_string()));
        if record.unbind(epoch) {
            tracing::info!(
                "[SessionRegistry] 关闭旧连接后重新连接: session_id={}",
                session_id
            );
        }

        tracing::info!(
            "[SessionRegistry] 连接远程会话: session_id={}, target={}",
            session_id,
            config.display_name()
        );

        record.kind = Some(SessionKind::Remote);
        record.remote = Some(config.clone());
        if let Some(profile_id) = profile_id {
            record.profile_id = Some(profile_id.to_string());
        }
        record.set_status(&self.events, SessionStatus::Connecting, None);
        record.adapter = Some(self.factory.spawn_remote(config, self.sink(session_id, epoch)));
        Ok(())
    }

    fn bound_adapter(
        sessions: &HashMap<SessionId, SessionRecord>,
        session_id: &str,
    ) -> Option<Arc<dyn SessionAdapter>> {
        sessions.get(session_id).and_then(|r| r.adapter.clone())
    }

    /// 写入会话（无适配器时静默忽略）
    pub async fn write(&self, session_id: &str, data: &[u8]) {
        let sessions = self.sessions.read().await;
        match Self::bound_adapter(&sessions, session_id) {
            Some(adapter) => adapter.write(data),
            None => tracing::trace!("[SessionRegistry] 忽略写入: session_id={}", session_id),
        }
    }

    /// 调整会话大小（无适配器时静默忽略）
    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) {
        let sessions = self.sessions.read().await;
        if let Some(adapter) = Self::bound_adapter(&sessions, session_id) {
            adapter.resize(cols, rows);
        }
    }

    /// 断开会话（保留记录）
    pub async fn disconnect(&self, session_id: &str) -> Result<(), TerminalError> {
        let mut sessions = self.sessions.write().await;
        let epoch = self.next_epoch();
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| TerminalError::SessionNotFound(session_id.to_string()))?;

        if record.unbind(epoch) {
            tracing::info!("[SessionRegistry] 已断开: session_id={}", session_id);
        }
        record.set_status(&self.events, SessionStatus::Disconnected, None);
        Ok(())
    }

    /// 销毁会话记录，返回记录是否存在
    pub async fn destroy(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.remove(session_id) {
            Some(mut record) => {
                if record.unbind(self.next_epoch()) {
                    record.set_status(&self.events, SessionStatus::Disconnected, None);
                }
                tracing::info!("[SessionRegistry] 已销毁: session_id={}", session_id);
                true
            }
            None => false,
        }
    }

    /// 在会话的适配器上一次性执行
    pub async fn exec(
        &self,
        session_id: &str,
        command: &str,
        timeout: Duration,
        on_chunk: ChunkCallback,
    ) -> Result<ExecOutcome, TerminalError> {
        let adapter = {
            let sessions = self.sessions.read().await;
            Self::bound_adapter(&sessions, session_id)
        }
        .ok_or_else(|| TerminalError::NoActiveSession(session_id.to_string()))?;

        adapter.exec_once(command, timeout, on_chunk).await
    }

    /// 按连接配置 ID 获取或创建会话记录
    pub async fn get_or_create_session(&self, profile_id: &str) -> Result<SessionId, TerminalError> {
        let mut sessions = self.sessions.write().await;
        if let Some(record) = sessions
            .values()
            .find(|r| r.profile_id.as_deref() == Some(profile_id))
        {
            return Ok(record.id.clone());
        }

        let session_id = Uuid::new_v4().to_string();
        self.ensure_capacity(&sessions, &session_id)?;
        let mut record = SessionRecord::new(session_id.clone());
        record.profile_id = Some(profile_id.to_string());
        sessions.insert(session_id.clone(), record);

        tracing::debug!(
            "[SessionRegistry] 为连接配置创建会话: profile_id={}, session_id={}",
            profile_id,
            session_id
        );
        Ok(session_id)
    }

    pub async fn get_session(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.sessions.read().await.get(session_id).map(SessionRecord::snapshot)
    }

    /// 所有会话（按创建时间排序）
    pub async fn list_sessions(&self) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<SessionSnapshot> = sessions.values().map(SessionRecord::snapshot).collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    /// 远程会话的连接配置
    pub async fn remote_config(&self, session_id: &str) -> Option<RemoteConfig> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .and_then(|r| r.remote.clone())
    }

    /// 关闭所有适配器
    pub async fn shutdown(&self) {
        let mut sessions = self.sessions.write().await;
        let mut closed = 0usize;
        for record in sessions.values_mut() {
            if record.unbind(self.next_epoch()) {
                record.set_status(&self.events, SessionStatus::Disconnected, None);
                closed += 1;
            }
        }
        tracing::info!("[SessionRegistry] 已关闭 {} 个适配器", closed);
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

/// 上报泵：只应用当前纪元的上报
async fn run_report_pump(
    sessions: SessionMap,
    events: EventMultiplexer,
    mut report_rx: mpsc::UnboundedReceiver<AdapterReport>,
) {
    while let Some(report) = report_rx.recv().await {
        if let AdapterEvent::Data(_) = report.event {
            let sessions = sessions.read().await;
            if is_current(&sessions, &report) {
                if let AdapterEvent::Data(data) = report.event {
                    events.emit_data(&report.session_id, data);
                }
            }
            continue;
        }

        let mut sessions = sessions.write().await;
        if !is_current(&sessions, &report) {
            tracing::debug!(
                "[SessionRegistry] 丢弃过期上报: session_id={}, epoch={}, event={:?}",
                report.session_id,
                report.epoch,
                report.event
            );
            continue;
        }
        let Some(record) = sessions.get_mut(&report.session_id) else {
            continue;
        };

        match report.event {
            AdapterEvent::Data(_) => {}
            AdapterEvent::Connected => {
                if record.status != SessionStatus::Connected {
                    tracing::info!("[SessionRegistry] 已连接: session_id={}", record.id);
                    record.set_status(&events, SessionStatus::Connected, None);
                }
            }
            AdapterEvent::Failed(message) => {
                record.release();
                record.set_status(&events, SessionStatus::Error, Some(message));
            }
            AdapterEvent::Closed => {
                tracing::info!("[SessionRegistry] 连接已关闭: session_id={}", record.id);
                record.release();
                record.set_status(&events, SessionStatus::Disconnected, None);
            }
            AdapterEvent::Exit(code) => {
                tracing::info!(
                    "[SessionRegistry] 本地进程退出: session_id={}, exit_code={:?}",
                    record.id,
                    code
                );
                record.release();
                events.emit(TerminalEvent::SessionExit {
                    session_id: record.id.clone(),
                    exit_code: code,
                });
                record.set_status(&events, SessionStatus::Disconnected, None);
            }
        }
    }
}

fn is_current(sessions: &HashMap<SessionId, SessionRecord>, report: &AdapterReport) -> bool {
    sessions
        .get(&report.session_id)
        .map(|r| r.adapter.is_some() && r.epoch == report.epoch)
        .unwrap_or(false)
}
