//! 终端命令模块
//!
//! 把外部意图翻译成会话注册表与命令执行器的调用。
//!
//! ## 功能
//! - 每个意图对应一个异步函数，统一返回 `Result<T, String>`
//! - `Intent` / `IntentRequest`：JSON 意图（`type` 标签）
//! - `dispatch_request`：执行意图并生成应答
//!
//! ## 说明
//! 调用方输入错误（凭据缺失、Base64 非法、尺寸为 0 等）在这里同步拒绝，
//! 不分配任何资源。传输层错误只通过会话状态事件上报。

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use shellmux_core::{sanitize_log_message, ConnectionProfile, RemoteConfig};

use crate::terminal::{
    CommandExecutor, ExecResult, ExecTarget, LocalSystemInfo, RemoteSystemInfo, SessionId,
    SessionRegistry, SessionSnapshot, TerminalError,
};

/// 命令层共享状态
#[derive(Clone)]
pub struct TerminalState {
    pub registry: Arc<SessionRegistry>,
    pub executor: CommandExecutor,
}

impl TerminalState {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            executor: CommandExecutor::new(registry.clone()),
            registry,
        }
    }
}

/// 远程连接目标
///
/// 内联的连接配置（扁平字段）或已校验的运行时配置。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectTarget {
    Profile(ConnectionProfile),
    Remote(RemoteConfig),
}

impl ConnectTarget {
    /// 解析为连接参数，连接配置同时给出其 ID
    fn into_remote_config(self) -> Result<(RemoteConfig, Option<String>), TerminalError> {
        match self {
            Self::Profile(profile) => Ok((profile.to_remote_config()?, Some(profile.id))),
            Self::Remote(config) => {
                config.validate()?;
                Ok((config, None))
            }
        }
    }
}

// ============================================================================
// 意图对应的命令
// ============================================================================

/// 创建本地会话
pub async fn create_local_session(
    registry: &SessionRegistry,
    session_id: Option<SessionId>,
) -> Result<SessionId, String> {
    tracing::info!("[TerminalCmd] 创建本地会话: session_id={:?}", session_id);
    Ok(registry.create_local(session_id).await?)
}

/// 连接远程会话
///
/// 返回时连接尚未完成，结果通过状态事件上报。
pub async fn connect_session(
    registry: &SessionRegistry,
    session_id: &str,
    target: ConnectTarget,
) -> Result<(), String> {
    let (config, profile_id) = target.into_remote_config()?;
    tracing::info!(
        "[TerminalCmd] 连接会话: session_id={}, target={}, profile_id={:?}",
        session_id,
        config.display_name(),
        profile_id
    );
    match profile_id {
        Some(profile_id) => Ok(registry.connect_profile(session_id, config, &profile_id).await?),
        None => Ok(registry.connect_remote(session_id, config).await?),
    }
}

pub async fn disconnect_session(registry: &SessionRegistry, session_id: &str) -> Result<(), String> {
    Ok(registry.disconnect(session_id).await?)
}

/// 销毁会话，返回会话是否存在
pub async fn destroy_session(registry: &SessionRegistry, session_id: &str) -> Result<bool, String> {
    Ok(registry.destroy(session_id).await)
}

/// 写入会话
///
/// `data` 为 Base64 编码的原始字节。
pub async fn write_session(
    registry: &SessionRegistry,
    session_id: &str,
    data: &str,
) -> Result<(), String> {
    let bytes = BASE64
        .decode(data)
        .map_err(|e| format!("Base64 解码失败: {}", e))?;
    registry.write(session_id, &bytes).await;
    Ok(())
}

pub async fn resize_session(
    registry: &SessionRegistry,
    session_id: &str,
    cols: u16,
    rows: u16,
) -> Result<(), String> {
    if cols == 0 || rows == 0 {
        return Err(format!("无效的终端尺寸: {}x{}", cols, rows));
    }
    registry.resize(session_id, cols, rows).await;
    Ok(())
}

/// 一次性执行命令
///
/// 执行失败（无连接、超时、非零退出码）体现在结果里，不作为错误返回。
pub async fn exec_on_session(
    executor: &CommandExecutor,
    target: ExecTarget,
    command: &str,
    timeout_ms: Option<u64>,
) -> Result<ExecResult, String> {
    let command = command.trim();
    if command.is_empty() {
        return Err("命令为空".to_string());
    }
    tracing::debug!(
        "[TerminalCmd] 执行意图: target={}, command={}",
        target,
        sanitize_log_message(command)
    );
    let timeout = timeout_ms.map(Duration::from_millis);
    Ok(executor.run(&target, command, timeout).await)
}

pub async fn local_system_info() -> Result<LocalSystemInfo, String> {
    Ok(LocalSystemInfo::collect().await?)
}

pub async fn remote_system_info(
    registry: &SessionRegistry,
    session_id: &str,
) -> Result<RemoteSystemInfo, String> {
    Ok(RemoteSystemInfo::probe(registry, session_id).await?)
}

pub async fn list_sessions(registry: &SessionRegistry) -> Result<Vec<SessionSnapshot>, String> {
    Ok(registry.list_sessions().await)
}

pub async fn get_session(
    registry: &SessionRegistry,
    session_id: &str,
) -> Result<Option<SessionSnapshot>, String> {
    Ok(registry.get_session(session_id).await)
}

/// 按连接配置 ID 获取或创建会话
pub async fn get_or_create_session(
    registry: &SessionRegistry,
    profile_id: &str,
) -> Result<SessionId, String> {
    if profile_id.trim().is_empty() {
        return Err("连接配置 ID 为空".to_string());
    }
    Ok(registry.get_or_create_session(profile_id).await?)
}

// ============================================================================
// JSON 意图
// ============================================================================

/// 外部意图
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Intent {
    #[serde(rename_all = "camelCase")]
    CreateLocalSession {
        #[serde(default)]
        session_id: Option<SessionId>,
    },
    #[serde(rename_all = "camelCase")]
    ConnectSession {
        session_id: SessionId,
        target: ConnectTarget,
    },
    #[serde(rename_all = "camelCase")]
    DisconnectSession { session_id: SessionId },
    #[serde(rename_all = "camelCase")]
    DestroySession { session_id: SessionId },
    #[serde(rename_all = "camelCase")]
    WriteSession { session_id: SessionId, data: String },
    #[serde(rename_all = "camelCase")]
    ResizeSession {
        session_id: SessionId,
        cols: u16,
        rows: u16,
    },
    #[serde(rename_all = "camelCase")]
    ExecOnSession {
        target: ExecTarget,
        command: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    LocalSystemInfo,
    #[serde(rename_all = "camelCase")]
    RemoteSystemInfo { session_id: SessionId },
    ListSessions,
    #[serde(rename_all = "camelCase")]
    GetSession { session_id: SessionId },
    #[serde(rename_all = "camelCase")]
    GetOrCreateSession { profile_id: String },
}

impl Intent {
    /// 需要较长时间才能应答的意图（宿主应并发处理，避免阻塞后续意图）
    pub fn is_long_running(&self) -> bool {
        matches!(
            self,
            Self::ExecOnSession { .. } | Self::LocalSystemInfo | Self::RemoteSystemInfo { .. }
        )
    }
}

/// 带请求 ID 的意图
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    #[serde(flatten)]
    pub intent: Intent,
}

impl IntentRequest {
    pub fn parse(line: &str) -> Result<Self, String> {
        serde_json::from_str(line).map_err(|e| format!("无效的请求: {}", e))
    }
}

/// 意图应答
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "reply")]
pub struct IntentReply {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IntentReply {
    pub fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<serde_json::Value>, error: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

fn to_value<T: Serialize>(value: T) -> Result<serde_json::Value, String> {
    serde_json::to_value(value).map_err(|e| format!("序列化失败: {}", e))
}

/// 执行意图
pub async fn dispatch_intent(
    state: &TerminalState,
    intent: Intent,
) -> Result<serde_json::Value, String> {
    let registry = state.registry.as_ref();
    match intent {
        Intent::CreateLocalSession { session_id } => {
            to_value(create_local_session(registry, session_id).await?)
        }
        Intent::ConnectSession { session_id, target } => {
            to_value(connect_session(registry, &session_id, target).await?)
        }
        Intent::DisconnectSession { session_id } => {
            to_value(disconnect_session(registry, &session_id).await?)
        }
        Intent::DestroySession { session_id } => {
            to_value(destroy_session(registry, &session_id).await?)
        }
        Intent::WriteSession { session_id, data } => {
            to_value(write_session(registry, &session_id, &data).await?)
        }
        Intent::ResizeSession {
            session_id,
            cols,
            rows,
        } => to_value(resize_session(registry, &session_id, cols, rows).await?),
        Intent::ExecOnSession {
            target,
            command,
            timeout_ms,
        } => to_value(exec_on_session(&state.executor, target, &command, timeout_ms).await?),
        Intent::LocalSystemInfo => to_value(local_system_info().await?),
        Intent::RemoteSystemInfo { session_id } => {
            to_value(remote_system_info(registry, &session_id).await?)
        }
        Intent::ListSessions => to_value(list_sessions(registry).await?),
        Intent::GetSession { session_id } => to_value(get_session(registry, &session_id).await?),
        Intent::GetOrCreateSession { profile_id } => {
            to_value(get_or_create_session(registry, &profile_id).await?)
        }
    }
}

/// 执行请求并生成应答
pub async fn dispatch_request(state: &TerminalState, request: IntentRequest) -> IntentReply {
    let IntentRequest { id, intent } = request;
    match dispatch_intent(state, intent).await {
        Ok(result) => IntentReply::success(id, result),
        Err(e) => {
            tracing::debug!("[TerminalCmd] 意图失败: {}", sanitize_log_message(&e));
            IntentReply::failure(id, e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::{EventMultiplexer, SystemAdapterFactory, TerminalConfig};
    use serde_json::json;

    fn state() -> TerminalState {
        let config = Arc::new(TerminalConfig::default());
        let (events, _stream) = EventMultiplexer::new();
        let registry = SessionRegistry::with_factory(
            config.clone(),
            events,
            Arc::new(SystemAdapterFactory::new(config)),
            Ok(()),
        );
        TerminalState::new(Arc::new(registry))
    }

    #[test]
    fn test_parse_intents() {
        let request = IntentRequest::parse(
            r#"{"id":7,"type":"resizeSession","sessionId":"s1","cols":120,"rows":40}"#,
        )
        .unwrap();
        assert_eq!(request.id, Some(json!(7)));
        assert!(matches!(
            request.intent,
            Intent::ResizeSession { cols: 120, rows: 40, .. }
        ));

        let request = IntentRequest::parse(
            r#"{"type":"execOnSession","target":{"type":"local"},"command":"ls"}"#,
        )
        .unwrap();
        assert!(request.id.is_none());
        assert!(request.intent.is_long_running());

        let request = IntentRequest::parse(r#"{"type":"createLocalSession"}"#).unwrap();
        assert!(matches!(
            request.intent,
            Intent::CreateLocalSession { session_id: None }
        ));

        assert!(IntentRequest::parse(r#"{"type":"selfDestruct"}"#).is_err());
        assert!(IntentRequest::parse("not json").is_err());
    }

    #[test]
    fn test_parse_connect_targets() {
        let request = IntentRequest::parse(
            r#"{"type":"connectSession","sessionId":"s1","target":{"remote":{"host":"h","username":"u","authType":"password","password":"p"}}}"#,
        )
        .unwrap();
        match request.intent {
            Intent::ConnectSession {
                target: ConnectTarget::Remote(config),
                ..
            } => assert_eq!(config.port, 22),
            other => panic!("unexpected intent: {:?}", other),
        }

        let request = IntentRequest::parse(
            r#"{"type":"connectSession","sessionId":"s1","target":{"profile":{"id":"p1","host":"h","username":"u","authType":"privateKey","privateKeyPath":"~/.ssh/id_ed25519"}}}"#,
        )
        .unwrap();
        assert!(matches!(
            request.intent,
            Intent::ConnectSession {
                target: ConnectTarget::Profile(_),
                ..
            }
        ));
    }

    #[test]
    fn test_reply_serialize() {
        let reply = IntentReply::success(Some(json!("r1")), json!(true));
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"type": "reply", "id": "r1", "ok": true, "result": true})
        );
        let reply = IntentReply::failure(None, "boom");
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"type": "reply", "id": null, "ok": false, "error": "boom"})
        );
    }

    #[tokio::test]
    async fn test_connect_rejects_missing_credential() {
        let state = state();
        let profile = ConnectionProfile {
            id: "p1".to_string(),
            host: "example.com".to_string(),
            username: "root".to_string(),
            ..Default::default()
        };
        let err = connect_session(&state.registry, "s1", ConnectTarget::Profile(profile))
            .await
            .unwrap_err();
        assert!(err.contains("password"), "{}", err);
        assert!(state.registry.get_session("s1").await.is_none());
    }

    #[tokio::test]
    async fn test_write_rejects_bad_base64() {
        let state = state();
        assert!(write_session(&state.registry, "s1", "@@@").await.is_err());
        // 未知会话静默忽略
        assert!(write_session(&state.registry, "s1", "bHMK").await.is_ok());
    }

    #[tokio::test]
    async fn test_resize_rejects_zero() {
        let state = state();
        assert!(resize_session(&state.registry, "s1", 0, 24).await.is_err());
        assert!(resize_session(&state.registry, "s1", 80, 24).await.is_ok());
    }

    #[tokio::test]
    async fn test_exec_on_unbound_session_is_failed_result() {
        let state = state();
        assert!(exec_on_session(&state.executor, ExecTarget::Local, "  ", None)
            .await
            .is_err());

        let result = exec_on_session(&state.executor, ExecTarget::session("nope"), "ls", None)
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, -1);
    }

    #[tokio::test]
    async fn test_dispatch_get_or_create_is_stable() {
        let state = state();
        let first = dispatch_request(
            &state,
            IntentRequest::parse(r#"{"id":1,"type":"getOrCreateSession","profileId":"p1"}"#)
                .unwrap(),
        )
        .await;
        assert!(first.ok);
        let second = dispatch_request(
            &state,
            IntentRequest::parse(r#"{"id":2,"type":"getOrCreateSession","profileId":"p1"}"#)
                .unwrap(),
        )
        .await;
        assert_eq!(first.result, second.result);
        assert_eq!(second.id, Some(json!(2)));

        let listed = dispatch_intent(&state, Intent::ListSessions).await.unwrap();
        assert_eq!(listed.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_dispatch_reports_errors() {
        let state = state();
        let reply = dispatch_request(
            &state,
            IntentRequest::parse(r#"{"type":"disconnectSession","sessionId":"ghost"}"#).unwrap(),
        )
        .await;
        assert!(!reply.ok);
        assert_eq!(reply.error.as_deref(), Some("会话不存在: ghost"));
    }
}
