//! 终端模块错误类型
//!
//! 定义会话编排相关的错误类型。
//!
//! ## 功能
//! - 本地 PTY 错误（启动失败、PTY 不可用）
//! - 调用方输入错误（凭据缺失）
//! - 传输层错误（已分类，见 `connections::transport_error`）
//! - 一次性执行超时
//! - 序列化支持

use shellmux_core::ProfileError;
use thiserror::Error;

use super::connections::transport_error::{TransportErrorKind, TransportFailure};

/// 终端错误类型
#[derive(Debug, Error)]
pub enum TerminalError {
    /// 本地进程启动失败
    #[error("本地 Shell 启动失败: {0}")]
    SpawnFailed(String),

    /// 本地 PTY 机制不可用（启动时探测一次）
    #[error("本地 PTY 不可用: {0}")]
    AdapterUnavailable(String),

    /// 凭据缺失（在任何网络动作之前拒绝）
    #[error("缺少凭据: {0}")]
    MissingCredential(String),

    /// SSH 认证失败
    #[error("认证失败: {0}")]
    AuthFailed(String),

    /// 连接超时
    #[error("连接超时: {0}")]
    Timeout(String),

    /// 连接被拒绝
    #[error("连接被拒绝: {0}")]
    ConnectionRefused(String),

    /// 连接被重置
    #[error("连接被重置: {0}")]
    ConnectionReset(String),

    /// 主机不可达
    #[error("无法访问主机: {0}")]
    HostUnreachable(String),

    /// 私钥格式错误或无法读取
    #[error("私钥无效: {0}")]
    MalformedKey(String),

    /// 其他传输层错误
    #[error("传输错误: {0}")]
    TransportOther(String),

    /// 一次性执行超时
    #[error("命令执行超时")]
    ExecTimeout,

    /// 会话没有活跃的适配器
    #[error("会话没有活跃连接: {0}")]
    NoActiveSession(String),

    /// 会话不存在
    #[error("会话不存在: {0}")]
    SessionNotFound(String),

    /// 写入失败
    #[error("写入失败: {0}")]
    WriteFailed(String),

    /// 会话数量达到上限
    #[error("会话数量已达上限: {0}")]
    SessionLimitReached(usize),

    /// 内部错误
    #[error("内部错误: {0}")]
    Internal(String),
}

impl TerminalError {
    /// 是否为调用方输入错误（不涉及任何资源分配）
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::MissingCredential(_) | Self::SessionLimitReached(_)
        )
    }
}

impl From<ProfileError> for TerminalError {
    fn from(err: ProfileError) -> Self {
        Self::MissingCredential(err.to_string())
    }
}

impl From<TransportFailure> for TerminalError {
    fn from(failure: TransportFailure) -> Self {
        let detail = failure.detail;
        match failure.kind {
            TransportErrorKind::Timeout => Self::Timeout(detail),
            TransportErrorKind::AuthFailed => Self::AuthFailed(detail),
            TransportErrorKind::ConnectionRefused => Self::ConnectionRefused(detail),
            TransportErrorKind::ConnectionReset => Self::ConnectionReset(detail),
            TransportErrorKind::HostUnreachable => Self::HostUnreachable(detail),
            TransportErrorKind::MalformedKey => Self::MalformedKey(detail),
            TransportErrorKind::Other => Self::TransportOther(detail),
        }
    }
}

impl From<TerminalError> for String {
    fn from(err: TerminalError) -> Self {
        err.to_string()
    }
}

impl serde::Serialize for TerminalError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_error_maps_to_missing_credential() {
        let err: TerminalError = ProfileError::MissingField("password").into();
        assert!(matches!(err, TerminalError::MissingCredential(_)));
        assert!(err.is_caller_error());
        assert_eq!(err.to_string(), "缺少凭据: 缺少必填字段: password");
    }

    #[test]
    fn test_transport_failure_maps_to_variant() {
        let failure = TransportFailure::new(TransportErrorKind::ConnectionRefused, "ECONNREFUSED");
        let err: TerminalError = failure.into();
        assert!(matches!(err, TerminalError::ConnectionRefused(ref d) if d == "ECONNREFUSED"));
        assert!(!err.is_caller_error());
    }

    #[test]
    fn test_terminal_error_serialize() {
        let err = TerminalError::NoActiveSession("s1".to_string());
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(json, "\"会话没有活跃连接: s1\"");
        let s: String = err.into();
        assert_eq!(s, "会话没有活跃连接: s1");
    }
}
