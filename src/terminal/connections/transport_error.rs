//! 传输层错误分类
//!
//! 把 TCP / libssh2 的原始错误归入固定的小分类，并给出面向用户的提示。
//!
//! 分类依据（按优先级）：
//! 1. `std::io::ErrorKind`
//! 2. libssh2 错误码
//! 3. 错误消息中的关键字

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

/// libssh2 错误码
pub(crate) mod libssh2_code {
    pub const SOCKET_SEND: i32 = -7;
    pub const TIMEOUT: i32 = -9;
    pub const SOCKET_DISCONNECT: i32 = -13;
    pub const PASSWORD_EXPIRED: i32 = -15;
    pub const FILE: i32 = -16;
    pub const METHOD_NONE: i32 = -17;
    pub const AUTHENTICATION_FAILED: i32 = -18;
    pub const PUBLICKEY_UNVERIFIED: i32 = -19;
    pub const EAGAIN: i32 = -37;
    pub const SOCKET_RECV: i32 = -43;
}

/// 传输错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportErrorKind {
    Timeout,
    AuthFailed,
    ConnectionRefused,
    ConnectionReset,
    HostUnreachable,
    MalformedKey,
    Other,
}

impl TransportErrorKind {
    /// 面向用户的提示
    pub fn hint(&self) -> &'static str {
        match self {
            Self::Timeout => "连接超时，请检查网络或服务器地址",
            Self::AuthFailed => "认证失败，请检查用户名和密码",
            Self::ConnectionRefused => "连接被拒绝，请检查服务器地址和端口",
            Self::ConnectionReset => "连接被重置，服务器可能断开了连接",
            Self::HostUnreachable => "无法访问主机，请检查网络连接",
            Self::MalformedKey => "私钥无效或无法读取，请检查私钥文件和密码",
            Self::Other => "连接异常",
        }
    }

    /// 从 io 错误类型推断
    pub fn from_io_kind(kind: io::ErrorKind) -> Option<Self> {
        match kind {
            io::ErrorKind::TimedOut => Some(Self::Timeout),
            io::ErrorKind::ConnectionRefused => Some(Self::ConnectionRefused),
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => Some(Self::ConnectionReset),
            io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => {
                Some(Self::HostUnreachable)
            }
            _ => None,
        }
    }

    /// 从 libssh2 错误码推断
    pub fn from_ssh_code(code: i32) -> Option<Self> {
        use libssh2_code::*;
        match code {
            TIMEOUT => Some(Self::Timeout),
            AUTHENTICATION_FAILED | PASSWORD_EXPIRED | METHOD_NONE => Some(Self::AuthFailed),
            FILE | PUBLICKEY_UNVERIFIED => Some(Self::MalformedKey),
            SOCKET_DISCONNECT | SOCKET_RECV | SOCKET_SEND => Some(Self::ConnectionReset),
            _ => None,
        }
    }

    /// 从错误消息关键字推断
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("timed out") || lower.contains("timeout") {
            Self::Timeout
        } else if lower.contains("private key")
            || lower.contains("passphrase")
            || lower.contains("key file")
            || lower.contains("public key from private")
        {
            Self::MalformedKey
        } else if lower.contains("authentication") || lower.contains("auth fail") {
            Self::AuthFailed
        } else if lower.contains("refused") || lower.contains("econnrefused") {
            Self::ConnectionRefused
        } else if lower.contains("reset")
            || lower.contains("econnreset")
            || lower.contains("broken pipe")
        {
            Self::ConnectionReset
        } else if lower.contains("unreachable")
            || lower.contains("ehostunreach")
            || lower.contains("no route to host")
        {
            Self::HostUnreachable
        } else {
            Self::Other
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Timeout => "timeout",
            Self::AuthFailed => "authFailed",
            Self::ConnectionRefused => "connectionRefused",
            Self::ConnectionReset => "connectionReset",
            Self::HostUnreachable => "hostUnreachable",
            Self::MalformedKey => "malformedKey",
            Self::Other => "other",
        };
        write!(f, "{}", name)
    }
}

/// 已分类的传输失败
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFailure {
    pub kind: TransportErrorKind,
    /// 原始错误信息
    pub detail: String,
}

impl TransportFailure {
    pub fn new(kind: TransportErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, detail)
    }

    /// 分类 io 错误
    pub fn from_io(err: &io::Error) -> Self {
        let detail = err.to_string();
        let kind = TransportErrorKind::from_io_kind(err.kind())
            .unwrap_or_else(|| TransportErrorKind::from_message(&detail));
        Self { kind, detail }
    }

    /// 分类 libssh2 错误
    pub fn from_ssh(err: &ssh2::Error) -> Self {
        let detail = err.message().to_string();
        let kind = match err.code() {
            ssh2::ErrorCode::Session(code) => TransportErrorKind::from_ssh_code(code),
            ssh2::ErrorCode::SFTP(_) => None,
        }
        .unwrap_or_else(|| TransportErrorKind::from_message(&detail));
        Self { kind, detail }
    }

    /// 分类认证阶段的 libssh2 错误
    ///
    /// 认证阶段无法细分的错误一律视为认证失败。
    pub fn from_auth(err: &ssh2::Error) -> Self {
        let mut failure = Self::from_ssh(err);
        if failure.kind == TransportErrorKind::Other {
            failure.kind = TransportErrorKind::AuthFailed;
        }
        failure
    }

    /// 推送给消费方的状态消息
    pub fn status_message(&self) -> String {
        format!("连接失败: {}", self.kind.hint())
    }
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.kind.hint(), self.detail)
    }
}

/// 判断 libssh2 错误是否为"稍后重试"
pub(crate) fn is_would_block(err: &ssh2::Error) -> bool {
    err.code() == ssh2::ErrorCode::Session(libssh2_code::EAGAIN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_kinds() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "Connection refused");
        assert_eq!(
            TransportFailure::from_io(&refused).kind,
            TransportErrorKind::ConnectionRefused
        );

        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        assert_eq!(
            TransportFailure::from_io(&reset).kind,
            TransportErrorKind::ConnectionReset
        );

        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "connect");
        assert_eq!(
            TransportFailure::from_io(&timed_out).kind,
            TransportErrorKind::Timeout
        );
    }

    #[test]
    fn test_io_falls_back_to_message() {
        let err = io::Error::new(io::ErrorKind::Other, "No route to host (os error 113)");
        assert_eq!(
            TransportFailure::from_io(&err).kind,
            TransportErrorKind::HostUnreachable
        );
    }

    #[test]
    fn test_ssh_codes() {
        assert_eq!(
            TransportErrorKind::from_ssh_code(libssh2_code::TIMEOUT),
            Some(TransportErrorKind::Timeout)
        );
        assert_eq!(
            TransportErrorKind::from_ssh_code(libssh2_code::AUTHENTICATION_FAILED),
            Some(TransportErrorKind::AuthFailed)
        );
        assert_eq!(
            TransportErrorKind::from_ssh_code(libssh2_code::FILE),
            Some(TransportErrorKind::MalformedKey)
        );
        assert_eq!(
            TransportErrorKind::from_ssh_code(libssh2_code::SOCKET_DISCONNECT),
            Some(TransportErrorKind::ConnectionReset)
        );
        assert_eq!(TransportErrorKind::from_ssh_code(-1), None);
    }

    #[test]
    fn test_messages() {
        let cases = [
            ("Timed out while waiting for handshake", TransportErrorKind::Timeout),
            ("All configured authentication methods failed", TransportErrorKind::AuthFailed),
            ("connect ECONNREFUSED 10.0.0.1:22", TransportErrorKind::ConnectionRefused),
            ("read ECONNRESET", TransportErrorKind::ConnectionReset),
            ("connect EHOSTUNREACH", TransportErrorKind::HostUnreachable),
            (
                "Unable to extract public key from private key file",
                TransportErrorKind::MalformedKey,
            ),
            ("Wrong passphrase", TransportErrorKind::MalformedKey),
            ("something odd", TransportErrorKind::Other),
        ];
        for (message, expected) in cases {
            assert_eq!(TransportErrorKind::from_message(message), expected, "{}", message);
        }
    }

    #[test]
    fn test_status_message_uses_hint() {
        let failure = TransportFailure::timeout("handshake");
        assert_eq!(
            failure.status_message(),
            "连接失败: 连接超时，请检查网络或服务器地址"
        );
    }
}
