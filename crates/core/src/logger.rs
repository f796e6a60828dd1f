//! 日志管理模块
//!
//! - `init_tracing`: 初始化 tracing 订阅器（输出到 stderr，stdout 留给事件流）
//! - `sanitize_log_message`: 日志脱敏

use std::str::FromStr;
use std::sync::Once;

use serde::{Deserialize, Serialize};
use tracing::Level;

static INIT: Once = Once::new();

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            other => Err(format!("无效的日志级别: {}", other)),
        }
    }
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// 初始化全局 tracing 订阅器
///
/// 重复调用只有第一次生效。
pub fn init_tracing(level: LogLevel) {
    INIT.call_once(|| {
        let result = tracing_subscriber::fmt()
            .with_max_level(Level::from(level))
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
        if let Err(e) = result {
            eprintln!("初始化日志失败: {}", e);
        }
    });
}

/// 敏感字段（`key=value` / `"key":"value"` / `--key value` 形式，不区分大小写）
const SENSITIVE_KEYS: [&str; 4] = ["password", "passphrase", "secret", "token"];

/// 日志脱敏
///
/// 覆盖 Bearer token 与常见凭据字段，包括 Shell 命令中的环境变量赋值
/// （`DB_PASSWORD=...`）与命令行参数（`--password ...`）。
pub fn sanitize_log_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    // Bearer token
    if let Some(pos) = sanitized.find("Bearer ") {
        let start = pos + 7;
        let end = sanitized[start..]
            .find(|c: char| c.is_whitespace() || c == '"' || c == '\'')
            .map(|offset| start + offset)
            .unwrap_or(sanitized.len());
        if end > start {
            sanitized.replace_range(start..end, "***");
        }
    }

    for key in SENSITIVE_KEYS {
        sanitized = redact_value_after(&sanitized, &format!("{}=", key));
        sanitized = redact_value_after(&sanitized, &format!("\"{}\":\"", key));
        sanitized = redact_value_after(&sanitized, &format!("--{} ", key));
    }

    sanitized
}

fn redact_value_after(input: &str, marker: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.to_ascii_lowercase().find(marker) {
        let value_start = pos + marker.len();
        output.push_str(&rest[..value_start]);
        let tail = &rest[value_start..];
        let value_len = tail
            .find(|c: char| c.is_whitespace() || matches!(c, '"' | '&' | ',' | ';'))
            .unwrap_or(tail.len());
        if value_len > 0 {
            output.push_str("***");
        }
        rest = &tail[value_len..];
    }

    output.push_str(rest);
    output
}
