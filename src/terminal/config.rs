//! 终端配置
//!
//! 所有时长字段以毫秒存储，便于 JSON 配置文件书写。
//!
//! ## 来源优先级
//! 1. 默认值
//! 2. `SHELLMUX_CONFIG` 指向的 JSON 文件
//! 3. 环境变量 `SHELL` / `SHELLMUX_LOG`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shellmux_core::{LogLevel, DEFAULT_SSH_PORT};

use super::error::TerminalError;

/// 配置文件路径环境变量
pub const CONFIG_PATH_ENV: &str = "SHELLMUX_CONFIG";
/// 日志级别环境变量
pub const LOG_LEVEL_ENV: &str = "SHELLMUX_LOG";

/// 交互式终端默认列数
pub const DEFAULT_COLS: u16 = 80;
/// 交互式终端默认行数
pub const DEFAULT_ROWS: u16 = 24;
/// 一次性执行的终端列数
pub const DEFAULT_EXEC_COLS: u16 = 120;
/// 一次性执行的终端行数
pub const DEFAULT_EXEC_ROWS: u16 = 30;

/// 终端配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TerminalConfig {
    /// 本地 Shell 路径
    pub shell_path: String,
    pub local_cols: u16,
    pub local_rows: u16,
    pub exec_cols: u16,
    pub exec_rows: u16,
    pub default_ssh_port: u16,
    /// SSH 就绪超时（握手 + 认证 + 打开 Shell）
    pub ready_timeout_ms: u64,
    /// keep-alive 探测间隔
    pub keepalive_interval_ms: u64,
    /// 连续失败多少次后放弃连接
    pub keepalive_max_missed: u32,
    pub remote_exec_timeout_ms: u64,
    pub local_exec_timeout_ms: u64,
    /// 会话记录数上限
    pub max_sessions: usize,
    /// 单次执行缓冲输出上限（超出部分只推送、不缓冲）
    pub max_exec_output_bytes: usize,
    pub log_level: LogLevel,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell_path: default_shell(),
            local_cols: DEFAULT_COLS,
            local_rows: DEFAULT_ROWS,
            exec_cols: DEFAULT_EXEC_COLS,
            exec_rows: DEFAULT_EXEC_ROWS,
            default_ssh_port: DEFAULT_SSH_PORT,
            ready_timeout_ms: 30_000,
            keepalive_interval_ms: 10_000,
            keepalive_max_missed: 3,
            remote_exec_timeout_ms: 30_000,
            local_exec_timeout_ms: 60_000,
            max_sessions: 64,
            max_exec_output_bytes: 8 * 1024 * 1024,
            log_level: LogLevel::Info,
        }
    }
}

impl TerminalConfig {
    /// 从环境变量构建配置
    pub fn from_env() -> Result<Self, TerminalError> {
        let mut config = match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::load(Path::new(&path))?,
            None => Self::default(),
        };

        if let Ok(shell) = std::env::var("SHELL") {
            if !shell.trim().is_empty() {
                config.shell_path = shell;
            }
        }

        if let Ok(level) = std::env::var(LOG_LEVEL_ENV) {
            match level.parse() {
                Ok(level) => config.log_level = level,
                Err(e) => tracing::warn!("[Config] 忽略 {}: {}", LOG_LEVEL_ENV, e),
            }
        }

        Ok(config)
    }

    /// 从 JSON 文件加载（缺省字段使用默认值）
    pub fn load(path: &Path) -> Result<Self, TerminalError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TerminalError::Internal(format!("读取配置文件失败 {:?}: {}", path, e))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| TerminalError::Internal(format!("解析配置文件失败 {:?}: {}", path, e)))
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn remote_exec_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_exec_timeout_ms)
    }

    pub fn local_exec_timeout(&self) -> Duration {
        Duration::from_millis(self.local_exec_timeout_ms)
    }

    /// 本地 Shell 的工作目录（用户主目录）
    pub fn working_dir(&self) -> PathBuf {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"))
    }
}

/// 平台默认 Shell
pub fn default_shell() -> String {
    if cfg!(windows) {
        std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())
    } else if cfg!(target_os = "macos") {
        "/bin/zsh".to_string()
    } else {
        "/bin/bash".to_string()
    }
}

/// 展开路径开头的 `~/`
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}
