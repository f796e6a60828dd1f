//! 一次性执行的公共类型
//!
//! 本地一次性进程与远程执行通道共享的输出缓冲和结果结构。

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// 超时后追加到输出末尾的标记
pub const TIMEOUT_MARKER: &str = "\n[命令超时]";

/// 输出超过缓冲上限时追加的标记
pub const TRUNCATED_MARKER: &str = "\n[输出已截断]";

/// 超时或启动失败时的退出码
pub const FAILED_EXIT_CODE: i32 = -1;

/// 实时输出回调
pub type ChunkCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// 不做任何事的回调
pub fn discard_chunks() -> ChunkCallback {
    Arc::new(|_| {})
}

/// 适配器层面的执行结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    /// 合并后的 stdout + stderr
    pub output: String,
    pub exit_code: i32,
    pub timed_out: bool,
    /// 输出超过上限，只保留了开头部分
    pub truncated: bool,
}

impl ExecOutcome {
    pub fn finished(output: String, exit_code: i32) -> Self {
        Self {
            output,
            exit_code,
            timed_out: false,
            truncated: false,
        }
    }

    pub fn timed_out(output: String) -> Self {
        Self {
            output,
            exit_code: FAILED_EXIT_CODE,
            timed_out: true,
            truncated: false,
        }
    }
}

/// 命令执行记录（返回给调用方，不持久化）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResult {
    pub command: String,
    pub success: bool,
    pub output: String,
    pub exit_code: i32,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub truncated: bool,
}

impl ExecResult {
    /// 由适配器结果构建
    ///
    /// 超时：`success=false`、`exit_code=-1`，输出追加超时标记。
    /// 截断：输出追加截断标记（在超时标记之前），成功与否仍由退出码决定。
    pub fn from_outcome(command: &str, outcome: ExecOutcome) -> Self {
        let mut output = outcome.output;
        if outcome.truncated {
            output.push_str(TRUNCATED_MARKER);
        }
        if outcome.timed_out {
            output.push_str(TIMEOUT_MARKER);
            return Self {
                command: command.to_string(),
                success: false,
                output,
                exit_code: FAILED_EXIT_CODE,
                timed_out: true,
                truncated: outcome.truncated,
            };
        }
        Self {
            command: command.to_string(),
            success: outcome.exit_code == 0,
            output,
            exit_code: outcome.exit_code,
            timed_out: false,
            truncated: outcome.truncated,
        }
    }

    /// 执行未能开始（无会话、启动失败等）
    pub fn failed(command: &str, message: impl Into<String>) -> Self {
        Self {
            command: command.to_string(),
            success: false,
            output: message.into(),
            exit_code: FAILED_EXIT_CODE,
            timed_out: false,
            truncated: false,
        }
    }
}

/// 有上限的输出缓冲
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    bytes: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// 转为字符串（非法 UTF-8 以替换字符代替）
    pub fn into_string(self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    /// 命令正常结束
    pub fn into_finished(self, exit_code: i32) -> ExecOutcome {
        let truncated = self.truncated;
        ExecOutcome {
            truncated,
            ..ExecOutcome::finished(self.into_string(), exit_code)
        }
    }

    /// 命令超时，保留已收集的输出
    pub fn into_timed_out(self) -> ExecOutcome {
        let truncated = self.truncated;
        ExecOutcome {
            truncated,
            ..ExecOutcome::timed_out(self.into_string())
        }
    }
}
