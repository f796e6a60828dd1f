//! Agent 类型定义

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::terminal::ExecResult;

/// 消息角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// 对话消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// 一轮对话的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentTurn {
    /// 生成器的原始回复
    pub reply: String,
    /// 回复中命令块的执行结果（按提交顺序）
    pub results: Vec<ExecResult>,
}

/// Agent 错误
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("输入为空")]
    EmptyInput,

    /// 文本生成器调用失败
    #[error("生成器错误: {0}")]
    Backend(String),
}

impl From<AgentError> for String {
    fn from(err: AgentError) -> Self {
        err.to_string()
    }
}
