//! AI Agent 集成模块
//!
//! 外部文本生成器只负责产出回复；回复中 `[EXECUTE]` 命令块由命令执行器依次执行。
//!
//! ## 架构设计
//! - types - 对话消息、单轮结果、错误类型
//! - session - 系统提示词、生成器 trait、Agent 会话

pub mod session;
pub mod types;

pub use session::{AgentBackend, AgentSession, AGENT_SYSTEM_PROMPT};
pub use types::{AgentError, AgentTurn, ChatMessage, ChatRole};
