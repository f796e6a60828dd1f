//! Agent 会话
//!
//! 把用户输入交给外部文本生成器，再执行回复中的命令块。
//! 命令结果返回给调用方展示，不回填到对话历史。

use std::sync::Arc;

use async_trait::async_trait;

use crate::terminal::{execute_blocks, CommandExecutor, ExecTarget};

use super::types::{AgentError, AgentTurn, ChatMessage};

/// 系统提示词
pub const AGENT_SYSTEM_PROMPT: &str = r#"你是一个终端助手，可以在用户当前的终端（本地或 SSH 远程主机）上执行命令。

当用户提出任务时：
1. 理解用户的需求
2. 给出完成任务所需的命令
3. 把每条要执行的命令放进 [EXECUTE] 标记中

格式：
[EXECUTE]命令[/EXECUTE]

示例：
- 用户："看看当前目录有哪些文件"
  回复：好的，列出当前目录：
  [EXECUTE]ls -la[/EXECUTE]

- 用户："内存还剩多少"
  回复：查看内存使用情况：
  [EXECUTE]free -h[/EXECUTE]
  如果是 macOS：
  [EXECUTE]vm_stat[/EXECUTE]

注意：
- 危险命令（例如 rm -rf /）必须先提醒用户，不要直接执行
- 一次回复可以包含多条命令，按顺序执行
- 命令执行后根据结果给出分析和建议"#;

/// 外部文本生成器
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// 根据系统提示词与对话历史生成回复
    async fn complete(
        &self,
        system_prompt: &str,
        history: &[ChatMessage],
    ) -> Result<String, AgentError>;
}

/// Agent 会话
pub struct AgentSession {
    backend: Arc<dyn AgentBackend>,
    executor: CommandExecutor,
    history: Vec<ChatMessage>,
}

impl AgentSession {
    pub fn new(backend: Arc<dyn AgentBackend>, executor: CommandExecutor) -> Self {
        Self {
            backend,
            executor,
            history: Vec::new(),
        }
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    /// 进行一轮对话
    ///
    /// 生成器失败时本轮用户消息不会留在历史中。
    pub async fn turn(
        &mut self,
        user_input: &str,
        target: &ExecTarget,
    ) -> Result<AgentTurn, AgentError> {
        let input = user_input.trim();
        if input.is_empty() {
            return Err(AgentError::EmptyInput);
        }

        self.history.push(ChatMessage::user(input));
        let reply = match self
            .backend
            .complete(AGENT_SYSTEM_PROMPT, &self.history)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("[Agent] 生成器调用失败: {}", e);
                self.history.pop();
                return Err(e);
            }
        };
        self.history.push(ChatMessage::assistant(reply.clone()));

        let results = execute_blocks(&self.executor, target, &reply).await;
        tracing::info!(
            "[Agent] 本轮完成: target={}, commands={}",
            target,
            results.len()
        );
        Ok(AgentTurn { reply, results })
    }
}
