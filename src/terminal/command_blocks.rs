//! 命令块解析
//!
//! 从自由文本中提取 `[EXECUTE]...[/EXECUTE]` 包裹的命令，并按顺序交给执行器。
//!
//! 标记对出现在命令内部时没有转义规则，嵌套或转义的标记行为未定义。

use once_cell::sync::Lazy;
use regex::Regex;

use super::command_executor::CommandExecutor;
use super::events::ExecTarget;
use super::exec::ExecResult;

/// 命令块开始标记
pub const EXECUTE_OPEN: &str = "[EXECUTE]";
/// 命令块结束标记
pub const EXECUTE_CLOSE: &str = "[/EXECUTE]";

static EXECUTE_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\[EXECUTE\](.*?)\[/EXECUTE\]").unwrap());

/// 按出现顺序提取命令（去除首尾空白，跳过空命令）
pub fn extract_commands(text: &str) -> Vec<String> {
    EXECUTE_BLOCK
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|command| !command.is_empty())
        .map(str::to_string)
        .collect()
}

/// 依次执行文本中的所有命令块
///
/// 串行执行，结果顺序与提交顺序一致。
pub async fn execute_blocks(
    executor: &CommandExecutor,
    target: &ExecTarget,
    text: &str,
) -> Vec<ExecResult> {
    let commands = extract_commands(text);
    if commands.is_empty() {
        return Vec::new();
    }

    tracing::info!(
        "[CommandBlocks] 提取到 {} 条命令: target={}",
        commands.len(),
        target
    );

    let mut results = Vec::with_capacity(commands.len());
    for command in &commands {
        results.push(executor.run(target, command, None).await);
    }
    results
}
