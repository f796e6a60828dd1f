//! 命令模块
//!
//! 外部意图与核心之间的边界层。

pub mod terminal_cmd;

pub use terminal_cmd::{
    dispatch_intent, dispatch_request, ConnectTarget, Intent, IntentReply, IntentRequest,
    TerminalState,
};
