//! shellmux 宿主进程
//!
//! 从 stdin 逐行读取 JSON 意图，向 stdout 逐行写出应答与事件。
//! 日志输出到 stderr。stdin 关闭或收到 Ctrl-C 时关闭所有会话后退出。

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use shellmux::commands::{dispatch_request, IntentReply, IntentRequest, TerminalState};
use shellmux::{init_tracing, EventMultiplexer, SessionRegistry, TerminalConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

/// 退出前等待剩余事件写出的时间
const FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<()> {
    let config = TerminalConfig::from_env().context("加载配置失败")?;
    init_tracing(config.log_level);
    tracing::info!(
        "[Main] shellmux v{} 启动: shell={}",
        shellmux_core::version(),
        config.shell_path
    );

    let (events, mut stream) = EventMultiplexer::new();
    let registry = Arc::new(SessionRegistry::new(Arc::new(config), events));
    let state = TerminalState::new(registry.clone());

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let event_tx = out_tx.clone();
    let mut forwarder = tokio::spawn(async move {
        while let Some(event) = stream.recv().await {
            if let Some(line) = encode_line(&event) {
                if event_tx.send(line).is_err() {
                    break;
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        tracing::info!("[Main] stdin 已关闭");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("[Main] 读取 stdin 失败: {}", e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                handle_line(&state, &out_tx, &line).await;
            }
            _ = &mut shutdown => {
                tracing::info!("[Main] 收到 Ctrl-C");
                break;
            }
        }
    }

    registry.shutdown().await;
    drop(state);
    drop(registry);

    if tokio::time::timeout(FLUSH_TIMEOUT, &mut forwarder).await.is_err() {
        forwarder.abort();
    }
    drop(out_tx);
    match writer.await {
        Ok(Err(e)) => tracing::warn!("[Main] 写出 stdout 失败: {}", e),
        Err(e) => tracing::warn!("[Main] 输出任务异常退出: {}", e),
        Ok(Ok(())) => {}
    }

    tracing::info!("[Main] 已退出");
    Ok(())
}

/// 处理一行意图
///
/// 长耗时意图在独立任务中执行，其余按接收顺序依次执行。
async fn handle_line(state: &TerminalState, out_tx: &mpsc::UnboundedSender<String>, line: &str) {
    let request = match IntentRequest::parse(line) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("[Main] {}", shellmux::sanitize_log_message(&e));
            send_reply(out_tx, &IntentReply::failure(None, e));
            return;
        }
    };

    if request.intent.is_long_running() {
        let state = state.clone();
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            let reply = dispatch_request(&state, request).await;
            send_reply(&out_tx, &reply);
        });
    } else {
        let reply = dispatch_request(state, request).await;
        send_reply(out_tx, &reply);
    }
}

fn send_reply(out_tx: &mpsc::UnboundedSender<String>, reply: &IntentReply) {
    if let Some(line) = encode_line(reply) {
        let _ = out_tx.send(line);
    }
}

fn encode_line<T: Serialize>(value: &T) -> Option<String> {
    match serde_json::to_string(value) {
        Ok(line) => Some(line),
        Err(e) => {
            tracing::error!("[Main] 序列化失败: {}", e);
            None
        }
    }
}
