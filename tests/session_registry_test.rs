//! 会话注册表集成测试
//!
//! 通过公共 API 与假适配器驱动注册表，覆盖单适配器不变量、
//! 过期上报丢弃、一次性执行与 Agent 轮次。

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{drain, fake_registry, password_config, wait_for, FAKE_OUTPUT_LIMIT};
use proptest::prelude::*;
use shellmux::agent::{AgentBackend, AgentError, AgentSession, ChatMessage};
use shellmux::commands::terminal_cmd::{connect_session, get_or_create_session};
use shellmux::commands::ConnectTarget;
use shellmux::ConnectionProfile;
use shellmux::terminal::{
    CommandExecutor, ExecTarget, SessionKind, SessionStatus, TerminalError, TerminalEvent,
    TRUNCATED_MARKER,
};

const SESSION_IDS: [&str; 3] = ["alpha", "beta", "gamma"];

#[derive(Debug, Clone)]
enum Op {
    Connect(usize),
    CreateLocal(usize),
    Disconnect(usize),
    Destroy(usize),
    Report { sink: usize, event: u8 },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..SESSION_IDS.len()).prop_map(Op::Connect),
        (0..SESSION_IDS.len()).prop_map(Op::CreateLocal),
        (0..SESSION_IDS.len()).prop_map(Op::Disconnect),
        (0..SESSION_IDS.len()).prop_map(Op::Destroy),
        (0..16usize, 0..4u8).prop_map(|(sink, event)| Op::Report { sink, event }),
    ]
}

struct RunSummary {
    /// 每个会话的状态事件序列
    statuses: HashMap<String, Vec<SessionStatus>>,
    /// (会话, 未关闭适配器数, 记录是否绑定适配器)
    bindings: Vec<(String, usize, bool)>,
}

async fn run_ops(ops: Vec<Op>) -> RunSummary {
    let (registry, factory, mut stream) = fake_registry();

    for op in ops {
        match op {
            Op::Connect(i) => {
                registry
                    .connect_remote(SESSION_IDS[i], password_config("10.0.0.1"))
                    .await
                    .unwrap();
            }
            Op::CreateLocal(i) => {
                registry
                    .create_local(Some(SESSION_IDS[i].to_string()))
                    .await
                    .unwrap();
            }
            Op::Disconnect(i) => {
                let _ = registry.disconnect(SESSION_IDS[i]).await;
            }
            Op::Destroy(i) => {
                registry.destroy(SESSION_IDS[i]).await;
            }
            Op::Report { sink, event } => {
                let count = factory.count();
                if count == 0 {
                    continue;
                }
                let Some(sink) = factory.sink(sink % count) else {
                    continue;
                };
                match event {
                    0 => sink.connected(),
                    1 => sink.failed("连接失败: 连接被重置"),
                    2 => sink.closed(),
                    _ => sink.data(b"out"),
                }
            }
        }
        tokio::task::yield_now().await;
    }

    // 等待上报泵处理完剩余上报
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut statuses: HashMap<String, Vec<SessionStatus>> = HashMap::new();
    for event in drain(&mut stream) {
        if let TerminalEvent::SessionStatus {
            session_id, status, ..
        } = event
        {
            statuses.entry(session_id).or_default().push(status);
        }
    }

    let mut bindings = Vec::new();
    for id in SESSION_IDS {
        let bound = registry
            .get_session(id)
            .await
            .map(|s| s.has_adapter)
            .unwrap_or(false);
        bindings.push((id.to_string(), factory.open_adapters(id), bound));
    }

    RunSummary { statuses, bindings }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// 任意意图与上报序列之后：每个会话至多一个存活适配器，
    /// 且存活适配器恰好是记录绑定的那个；不会出现连续两次 connected。
    #[test]
    fn prop_at_most_one_live_adapter(ops in prop::collection::vec(arb_op(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let summary = runtime.block_on(run_ops(ops));

        for (id, open, bound) in &summary.bindings {
            prop_assert!(*open <= 1, "session {} has {} live adapters", id, open);
            prop_assert_eq!(*open, usize::from(*bound), "session {}", id);
        }
        for (id, statuses) in &summary.statuses {
            for pair in statuses.windows(2) {
                prop_assert!(
                    !(pair[0] == SessionStatus::Connected && pair[1] == SessionStatus::Connected),
                    "session {} reported connected twice: {:?}",
                    id,
                    statuses
                );
            }
        }
    }
}

#[tokio::test]
async fn test_stale_adapter_output_is_dropped() {
    let (registry, factory, mut stream) = fake_registry();
    registry
        .connect_remote("s1", password_config("a.example"))
        .await
        .unwrap();
    let first = factory.last_sink().unwrap();
    registry
        .connect_remote("s1", password_config("b.example"))
        .await
        .unwrap();
    let second = factory.last_sink().unwrap();

    first.data(b"from-old");
    second.data(b"from-new");
    let event = wait_for(&mut stream, Duration::from_secs(2), |e| {
        matches!(e, TerminalEvent::SessionData { .. })
    })
    .await
    .unwrap();
    assert!(matches!(event, TerminalEvent::SessionData { ref data, .. } if data == b"from-new"));

    let snapshot = registry.get_session("s1").await.unwrap();
    assert_eq!(snapshot.target.as_deref(), Some("deploy@b.example:22"));
    assert_eq!(snapshot.kind, Some(SessionKind::Remote));
}

#[tokio::test]
async fn test_destroy_then_recreate_ignores_old_epoch() {
    let (registry, factory, mut stream) = fake_registry();
    registry
        .connect_remote("s1", password_config("h"))
        .await
        .unwrap();
    let old = factory.last_sink().unwrap();
    assert!(registry.destroy("s1").await);

    registry
        .connect_remote("s1", password_config("h"))
        .await
        .unwrap();
    old.connected();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let statuses: Vec<SessionStatus> = drain(&mut stream)
        .into_iter()
        .filter_map(|e| match e {
            TerminalEvent::SessionStatus { status, .. } => Some(status),
            _ => None,
        })
        .collect();
    assert!(!statuses.contains(&SessionStatus::Connected), "{:?}", statuses);
    assert_eq!(
        registry.get_session("s1").await.unwrap().status,
        SessionStatus::Connecting
    );
}

fn profile(id: &str, host: &str) -> ConnectionProfile {
    ConnectionProfile {
        id: id.to_string(),
        host: host.to_string(),
        username: "deploy".to_string(),
        password: Some("hunter2".to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_connect_by_profile_is_found_by_profile_id() {
    let (registry, factory, _stream) = fake_registry();
    connect_session(&registry, "s1", ConnectTarget::Profile(profile("p1", "h")))
        .await
        .unwrap();

    assert_eq!(get_or_create_session(&registry, "p1").await.unwrap(), "s1");
    assert_eq!(registry.list_sessions().await.len(), 1);
    assert_eq!(factory.count(), 1);
    assert_eq!(factory.open_adapters("s1"), 1);
}

#[tokio::test]
async fn test_profile_has_single_live_session() {
    let (registry, factory, _stream) = fake_registry();
    connect_session(&registry, "s1", ConnectTarget::Profile(profile("p1", "h")))
        .await
        .unwrap();
    connect_session(&registry, "s2", ConnectTarget::Profile(profile("p1", "h")))
        .await
        .unwrap();

    let live: usize = ["s1", "s2"]
        .iter()
        .map(|id| factory.open_adapters(id))
        .sum();
    assert_eq!(live, 1);
    assert_eq!(factory.open_adapters("s2"), 1);
    assert_eq!(get_or_create_session(&registry, "p1").await.unwrap(), "s2");

    // 直接给出连接参数的会话不参与配置关联
    connect_session(&registry, "s3", ConnectTarget::Remote(password_config("h")))
        .await
        .unwrap();
    assert_eq!(factory.open_adapters("s2"), 1);
    assert_eq!(get_or_create_session(&registry, "p1").await.unwrap(), "s2");
}

#[tokio::test]
async fn test_executor_streams_and_records_result() {
    let (registry, factory, mut stream) = fake_registry();
    registry
        .connect_remote("s1", password_config("h"))
        .await
        .unwrap();
    factory.last_sink().unwrap().connected();

    let executor = CommandExecutor::new(registry.clone());
    let target = ExecTarget::session("s1");
    let ok = executor.run(&target, "uname -a", None).await;
    assert!(ok.success);
    assert_eq!(ok.exit_code, 0);
    assert_eq!(ok.output, "uname -a");

    let failed = executor.run(&target, "fail now", None).await;
    assert!(!failed.success);
    assert_eq!(failed.exit_code, 1);

    let streamed = wait_for(&mut stream, Duration::from_secs(2), |e| {
        matches!(e, TerminalEvent::AgentOutput { .. })
    })
    .await
    .unwrap();
    assert!(matches!(
        streamed,
        TerminalEvent::AgentOutput { ref target, ref data }
            if *target == ExecTarget::session("s1") && data == b"uname -a"
    ));
}

/// 收集格式化后的日志
#[derive(Clone, Default)]
struct LogCapture(Arc<parking_lot::Mutex<Vec<u8>>>);

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_exec_logs_hide_credentials() {
    let capture = LogCapture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let (registry, factory, _stream) = fake_registry();
    registry
        .connect_remote("s1", password_config("h"))
        .await
        .unwrap();
    factory.last_sink().unwrap().connected();

    let state = shellmux::commands::TerminalState::new(registry.clone());
    let request = shellmux::commands::IntentRequest::parse(
        r#"{"type":"execOnSession","target":{"type":"session","sessionId":"s1"},"command":"DB_PASSWORD=s3cr3t-pw psql --password s3cr3t-pw"}"#,
    )
    .unwrap();
    let reply = shellmux::commands::dispatch_request(&state, request).await;
    assert!(reply.ok, "{:?}", reply);

    let logs = String::from_utf8_lossy(&capture.0.lock()).to_string();
    assert!(logs.contains("[Executor] 执行命令"), "{}", logs);
    assert!(logs.contains("DB_PASSWORD=***"), "{}", logs);
    assert!(!logs.contains("s3cr3t-pw"), "{}", logs);
}

#[tokio::test]
async fn test_executor_reports_truncated_output() {
    let (registry, factory, _stream) = fake_registry();
    registry
        .connect_remote("s1", password_config("h"))
        .await
        .unwrap();
    factory.last_sink().unwrap().connected();

    let executor = CommandExecutor::new(registry.clone());
    let result = executor.run(&ExecTarget::session("s1"), "flood", None).await;
    assert!(result.success);
    assert!(result.truncated);
    assert!(result.output.ends_with(TRUNCATED_MARKER), "{:?}", result.output);
    assert_eq!(result.output.len(), FAKE_OUTPUT_LIMIT + TRUNCATED_MARKER.len());

    let short = executor.run(&ExecTarget::session("s1"), "echo hi", None).await;
    assert!(!short.truncated);
}

#[tokio::test]
async fn test_exec_after_disconnect_has_no_session() {
    let (registry, _factory, _stream) = fake_registry();
    registry.create_local(Some("l".to_string())).await.unwrap();
    registry.disconnect("l").await.unwrap();

    let err = registry
        .exec(
            "l",
            "ls",
            Duration::from_secs(1),
            shellmux::terminal::discard_chunks(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TerminalError::NoActiveSession(_)));
}

struct CannedBackend(&'static str);

#[async_trait]
impl AgentBackend for CannedBackend {
    async fn complete(
        &self,
        _system_prompt: &str,
        _history: &[ChatMessage],
    ) -> Result<String, AgentError> {
        Ok(self.0.to_string())
    }
}

#[tokio::test]
async fn test_agent_turn_runs_commands_on_session() {
    let (registry, factory, _stream) = fake_registry();
    registry
        .connect_remote("s1", password_config("h"))
        .await
        .unwrap();
    factory.last_sink().unwrap().connected();

    let mut agent = AgentSession::new(
        Arc::new(CannedBackend(
            "先看磁盘：\n[EXECUTE]df -h[/EXECUTE]\n再看失败项：\n[EXECUTE]fail --x[/EXECUTE]",
        )),
        CommandExecutor::new(registry.clone()),
    );
    let turn = agent
        .turn("磁盘满了吗？", &ExecTarget::session("s1"))
        .await
        .unwrap();

    assert_eq!(turn.results.len(), 2);
    assert!(turn.results[0].success);
    assert_eq!(turn.results[0].command, "df -h");
    assert!(!turn.results[1].success);
    assert_eq!(agent.history().len(), 2);
}
