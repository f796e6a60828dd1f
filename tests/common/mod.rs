//! 集成测试公共工具：可编程的假适配器与工厂

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use shellmux::terminal::{
    AdapterFactory, AdapterSink, ChunkCallback, EventMultiplexer, EventStream, ExecOutcome,
    OutputBuffer, SessionAdapter, SessionKind, SessionRegistry, TerminalConfig, TerminalError, TerminalEvent,
};
use shellmux::{AuthConfig, RemoteConfig};

/// 假适配器的一次性执行输出上限
pub const FAKE_OUTPUT_LIMIT: usize = 64;

/// 假适配器
///
/// `exec_once` 按脚本回放输出：命令文本作为输出，`fail` 开头的命令以 1 退出，
/// `flood` 开头的命令输出超过 [`FAKE_OUTPUT_LIMIT`] 的内容。
pub struct FakeAdapter {
    pub session_id: String,
    pub kind: SessionKind,
    pub closed: AtomicBool,
    pub writes: Mutex<Vec<Vec<u8>>>,
}

impl FakeAdapter {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionAdapter for FakeAdapter {
    fn kind(&self) -> SessionKind {
        self.kind
    }

    fn write(&self, data: &[u8]) {
        self.writes.lock().push(data.to_vec());
    }

    fn resize(&self, _cols: u16, _rows: u16) {}

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    async fn exec_once(
        &self,
        command: &str,
        _timeout: Duration,
        on_chunk: ChunkCallback,
    ) -> Result<ExecOutcome, TerminalError> {
        if self.is_closed() {
            return Err(TerminalError::NoActiveSession(self.session_id.clone()));
        }
        if command.starts_with("flood") {
            let mut output = OutputBuffer::new(FAKE_OUTPUT_LIMIT);
            for _ in 0..100 {
                on_chunk(b"0123456789");
                output.push(b"0123456789");
            }
            return Ok(output.into_finished(0));
        }
        on_chunk(command.as_bytes());
        let code = if command.starts_with("fail") { 1 } else { 0 };
        Ok(ExecOutcome::finished(command.to_string(), code))
    }
}

/// 假工厂：记录创建过的每个适配器及其上报句柄
#[derive(Default)]
pub struct FakeFactory {
    pub spawned: Mutex<Vec<(Arc<FakeAdapter>, AdapterSink)>>,
}

impl FakeFactory {
    fn spawn(&self, kind: SessionKind, sink: AdapterSink) -> Arc<FakeAdapter> {
        let adapter = Arc::new(FakeAdapter {
            session_id: sink.session_id().to_string(),
            kind,
            closed: AtomicBool::new(false),
            writes: Mutex::new(Vec::new()),
        });
        self.spawned.lock().push((adapter.clone(), sink));
        adapter
    }

    pub fn count(&self) -> usize {
        self.spawned.lock().len()
    }

    pub fn sink(&self, index: usize) -> Option<AdapterSink> {
        self.spawned.lock().get(index).map(|(_, sink)| sink.clone())
    }

    pub fn last_sink(&self) -> Option<AdapterSink> {
        self.spawned.lock().last().map(|(_, sink)| sink.clone())
    }

    /// 指定会话上未关闭的适配器数
    pub fn open_adapters(&self, session_id: &str) -> usize {
        self.spawned
            .lock()
            .iter()
            .filter(|(adapter, _)| adapter.session_id == session_id && !adapter.is_closed())
            .count()
    }
}

impl AdapterFactory for FakeFactory {
    fn spawn_local(&self, sink: AdapterSink) -> Result<Arc<dyn SessionAdapter>, TerminalError> {
        Ok(self.spawn(SessionKind::Local, sink))
    }

    fn spawn_remote(&self, _config: RemoteConfig, sink: AdapterSink) -> Arc<dyn SessionAdapter> {
        self.spawn(SessionKind::Remote, sink)
    }
}

pub fn fake_registry() -> (Arc<SessionRegistry>, Arc<FakeFactory>, EventStream) {
    let (events, stream) = EventMultiplexer::new();
    let factory = Arc::new(FakeFactory::default());
    let registry = SessionRegistry::with_factory(
        Arc::new(TerminalConfig::default()),
        events,
        factory.clone(),
        Ok(()),
    );
    (Arc::new(registry), factory, stream)
}

pub fn password_config(host: &str) -> RemoteConfig {
    RemoteConfig::new(
        host,
        22,
        "deploy",
        AuthConfig::Password {
            password: "hunter2".to_string(),
        },
    )
    .unwrap()
}

/// 取出当前已排队的全部事件
pub fn drain(stream: &mut EventStream) -> Vec<TerminalEvent> {
    let mut events = Vec::new();
    while let Some(event) = stream.try_recv() {
        events.push(event);
    }
    events
}

/// 等待满足条件的事件
pub async fn wait_for<F>(stream: &mut EventStream, timeout: Duration, mut pred: F) -> Option<TerminalEvent>
where
    F: FnMut(&TerminalEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let event = tokio::time::timeout_at(deadline, stream.recv()).await.ok()??;
        if pred(&event) {
            return Some(event);
        }
    }
}
