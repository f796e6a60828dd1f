//! 系统信息
//!
//! ## 功能
//! - 本地：通过 `sysinfo` 采集主机名、CPU、内存、运行时间与负载
//! - 远程：在已连接会话上并发执行五条探测命令并宽松解析

use serde::{Deserialize, Serialize};
use sysinfo::System;

use super::error::TerminalError;
use super::exec::{discard_chunks, ExecOutcome};
use super::session_registry::SessionRegistry;

/// 远程探测命令
pub mod probe_commands {
    pub const CPU: &str = "top -bn1 | grep 'Cpu(s)' | awk '{print $2}' | cut -d'%' -f1";
    pub const MEMORY: &str =
        "free -b | awk 'NR==2{printf \"%d %d %.1f\", $2, $3, $3*100/$2}'";
    pub const NETWORK: &str = "cat /proc/net/dev | awk 'NR>2{rx+=$2;tx+=$10}END{print rx,tx}'";
    pub const UPTIME: &str =
        "uptime -p 2>/dev/null || uptime | awk -F'up ' '{print $2}' | awk -F',' '{print $1}'";
    pub const HOSTNAME: &str = "hostname";
}

/// 本地系统信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalSystemInfo {
    pub hostname: String,
    pub platform: String,
    pub arch: String,
    /// CPU 使用率（百分比，取整）
    pub cpu_usage: u32,
    pub cpu_cores: usize,
    pub mem_total: u64,
    pub mem_used: u64,
    pub mem_percent: u32,
    /// 运行时间（秒）
    pub uptime: u64,
    /// 1 / 5 / 15 分钟负载
    pub loadavg: [f64; 3],
}

impl LocalSystemInfo {
    /// 采集本地系统信息
    ///
    /// CPU 使用率需要两次采样，采样间隔在阻塞线程中等待。
    pub async fn collect() -> Result<Self, TerminalError> {
        tokio::task::spawn_blocking(Self::collect_blocking)
            .await
            .map_err(|e| TerminalError::Internal(format!("采集系统信息失败: {}", e)))
    }

    fn collect_blocking() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_all();
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let mem_total = sys.total_memory();
        let mem_used = sys.used_memory();
        let load = System::load_average();

        Self {
            hostname: System::host_name().unwrap_or_default(),
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            cpu_usage: sys.global_cpu_usage().round().max(0.0) as u32,
            cpu_cores: sys.cpus().len(),
            mem_total,
            mem_used,
            mem_percent: percent(mem_used, mem_total),
            uptime: System::uptime(),
            loadavg: [load.one, load.five, load.fifteen],
        }
    }
}

fn percent(used: u64, total: u64) -> u32 {
    if total == 0 {
        return 0;
    }
    ((used as f64 / total as f64) * 100.0).round() as u32
}

/// 远程系统信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSystemInfo {
    pub hostname: String,
    pub cpu_usage: f64,
    pub mem_total: u64,
    pub mem_used: u64,
    pub mem_percent: f64,
    pub net_rx: u64,
    pub net_tx: u64,
    /// 远程 `uptime` 的原样文本，无法获取时为 `-`
    pub uptime: String,
}

/// 探测命令的原始输出
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeOutputs {
    pub cpu: String,
    pub memory: String,
    pub network: String,
    pub uptime: String,
    pub hostname: String,
}

impl RemoteSystemInfo {
    /// 在会话上并发探测
    ///
    /// 会话未连接时返回 `NoActiveSession`；单条命令失败或超时只影响对应字段。
    pub async fn probe(registry: &SessionRegistry, session_id: &str) -> Result<Self, TerminalError> {
        let fallback_host = registry
            .remote_config(session_id)
            .await
            .map(|config| config.host)
            .unwrap_or_default();
        let timeout = registry.config().remote_exec_timeout();
        let run = |command: &'static str| registry.exec(session_id, command, timeout, discard_chunks());

        let (cpu, memory, network, uptime, hostname) = tokio::join!(
            run(probe_commands::CPU),
            run(probe_commands::MEMORY),
            run(probe_commands::NETWORK),
            run(probe_commands::UPTIME),
            run(probe_commands::HOSTNAME),
        );

        let outputs = ProbeOutputs {
            cpu: probe_output(cpu)?,
            memory: probe_output(memory)?,
            network: probe_output(network)?,
            uptime: probe_output(uptime)?,
            hostname: probe_output(hostname)?,
        };
        Ok(Self::parse(&outputs, &fallback_host))
    }

    /// 宽松解析：无法解析的数字为 0，运行时间为 `-`，主机名回退到连接地址
    pub fn parse(outputs: &ProbeOutputs, fallback_host: &str) -> Self {
        let memory: Vec<&str> = outputs.memory.split_whitespace().collect();
        let network: Vec<&str> = outputs.network.split_whitespace().collect();

        let hostname = outputs.hostname.trim();
        let uptime = outputs.uptime.trim();

        Self {
            hostname: if hostname.is_empty() {
                fallback_host.to_string()
            } else {
                hostname.to_string()
            },
            cpu_usage: lenient_f64(&outputs.cpu),
            mem_total: lenient_u64(field(&memory, 0)),
            mem_used: lenient_u64(field(&memory, 1)),
            mem_percent: lenient_f64(field(&memory, 2)),
            net_rx: lenient_u64(field(&network, 0)),
            net_tx: lenient_u64(field(&network, 1)),
            uptime: if uptime.is_empty() {
                "-".to_string()
            } else {
                uptime.to_string()
            },
        }
    }
}

fn probe_output(result: Result<ExecOutcome, TerminalError>) -> Result<String, TerminalError> {
    match result {
        Ok(outcome) if outcome.timed_out => Ok(String::new()),
        Ok(outcome) => Ok(outcome.output),
        Err(e @ TerminalError::NoActiveSession(_)) => Err(e),
        Err(e) => {
            tracing::debug!("[SystemInfo] 探测命令失败: {}", e);
            Ok(String::new())
        }
    }
}

/// 按下标取字段，越界时为空串
fn field<'a>(parts: &[&'a str], index: usize) -> &'a str {
    parts.get(index).copied().unwrap_or("")
}

/// 取开头的数字部分
fn numeric_prefix(text: &str, allow_fraction: bool) -> &str {
    let text = text.trim_start();
    let mut end = 0;
    let mut seen_dot = false;
    for (i, c) in text.char_indices() {
        let accepted = c.is_ascii_digit()
            || (i == 0 && (c == '-' || c == '+'))
            || (allow_fraction && c == '.' && !seen_dot);
        if !accepted {
            break;
        }
        seen_dot |= c == '.';
        end = i + c.len_utf8();
    }
    &text[..end]
}

fn lenient_f64(text: &str) -> f64 {
    numeric_prefix(text, true).parse().unwrap_or(0.0)
}

fn lenient_u64(text: &str) -> u64 {
    numeric_prefix(text, false).parse().unwrap_or(0)
}
