//! Call instrumentation for gateway invocations.
//!
//! Every LLM call is bracketed by a start and an end record carrying the
//! call id, backend name, purpose label, timing and token accounting. The
//! sink is an injected port: recording is fire-and-forget, and a failing
//! sink must never abort the call it observes.

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

static ENABLED: AtomicBool = AtomicBool::new(true);

/// Process-wide recording toggle, on by default. Checked by the gateway
/// before each record so a disabled run skips sink work entirely.
pub fn set_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// Token accounting normalized across backends; absent fields are zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub cached_tokens: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallStart {
    pub call_id: String,
    pub model_name: String,
    pub purpose: String,
    pub temperature: f32,
    pub started_at_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallEnd {
    pub call_id: String,
    pub ended_at_ms: u64,
    pub waited_ms: u64,
    pub usage: TokenUsage,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn new_call_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// Instrumentation port. Implementations must swallow their own failures;
/// callers never see an error from a record call.
pub trait TelemetrySink: Send + Sync {
    fn record_start(&self, record: CallStart);
    fn record_end(&self, record: CallEnd);
}

pub type SharedTelemetrySink = Arc<dyn TelemetrySink>;

#[derive(Default)]
pub struct NullTelemetrySink;

impl TelemetrySink for NullTelemetrySink {
    fn record_start(&self, _record: CallStart) {}
    fn record_end(&self, _record: CallEnd) {}
}

/// Keeps records in memory so tests can assert on what a run emitted.
#[derive(Default)]
pub struct MemoryTelemetrySink {
    starts: Mutex<Vec<CallStart>>,
    ends: Mutex<Vec<CallEnd>>,
}

impl MemoryTelemetrySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starts(&self) -> Vec<CallStart> {
        self.starts
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn ends(&self) -> Vec<CallEnd> {
        self.ends
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

impl TelemetrySink for MemoryTelemetrySink {
    fn record_start(&self, record: CallStart) {
        if let Ok(mut guard) = self.starts.lock() {
            guard.push(record);
        }
    }

    fn record_end(&self, record: CallEnd) {
        if let Ok(mut guard) = self.ends.lock() {
            guard.push(record);
        }
    }
}

/// Appends one JSON object per record to a log file. Write errors are
/// logged through the `log` facade and dropped.
pub struct JsonlTelemetrySink {
    path: PathBuf,
    file: Mutex<Option<std::fs::File>>,
}

impl JsonlTelemetrySink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, line: String) {
        let Ok(mut guard) = self.file.lock() else {
            return;
        };

        if guard.is_none() {
            match OpenOptions::new().create(true).append(true).open(&self.path) {
                Ok(file) => *guard = Some(file),
                Err(err) => {
                    log::warn!("无法打开调用记录文件 {}: {err}", self.path.display());
                    return;
                }
            }
        }

        if let Some(file) = guard.as_mut() {
            if let Err(err) = writeln!(file, "{line}") {
                log::warn!("写入调用记录失败: {err}");
                *guard = None;
            }
        }
    }
}

impl TelemetrySink for JsonlTelemetrySink {
    fn record_start(&self, record: CallStart) {
        match serde_json::to_string(&Row::Start(record)) {
            Ok(line) => self.append(line),
            Err(err) => log::warn!("序列化调用开始记录失败: {err}"),
        }
    }

    fn record_end(&self, record: CallEnd) {
        match serde_json::to_string(&Row::End(record)) {
            Ok(line) => self.append(line),
            Err(err) => log::warn!("序列化调用结束记录失败: {err}"),
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Row {
    Start(CallStart),
    End(CallEnd),
}
