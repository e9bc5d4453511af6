//! The uniform model-invocation contract every pipeline stage talks to.
//!
//! A [`Gateway`] pairs one concrete backend with a telemetry sink; stages
//! never see which provider sits behind it. [`invoke_with_cleaning`] is the
//! response sanitizer: it retries transient failures, strips markup the
//! model tends to wrap its output in, and reports a persistently empty
//! reply as an empty string so callers can branch on it uniformly.

use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::telemetry::{self, CallEnd, CallStart, SharedTelemetrySink, TokenUsage};
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// What a backend hands back for one prompt. Usage fields a provider does
/// not report are zero.
#[derive(Clone, Debug, Default)]
pub struct ModelReply {
    pub text: String,
    pub usage: TokenUsage,
}

impl ModelReply {
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: TokenUsage::default(),
        }
    }
}

#[derive(Debug)]
pub struct LanguageModelError {
    inner: Box<dyn StdError + Send + Sync>,
}

impl LanguageModelError {
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            inner: Box::new(error),
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            inner: message.into().into(),
        }
    }

    pub fn as_inner(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.inner.as_ref()
    }
}

impl fmt::Display for LanguageModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl StdError for LanguageModelError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.inner.as_ref())
    }
}

/// One concrete backend: endpoint + model identifier + generation
/// parameters, hidden behind a single invoke call.
pub trait LanguageModel: Send + Sync {
    fn invoke(&self, prompt: &str) -> Result<ModelReply, LanguageModelError>;

    fn model_name(&self) -> &str;

    fn temperature(&self) -> f32;
}

/// Cloneable handle over a backend plus its instrumentation sink.
#[derive(Clone)]
pub struct Gateway {
    model: Arc<dyn LanguageModel>,
    sink: SharedTelemetrySink,
    label: String,
}

impl Gateway {
    pub fn new(model: Arc<dyn LanguageModel>, sink: SharedTelemetrySink) -> Self {
        let label = model.model_name().to_string();
        Self { model, sink, label }
    }

    /// Overrides the display label (the backend roster uses profile names
    /// rather than raw model identifiers).
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn model_name(&self) -> &str {
        self.model.model_name()
    }

    /// Invokes the backend once, bracketed by call-start/call-end records.
    /// Instrumentation failures stay inside the sink and never surface here.
    pub fn invoke(&self, prompt: &str, purpose: &str) -> Result<ModelReply, LanguageModelError> {
        let recording = telemetry::is_enabled();
        let call_id = telemetry::new_call_id();
        let started = Instant::now();

        if recording {
            self.sink.record_start(CallStart {
                call_id: call_id.clone(),
                model_name: self.model.model_name().to_string(),
                purpose: purpose.to_string(),
                temperature: self.model.temperature(),
                started_at_ms: telemetry::unix_millis(),
            });
        }

        let outcome = self.model.invoke(prompt);
        let waited_ms = started.elapsed().as_millis() as u64;

        if recording {
            let (usage, success, error) = match &outcome {
                Ok(reply) => (reply.usage, true, None),
                Err(err) => (TokenUsage::default(), false, Some(err.to_string())),
            };
            self.sink.record_end(CallEnd {
                call_id,
                ended_at_ms: telemetry::unix_millis(),
                waited_ms,
                usage,
                success,
                error,
            });
        }

        outcome
    }
}

/// Invokes the gateway with cleanup and bounded retries. Transport errors
/// are retried up to `max_retries`; the final error propagates. A reply
/// that stays empty after cleaning across every attempt yields `Ok("")` —
/// an empty result is a stage-level signal, not a transport failure.
pub fn invoke_with_cleaning(
    gateway: &Gateway,
    purpose: &str,
    prompt: &str,
    max_retries: usize,
    sink: &dyn LogSink,
) -> Result<String, LanguageModelError> {
    let attempts = max_retries.max(1);

    for attempt in 1..=attempts {
        match gateway.invoke(prompt, purpose) {
            Ok(reply) => {
                let cleaned = clean_response(&reply.text);
                if !cleaned.is_empty() {
                    return Ok(cleaned);
                }
                sink.log(LogRecord::scoped(
                    LogLevel::Warn,
                    purpose,
                    format!(
                        "{} 返回空响应（第{}次尝试，共{}次）",
                        gateway.label(),
                        attempt,
                        attempts
                    ),
                ));
            }
            Err(err) => {
                sink.log(LogRecord::scoped(
                    LogLevel::Warn,
                    purpose,
                    format!(
                        "{} 调用失败（第{}次尝试，共{}次）：{err}",
                        gateway.label(),
                        attempt,
                        attempts
                    ),
                ));
                if attempt == attempts {
                    return Err(err);
                }
            }
        }
    }

    Ok(String::new())
}

/// Strips code-fence markup and surrounding whitespace. The models wrap
/// plain-text stage output in ``` fences often enough that downstream
/// parsers have to assume they are gone.
pub fn clean_response(text: &str) -> String {
    text.replace("```", "").trim().to_string()
}


#[cfg(test)]
mod tests {
    use super::testing::{mock_gateway, MockLanguageModel};
    use super::*;
    use crate::logging::VecLogSink;
    use crate::telemetry::MemoryTelemetrySink;

    #[test]
    fn cleaning_strips_fences_and_whitespace() {
        assert_eq!(clean_response("```\n正文内容\n```"), "正文内容");
        assert_eq!(clean_response("  已修剪  "), "已修剪");
        assert_eq!(clean_response("``` ```"), "");
    }

    #[test]
    fn gateway_records_call_pair() {
        let sink = Arc::new(MemoryTelemetrySink::new());
        let gateway = Gateway::new(Arc::new(MockLanguageModel::new(["回复"])), sink.clone());

        let reply = gateway.invoke("提示词", "生成角色信息").unwrap();
        assert_eq!(reply.text, "回复");

        let starts = sink.starts();
        let ends = sink.ends();
        assert_eq!(starts.len(), 1);
        assert_eq!(ends.len(), 1);
        assert_eq!(starts[0].purpose, "生成角色信息");
        assert_eq!(starts[0].call_id, ends[0].call_id);
        assert!(ends[0].success);
    }

    #[test]
    fn gateway_records_failure_without_masking_error() {
        let sink = Arc::new(MemoryTelemetrySink::new());
        let gateway = Gateway::new(
            Arc::new(MockLanguageModel::from_results([Err(
                "connection reset".to_string()
            )])),
            sink.clone(),
        );

        let err = gateway.invoke("提示词", "测试").unwrap_err();
        assert!(err.to_string().contains("connection reset"));

        let ends = sink.ends();
        assert_eq!(ends.len(), 1);
        assert!(!ends[0].success);
        assert_eq!(ends[0].error.as_deref(), Some("connection reset"));
    }

    #[test]
    fn invoke_with_cleaning_retries_transient_errors() {
        let gateway = mock_gateway(MockLanguageModel::from_results([
            Err("502".to_string()),
            Ok("```最终回复```".to_string()),
        ]));
        let sink = VecLogSink::new();

        let text = invoke_with_cleaning(&gateway, "测试", "提示词", 3, &sink).unwrap();
        assert_eq!(text, "最终回复");
        assert!(sink.contains("调用失败"));
    }

    #[test]
    fn invoke_with_cleaning_reports_persistent_empty_as_empty() {
        let gateway = mock_gateway(MockLanguageModel::new(["", "", ""]));
        let sink = VecLogSink::new();

        let text = invoke_with_cleaning(&gateway, "测试", "提示词", 3, &sink).unwrap();
        assert!(text.is_empty());
    }

    #[test]
    fn invoke_with_cleaning_propagates_final_error() {
        let gateway = mock_gateway(MockLanguageModel::from_results([
            Err("boom".to_string()),
            Err("boom".to_string()),
        ]));
        let sink = VecLogSink::new();

        let err = invoke_with_cleaning(&gateway, "测试", "提示词", 2, &sink).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
