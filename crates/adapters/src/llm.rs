//! Concrete LLM backends behind the core gateway trait.
//!
//! Two wire formats cover the whole roster: the OpenAI-compatible chat
//! endpoint (openai, deepseek, qwen, doubao, ollama) and the native
//! Gemini generateContent endpoint. Both normalize token accounting into
//! [`TokenUsage`], treating any field the provider does not report as
//! zero, and both report a contentless completion as an empty reply
//! rather than an error so the pipeline's empty-result policy applies
//! uniformly.

use std::thread;
use std::time::Duration;

use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use storyloom_core::config::LlmProfile;
use storyloom_core::gateway::{LanguageModel, LanguageModelError, ModelReply};
use storyloom_core::telemetry::TokenUsage;

use crate::base_url::check_base_url;
use crate::error::AdapterError;
use crate::retry::{call_with_retry, RetryPolicy};

/// Builds the backend named by the profile's `interface_format`.
pub fn create_backend(profile: &LlmProfile) -> Result<Box<dyn LanguageModel>, AdapterError> {
    let format = profile.interface_format.trim().to_lowercase();
    let timeout = profile.timeout.max(1);

    match format.as_str() {
        "openai" => Ok(Box::new(OpenAiCompatibleBackend::new(
            resolve_base_url(&profile.base_url, "https://api.openai.com/v1"),
            optional(&profile.api_key),
            profile.model_name.clone(),
            profile.max_tokens,
            profile.temperature,
            timeout,
            Some("You are a helpful assistant."),
        )?)),
        "deepseek" => Ok(Box::new(OpenAiCompatibleBackend::new(
            resolve_base_url(&profile.base_url, "https://api.deepseek.com/v1"),
            optional(&profile.api_key),
            profile.model_name.clone(),
            profile.max_tokens,
            profile.temperature,
            timeout,
            Some("You are a helpful assistant."),
        )?)),
        "qwen" => Ok(Box::new(OpenAiCompatibleBackend::new(
            resolve_base_url(
                &profile.base_url,
                "https://dashscope.aliyuncs.com/compatible-mode/v1",
            ),
            optional(&profile.api_key),
            profile.model_name.clone(),
            profile.max_tokens,
            profile.temperature,
            timeout,
            None,
        )?)),
        "doubao" => Ok(Box::new(OpenAiCompatibleBackend::new(
            resolve_base_url(&profile.base_url, "https://ark.cn-beijing.volces.com/api/v3"),
            optional(&profile.api_key),
            profile.model_name.clone(),
            profile.max_tokens,
            profile.temperature,
            timeout,
            None,
        )?)),
        "ollama" => Ok(Box::new(OpenAiCompatibleBackend::new(
            resolve_base_url(&profile.base_url, "http://localhost:11434/v1"),
            optional(&profile.api_key),
            profile.model_name.clone(),
            profile.max_tokens,
            profile.temperature,
            timeout,
            Some("You are a helpful assistant."),
        )?)),
        "gemini" => Ok(Box::new(GeminiBackend::new(
            profile.api_key.clone(),
            &profile.base_url,
            &profile.model_name,
            profile.max_tokens,
            profile.temperature,
            timeout,
        )?)),
        other => Err(AdapterError::InvalidConfig(format!(
            "unknown interface_format: {other}"
        ))),
    }
}

fn optional(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn resolve_base_url(base_url: &str, default: &str) -> String {
    let raw = if base_url.trim().is_empty() {
        default.to_string()
    } else {
        base_url.to_string()
    };
    check_base_url(&raw)
}

fn adapter_to_model_error(err: AdapterError) -> LanguageModelError {
    LanguageModelError::new(err)
}

struct OpenAiCompatibleBackend {
    client: Client,
    url: String,
    api_key: Option<String>,
    model_name: String,
    max_tokens: Option<u32>,
    temperature: f32,
    system_prompt: Option<String>,
    retry: RetryPolicy,
}

impl OpenAiCompatibleBackend {
    #[allow(clippy::too_many_arguments)]
    fn new(
        base_url: String,
        api_key: Option<String>,
        model_name: String,
        max_tokens: u32,
        temperature: f32,
        timeout: u64,
        system_prompt: Option<&str>,
    ) -> Result<Self, AdapterError> {
        if base_url.trim().is_empty() {
            return Err(AdapterError::InvalidConfig(
                "base_url must not be empty".to_string(),
            ));
        }
        if model_name.trim().is_empty() {
            return Err(AdapterError::InvalidConfig(
                "model_name must not be empty".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()?;

        Ok(Self {
            client,
            url: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
            model_name,
            max_tokens: (max_tokens > 0).then_some(max_tokens),
            temperature,
            system_prompt: system_prompt.map(str::to_string),
            retry: RetryPolicy::default(),
        })
    }

    fn invoke_once(&self, prompt: &str) -> Result<ModelReply, AdapterError> {
        let mut messages = Vec::new();
        if let Some(system) = self.system_prompt.as_deref() {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: prompt,
        });

        let body = ChatRequest {
            model: &self.model_name,
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let mut request = self
            .client
            .post(&self.url)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.json(&body).send()?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(AdapterError::HttpStatus { status, body });
        }

        let parsed: ChatResponse = response.json()?;
        Ok(parsed.into_reply())
    }
}

impl LanguageModel for OpenAiCompatibleBackend {
    fn invoke(&self, prompt: &str) -> Result<ModelReply, LanguageModelError> {
        call_with_retry(|| self.invoke_once(prompt), &self.retry).map_err(adapter_to_model_error)
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn temperature(&self) -> f32 {
        self.temperature
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

impl ChatResponse {
    fn into_reply(self) -> ModelReply {
        let usage = self.usage.map(ChatUsage::normalize).unwrap_or_default();
        let text = self
            .choices
            .into_iter()
            .find_map(|choice| choice.message.and_then(|message| message.content))
            .unwrap_or_default();
        ModelReply { text, usage }
    }
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChatChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Default, Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}

impl ChatUsage {
    fn normalize(self) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
            cached_tokens: self
                .prompt_tokens_details
                .map(|details| details.cached_tokens)
                .unwrap_or(0),
        }
    }
}

struct GeminiBackend {
    client: Client,
    url: String,
    model_name: String,
    temperature: f32,
    max_tokens: u32,
    retry: RetryPolicy,
    base_delay: Duration,
}

impl GeminiBackend {
    fn new(
        api_key: String,
        base_url: &str,
        model_name: &str,
        max_tokens: u32,
        temperature: f32,
        timeout: u64,
    ) -> Result<Self, AdapterError> {
        if api_key.trim().is_empty() {
            return Err(AdapterError::InvalidConfig(
                "Gemini api_key must not be empty".to_string(),
            ));
        }
        if model_name.trim().is_empty() {
            return Err(AdapterError::InvalidConfig(
                "Gemini model_name must not be empty".to_string(),
            ));
        }

        let base = if base_url.trim().is_empty() {
            "https://generativelanguage.googleapis.com/v1beta".to_string()
        } else {
            base_url.trim().trim_end_matches('/').to_string()
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()?;

        Ok(Self {
            client,
            url: format!("{base}/models/{model_name}:generateContent?key={api_key}"),
            model_name: model_name.to_string(),
            temperature,
            max_tokens,
            retry: RetryPolicy::default(),
            base_delay: Duration::from_secs(5),
        })
    }

    fn invoke_once(&self, prompt: &str) -> Result<ModelReply, AdapterError> {
        let request = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user",
                parts: vec![GeminiPartRequest { text: prompt }],
            }],
            generation_config: GeminiGenerationConfig {
                max_output_tokens: self.max_tokens,
                temperature: self.temperature,
            },
        };

        let response = self.client.post(&self.url).json(&request).send()?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(AdapterError::HttpStatus { status, body });
        }

        let parsed: GeminiResponse = response.json()?;
        Ok(parsed.into_reply())
    }

    fn rate_limit_delay(&self, err: &AdapterError, attempt: usize) -> Option<Duration> {
        let AdapterError::HttpStatus { status, body } = err else {
            return None;
        };
        let lower = body.to_ascii_lowercase();
        if *status != StatusCode::TOO_MANY_REQUESTS
            && !lower.contains("quota")
            && !lower.contains("rate limit")
        {
            return None;
        }

        if let Some(secs) = parse_retry_delay(body) {
            return Some(Duration::from_secs(secs + 5));
        }
        let multiplier = 1u32.checked_shl(attempt as u32).unwrap_or(1);
        self.base_delay
            .checked_mul(multiplier)
            .or(Some(self.base_delay))
    }
}

impl LanguageModel for GeminiBackend {
    fn invoke(&self, prompt: &str) -> Result<ModelReply, LanguageModelError> {
        let attempts = self.retry.max_attempts.max(1);

        for attempt in 0..attempts {
            match self.invoke_once(prompt) {
                Ok(reply) => return Ok(reply),
                Err(err) => {
                    if attempt + 1 < attempts {
                        if let Some(delay) = self.rate_limit_delay(&err, attempt) {
                            warn!(
                                "Gemini rate limit hit, retrying in {delay:?} (attempt {}/{attempts})",
                                attempt + 1
                            );
                            thread::sleep(delay);
                            continue;
                        }
                    }
                    return Err(adapter_to_model_error(err));
                }
            }
        }

        Err(adapter_to_model_error(AdapterError::retry_exhausted(
            attempts,
            AdapterError::EmptyResponse,
        )))
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn temperature(&self) -> f32 {
        self.temperature
    }
}

#[derive(Serialize)]
struct GeminiRequest<'a> {
    contents: Vec<GeminiContent<'a>>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiContent<'a> {
    role: &'static str,
    parts: Vec<GeminiPartRequest<'a>>,
}

#[derive(Serialize)]
struct GeminiPartRequest<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct GeminiGenerationConfig {
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata")]
    #[serde(default)]
    usage_metadata: Option<GeminiUsage>,
}

impl GeminiResponse {
    fn into_reply(self) -> ModelReply {
        let usage = self.usage_metadata.map(GeminiUsage::normalize).unwrap_or_default();

        let mut text = String::new();
        for candidate in self.candidates {
            if let Some(reason) = candidate.finish_reason.as_deref() {
                match reason {
                    "MAX_TOKENS" => warn!("Gemini response truncated by max output tokens"),
                    "SAFETY" => warn!("Gemini response blocked by safety filters"),
                    "RECITATION" => warn!("Gemini response blocked for recitation"),
                    _ => {}
                }
            }
            if let Some(content) = candidate.content {
                for part in content.parts {
                    if let GeminiPart::Text { text: part_text } = part {
                        text.push_str(&part_text);
                    }
                }
            }
            if !text.trim().is_empty() {
                break;
            }
        }

        ModelReply { text, usage }
    }
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiCandidateContent>,
    #[serde(rename = "finishReason")]
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    Text { text: String },
    Other(serde_json::Value),
}

#[derive(Debug, Default, Deserialize)]
struct GeminiUsage {
    #[serde(rename = "promptTokenCount")]
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(rename = "candidatesTokenCount")]
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(rename = "totalTokenCount")]
    #[serde(default)]
    total_token_count: u64,
    #[serde(rename = "cachedContentTokenCount")]
    #[serde(default)]
    cached_content_token_count: u64,
}

impl GeminiUsage {
    fn normalize(self) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.prompt_token_count,
            completion_tokens: self.candidates_token_count,
            total_tokens: self.total_token_count,
            cached_tokens: self.cached_content_token_count,
        }
    }
}

fn parse_retry_delay(body: &str) -> Option<u64> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(details) = value
            .get("error")
            .and_then(|v| v.get("details"))
            .and_then(|v| v.as_array())
        {
            for detail in details {
                if let Some(delay) = detail
                    .get("retryDelay")
                    .or_else(|| detail.get("retry_delay"))
                {
                    if let Some(parsed) = parse_delay_value(delay) {
                        return Some(parsed);
                    }
                }
            }
        }
    }

    static RETRY_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"retry[_ ]?delay[^0-9]*(\d+)").expect("valid retry delay regex"));
    RETRY_RE
        .captures(body)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())
}

fn parse_delay_value(value: &serde_json::Value) -> Option<u64> {
    if let Some(number) = value.as_u64() {
        return Some(number);
    }
    value
        .as_str()
        .and_then(|text| text.trim_end_matches('s').parse::<u64>().ok())
}
