//! Chapter drafting: one chapter of prose at a time.
//!
//! Chapter 1 is primed purely from the architecture and the first two
//! blueprint entries. Every later chapter reads the preceding draft in
//! full, asks the model for a short continuity summary of it, and then
//! feeds the final prompt with the whole previous chapter as a trailing
//! excerpt. The excerpt is deliberately not windowed — tone continuity
//! outweighs prompt growth here, unlike the blueprint stage.

use crate::blueprint::{Blueprint, BlueprintEntry};
use crate::gateway::{invoke_with_cleaning, Gateway, LanguageModelError};
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::prompts::{PromptArguments, PromptError, PromptRegistry};
use crate::store::{chapter_draft_file, ArtifactStore, StoreError, ARCHITECTURE_FILE, CHARACTER_STATE_FILE};
use std::fmt;
use thiserror::Error;

const SUMMARY_MARKERS: [&str; 4] = ["当前章节摘要:", "当前章节摘要：", "章节摘要:", "摘要:"];
const SUMMARY_FAILED_PLACEHOLDER: &str = "（摘要生成失败）";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChapterStage {
    Summary,
    Prompt,
    Draft,
}

impl ChapterStage {
    fn label(&self) -> &'static str {
        match self {
            Self::Summary => "章节摘要",
            Self::Prompt => "提示词构建",
            Self::Draft => "章节草稿",
        }
    }
}

impl fmt::Display for ChapterStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error)]
pub enum ChapterError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("chapter {number} is missing from the blueprint")]
    MissingChapter { number: u32 },
    #[error("failed to render {stage} prompt: {source}")]
    Prompt {
        stage: ChapterStage,
        #[source]
        source: PromptError,
    },
    #[error("language model invocation failed during {stage}: {source}")]
    Model {
        stage: ChapterStage,
        #[source]
        source: LanguageModelError,
    },
    #[error("chapter {number} draft came back empty; nothing was written")]
    EmptyDraft { number: u32 },
}

#[derive(Clone, Debug)]
pub struct ChapterRequest<'a> {
    pub blueprint: &'a Blueprint,
    pub chapter_number: u32,
    pub word_number: u32,
    pub genre: String,
}

#[derive(Clone, Debug)]
pub struct ChapterDraft {
    pub chapter_number: u32,
    pub content: String,
    pub prompt: String,
    pub artifact: String,
}

pub struct ChapterService<'a> {
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
    max_retries: usize,
}

impl<'a> ChapterService<'a> {
    pub fn new(prompts: &'a PromptRegistry, sink: &'a dyn LogSink) -> Self {
        Self {
            prompts,
            sink,
            max_retries: 3,
        }
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Assembles the draft prompt for the requested chapter. For chapters
    /// past the first this issues one LLM call for the continuity summary.
    pub fn build_prompt(
        &self,
        gateway: &Gateway,
        store: &ArtifactStore,
        request: &ChapterRequest<'_>,
    ) -> Result<String, ChapterError> {
        let number = request.chapter_number;
        let entry = request
            .blueprint
            .chapter(number)
            .ok_or(ChapterError::MissingChapter { number })?;
        let next = request.blueprint.chapter(number + 1);

        if number == 1 {
            let architecture = store.read_or_default(ARCHITECTURE_FILE)?;
            let mut args = entry_arguments(entry, next, request);
            args.insert("novel_setting".into(), architecture);
            return self
                .prompts
                .format("first_chapter_draft", &args)
                .map_err(|source| ChapterError::Prompt {
                    stage: ChapterStage::Prompt,
                    source,
                });
        }

        let previous = store
            .read_or_default(&chapter_draft_file(number - 1))?
            .trim()
            .to_string();
        let short_summary = self.summarize_previous(gateway, entry, next, &previous, number)?;
        let character_state = store.read_or_default(CHARACTER_STATE_FILE)?;

        let mut args = entry_arguments(entry, next, request);
        args.insert("previous_chapter_excerpt".into(), previous);
        args.insert("character_state".into(), character_state);
        args.insert("short_summary".into(), short_summary);

        self.prompts
            .format("next_chapter_draft", &args)
            .map_err(|source| ChapterError::Prompt {
                stage: ChapterStage::Prompt,
                source,
            })
    }

    /// Drafts and persists one chapter. An empty reply aborts the chapter
    /// without touching the store.
    pub fn generate_draft(
        &self,
        gateway: &Gateway,
        store: &ArtifactStore,
        request: &ChapterRequest<'_>,
    ) -> Result<ChapterDraft, ChapterError> {
        let number = request.chapter_number;
        let prompt = self.build_prompt(gateway, store, request)?;

        self.log(number, LogLevel::Info, "开始生成章节正文...");
        let content = invoke_with_cleaning(gateway, "生成章节正文", &prompt, self.max_retries, self.sink)
            .map_err(|source| ChapterError::Model {
                stage: ChapterStage::Draft,
                source,
            })?;
        if content.is_empty() {
            self.log(number, LogLevel::Error, "章节正文返回为空，放弃本章。");
            return Err(ChapterError::EmptyDraft { number });
        }

        let artifact = chapter_draft_file(number);
        store.write(&artifact, &content)?;
        self.log(number, LogLevel::Info, "章节正文生成完成。");

        Ok(ChapterDraft {
            chapter_number: number,
            content,
            prompt,
            artifact,
        })
    }

    /// Short LLM-generated summary of the previous chapter, conditioned on
    /// both the current and next blueprint entries so the continuity hint
    /// points forward. Failure degrades to a placeholder instead of
    /// aborting the draft.
    fn summarize_previous(
        &self,
        gateway: &Gateway,
        entry: &BlueprintEntry,
        next: Option<&BlueprintEntry>,
        previous_text: &str,
        number: u32,
    ) -> Result<String, ChapterError> {
        if previous_text.is_empty() {
            return Ok(String::new());
        }

        let defaults = NextEntryDefaults::from(next);
        let prompt = self
            .prompts
            .format_with(
                "summarize_recent_chapters",
                [
                    ("combined_text", previous_text.to_string()),
                    ("novel_number", number.to_string()),
                    ("chapter_title", entry.chapter_title.clone()),
                    ("chapter_role", entry.chapter_role.clone()),
                    ("chapter_purpose", entry.chapter_purpose.clone()),
                    ("suspense_level", entry.suspense_level.clone()),
                    ("chapter_summary", entry.chapter_summary.clone()),
                    ("next_chapter_number", (number + 1).to_string()),
                    ("next_chapter_title", defaults.title.clone()),
                    ("next_chapter_role", defaults.role.clone()),
                    ("next_chapter_purpose", defaults.purpose.clone()),
                    ("next_chapter_suspense_level", defaults.suspense.clone()),
                    ("next_chapter_summary", defaults.summary.clone()),
                ],
            )
            .map_err(|source| ChapterError::Prompt {
                stage: ChapterStage::Summary,
                source,
            })?;

        self.log(number, LogLevel::Info, "正在生成前章摘要...");
        match invoke_with_cleaning(gateway, "生成章节摘要", &prompt, self.max_retries, self.sink) {
            Ok(response) if !response.is_empty() => Ok(extract_summary(&response)),
            Ok(_) => {
                self.log(number, LogLevel::Warn, "前章摘要返回为空，使用占位文本。");
                Ok(SUMMARY_FAILED_PLACEHOLDER.to_string())
            }
            Err(err) => {
                self.log(
                    number,
                    LogLevel::Warn,
                    format!("前章摘要生成失败，使用占位文本：{err}"),
                );
                Ok(SUMMARY_FAILED_PLACEHOLDER.to_string())
            }
        }
    }

    fn log(&self, number: u32, level: LogLevel, message: impl Into<String>) {
        self.sink
            .log(LogRecord::scoped(level, format!("第{number}章草稿"), message));
    }
}

/// Pulls the summary body out of a marker-labelled reply; an unlabelled
/// reply is used as-is.
pub fn extract_summary(text: &str) -> String {
    for marker in SUMMARY_MARKERS {
        if let Some(index) = text.find(marker) {
            return text[index + marker.len()..].trim().to_string();
        }
    }
    text.trim().to_string()
}

struct NextEntryDefaults {
    title: String,
    role: String,
    purpose: String,
    suspense: String,
    connection: String,
    summary: String,
}

impl NextEntryDefaults {
    fn from(next: Option<&BlueprintEntry>) -> Self {
        match next {
            Some(entry) => Self {
                title: entry.chapter_title.clone(),
                role: entry.chapter_role.clone(),
                purpose: entry.chapter_purpose.clone(),
                suspense: entry.suspense_level.clone(),
                connection: entry.connection_elements.clone(),
                summary: entry.chapter_summary.clone(),
            },
            None => Self {
                title: "（未命名）".to_string(),
                role: "过渡章节".to_string(),
                purpose: "承上启下".to_string(),
                suspense: "中等".to_string(),
                connection: "自然衔接".to_string(),
                summary: "衔接过渡内容".to_string(),
            },
        }
    }
}

fn entry_arguments(
    entry: &BlueprintEntry,
    next: Option<&BlueprintEntry>,
    request: &ChapterRequest<'_>,
) -> PromptArguments {
    let defaults = NextEntryDefaults::from(next);
    let mut args = PromptArguments::new();
    args.insert("novel_number".into(), request.chapter_number.to_string());
    args.insert("word_number".into(), request.word_number.to_string());
    args.insert("genre".into(), request.genre.clone());
    args.insert("chapter_title".into(), entry.chapter_title.clone());
    args.insert("chapter_role".into(), entry.chapter_role.clone());
    args.insert("chapter_purpose".into(), entry.chapter_purpose.clone());
    args.insert("suspense_level".into(), entry.suspense_level.clone());
    args.insert(
        "connection_elements".into(),
        entry.connection_elements.clone(),
    );
    args.insert("chapter_summary".into(), entry.chapter_summary.clone());
    args.insert(
        "next_chapter_number".into(),
        (request.chapter_number + 1).to_string(),
    );
    args.insert("next_chapter_title".into(), defaults.title);
    args.insert("next_chapter_role".into(), defaults.role);
    args.insert("next_chapter_purpose".into(), defaults.purpose);
    args.insert("next_chapter_suspense_level".into(), defaults.suspense);
    args.insert("next_connection_elements".into(), defaults.connection);
    args.insert("next_chapter_summary".into(), defaults.summary);
    args
}
