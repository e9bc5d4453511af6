//! Finalization: the post-draft bookkeeping for one chapter.
//!
//! Two LLM tasks run concurrently — the archival chapter summary and the
//! character-state patch — and both must succeed. An empty or failed
//! result here is fatal to the whole run: a silently stale character
//! state would poison the context of every later chapter, which is
//! strictly worse than stopping. Nothing is persisted unless both tasks
//! returned content.

use crate::fanout::{self, FanoutError, TaggedTask, TaskFailure};
use crate::gateway::{invoke_with_cleaning, Gateway, LanguageModelError};
use crate::logging::{LogLevel, LogRecord, LogSink, NullLogSink};
use crate::prompts::{PromptError, PromptRegistry};
use crate::store::{
    chapter_draft_file, chapter_summary_file, ArtifactStore, StoreError, CHARACTER_STATE_FILE,
};
use std::fmt;
use thiserror::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FinalizeStage {
    Summary,
    CharacterState,
    Enrichment,
}

impl FinalizeStage {
    fn label(&self) -> &'static str {
        match self {
            Self::Summary => "章节存档摘要",
            Self::CharacterState => "角色状态更新",
            Self::Enrichment => "章节扩写",
        }
    }
}

impl fmt::Display for FinalizeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("chapter {chapter_number} has no draft to finalize")]
    MissingDraft { chapter_number: u32 },
    #[error("chapter {chapter_number} draft is empty; cannot finalize")]
    EmptyDraft { chapter_number: u32 },
    #[error("failed to render {stage} prompt: {source}")]
    Prompt {
        stage: FinalizeStage,
        #[source]
        source: PromptError,
    },
    #[error("language model invocation failed during {stage}: {source}")]
    Model {
        stage: FinalizeStage,
        #[source]
        source: LanguageModelError,
    },
    /// The fatal case: proceeding with a missing summary or a stale
    /// character state would corrupt every subsequent chapter's context.
    #[error("{stage} returned empty content for chapter {chapter_number}; run must stop")]
    FatalEmpty {
        stage: FinalizeStage,
        chapter_number: u32,
    },
    #[error(transparent)]
    Fanout(#[from] FanoutError),
}

impl FinalizeError {
    /// Whether the driver must terminate the process rather than resume.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FinalizeError::FatalEmpty { .. } | FinalizeError::Model { .. }
        )
    }
}

#[derive(Clone, Debug)]
pub struct FinalizeOutcome {
    pub chapter_number: u32,
    pub summary_text: String,
    pub character_state_text: String,
    pub summary_artifact: String,
}

pub struct Finalizer<'a> {
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
    max_retries: usize,
}

impl<'a> Finalizer<'a> {
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

    pub fn finalize(
        &self,
        gateway: &Gateway,
        store: &ArtifactStore,
        chapter_number: u32,
    ) -> Result<FinalizeOutcome, FinalizeError> {
        let draft_name = chapter_draft_file(chapter_number);
        let chapter_text = store
            .read_optional(&draft_name)?
            .ok_or(FinalizeError::MissingDraft { chapter_number })?;
        let chapter_text = chapter_text.trim().to_string();
        if chapter_text.is_empty() {
            return Err(FinalizeError::EmptyDraft { chapter_number });
        }

        let old_state = store.read_or_default(CHARACTER_STATE_FILE)?;

        let summary_prompt = self
            .prompts
            .format_with("chapter_summary", [("chapter_text", chapter_text.clone())])
            .map_err(|source| FinalizeError::Prompt {
                stage: FinalizeStage::Summary,
                source,
            })?;
        let state_prompt = self
            .prompts
            .format_with(
                "update_character_state",
                [
                    ("chapter_text", chapter_text.clone()),
                    ("old_state", old_state.clone()),
                ],
            )
            .map_err(|source| FinalizeError::Prompt {
                stage: FinalizeStage::CharacterState,
                source,
            })?;

        self.log(
            chapter_number,
            LogLevel::Info,
            "并发生成存档摘要与角色状态更新...",
        );

        let retries = self.max_retries;
        let summary_gateway = gateway.clone();
        let state_gateway = gateway.clone();
        let tasks: Vec<TaggedTask<String, LanguageModelError>> = vec![
            TaggedTask::new("summary", move || {
                invoke_with_cleaning(
                    &summary_gateway,
                    "章节存档摘要",
                    &summary_prompt,
                    retries,
                    &NullLogSink,
                )
            }),
            TaggedTask::new("character_state", move || {
                invoke_with_cleaning(
                    &state_gateway,
                    "角色状态更新",
                    &state_prompt,
                    retries,
                    &NullLogSink,
                )
            }),
        ];

        let mut outcomes = fanout::join_all(tasks)?.into_iter();
        let summary_text = self.require(
            chapter_number,
            FinalizeStage::Summary,
            outcomes.next().map(|outcome| outcome.result),
        )?;
        let character_state_text = self.require(
            chapter_number,
            FinalizeStage::CharacterState,
            outcomes.next().map(|outcome| outcome.result),
        )?;

        let summary_artifact = chapter_summary_file(chapter_number);
        store.write(&summary_artifact, &summary_text)?;
        store.write(CHARACTER_STATE_FILE, &character_state_text)?;
        self.log(
            chapter_number,
            LogLevel::Info,
            "存档摘要与角色状态已更新。",
        );

        Ok(FinalizeOutcome {
            chapter_number,
            summary_text,
            character_state_text,
            summary_artifact,
        })
    }

    /// Expands a too-short draft toward the word target. The model coming
    /// back empty keeps the original text; enrichment is best-effort.
    pub fn enrich_chapter_text(
        &self,
        gateway: &Gateway,
        chapter_number: Option<u32>,
        chapter_text: &str,
        word_number: u32,
    ) -> Result<String, FinalizeError> {
        let stage = FinalizeStage::Enrichment;
        let prompt = self
            .prompts
            .format_with(
                "enrich_chapter",
                [
                    ("chapter_text", chapter_text.to_string()),
                    ("word_number", word_number.to_string()),
                ],
            )
            .map_err(|source| FinalizeError::Prompt { stage, source })?;

        if let Some(number) = chapter_number {
            self.log(number, LogLevel::Info, "开始扩写章节文本。");
        }

        let result = invoke_with_cleaning(gateway, stage.label(), &prompt, self.max_retries, self.sink)
            .map_err(|source| FinalizeError::Model { stage, source })?;
        if result.is_empty() {
            self.sink.log(LogRecord::new(
                LogLevel::Warn,
                "扩写模型返回空文本，保留原始内容。",
            ));
            Ok(chapter_text.to_string())
        } else {
            Ok(result)
        }
    }

    fn require(
        &self,
        chapter_number: u32,
        stage: FinalizeStage,
        result: Option<Result<String, TaskFailure<LanguageModelError>>>,
    ) -> Result<String, FinalizeError> {
        match result {
            Some(Ok(text)) if !text.is_empty() => Ok(text),
            Some(Ok(_)) => {
                self.log(
                    chapter_number,
                    LogLevel::Error,
                    format!("{}返回为空，终止本次运行。", stage.label()),
                );
                Err(FinalizeError::FatalEmpty {
                    stage,
                    chapter_number,
                })
            }
            Some(Err(failure)) => {
                self.log(
                    chapter_number,
                    LogLevel::Error,
                    format!("{}失败：{failure}", stage.label()),
                );
                Err(FinalizeError::Model {
                    stage,
                    source: LanguageModelError::message(failure.to_string()),
                })
            }
            None => Err(FinalizeError::FatalEmpty {
                stage,
                chapter_number,
            }),
        }
    }

    fn log(&self, chapter_number: u32, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::scoped(
            level,
            format!("第{chapter_number}章定稿"),
            message,
        ));
    }
}
