//! The sequential run loop over the whole pipeline.
//!
//! Chapters advance strictly one at a time: chapter N+1 never starts
//! before chapter N's finalization persisted its state, because the next
//! draft reads that state. Resumption is artifact-driven — a chapter
//! whose draft exists is not redrafted, one whose archival summary
//! exists is not re-finalized — so rerunning the binary after a crash
//! picks up at the first missing artifact.

use crate::architecture::{ArchitectureError, ArchitectureOutcome, ArchitectureRequest, ArchitectureService};
use crate::blueprint::{Blueprint, BlueprintError, BlueprintRequest, BlueprintService};
use crate::chapter::{ChapterError, ChapterRequest, ChapterService};
use crate::compaction::{CompactionError, CompactionService};
use crate::config::{BlueprintMode, NovelSettings, PipelineSettings};
use crate::finalization::{FinalizeError, Finalizer};
use crate::gateway::Gateway;
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::prompts::PromptRegistry;
use crate::store::{
    chapter_draft_file, chapter_summary_file, character_state_snapshot_file, ArtifactStore,
    StoreError,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("architecture stage failed: {0}")]
    Architecture(#[from] ArchitectureError),
    #[error("blueprint stage failed: {0}")]
    Blueprint(#[from] BlueprintError),
    #[error("chapter drafting failed: {0}")]
    Chapter(#[from] ChapterError),
    #[error("finalization failed: {0}")]
    Finalize(#[from] FinalizeError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    /// Finalization's fatal-empty is the one condition that must bring
    /// the process down instead of being retried by a rerun.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::Finalize(err) if err.is_fatal())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// All chapters drafted and finalized.
    Completed { chapters: u32 },
    /// Stopped at the manual plot-selection checkpoint.
    AwaitingPlotSelection { candidates: Vec<String> },
}

pub struct Pipeline<'a> {
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
    novel: &'a NovelSettings,
    settings: &'a PipelineSettings,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        prompts: &'a PromptRegistry,
        sink: &'a dyn LogSink,
        novel: &'a NovelSettings,
        settings: &'a PipelineSettings,
    ) -> Self {
        Self {
            prompts,
            sink,
            novel,
            settings,
        }
    }

    /// Runs architecture → blueprint → per-chapter draft/finalize, with
    /// compaction every `compaction_interval` chapters.
    pub fn run(
        &self,
        primary: &Gateway,
        roster: &[Gateway],
        store: &ArtifactStore,
    ) -> Result<RunOutcome, PipelineError> {
        let blueprint = match self.prepare(primary, roster, store)? {
            Prepared::Blueprint(blueprint) => blueprint,
            Prepared::AwaitingPlotSelection { candidates } => {
                return Ok(RunOutcome::AwaitingPlotSelection { candidates })
            }
        };

        let total = self.novel.num_chapters;
        let chapter_service =
            ChapterService::new(self.prompts, self.sink).with_max_retries(self.settings.max_retries);
        let finalizer =
            Finalizer::new(self.prompts, self.sink).with_max_retries(self.settings.max_retries);
        let compactor = CompactionService::new(self.prompts, self.sink)
            .with_max_retries(self.settings.max_retries);

        for chapter_number in 1..=total {
            if store.exists(&chapter_draft_file(chapter_number)) {
                self.log(
                    LogLevel::Info,
                    format!("第{chapter_number}章草稿已存在，跳过。"),
                );
            } else {
                let request = ChapterRequest {
                    blueprint: &blueprint,
                    chapter_number,
                    word_number: self.novel.word_number,
                    genre: self.novel.genre.clone(),
                };
                chapter_service.generate_draft(primary, store, &request)?;
            }

            if store.exists(&chapter_summary_file(chapter_number)) {
                self.log(
                    LogLevel::Info,
                    format!("第{chapter_number}章已定稿，跳过。"),
                );
            } else {
                finalizer.finalize(primary, store, chapter_number)?;
            }

            if self.due_for_compaction(chapter_number)
                && !store.exists(&character_state_snapshot_file(chapter_number))
            {
                // Compaction is best-effort maintenance; a failed pass
                // leaves the uncompacted state in place and the run goes on.
                match compactor.compact(primary, store, chapter_number) {
                    Ok(outcome) => self.log(
                        LogLevel::Info,
                        format!(
                            "第{chapter_number}章后完成状态压缩（更新{}个角色）。",
                            outcome.updated_characters.len()
                        ),
                    ),
                    Err(CompactionError::Store(source)) => return Err(source.into()),
                    Err(err) => self.log(
                        LogLevel::Warn,
                        format!("第{chapter_number}章后的状态压缩失败：{err}"),
                    ),
                }
            }
        }

        self.log(LogLevel::Info, format!("全部{total}章生成完毕。"));
        Ok(RunOutcome::Completed { chapters: total })
    }

    fn prepare(
        &self,
        primary: &Gateway,
        roster: &[Gateway],
        store: &ArtifactStore,
    ) -> Result<Prepared, PipelineError> {
        let architecture_service = ArchitectureService::new(self.prompts, self.sink)
            .with_max_retries(self.settings.max_retries);
        let request = ArchitectureRequest {
            topic: self.novel.topic.clone(),
            genre: self.novel.genre.clone(),
            number_of_chapters: self.novel.num_chapters,
            word_number: self.novel.word_number,
            user_guidance: self.novel.user_guidance.clone(),
        };

        match architecture_service.generate(primary, roster, store, &request)? {
            ArchitectureOutcome::AwaitingPlotSelection { candidates } => {
                return Ok(Prepared::AwaitingPlotSelection { candidates })
            }
            ArchitectureOutcome::Completed => {}
        }

        let blueprint_service = BlueprintService::new(self.prompts, self.sink)
            .with_max_retries(self.settings.max_retries);
        let blueprint_request = BlueprintRequest {
            number_of_chapters: self.novel.num_chapters,
            chunk_size: self.settings.chunk_size,
            context_window: self.settings.context_window,
            min_chapters_per_part: self.settings.min_chapters_per_part,
            user_guidance: self.novel.user_guidance.clone(),
        };
        let blueprint = match self.settings.blueprint_mode {
            BlueprintMode::Chunked => {
                blueprint_service.generate(primary, store, &blueprint_request)?
            }
            BlueprintMode::ByParts => {
                blueprint_service.generate_by_parts(primary, store, &blueprint_request)?
            }
        };

        Ok(Prepared::Blueprint(blueprint))
    }

    fn due_for_compaction(&self, chapter_number: u32) -> bool {
        let interval = self.settings.compaction_interval;
        interval > 0 && chapter_number % interval == 0
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::scoped(level, "流程", message));
    }
}

enum Prepared {
    Blueprint(Blueprint),
    AwaitingPlotSelection { candidates: Vec<String> },
}
