//! Blueprint stage: the per-chapter outline table, generated incrementally.
//!
//! Generation is chunked so a 100+ chapter novel never exceeds one
//! LLM-call-sized window: each request covers a fixed span of chapters and
//! is conditioned on a bounded slice of the already-written outline. The
//! accumulated text is persisted after every chunk, and a rerun resumes at
//! the highest chapter number found on disk. The part-aligned mode chunks
//! along the narrative parts of the plot architecture instead, keeping a
//! progress cursor artifact because part boundaries are not recoverable
//! from the outline text itself.

pub mod parser;

use crate::gateway::{invoke_with_cleaning, Gateway, LanguageModelError};
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::prompts::{PromptError, PromptRegistry};
use crate::store::{
    ArtifactStore, StoreError, ARCHITECTURE_FILE, BLUEPRINT_FILE, PART_PROGRESS_FILE,
    PLOT_CANONICAL_FILE,
};
use std::cmp::min;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub use parser::{
    ensure_contiguous, find_max_chapter_number, limit_to_recent_chapters, parse_blueprint,
    parse_plot_parts, BlueprintEntry, ContiguityError, PlotPart,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlueprintPromptKind {
    SingleShot,
    Chunk { start: u32, end: u32 },
    Part { index: usize },
}

impl fmt::Display for BlueprintPromptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SingleShot => write!(f, "章节蓝图-单次生成"),
            Self::Chunk { start, end } => write!(f, "章节蓝图-分块({start}-{end})"),
            Self::Part { index } => write!(f, "章节蓝图-第{}部分", index + 1),
        }
    }
}

#[derive(Debug, Error)]
pub enum BlueprintError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("architecture file `{path}` is empty")]
    EmptyArchitecture { path: PathBuf },
    #[error("canonical plot `{path}` is empty")]
    EmptyPlot { path: PathBuf },
    #[error("plot architecture contains no part headings; part-aligned mode needs them")]
    NoParts,
    #[error("failed to render {kind} prompt: {source}")]
    Prompt {
        kind: BlueprintPromptKind,
        #[source]
        source: PromptError,
    },
    #[error("language model invocation failed for {kind}: {source}")]
    Model {
        kind: BlueprintPromptKind,
        #[source]
        source: LanguageModelError,
    },
    #[error("{kind} returned empty content; partial blueprint kept for resumption")]
    EmptyChunk { kind: BlueprintPromptKind },
    #[error("blueprint numbering is broken: {0}")]
    Contiguity(#[from] ContiguityError),
}

#[derive(Clone, Debug)]
pub struct BlueprintRequest {
    pub number_of_chapters: u32,
    pub chunk_size: u32,
    pub context_window: u32,
    pub min_chapters_per_part: u32,
    pub user_guidance: String,
}

/// Parsed outline plus the raw text it came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Blueprint {
    raw_text: String,
    entries: Vec<BlueprintEntry>,
}

impl Blueprint {
    pub fn from_text(raw_text: String) -> Self {
        let raw_text = raw_text.trim().to_string();
        let entries = parse_blueprint(&raw_text);
        Self { raw_text, entries }
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    pub fn entries(&self) -> &[BlueprintEntry] {
        &self.entries
    }

    pub fn chapter(&self, number: u32) -> Option<&BlueprintEntry> {
        self.entries
            .iter()
            .find(|entry| entry.chapter_number == number)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_chapter_number(&self) -> Option<u32> {
        self.entries.iter().map(|entry| entry.chapter_number).max()
    }
}

pub struct BlueprintService<'a> {
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
    max_retries: usize,
}

impl<'a> BlueprintService<'a> {
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

    /// Loads the persisted blueprint, if any.
    pub fn load(&self, store: &ArtifactStore) -> Result<Option<Blueprint>, BlueprintError> {
        let Some(text) = store.read_optional(BLUEPRINT_FILE)? else {
            return Ok(None);
        };
        if text.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(Blueprint::from_text(text)))
    }

    /// Chunked generation with resume-from-last-chapter semantics.
    pub fn generate(
        &self,
        gateway: &Gateway,
        store: &ArtifactStore,
        request: &BlueprintRequest,
    ) -> Result<Blueprint, BlueprintError> {
        let architecture = self.read_architecture(store)?;
        let mut final_text = store
            .read_or_default(BLUEPRINT_FILE)?
            .trim()
            .to_string();
        let total = request.number_of_chapters;
        let chunk_size = request.chunk_size.max(1);

        self.log(
            LogLevel::Info,
            format!("章节总数 = {total}，chunk_size = {chunk_size}。"),
        );

        // Small novels fit in one request; no chunk bookkeeping needed.
        if final_text.is_empty() && chunk_size >= total {
            let kind = BlueprintPromptKind::SingleShot;
            let prompt = self
                .prompts
                .format_with(
                    "chapter_blueprint",
                    [
                        ("novel_architecture", architecture),
                        ("number_of_chapters", total.to_string()),
                        ("user_guidance", request.user_guidance.trim().to_string()),
                    ],
                )
                .map_err(|source| BlueprintError::Prompt { kind, source })?;

            let response = invoke_with_cleaning(gateway, "生成章节目录", &prompt, self.max_retries, self.sink)
                .map_err(|source| BlueprintError::Model { kind, source })?;
            if response.is_empty() {
                return Err(BlueprintError::EmptyChunk { kind });
            }

            store.write(BLUEPRINT_FILE, &response)?;
            self.log(LogLevel::Info, "章节蓝图已生成（单次模式）。");
            return self.finish(store, response, total);
        }

        let mut current_start = match find_max_chapter_number(&final_text) {
            Some(max_existing) => {
                // Refuse to resume on top of a corrupted sequence.
                ensure_contiguous(&parse_blueprint(&final_text))?;
                self.log(
                    LogLevel::Info,
                    format!("检测到已有蓝图至第{max_existing}章，从下一章继续。"),
                );
                max_existing + 1
            }
            None => 1,
        };

        while current_start <= total {
            let current_end = min(current_start + chunk_size - 1, total);
            let kind = BlueprintPromptKind::Chunk {
                start: current_start,
                end: current_end,
            };
            let context = limit_to_recent_chapters(&final_text, request.context_window as usize);
            let prompt = self
                .prompts
                .format_with(
                    "chunked_chapter_blueprint",
                    [
                        ("novel_architecture", architecture.clone()),
                        ("chapter_list", context),
                        ("number_of_chapters", total.to_string()),
                        ("n", current_start.to_string()),
                        ("m", current_end.to_string()),
                        ("user_guidance", request.user_guidance.trim().to_string()),
                    ],
                )
                .map_err(|source| BlueprintError::Prompt { kind, source })?;

            self.log(
                LogLevel::Info,
                format!("正在生成第{current_start}-{current_end}章的目录..."),
            );
            let response = invoke_with_cleaning(gateway, "分块生成章节目录", &prompt, self.max_retries, self.sink)
                .map_err(|source| BlueprintError::Model { kind, source })?;

            if response.is_empty() {
                // Keep what was accumulated; the operator reruns to resume.
                store.write(BLUEPRINT_FILE, &final_text)?;
                self.log(
                    LogLevel::Warn,
                    format!("第{current_start}-{current_end}章目录返回为空，已保存当前进度。"),
                );
                return Err(BlueprintError::EmptyChunk { kind });
            }

            append_section(&mut final_text, &response);
            store.write(BLUEPRINT_FILE, &final_text)?;
            current_start = current_end + 1;
        }

        self.log(LogLevel::Info, "所有章节目录生成完毕。");
        self.finish(store, final_text, total)
    }

    /// Part-aligned generation: chunks follow the narrative parts of the
    /// canonical plot, asking for "at least M chapters" per part instead
    /// of a fixed span.
    pub fn generate_by_parts(
        &self,
        gateway: &Gateway,
        store: &ArtifactStore,
        request: &BlueprintRequest,
    ) -> Result<Blueprint, BlueprintError> {
        let architecture = self.read_architecture(store)?;
        let plot = store.read(PLOT_CANONICAL_FILE)?;
        if plot.trim().is_empty() {
            return Err(BlueprintError::EmptyPlot {
                path: store.path_of(PLOT_CANONICAL_FILE),
            });
        }

        let parts = parse_plot_parts(&plot);
        if parts.is_empty() {
            return Err(BlueprintError::NoParts);
        }

        let mut final_text = store.read_or_default(BLUEPRINT_FILE)?.trim().to_string();
        let completed = self.read_part_progress(store)?;
        if completed > 0 {
            self.log(
                LogLevel::Info,
                format!("检测到前{completed}个部分已完成，继续后续部分。"),
            );
        }

        for part in parts.iter().skip(completed) {
            let kind = BlueprintPromptKind::Part { index: part.index };
            let start_chapter = find_max_chapter_number(&final_text).unwrap_or(0) + 1;
            let context =
                limit_to_recent_chapters(&final_text, request.min_chapters_per_part as usize);
            let prompt = self
                .prompts
                .format_with(
                    "part_chapter_blueprint",
                    [
                        ("novel_architecture", architecture.clone()),
                        ("part_context", part_context(&parts, part.index)),
                        ("chapter_list", context),
                        ("min_chapters", request.min_chapters_per_part.to_string()),
                        ("start_chapter", start_chapter.to_string()),
                        ("user_guidance", request.user_guidance.trim().to_string()),
                    ],
                )
                .map_err(|source| BlueprintError::Prompt { kind, source })?;

            self.log(
                LogLevel::Info,
                format!("正在为{}生成章节目录（从第{start_chapter}章起）...", part.heading),
            );
            let response = invoke_with_cleaning(gateway, "按部分生成章节目录", &prompt, self.max_retries, self.sink)
                .map_err(|source| BlueprintError::Model { kind, source })?;

            if response.is_empty() {
                store.write(BLUEPRINT_FILE, &final_text)?;
                self.log(
                    LogLevel::Warn,
                    format!("{}目录返回为空，已保存当前进度。", part.heading),
                );
                return Err(BlueprintError::EmptyChunk { kind });
            }

            append_section(&mut final_text, &response);
            store.write(BLUEPRINT_FILE, &final_text)?;
            store.write(PART_PROGRESS_FILE, &(part.index + 1).to_string())?;
        }

        self.log(LogLevel::Info, "所有部分的章节目录生成完毕。");
        let expected = find_max_chapter_number(&final_text).unwrap_or(0);
        self.finish(store, final_text, expected)
    }

    fn finish(
        &self,
        store: &ArtifactStore,
        final_text: String,
        expected_chapters: u32,
    ) -> Result<Blueprint, BlueprintError> {
        let blueprint = Blueprint::from_text(final_text);
        ensure_contiguous(blueprint.entries())?;
        if blueprint.max_chapter_number() != Some(expected_chapters) {
            self.log(
                LogLevel::Warn,
                format!(
                    "蓝图章节数（{}）与目标（{expected_chapters}）不一致。",
                    blueprint.max_chapter_number().unwrap_or(0)
                ),
            );
        }
        store.write(BLUEPRINT_FILE, blueprint.raw_text())?;
        Ok(blueprint)
    }

    fn read_architecture(&self, store: &ArtifactStore) -> Result<String, BlueprintError> {
        let text = store.read(ARCHITECTURE_FILE)?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(BlueprintError::EmptyArchitecture {
                path: store.path_of(ARCHITECTURE_FILE),
            });
        }
        Ok(trimmed.to_string())
    }

    fn read_part_progress(&self, store: &ArtifactStore) -> Result<usize, BlueprintError> {
        let Some(text) = store.read_optional(PART_PROGRESS_FILE)? else {
            return Ok(0);
        };
        match text.trim().parse::<usize>() {
            Ok(completed) => Ok(completed),
            Err(_) => {
                self.log(
                    LogLevel::Warn,
                    format!("{PART_PROGRESS_FILE} 内容无法解析，按从头开始处理。"),
                );
                Ok(0)
            }
        }
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::scoped(level, "章节蓝图", message));
    }
}

fn append_section(text: &mut String, section: &str) {
    if text.is_empty() {
        text.push_str(section);
    } else {
        text.push_str("\n\n");
        text.push_str(section);
    }
}

/// Current part plus one neighbor on each side; the edges get a single
/// neighbor only.
fn part_context(parts: &[PlotPart], index: usize) -> String {
    let from = index.saturating_sub(1);
    let to = min(index + 1, parts.len() - 1);
    parts[from..=to]
        .iter()
        .map(|part| {
            let marker = if part.index == index {
                "【当前部分】"
            } else {
                "【相邻部分】"
            };
            format!("{marker}{}\n{}", part.heading, part.body)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
