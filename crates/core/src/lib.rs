//! storyloom-core: a staged, resumable novel generation pipeline.
//!
//! The pipeline drives LLM calls through a uniform gateway, persists
//! every intermediate artifact as a plain text file, and resumes an
//! interrupted run at the first missing artifact.

pub mod architecture;
pub mod blueprint;
pub mod chapter;
pub mod compaction;
pub mod config;
pub mod fanout;
pub mod finalization;
pub mod gateway;
pub mod logging;
pub mod pipeline;
pub mod prompts;
pub mod store;
pub mod telemetry;

pub use architecture::{
    ArchitectureError, ArchitectureOutcome, ArchitectureRequest, ArchitectureService,
};
pub use blueprint::{
    Blueprint, BlueprintEntry, BlueprintError, BlueprintRequest, BlueprintService,
};
pub use chapter::{ChapterDraft, ChapterError, ChapterRequest, ChapterService};
pub use compaction::{CompactionError, CompactionOutcome, CompactionService};
pub use config::{
    BlueprintMode, Config, ConfigError, ConfigStore, LlmProfile, NovelSettings, PipelineSettings,
    TelemetrySettings,
};
pub use finalization::{FinalizeError, FinalizeOutcome, Finalizer};
pub use gateway::{
    clean_response, invoke_with_cleaning, Gateway, LanguageModel, LanguageModelError, ModelReply,
};
pub use logging::{
    LogLevel, LogRecord, LogSink, NullLogSink, SharedLogSink, StdoutLogSink, VecLogSink,
};
pub use pipeline::{Pipeline, PipelineError, RunOutcome};
pub use prompts::{PromptArguments, PromptError, PromptRegistry, PromptTemplate};
pub use store::{ArtifactStore, StoreError};
pub use telemetry::{
    CallEnd, CallStart, JsonlTelemetrySink, MemoryTelemetrySink, NullTelemetrySink,
    SharedTelemetrySink, TelemetrySink, TokenUsage,
};
