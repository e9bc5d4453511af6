use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use thiserror::Error;

use storyloom_adapters::{create_backend, AdapterError};
use storyloom_core::architecture::ArchitectureOutcome;
use storyloom_core::blueprint::{BlueprintRequest, BlueprintService};
use storyloom_core::chapter::{ChapterRequest, ChapterService};
use storyloom_core::compaction::CompactionService;
use storyloom_core::config::{BlueprintMode, Config, ConfigError, ConfigStore, TelemetrySettings};
use storyloom_core::finalization::Finalizer;
use storyloom_core::pipeline::{Pipeline, PipelineError, RunOutcome};
use storyloom_core::store::ArtifactStore;
use storyloom_core::telemetry::{
    self, JsonlTelemetrySink, NullTelemetrySink, SharedTelemetrySink,
};
use storyloom_core::{
    ArchitectureError, ArchitectureRequest, ArchitectureService, BlueprintError, ChapterError,
    CompactionError, FinalizeError, Gateway, LogLevel, LogRecord, LogSink, PromptError,
    PromptRegistry, StdoutLogSink, StoreError,
};

#[derive(Parser)]
#[command(name = "storyloom", about = "Staged, resumable LLM novel generation")]
struct Cli {
    /// Path to the JSON config document.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the whole pipeline: architecture, blueprint, then every chapter.
    Run,
    /// Run the architecture stage only (stops at plot selection).
    Architecture,
    /// Generate or resume the chapter blueprint.
    Blueprint,
    /// Draft a single chapter.
    Draft { chapter: u32 },
    /// Finalize a single drafted chapter.
    Finalize { chapter: u32 },
    /// Compact the character-state events, snapshotting at the chapter number.
    Compact { chapter: u32 },
}

#[derive(Debug, Error)]
enum CliError {
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    #[error("适配器错误: {0}")]
    Adapter(#[from] AdapterError),
    #[error("提示词错误: {0}")]
    Prompt(#[from] PromptError),
    #[error("输出目录错误: {0}")]
    Store(#[from] StoreError),
    #[error("架构阶段错误: {0}")]
    Architecture(#[from] ArchitectureError),
    #[error("蓝图阶段错误: {0}")]
    Blueprint(#[from] BlueprintError),
    #[error("章节草稿错误: {0}")]
    Chapter(#[from] ChapterError),
    #[error("章节定稿错误: {0}")]
    Finalize(#[from] FinalizeError),
    #[error("状态压缩错误: {0}")]
    Compaction(#[from] CompactionError),
    #[error("流程错误: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("{0}")]
    Usage(String),
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    let sink = StdoutLogSink::new();

    match run(cli, &sink) {
        Ok(code) => code,
        Err(err) => {
            sink.log(LogRecord::new(LogLevel::Error, err.to_string()));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli, sink: &StdoutLogSink) -> Result<ExitCode, CliError> {
    let store = ConfigStore::open(cli.config.clone())?;
    let config = store.config();
    let prompts = PromptRegistry::with_directories(config.prompt_directories.clone())?;
    let artifacts = open_artifacts(config)?;

    telemetry::set_enabled(config.telemetry.enabled);
    let telemetry_sink = build_telemetry(config.telemetry.clone());
    let primary = build_primary(config, &telemetry_sink)?;

    match cli.command {
        Command::Run => {
            let roster = build_roster(config, &telemetry_sink)?;
            let pipeline = Pipeline::new(&prompts, sink, &config.novel, &config.pipeline);
            match pipeline.run(&primary, &roster, &artifacts) {
                Ok(RunOutcome::Completed { chapters }) => {
                    sink.log(LogRecord::new(
                        LogLevel::Info,
                        format!("生成完成，共{chapters}章。输出目录：{}", artifacts.root().display()),
                    ));
                    Ok(ExitCode::SUCCESS)
                }
                Ok(RunOutcome::AwaitingPlotSelection { candidates }) => {
                    sink.log(LogRecord::new(
                        LogLevel::Info,
                        format!(
                            "已生成{}个情节候选，请完成人工选择后重新运行。",
                            candidates.len()
                        ),
                    ));
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) if err.is_fatal() => {
                    // Stale character state must never leak into later
                    // chapters; stop the process outright.
                    sink.log(LogRecord::new(LogLevel::Error, format!("致命错误：{err}")));
                    std::process::exit(1);
                }
                Err(err) => Err(err.into()),
            }
        }
        Command::Architecture => {
            let roster = build_roster(config, &telemetry_sink)?;
            let service = ArchitectureService::new(&prompts, sink)
                .with_max_retries(config.pipeline.max_retries);
            let request = ArchitectureRequest {
                topic: config.novel.topic.clone(),
                genre: config.novel.genre.clone(),
                number_of_chapters: config.novel.num_chapters,
                word_number: config.novel.word_number,
                user_guidance: config.novel.user_guidance.clone(),
            };
            match service.generate(&primary, &roster, &artifacts, &request)? {
                ArchitectureOutcome::Completed => {
                    sink.log(LogRecord::new(LogLevel::Info, "架构阶段完成。"));
                }
                ArchitectureOutcome::AwaitingPlotSelection { .. } => {
                    sink.log(LogRecord::new(LogLevel::Info, "等待人工选择情节方案。"));
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Blueprint => {
            let service =
                BlueprintService::new(&prompts, sink).with_max_retries(config.pipeline.max_retries);
            let request = BlueprintRequest {
                number_of_chapters: config.novel.num_chapters,
                chunk_size: config.pipeline.chunk_size,
                context_window: config.pipeline.context_window,
                min_chapters_per_part: config.pipeline.min_chapters_per_part,
                user_guidance: config.novel.user_guidance.clone(),
            };
            let blueprint = match config.pipeline.blueprint_mode {
                BlueprintMode::Chunked => service.generate(&primary, &artifacts, &request)?,
                BlueprintMode::ByParts => {
                    service.generate_by_parts(&primary, &artifacts, &request)?
                }
            };
            sink.log(LogRecord::new(
                LogLevel::Info,
                format!("章节蓝图就绪，共{}章。", blueprint.len()),
            ));
            Ok(ExitCode::SUCCESS)
        }
        Command::Draft { chapter } => {
            let blueprint = load_blueprint(&prompts, sink, &artifacts)?;
            let service =
                ChapterService::new(&prompts, sink).with_max_retries(config.pipeline.max_retries);
            let request = ChapterRequest {
                blueprint: &blueprint,
                chapter_number: chapter,
                word_number: config.novel.word_number,
                genre: config.novel.genre.clone(),
            };
            let draft = service.generate_draft(&primary, &artifacts, &request)?;
            sink.log(LogRecord::new(
                LogLevel::Info,
                format!("第{}章草稿已写入 {}。", draft.chapter_number, draft.artifact),
            ));
            Ok(ExitCode::SUCCESS)
        }
        Command::Finalize { chapter } => {
            let finalizer =
                Finalizer::new(&prompts, sink).with_max_retries(config.pipeline.max_retries);
            match finalizer.finalize(&primary, &artifacts, chapter) {
                Ok(outcome) => {
                    sink.log(LogRecord::new(
                        LogLevel::Info,
                        format!("第{}章定稿完成。", outcome.chapter_number),
                    ));
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) if err.is_fatal() => {
                    sink.log(LogRecord::new(LogLevel::Error, format!("致命错误：{err}")));
                    std::process::exit(1);
                }
                Err(err) => Err(err.into()),
            }
        }
        Command::Compact { chapter } => {
            let service = CompactionService::new(&prompts, sink)
                .with_max_retries(config.pipeline.max_retries);
            let outcome = service.compact(&primary, &artifacts, chapter)?;
            sink.log(LogRecord::new(
                LogLevel::Info,
                format!(
                    "状态压缩完成：更新{}个角色，备份 {}。",
                    outcome.updated_characters.len(),
                    outcome.snapshot_artifact
                ),
            ));
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn open_artifacts(config: &Config) -> Result<ArtifactStore, CliError> {
    let dir = if config.novel.output_dir.trim().is_empty() {
        "novel_output".to_string()
    } else {
        config.novel.output_dir.clone()
    };
    Ok(ArtifactStore::open(dir)?)
}

fn build_telemetry(settings: TelemetrySettings) -> SharedTelemetrySink {
    if settings.log_path.trim().is_empty() {
        Arc::new(NullTelemetrySink)
    } else {
        Arc::new(JsonlTelemetrySink::new(settings.log_path))
    }
}

fn build_primary(config: &Config, sink: &SharedTelemetrySink) -> Result<Gateway, CliError> {
    let (name, profile) = config.primary_profile()?;
    let backend = create_backend(profile)?;
    Ok(Gateway::new(Arc::from(backend), sink.clone()).with_label(name))
}

fn build_roster(config: &Config, sink: &SharedTelemetrySink) -> Result<Vec<Gateway>, CliError> {
    config
        .plot_roster()?
        .into_iter()
        .map(|(name, profile)| {
            let backend = create_backend(profile)?;
            Ok(Gateway::new(Arc::from(backend), sink.clone()).with_label(name))
        })
        .collect()
}

fn load_blueprint(
    prompts: &PromptRegistry,
    sink: &dyn LogSink,
    artifacts: &ArtifactStore,
) -> Result<storyloom_core::Blueprint, CliError> {
    BlueprintService::new(prompts, sink)
        .load(artifacts)?
        .ok_or_else(|| {
            CliError::Usage("章节蓝图不存在，请先运行 blueprint 子命令。".to_string())
        })
}
