//! Architecture stage: character dynamics, initial character state, world
//! building, the multi-backend plot fan-out, and final document assembly.
//!
//! Every step checks the artifact store first and reads back prior output
//! instead of regenerating, so an interrupted run resumes at the first
//! missing artifact. Plot selection is a manual checkpoint: the stage
//! writes one candidate per backend plus a comparison document and stops
//! until the operator copies the chosen candidate into `plot.txt`.

use crate::fanout::{self, FanoutError, TaggedTask};
use crate::gateway::{invoke_with_cleaning, Gateway, LanguageModelError};
use crate::logging::{LogLevel, LogRecord, LogSink, NullLogSink};
use crate::prompts::{PromptError, PromptRegistry};
use crate::store::{
    plot_candidate_file, ArtifactStore, StoreError, ARCHITECTURE_FILE, CHARACTER_DYNAMICS_FILE,
    CHARACTER_STATE_FILE, PLOT_CANONICAL_FILE, PLOT_COMPARISON_FILE, WORLD_BUILDING_FILE,
};
use std::fmt;
use thiserror::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ArchitectureStage {
    CharacterDynamics,
    CharacterState,
    WorldBuilding,
    PlotArchitecture,
}

impl ArchitectureStage {
    pub fn label(&self) -> &'static str {
        match self {
            Self::CharacterDynamics => "角色体系",
            Self::CharacterState => "初始角色状态",
            Self::WorldBuilding => "世界观",
            Self::PlotArchitecture => "情节架构",
        }
    }
}

impl fmt::Display for ArchitectureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error)]
pub enum ArchitectureError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to render prompt for stage {stage}: {source}")]
    Prompt {
        stage: ArchitectureStage,
        #[source]
        source: PromptError,
    },
    #[error("language model invocation failed for stage {stage}: {source}")]
    Model {
        stage: ArchitectureStage,
        #[source]
        source: LanguageModelError,
    },
    #[error("stage {stage} returned empty content")]
    EmptyResponse { stage: ArchitectureStage },
    #[error(transparent)]
    Fanout(#[from] FanoutError),
    #[error("every plot backend failed or returned empty content")]
    NoPlotCandidates,
}

#[derive(Clone, Debug)]
pub struct ArchitectureRequest {
    pub topic: String,
    pub genre: String,
    pub number_of_chapters: u32,
    pub word_number: u32,
    pub user_guidance: String,
}

/// How a stage run ended: either the final architecture document exists,
/// or the run is parked until the operator selects a plot candidate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArchitectureOutcome {
    Completed,
    AwaitingPlotSelection { candidates: Vec<String> },
}

pub struct ArchitectureService<'a> {
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
    max_retries: usize,
}

impl<'a> ArchitectureService<'a> {
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

    /// Runs the stage. `gateway` drives the single-backend steps; `roster`
    /// is fanned out for plot candidates.
    pub fn generate(
        &self,
        gateway: &Gateway,
        roster: &[Gateway],
        store: &ArtifactStore,
        request: &ArchitectureRequest,
    ) -> Result<ArchitectureOutcome, ArchitectureError> {
        if store.exists(ARCHITECTURE_FILE) {
            self.log(LogLevel::Info, "架构文件已存在，跳过生成。");
            return Ok(ArchitectureOutcome::Completed);
        }

        let character_dynamics = self.ensure_step(
            gateway,
            store,
            ArchitectureStage::CharacterDynamics,
            CHARACTER_DYNAMICS_FILE,
            "character_dynamics",
            vec![
                ("topic", request.topic.trim().to_string()),
                ("user_guidance", request.user_guidance.trim().to_string()),
            ],
        )?;

        self.ensure_step(
            gateway,
            store,
            ArchitectureStage::CharacterState,
            CHARACTER_STATE_FILE,
            "create_character_state",
            vec![("character_dynamics", character_dynamics.clone())],
        )?;

        let world_building = self.ensure_step(
            gateway,
            store,
            ArchitectureStage::WorldBuilding,
            WORLD_BUILDING_FILE,
            "world_building",
            vec![
                ("topic", request.topic.trim().to_string()),
                ("character_dynamics", character_dynamics.clone()),
                ("user_guidance", request.user_guidance.trim().to_string()),
            ],
        )?;

        // The fan-out only runs while no canonical plot has been chosen;
        // once the operator promotes a candidate, reruns go straight to
        // assembly.
        let Some(plot) = store.read_optional(PLOT_CANONICAL_FILE)? else {
            let candidates = self.generate_plot_candidates(
                roster,
                store,
                request,
                &character_dynamics,
                &world_building,
            )?;
            self.log(
                LogLevel::Info,
                format!(
                    "已生成 {} 个情节架构候选，请查看 {} 后将选定方案复制到 {}，再重新运行。",
                    candidates.len(),
                    PLOT_COMPARISON_FILE,
                    PLOT_CANONICAL_FILE
                ),
            );
            return Ok(ArchitectureOutcome::AwaitingPlotSelection { candidates });
        };

        self.assemble(store, request, &character_dynamics, &world_building, &plot)?;
        Ok(ArchitectureOutcome::Completed)
    }

    fn ensure_step(
        &self,
        gateway: &Gateway,
        store: &ArtifactStore,
        stage: ArchitectureStage,
        artifact: &str,
        prompt_key: &str,
        args: Vec<(&str, String)>,
    ) -> Result<String, ArchitectureError> {
        if let Some(existing) = store.read_optional(artifact)? {
            self.log(
                LogLevel::Info,
                format!("{} 已存在，跳过生成。", stage.label()),
            );
            return Ok(existing.trim().to_string());
        }

        self.log(LogLevel::Info, format!("开始生成{}...", stage.label()));
        let prompt = self
            .prompts
            .format_with(prompt_key, args)
            .map_err(|source| ArchitectureError::Prompt { stage, source })?;

        let result = invoke_with_cleaning(gateway, stage.label(), &prompt, self.max_retries, self.sink)
            .map_err(|source| ArchitectureError::Model { stage, source })?;
        if result.is_empty() {
            self.log(
                LogLevel::Warn,
                format!("{}生成失败，模型返回内容为空。", stage.label()),
            );
            return Err(ArchitectureError::EmptyResponse { stage });
        }

        store.write(artifact, &result)?;
        self.log(
            LogLevel::Info,
            format!("{}已写入 {}。", stage.label(), artifact),
        );
        Ok(result)
    }

    /// Requests one plot candidate per backend concurrently. A backend that
    /// errors or returns empty is logged and excluded; the batch succeeds
    /// as long as one candidate survives.
    fn generate_plot_candidates(
        &self,
        roster: &[Gateway],
        store: &ArtifactStore,
        request: &ArchitectureRequest,
        character_dynamics: &str,
        world_building: &str,
    ) -> Result<Vec<String>, ArchitectureError> {
        let stage = ArchitectureStage::PlotArchitecture;
        let prompt = self
            .prompts
            .format_with(
                "plot_architecture",
                [
                    ("topic", request.topic.trim().to_string()),
                    ("character_dynamics", character_dynamics.to_string()),
                    ("world_building", world_building.to_string()),
                    ("user_guidance", request.user_guidance.trim().to_string()),
                ],
            )
            .map_err(|source| ArchitectureError::Prompt { stage, source })?;

        let mut results: Vec<(String, String)> = Vec::new();
        let mut tasks: Vec<TaggedTask<String, LanguageModelError>> = Vec::new();

        for gateway in roster {
            let name = gateway.label().to_string();
            let artifact = plot_candidate_file(&name);
            if let Some(existing) = store.read_optional(&artifact)? {
                self.log(
                    LogLevel::Info,
                    format!("{name} 的情节架构已存在，跳过生成。"),
                );
                results.push((name, existing.trim().to_string()));
                continue;
            }

            let task_gateway = gateway.clone();
            let task_prompt = prompt.clone();
            let retries = self.max_retries;
            tasks.push(TaggedTask::new(name, move || {
                invoke_with_cleaning(
                    &task_gateway,
                    "生成情节架构",
                    &task_prompt,
                    retries,
                    &NullLogSink,
                )
            }));
        }

        if !tasks.is_empty() {
            self.log(
                LogLevel::Info,
                format!("开始使用 {} 个后端并发生成情节架构...", tasks.len()),
            );
            for outcome in fanout::join_all(tasks)? {
                match outcome.result {
                    Ok(text) if !text.is_empty() => {
                        let artifact = plot_candidate_file(&outcome.name);
                        store.write(&artifact, &text)?;
                        self.log(
                            LogLevel::Info,
                            format!("{} 情节架构生成完成。", outcome.name),
                        );
                        results.push((outcome.name, text));
                    }
                    Ok(_) => {
                        self.log(
                            LogLevel::Warn,
                            format!("{} 情节架构生成失败：返回内容为空。", outcome.name),
                        );
                    }
                    Err(failure) => {
                        self.log(
                            LogLevel::Warn,
                            format!("{} 情节架构生成失败：{failure}", outcome.name),
                        );
                    }
                }
            }
        }

        if results.is_empty() {
            self.log(LogLevel::Error, "所有后端都未能生成情节架构。");
            return Err(ArchitectureError::NoPlotCandidates);
        }

        store.write(PLOT_COMPARISON_FILE, &render_comparison(&results))?;
        self.log(
            LogLevel::Info,
            format!("对比文件已保存至 {PLOT_COMPARISON_FILE}。"),
        );

        Ok(results.into_iter().map(|(name, _)| name).collect())
    }

    fn assemble(
        &self,
        store: &ArtifactStore,
        request: &ArchitectureRequest,
        character_dynamics: &str,
        world_building: &str,
        plot: &str,
    ) -> Result<(), ArchitectureError> {
        let content = format!(
            "#=== 0) 小说设定 ===\n类型：{genre}，篇幅：约{chapters}章（每章至少{words}字）\n\n\
             #=== 1) 核心剧情 ===\n{topic}\n\n\
             #=== 2) 角色体系 ===\n{characters}\n\n\
             #=== 3) 世界观 ===\n{world}\n\n\
             #=== 4) 情节架构 ===\n{plot}\n",
            genre = request.genre.trim(),
            chapters = request.number_of_chapters,
            words = request.word_number,
            topic = request.topic.trim(),
            characters = character_dynamics,
            world = world_building,
            plot = plot.trim(),
        );

        store.write(ARCHITECTURE_FILE, &content)?;
        self.log(
            LogLevel::Info,
            format!("{ARCHITECTURE_FILE} 已生成。"),
        );
        Ok(())
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::scoped(level, "小说架构", message));
    }
}

fn render_comparison(results: &[(String, String)]) -> String {
    let rule = "=".repeat(60);
    let mut content = format!("{rule}\n多后端情节架构生成结果对比\n{rule}\n\n");

    for (index, (name, text)) in results.iter().enumerate() {
        content.push_str(&format!("方案 {}: {}\n{}\n{}\n\n", index + 1, name, "-".repeat(40), text));
    }

    content.push_str(&format!(
        "{rule}\n使用说明：\n\
         1. 阅读上述各后端生成的情节架构\n\
         2. 选择最优方案\n\
         3. 将选中的内容复制到 {PLOT_CANONICAL_FILE} 文件中\n\
         4. 重新运行生成流程以继续后续步骤\n{rule}\n"
    ));
    content
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::{mock_gateway, MockLanguageModel};
    use crate::logging::VecLogSink;
    use crate::store::ArtifactStore;
    use tempfile::tempdir;

    fn request() -> ArchitectureRequest {
        ArchitectureRequest {
            topic: "测试主题".into(),
            genre: "都市言情".into(),
            number_of_chapters: 10,
            word_number: 1100,
            user_guidance: String::new(),
        }
    }

    #[test]
    fn stops_awaiting_selection_until_canonical_plot_appears() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let service = ArchitectureService::new(&prompts, &sink).with_max_retries(1);

        let gateway = mock_gateway(MockLanguageModel::new(["角色体系", "初始状态", "世界观"]));
        let roster = vec![
            mock_gateway(MockLanguageModel::new(["方案甲"])).with_label("backend-a"),
            mock_gateway(MockLanguageModel::new(["方案乙"])).with_label("backend-b"),
        ];

        let outcome = service.generate(&gateway, &roster, &store, &request()).unwrap();
        assert_eq!(
            outcome,
            ArchitectureOutcome::AwaitingPlotSelection {
                candidates: vec!["backend-a".into(), "backend-b".into()]
            }
        );

        assert!(store.exists(CHARACTER_DYNAMICS_FILE));
        assert!(store.exists(CHARACTER_STATE_FILE));
        assert!(store.exists(WORLD_BUILDING_FILE));
        assert!(store.exists(&plot_candidate_file("backend-a")));
        assert!(store.exists(&plot_candidate_file("backend-b")));
        assert!(!store.exists(ARCHITECTURE_FILE));

        let comparison = store.read(PLOT_COMPARISON_FILE).unwrap();
        assert!(comparison.contains("方案甲"));
        assert!(comparison.contains("方案乙"));
        assert!(comparison.contains(PLOT_CANONICAL_FILE));

        // Operator copies the chosen candidate; the rerun skips every
        // generation step and only assembles.
        store.write(PLOT_CANONICAL_FILE, "方案甲").unwrap();
        let gateway = mock_gateway(MockLanguageModel::new(Vec::<String>::new()));
        let outcome = service.generate(&gateway, &[], &store, &request()).unwrap();
        assert_eq!(outcome, ArchitectureOutcome::Completed);

        let architecture = store.read(ARCHITECTURE_FILE).unwrap();
        assert!(architecture.contains("角色体系"));
        assert!(architecture.contains("世界观"));
        assert!(architecture.contains("方案甲"));
    }

    #[test]
    fn failing_backend_is_excluded_without_failing_the_batch() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let service = ArchitectureService::new(&prompts, &sink).with_max_retries(1);

        let gateway = mock_gateway(MockLanguageModel::new(["角色体系", "初始状态", "世界观"]));
        let roster = vec![
            mock_gateway(MockLanguageModel::from_results([Err("网络错误".to_string())]))
                .with_label("broken"),
            mock_gateway(MockLanguageModel::new(["仅存方案"])).with_label("alive"),
            mock_gateway(MockLanguageModel::new([""])).with_label("empty"),
        ];

        let outcome = service.generate(&gateway, &roster, &store, &request()).unwrap();
        assert_eq!(
            outcome,
            ArchitectureOutcome::AwaitingPlotSelection {
                candidates: vec!["alive".into()]
            }
        );

        assert!(!store.exists(&plot_candidate_file("broken")));
        assert!(!store.exists(&plot_candidate_file("empty")));
        let comparison = store.read(PLOT_COMPARISON_FILE).unwrap();
        assert!(comparison.contains("仅存方案"));
        assert!(sink.contains("broken"));
    }

    #[test]
    fn all_backends_failing_is_a_stage_error() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let service = ArchitectureService::new(&prompts, &sink).with_max_retries(1);

        let gateway = mock_gateway(MockLanguageModel::new(["角色体系", "初始状态", "世界观"]));
        let roster =
            vec![mock_gateway(MockLanguageModel::from_results([Err("down".to_string())]))
                .with_label("only")];

        let err = service
            .generate(&gateway, &roster, &store, &request())
            .unwrap_err();
        assert!(matches!(err, ArchitectureError::NoPlotCandidates));
    }

    #[test]
    fn empty_character_dynamics_halts_the_stage() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let service = ArchitectureService::new(&prompts, &sink).with_max_retries(1);

        let gateway = mock_gateway(MockLanguageModel::new([""]));
        let err = service.generate(&gateway, &[], &store, &request()).unwrap_err();
        assert!(matches!(
            err,
            ArchitectureError::EmptyResponse {
                stage: ArchitectureStage::CharacterDynamics
            }
        ));
        assert!(!store.exists(CHARACTER_DYNAMICS_FILE));
    }
}
