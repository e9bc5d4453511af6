//! Full-pipeline scenarios: the manual plot-selection checkpoint, the
//! chapter loop with finalization and compaction, and crash-resume
//! behavior in the blueprint stage.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use storyloom_core::blueprint::{BlueprintRequest, BlueprintService};
use storyloom_core::config::{NovelSettings, PipelineSettings};
use storyloom_core::pipeline::{Pipeline, RunOutcome};
use storyloom_core::store::{
    chapter_draft_file, chapter_summary_file, character_state_snapshot_file, ArtifactStore,
    ARCHITECTURE_FILE, BLUEPRINT_FILE, CHARACTER_STATE_FILE, PLOT_CANONICAL_FILE,
    PLOT_COMPARISON_FILE,
};
use storyloom_core::telemetry::MemoryTelemetrySink;
use storyloom_core::{
    Gateway, LanguageModel, LanguageModelError, ModelReply, PromptRegistry, VecLogSink,
};
use tempfile::tempdir;

/// Routes each prompt to a scripted reply queue by a template marker, so
/// concurrent calls (finalization's two tasks) stay deterministic.
struct ScriptedModel {
    routes: Mutex<Vec<(String, VecDeque<String>)>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    fn new() -> Self {
        Self {
            routes: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn route<I, S>(self, marker: &str, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routes
            .lock()
            .unwrap()
            .push((marker.to_string(), replies.into_iter().map(Into::into).collect()));
        self
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    fn prompts_matching(&self, needle: &str) -> Vec<String> {
        self.prompts()
            .into_iter()
            .filter(|prompt| prompt.contains(needle))
            .collect()
    }
}

impl LanguageModel for ScriptedModel {
    fn invoke(&self, prompt: &str) -> Result<ModelReply, LanguageModelError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let mut routes = self.routes.lock().unwrap();
        for (marker, queue) in routes.iter_mut() {
            if prompt.contains(marker.as_str()) {
                let reply = queue.pop_front().ok_or_else(|| {
                    LanguageModelError::message(format!("route `{marker}` has no replies left"))
                })?;
                return Ok(ModelReply::text_only(reply));
            }
        }
        Err(LanguageModelError::message("no route matched the prompt"))
    }

    fn model_name(&self) -> &str {
        "scripted"
    }

    fn temperature(&self) -> f32 {
        0.0
    }
}

fn blueprint_entry(number: u32, title: &str) -> String {
    format!(
        "第{number}章 - [{title}]\n本章定位：[推进]\n核心作用：[发展主线]\n悬念密度：[渐进]\n衔接要素：[承接上一章]\n本章简述：[第{number}章概要]"
    )
}

fn character_state_after(chapter: u32) -> String {
    format!(
        "角色一：主角\n[性格]\n- 坚韧。\n[背景与外貌]\n- 普通出身。\n[主要角色间关系网]\n- 女主：相互吸引。\n[触发或加深的事件]\n- 第{chapter}章发生的事件。\n\n新出场角色：\n- 暂无"
    )
}

fn novel_settings() -> NovelSettings {
    NovelSettings {
        topic: "逆袭故事".into(),
        genre: "都市言情".into(),
        num_chapters: 3,
        word_number: 1100,
        output_dir: String::new(),
        user_guidance: String::new(),
    }
}

fn pipeline_settings() -> PipelineSettings {
    PipelineSettings {
        chunk_size: 2,
        context_window: 10,
        compaction_interval: 2,
        min_chapters_per_part: 2,
        max_retries: 1,
        ..PipelineSettings::default()
    }
}

#[test]
fn run_stops_at_plot_selection_then_completes_all_chapters() {
    let dir = tempdir().unwrap();
    let store = ArtifactStore::open(dir.path()).unwrap();
    let prompts = PromptRegistry::new().unwrap();
    let sink = VecLogSink::new();
    let novel = novel_settings();
    let settings = pipeline_settings();
    let pipeline = Pipeline::new(&prompts, &sink, &novel, &settings);

    // Phase 1: everything up to the plot fan-out; the run parks itself at
    // the manual selection checkpoint.
    let telemetry = Arc::new(MemoryTelemetrySink::new());
    let phase1 = Arc::new(
        ScriptedModel::new()
            .route("核心角色体系", ["主角与女主的角色体系"])
            .route("初始角色状态表", [character_state_after(0)])
            .route("构建这部小说的世界观", ["现代都市世界观"])
            .route("设计完整的情节架构", ["第一部分：相遇\n相遇剧情。"]),
    );
    let gateway = Gateway::new(phase1.clone(), telemetry.clone()).with_label("primary");
    let roster = vec![gateway.clone()];

    let outcome = pipeline.run(&gateway, &roster, &store).unwrap();
    assert_eq!(
        outcome,
        RunOutcome::AwaitingPlotSelection {
            candidates: vec!["primary".into()]
        }
    );
    assert!(store.exists(PLOT_COMPARISON_FILE));
    assert!(!store.exists(ARCHITECTURE_FILE));

    // Every call carried a start/end telemetry pair.
    assert_eq!(telemetry.starts().len(), 4);
    assert_eq!(telemetry.ends().len(), 4);
    assert!(telemetry.ends().iter().all(|end| end.success));

    // The operator promotes the candidate.
    let candidate = store.read("plot_primary.txt").unwrap();
    store.write(PLOT_CANONICAL_FILE, &candidate).unwrap();

    // Phase 2: rerun from the same artifacts. Architecture steps are all
    // skipped; the blueprint is chunked (2 requests for 3 chapters), then
    // each chapter is drafted and finalized, with compaction after 2.
    let chunk1 = format!("{}\n\n{}", blueprint_entry(1, "相遇"), blueprint_entry(2, "误会"));
    let chunk2 = blueprint_entry(3, "和解");
    let phase2 = Arc::new(
        ScriptedModel::new()
            .route("继续生成第", [chunk1.as_str(), chunk2.as_str()])
            .route("概括上一章的关键剧情", ["当前章节摘要: 前章概述一", "当前章节摘要: 前章概述二"])
            .route("进行压缩总结", ["角色一：主角\n[触发或加深的事件]\n- 压缩后的事件。"])
            .route("更新角色状态表", [
                character_state_after(1),
                character_state_after(2),
                character_state_after(3),
            ])
            .route("存档摘要", ["第一章存档摘要", "第二章存档摘要", "第三章存档摘要"])
            .route("请创作这部", ["第一章正文内容", "第二章正文内容", "第三章正文内容"]),
    );
    let gateway = Gateway::new(phase2.clone(), telemetry.clone()).with_label("primary");
    let roster = vec![gateway.clone()];

    let outcome = pipeline.run(&gateway, &roster, &store).unwrap();
    assert_eq!(outcome, RunOutcome::Completed { chapters: 3 });

    // Stage artifacts.
    assert!(store.exists(ARCHITECTURE_FILE));
    for chapter in 1..=3 {
        assert_eq!(
            store.read(&chapter_draft_file(chapter)).unwrap(),
            format!("第{}章正文内容", ["零", "一", "二", "三"][chapter as usize])
        );
        assert!(store.exists(&chapter_summary_file(chapter)));
    }

    // Compaction ran after chapter 2 and snapshotted; chapter 3's
    // finalization then rewrote the live state.
    assert!(store.exists(&character_state_snapshot_file(2)));
    let snapshot = store.read(&character_state_snapshot_file(2)).unwrap();
    assert!(snapshot.contains("压缩后的事件"));
    let live_state = store.read(CHARACTER_STATE_FILE).unwrap();
    assert!(live_state.contains("第3章发生的事件"));

    // Exactly ceil(3 / 2) = 2 blueprint chunk requests.
    assert_eq!(phase2.prompts_matching("继续生成第").len(), 2);

    // Chapter 2's draft prompt embedded the whole chapter 1 text verbatim;
    // chapter 1's draft prompt had no previous-excerpt field at all.
    let draft_prompts = phase2.prompts_matching("请创作这部");
    assert_eq!(draft_prompts.len(), 3);
    assert!(!draft_prompts[0].contains("前一章结尾"));
    assert!(draft_prompts[1].contains("前一章结尾"));
    assert!(draft_prompts[1].contains("第一章正文内容"));
    assert!(draft_prompts[2].contains("第二章正文内容"));
}

#[test]
fn blueprint_crash_after_first_chunk_resumes_at_chapter_three() {
    let dir = tempdir().unwrap();
    let store = ArtifactStore::open(dir.path()).unwrap();
    store.write(ARCHITECTURE_FILE, "小说架构").unwrap();

    let prompts = PromptRegistry::new().unwrap();
    let sink = VecLogSink::new();
    let service = BlueprintService::new(&prompts, &sink).with_max_retries(1);
    let request = BlueprintRequest {
        number_of_chapters: 3,
        chunk_size: 2,
        context_window: 10,
        min_chapters_per_part: 2,
        user_guidance: String::new(),
    };

    // First run: chapters 1-2 succeed, the second chunk dies (empty reply
    // stands in for the process being killed mid-run: the chunk that never
    // returned was never persisted).
    let chunk1 = format!("{}\n\n{}", blueprint_entry(1, "一"), blueprint_entry(2, "二"));
    let first = Arc::new(
        ScriptedModel::new().route("继续生成第", [chunk1.as_str(), ""]),
    );
    let telemetry = Arc::new(MemoryTelemetrySink::new());
    let gateway = Gateway::new(first.clone(), telemetry.clone());
    service.generate(&gateway, &store, &request).unwrap_err();

    let persisted = store.read(BLUEPRINT_FILE).unwrap();
    assert!(persisted.contains("第2章"));
    assert!(!persisted.contains("第3章"));

    // Restart: exactly one request, asking for chapter 3 only, and the
    // persisted chapters 1-2 stay byte-identical.
    let chunk2 = blueprint_entry(3, "三");
    let second = Arc::new(ScriptedModel::new().route("继续生成第", [chunk2.as_str()]));
    let gateway = Gateway::new(second.clone(), telemetry);
    let blueprint = service.generate(&gateway, &store, &request).unwrap();

    assert_eq!(blueprint.len(), 3);
    let requests = second.prompts_matching("继续生成第");
    assert_eq!(requests.len(), 1);
    assert!(requests[0].contains("第3章到第3章"));

    let final_text = store.read(BLUEPRINT_FILE).unwrap();
    assert!(final_text.starts_with(persisted.trim()));
}
