//! Periodic character-state compaction.
//!
//! The `[触发或加深的事件]` section of every character grows with each
//! finalized chapter. Every K chapters those events are extracted,
//! compressed by the model into fewer, denser bullets, and spliced back
//! in place. All other sections — `[性格]`, `[背景与外貌]`,
//! `[主要角色间关系网]` and the trailing 新出场角色 section — are copied
//! through untouched, and a character the reply names but the document
//! lacks is skipped with a warning rather than risking a bad splice.

use crate::gateway::{invoke_with_cleaning, Gateway, LanguageModelError};
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::prompts::{PromptError, PromptRegistry};
use crate::store::{character_state_snapshot_file, ArtifactStore, StoreError, CHARACTER_STATE_FILE};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use thiserror::Error;

const EVENTS_HEADING: &str = "[触发或加深的事件]";
const NEW_CHARACTERS_HEADING: &str = "新出场角色：";

#[derive(Debug, Error)]
pub enum CompactionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("character state document is empty; nothing to compact")]
    EmptyState,
    #[error("no character events found in the state document")]
    NoEvents,
    #[error("failed to render compaction prompt: {0}")]
    Prompt(#[from] PromptError),
    #[error("language model invocation failed during compaction: {0}")]
    Model(#[from] LanguageModelError),
}

/// One character's heading plus its current events bullets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CharacterEvents {
    pub heading: String,
    pub name: String,
    pub events: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct CompactionOutcome {
    pub chapter_number: u32,
    pub updated_characters: Vec<String>,
    pub skipped_characters: Vec<String>,
    pub snapshot_artifact: String,
}

pub struct CompactionService<'a> {
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
    max_retries: usize,
}

impl<'a> CompactionService<'a> {
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

    pub fn compact(
        &self,
        gateway: &Gateway,
        store: &ArtifactStore,
        chapter_number: u32,
    ) -> Result<CompactionOutcome, CompactionError> {
        let original = store.read(CHARACTER_STATE_FILE)?;
        if original.trim().is_empty() {
            return Err(CompactionError::EmptyState);
        }

        let extracted = extract_character_events(&original);
        if extracted.is_empty() {
            return Err(CompactionError::NoEvents);
        }

        let combined = render_events(&extracted);
        let prompt = self
            .prompts
            .format_with("compress_character_events", [("character_events", combined)])?;

        self.log(
            chapter_number,
            LogLevel::Info,
            format!("开始压缩{}个角色的事件记录...", extracted.len()),
        );
        let response =
            invoke_with_cleaning(gateway, "总结角色状态", &prompt, self.max_retries, self.sink)?;

        // A failed compression keeps the document as it is; the snapshot
        // is still taken so cadence stays aligned with chapter numbers.
        let (updated_content, updated, skipped) = if response.is_empty() {
            self.log(
                chapter_number,
                LogLevel::Warn,
                "事件压缩返回为空，保留原始角色状态。",
            );
            (original.clone(), Vec::new(), Vec::new())
        } else {
            let replacements = extract_character_events(&response);
            splice_events(&original, &replacements, self.sink)
        };

        store.write(CHARACTER_STATE_FILE, &updated_content)?;
        let snapshot_artifact = character_state_snapshot_file(chapter_number);
        store.write(&snapshot_artifact, &updated_content)?;
        self.log(
            chapter_number,
            LogLevel::Info,
            format!(
                "角色状态压缩完成：更新{}个角色，跳过{}个，备份至 {snapshot_artifact}。",
                updated.len(),
                skipped.len()
            ),
        );

        Ok(CompactionOutcome {
            chapter_number,
            updated_characters: updated,
            skipped_characters: skipped,
            snapshot_artifact,
        })
    }

    fn log(&self, chapter_number: u32, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::scoped(
            level,
            format!("第{chapter_number}章状态压缩"),
            message,
        ));
    }
}

/// Pulls every character's `heading + events` pair out of the state text,
/// ignoring everything from the 新出场角色 section on.
pub fn extract_character_events(text: &str) -> Vec<CharacterEvents> {
    let scope = match text.find(NEW_CHARACTERS_HEADING) {
        Some(index) => &text[..index],
        None => text,
    };

    let mut blocks = Vec::new();
    let mut current: Option<CharacterEvents> = None;
    let mut in_events = false;

    for line in scope.lines() {
        let trimmed = line.trim();
        if character_heading_regex().is_match(trimmed) {
            if let Some(block) = current.take() {
                if !block.events.is_empty() {
                    blocks.push(block);
                }
            }
            current = character_name(trimmed).map(|name| CharacterEvents {
                heading: trimmed.to_string(),
                name,
                events: Vec::new(),
            });
            in_events = false;
            continue;
        }

        if trimmed == EVENTS_HEADING {
            in_events = current.is_some();
            continue;
        }
        if trimmed.starts_with('[') {
            in_events = false;
            continue;
        }
        if in_events && !trimmed.is_empty() {
            if let Some(block) = current.as_mut() {
                block.events.push(trimmed.to_string());
            }
        }
    }
    if let Some(block) = current.take() {
        if !block.events.is_empty() {
            blocks.push(block);
        }
    }

    blocks
}

/// Replaces each named character's events section with its replacement,
/// copying every other line through verbatim. Returns the new document
/// plus the names updated and the replacement names that matched nothing.
pub fn splice_events(
    original: &str,
    replacements: &[CharacterEvents],
    sink: &dyn LogSink,
) -> (String, Vec<String>, Vec<String>) {
    let by_name: BTreeMap<&str, &CharacterEvents> = replacements
        .iter()
        .map(|block| (block.name.as_str(), block))
        .collect();

    let mut output: Vec<String> = Vec::new();
    let mut updated: Vec<String> = Vec::new();
    let mut current_replacement: Option<&CharacterEvents> = None;
    let mut skipping_events = false;
    let mut past_new_characters = false;

    for line in original.lines() {
        let trimmed = line.trim();

        if !past_new_characters && trimmed.starts_with(NEW_CHARACTERS_HEADING) {
            past_new_characters = true;
        }

        if past_new_characters {
            output.push(line.to_string());
            continue;
        }

        if character_heading_regex().is_match(trimmed) {
            skipping_events = false;
            current_replacement = character_name(trimmed)
                .and_then(|name| by_name.get(name.as_str()).copied());
            output.push(line.to_string());
            continue;
        }

        if trimmed == EVENTS_HEADING {
            output.push(line.to_string());
            if let Some(replacement) = current_replacement {
                for event in &replacement.events {
                    output.push(event.clone());
                }
                updated.push(replacement.name.clone());
                skipping_events = true;
            }
            continue;
        }

        if skipping_events {
            // Drop the old bullets; anything else ends the events run.
            if trimmed.starts_with('-') {
                continue;
            }
            skipping_events = false;
        }

        output.push(line.to_string());
    }

    let skipped: Vec<String> = replacements
        .iter()
        .filter(|block| !updated.contains(&block.name))
        .map(|block| block.name.clone())
        .collect();
    for name in &skipped {
        sink.log(LogRecord::new(
            LogLevel::Warn,
            format!("未能在角色状态中找到角色“{name}”，该角色保持原样。"),
        ));
    }

    (output.join("\n"), updated, skipped)
}

fn render_events(blocks: &[CharacterEvents]) -> String {
    blocks
        .iter()
        .map(|block| {
            let mut section = format!("{}\n{EVENTS_HEADING}", block.heading);
            for event in &block.events {
                section.push('\n');
                section.push_str(event);
            }
            section
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn character_name(heading: &str) -> Option<String> {
    heading
        .split_once('：')
        .map(|(_, name)| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

fn character_heading_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^角色[一二三四五六七八九十百\d]+：").expect("invalid character heading regex")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::{mock_gateway, MockLanguageModel};
    use crate::logging::{NullLogSink, VecLogSink};
    use tempfile::tempdir;

    fn sample_state() -> &'static str {
        "角色一：顾清霜\n\
         [性格]\n\
         - 事业心极强，理性、情感表达内敛。\n\
         [背景与外貌]\n\
         - 出身法律世家，29岁。\n\
         [主要角色间关系网]\n\
         - 陆衍：从雇佣到相爱。\n\
         [触发或加深的事件]\n\
         - 在催婚压力下感到绝望。\n\
         - 与陆衍签订雇佣协议。\n\
         - 面对家族重压最终妥协。\n\
         \n\
         角色二：陆衍\n\
         [性格]\n\
         - 表面温和，带神秘感。\n\
         [背景与外貌]\n\
         - 咖啡店服务员，实为继承人。\n\
         [主要角色间关系网]\n\
         - 顾清霜：彼此的救赎。\n\
         [触发或加深的事件]\n\
         - 观察顾清霜多时。\n\
         - 谈判中捍卫十五倍酬金。\n\
         \n\
         新出场角色：\n\
         - 小李：顾清霜的助理。\n\
         - 沈佳宜：顾清霜的闺蜜。"
    }

    #[test]
    fn extraction_takes_only_events_before_new_characters() {
        let blocks = extract_character_events(sample_state());
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].name, "顾清霜");
        assert_eq!(blocks[0].events.len(), 3);
        assert_eq!(blocks[1].name, "陆衍");
        assert_eq!(blocks[1].events.len(), 2);

        let rendered = render_events(&blocks);
        assert!(!rendered.contains("[性格]"));
        assert!(!rendered.contains("小李"));
        assert!(rendered.contains("角色二：陆衍"));
    }

    #[test]
    fn splice_replaces_events_and_preserves_everything_else() {
        let replacements = vec![
            CharacterEvents {
                heading: "角色一：顾清霜".into(),
                name: "顾清霜".into(),
                events: vec!["- 压缩后的事件甲。".into()],
            },
            CharacterEvents {
                heading: "角色二：陆衍".into(),
                name: "陆衍".into(),
                events: vec!["- 压缩后的事件乙。".into()],
            },
        ];

        let (updated, names, skipped) = splice_events(sample_state(), &replacements, &NullLogSink);
        assert_eq!(names, vec!["顾清霜".to_string(), "陆衍".to_string()]);
        assert!(skipped.is_empty());

        assert!(updated.contains("- 压缩后的事件甲。"));
        assert!(updated.contains("- 压缩后的事件乙。"));
        assert!(!updated.contains("在催婚压力下感到绝望"));
        assert!(!updated.contains("捍卫十五倍酬金"));

        // Non-events sections are byte-identical, the trailing section too.
        for preserved in [
            "[性格]",
            "- 事业心极强，理性、情感表达内敛。",
            "[背景与外貌]",
            "- 咖啡店服务员，实为继承人。",
            "[主要角色间关系网]",
            "新出场角色：",
            "- 小李：顾清霜的助理。",
        ] {
            assert!(updated.contains(preserved), "lost `{preserved}`");
        }

        // Events still lead with the dash-bullet shape.
        let events_index = updated.find("[触发或加深的事件]").unwrap();
        let after = &updated[events_index..];
        assert!(after.lines().nth(1).unwrap().trim().starts_with('-'));
    }

    #[test]
    fn unknown_character_is_skipped_with_a_warning() {
        let replacements = vec![CharacterEvents {
            heading: "角色三：不存在".into(),
            name: "不存在".into(),
            events: vec!["- 不应出现。".into()],
        }];

        let sink = VecLogSink::new();
        let (updated, names, skipped) = splice_events(sample_state(), &replacements, &sink);
        assert!(names.is_empty());
        assert_eq!(skipped, vec!["不存在".to_string()]);
        assert!(sink.contains("不存在"));

        // Original events untouched when nothing matched.
        assert!(updated.contains("在催婚压力下感到绝望"));
        assert!(!updated.contains("不应出现"));
    }

    #[test]
    fn compact_round_trip_updates_state_and_writes_snapshot() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        store.write(CHARACTER_STATE_FILE, sample_state()).unwrap();

        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let service = CompactionService::new(&prompts, &sink).with_max_retries(1);

        let reply = "角色一：顾清霜\n[触发或加深的事件]\n- 压缩后的顾清霜事件。\n\n\
                     角色二：陆衍\n[触发或加深的事件]\n- 压缩后的陆衍事件。";
        let gateway = mock_gateway(MockLanguageModel::new([reply]));

        let outcome = service.compact(&gateway, &store, 10).unwrap();
        assert_eq!(outcome.updated_characters.len(), 2);
        assert!(outcome.skipped_characters.is_empty());

        let live = store.read(CHARACTER_STATE_FILE).unwrap();
        assert!(live.contains("压缩后的顾清霜事件"));
        assert!(live.contains("[性格]"));

        let snapshot = store.read(&character_state_snapshot_file(10)).unwrap();
        assert_eq!(snapshot, live);
    }

    #[test]
    fn empty_compression_keeps_document_and_still_snapshots() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        store.write(CHARACTER_STATE_FILE, sample_state()).unwrap();

        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let service = CompactionService::new(&prompts, &sink).with_max_retries(1);
        let gateway = mock_gateway(MockLanguageModel::new([""]));

        let outcome = service.compact(&gateway, &store, 10).unwrap();
        assert!(outcome.updated_characters.is_empty());
        assert_eq!(store.read(CHARACTER_STATE_FILE).unwrap(), sample_state());
        assert!(store.exists(&character_state_snapshot_file(10)));
    }

    #[test]
    fn state_without_events_is_an_error() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        store
            .write(CHARACTER_STATE_FILE, "角色一：某人\n[性格]\n- 温和。")
            .unwrap();

        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let service = CompactionService::new(&prompts, &sink);
        let gateway = mock_gateway(MockLanguageModel::new(Vec::<String>::new()));

        let err = service.compact(&gateway, &store, 10).unwrap_err();
        assert!(matches!(err, CompactionError::NoEvents));
    }
}
