//! Prompt template registry.
//!
//! Templates live in TOML documents: a built-in set compiled into the
//! binary, optionally overridden by documents from custom directories
//! (later directories win, file order within a directory is lexical).
//! Rendering substitutes `{name}` placeholders and fails on a missing
//! required argument instead of silently emitting a hole.

use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const BUILT_IN_PROMPTS: &str = include_str!("../prompts/default.toml");

pub type PromptArguments = HashMap<String, String>;

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("prompt `{0}` not found")]
    NotFound(String),
    #[error("missing argument `{argument}` when rendering prompt `{key}`")]
    MissingArgument { key: String, argument: String },
    #[error("failed to read prompt file `{path}`: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse built-in prompt definitions: {0}")]
    ParseBuiltIn(toml::de::Error),
    #[error("failed to parse prompt file `{path}`: {source}")]
    ParseFile {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Clone, Debug)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

#[derive(Clone, Debug)]
pub struct PromptTemplate {
    key: String,
    segments: Vec<Segment>,
    placeholders: BTreeSet<String>,
}

impl PromptTemplate {
    fn parse(key: String, template: &str) -> Self {
        let mut segments = Vec::new();
        let mut placeholders = BTreeSet::new();
        let mut literal = String::new();
        let mut chars = template.chars().peekable();

        while let Some(ch) = chars.next() {
            match ch {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for next in chars.by_ref() {
                        if next == '}' {
                            closed = true;
                            break;
                        }
                        name.push(next);
                    }
                    let trimmed = name.trim();
                    if closed && !trimmed.is_empty() {
                        if !literal.is_empty() {
                            segments.push(Segment::Literal(std::mem::take(&mut literal)));
                        }
                        placeholders.insert(trimmed.to_string());
                        segments.push(Segment::Placeholder(trimmed.to_string()));
                    } else {
                        // Unterminated or empty braces stay literal text.
                        literal.push('{');
                        literal.push_str(&name);
                        if closed {
                            literal.push('}');
                        }
                    }
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Self {
            key,
            segments,
            placeholders,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.placeholders.iter().map(|s| s.as_str())
    }

    pub fn render(&self, arguments: &PromptArguments) -> Result<String, PromptError> {
        for placeholder in &self.placeholders {
            if !arguments.contains_key(placeholder) {
                return Err(PromptError::MissingArgument {
                    key: self.key.clone(),
                    argument: placeholder.clone(),
                });
            }
        }

        let mut output = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => output.push_str(text),
                Segment::Placeholder(name) => {
                    if let Some(value) = arguments.get(name) {
                        output.push_str(value);
                    }
                }
            }
        }
        Ok(output)
    }
}

#[derive(Debug, Deserialize)]
struct PromptDocument {
    #[serde(default)]
    prompts: BTreeMap<String, RawPrompt>,
}

#[derive(Debug, Deserialize)]
struct RawPrompt {
    #[serde(alias = "text")]
    template: String,
}

#[derive(Debug)]
pub struct PromptRegistry {
    prompts: BTreeMap<String, PromptTemplate>,
    directories: Vec<PathBuf>,
}

impl PromptRegistry {
    pub fn new() -> Result<Self, PromptError> {
        Self::with_directories(Vec::new())
    }

    pub fn with_directories(directories: Vec<PathBuf>) -> Result<Self, PromptError> {
        let mut registry = Self {
            prompts: BTreeMap::new(),
            directories,
        };
        registry.reload()?;
        Ok(registry)
    }

    pub fn reload(&mut self) -> Result<(), PromptError> {
        let mut prompts = BTreeMap::new();

        let document: PromptDocument =
            toml::from_str(BUILT_IN_PROMPTS).map_err(PromptError::ParseBuiltIn)?;
        insert_document(&mut prompts, document);

        for dir in &self.directories {
            load_directory(dir, &mut prompts)?;
        }

        self.prompts = prompts;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&PromptTemplate> {
        self.prompts.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.prompts.keys().map(|k| k.as_str())
    }

    pub fn format(&self, key: &str, args: &PromptArguments) -> Result<String, PromptError> {
        self.get(key)
            .ok_or_else(|| PromptError::NotFound(key.to_string()))?
            .render(args)
    }

    pub fn format_with<I, K, V>(&self, key: &str, arguments: I) -> Result<String, PromptError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut args = PromptArguments::new();
        for (k, v) in arguments {
            args.insert(k.into(), v.into());
        }
        self.format(key, &args)
    }
}

fn insert_document(prompts: &mut BTreeMap<String, PromptTemplate>, document: PromptDocument) {
    for (key, raw) in document.prompts {
        let template = PromptTemplate::parse(key.clone(), &raw.template);
        prompts.insert(key, template);
    }
}

fn load_directory(
    dir: &Path,
    prompts: &mut BTreeMap<String, PromptTemplate>,
) -> Result<(), PromptError> {
    if !dir.is_dir() {
        return Ok(());
    }

    let mut files = Vec::new();
    let entries = fs::read_dir(dir).map_err(|source| PromptError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| PromptError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("toml") && path.is_file() {
            files.push(path);
        }
    }
    files.sort();

    for path in files {
        let contents = fs::read_to_string(&path).map_err(|source| PromptError::Io {
            path: path.clone(),
            source,
        })?;
        let document: PromptDocument =
            toml::from_str(&contents).map_err(|source| PromptError::ParseFile {
                path: path.clone(),
                source,
            })?;
        insert_document(prompts, document);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn built_in_document_loads_every_pipeline_key() {
        let registry = PromptRegistry::new().expect("registry");
        for key in [
            "character_dynamics",
            "create_character_state",
            "world_building",
            "plot_architecture",
            "chapter_blueprint",
            "chunked_chapter_blueprint",
            "part_chapter_blueprint",
            "summarize_recent_chapters",
            "first_chapter_draft",
            "next_chapter_draft",
            "chapter_summary",
            "update_character_state",
            "compress_character_events",
            "enrich_chapter",
        ] {
            assert!(registry.get(key).is_some(), "missing prompt `{key}`");
        }
    }

    #[test]
    fn renders_with_substitution() {
        let registry = PromptRegistry::new().expect("registry");
        let output = registry
            .format_with(
                "create_character_state",
                [("character_dynamics", "角色甲与角色乙")],
            )
            .expect("rendered");
        assert!(output.contains("角色甲与角色乙"));
        assert!(output.contains("[触发或加深的事件]"));
    }

    #[test]
    fn missing_argument_is_an_error() {
        let registry = PromptRegistry::new().expect("registry");
        let error = registry
            .format("character_dynamics", &PromptArguments::new())
            .expect_err("must fail");
        assert!(matches!(error, PromptError::MissingArgument { .. }));
    }

    #[test]
    fn escaped_braces_stay_literal() {
        let template = PromptTemplate::parse("t".into(), "保留{{字面}}与{value}");
        let mut args = PromptArguments::new();
        args.insert("value".into(), "插值".into());
        assert_eq!(template.render(&args).unwrap(), "保留{字面}与插值");
    }

    #[test]
    fn custom_directory_overrides_built_in() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("override.toml"),
            "[prompts.character_dynamics]\ntemplate = \"定制：{topic}{user_guidance}\"\n",
        )
        .unwrap();

        let registry = PromptRegistry::with_directories(vec![dir.path().to_path_buf()]).unwrap();
        let output = registry
            .format_with(
                "character_dynamics",
                [("topic", "悬疑"), ("user_guidance", "")],
            )
            .unwrap();
        assert_eq!(output, "定制：悬疑");
    }
}
