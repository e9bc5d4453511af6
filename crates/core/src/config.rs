use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_timeout() -> u64 {
    600
}

fn default_chunk_size() -> u32 {
    25
}

fn default_context_window() -> u32 {
    25
}

fn default_compaction_interval() -> u32 {
    10
}

fn default_min_chapters_per_part() -> u32 {
    10
}

fn default_max_retries() -> usize {
    3
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config `{path}`: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config `{path}`: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("unknown LLM profile `{0}`")]
    UnknownProfile(String),
    #[error("config names no LLM profiles")]
    NoProfiles,
}

/// One named backend: endpoint, model identifier and generation parameters.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LlmProfile {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub interface_format: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl Default for LlmProfile {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: String::new(),
            interface_format: String::new(),
            model_name: String::new(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout: default_timeout(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct NovelSettings {
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub genre: String,
    #[serde(default)]
    pub num_chapters: u32,
    #[serde(default)]
    pub word_number: u32,
    #[serde(default)]
    pub output_dir: String,
    #[serde(default)]
    pub user_guidance: String,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlueprintMode {
    /// Fixed-size chapter chunks with a sliding context window.
    #[default]
    Chunked,
    /// Chunks aligned to the narrative parts of the plot architecture.
    ByParts,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PipelineSettings {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
    /// How many already-written chapters of blueprint text feed the next
    /// chunk request.
    #[serde(default = "default_context_window")]
    pub context_window: u32,
    /// Compact the character-state events every this many chapters;
    /// 0 disables compaction.
    #[serde(default = "default_compaction_interval")]
    pub compaction_interval: u32,
    #[serde(default)]
    pub blueprint_mode: BlueprintMode,
    #[serde(default = "default_min_chapters_per_part")]
    pub min_chapters_per_part: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            context_window: default_context_window(),
            compaction_interval: default_compaction_interval(),
            blueprint_mode: BlueprintMode::default(),
            min_chapters_per_part: default_min_chapters_per_part(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TelemetrySettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// JSONL call-log path; empty means record nowhere (null sink).
    #[serde(default)]
    pub log_path: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            log_path: String::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub llm_profiles: BTreeMap<String, LlmProfile>,
    /// Profile used for every single-backend stage.
    #[serde(default)]
    pub primary_llm: String,
    /// Profiles fanned out for plot-architecture candidates.
    #[serde(default)]
    pub plot_backends: Vec<String>,
    #[serde(default)]
    pub novel: NovelSettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub telemetry: TelemetrySettings,
    #[serde(default)]
    pub prompt_directories: Vec<PathBuf>,
}

impl Config {
    pub fn from_json_str(path: &Path, input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(input).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(path, &data)
    }

    pub fn profile(&self, name: &str) -> Result<&LlmProfile, ConfigError> {
        self.llm_profiles
            .get(name)
            .ok_or_else(|| ConfigError::UnknownProfile(name.to_string()))
    }

    /// The profile for single-backend stages: the configured `primary_llm`
    /// when set, otherwise the first profile by name.
    pub fn primary_profile(&self) -> Result<(&str, &LlmProfile), ConfigError> {
        if !self.primary_llm.is_empty() {
            return Ok((self.primary_llm.as_str(), self.profile(&self.primary_llm)?));
        }
        self.llm_profiles
            .iter()
            .next()
            .map(|(name, profile)| (name.as_str(), profile))
            .ok_or(ConfigError::NoProfiles)
    }

    /// The fan-out roster as (name, profile) pairs; falls back to the
    /// primary profile alone when no roster is configured.
    pub fn plot_roster(&self) -> Result<Vec<(&str, &LlmProfile)>, ConfigError> {
        if self.plot_backends.is_empty() {
            return Ok(vec![self.primary_profile()?]);
        }
        self.plot_backends
            .iter()
            .map(|name| Ok((name.as_str(), self.profile(name)?)))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    config: Config,
}

impl ConfigStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = if path.exists() {
            Config::from_path(&path)?
        } else {
            Config::default()
        };
        Ok(Self { path, config })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let serialized =
            serde_json::to_string_pretty(&self.config).map_err(|source| ConfigError::Parse {
                path: self.path.clone(),
                source,
            })?;
        fs::write(&self.path, serialized).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_json() -> &'static str {
        r#"{
            "llm_profiles": {
                "flash": {
                    "api_key": "k1",
                    "base_url": "https://example.com/v1",
                    "interface_format": "gemini",
                    "model_name": "flash-2",
                    "temperature": 0.6,
                    "max_tokens": 65536,
                    "timeout": 600
                },
                "qwen": {
                    "api_key": "k2",
                    "base_url": "https://example.com/compatible-mode/v1",
                    "interface_format": "qwen",
                    "model_name": "qwen-plus"
                }
            },
            "primary_llm": "flash",
            "plot_backends": ["flash", "qwen"],
            "novel": {
                "topic": "测试主题",
                "genre": "都市言情",
                "num_chapters": 100,
                "word_number": 1100,
                "output_dir": "novel_output"
            },
            "pipeline": {
                "chunk_size": 20,
                "context_window": 30,
                "compaction_interval": 10,
                "blueprint_mode": "chunked"
            }
        }"#
    }

    #[test]
    fn parses_full_document() {
        let config = Config::from_json_str(Path::new("config.json"), sample_json()).unwrap();
        assert_eq!(config.llm_profiles.len(), 2);
        assert_eq!(config.primary_profile().unwrap().0, "flash");
        assert_eq!(config.plot_roster().unwrap().len(), 2);
        assert_eq!(config.pipeline.context_window, 30);
        assert_eq!(config.pipeline.max_retries, 3);
        assert!(config.telemetry.enabled);
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let config = Config::from_json_str(
            Path::new("config.json"),
            r#"{"llm_profiles": {"only": {"model_name": "m"}}}"#,
        )
        .unwrap();

        let (name, profile) = config.primary_profile().unwrap();
        assert_eq!(name, "only");
        assert_eq!(profile.max_tokens, 8192);
        assert_eq!(config.pipeline.compaction_interval, 10);
        // With no roster configured the fan-out degenerates to the primary.
        assert_eq!(config.plot_roster().unwrap().len(), 1);
    }

    #[test]
    fn unknown_roster_entry_is_an_error() {
        let config = Config::from_json_str(
            Path::new("config.json"),
            r#"{
                "llm_profiles": {"a": {"model_name": "m"}},
                "plot_backends": ["a", "missing"]
            }"#,
        )
        .unwrap();

        assert!(matches!(
            config.plot_roster(),
            Err(ConfigError::UnknownProfile(name)) if name == "missing"
        ));
    }

    #[test]
    fn store_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut store = ConfigStore::open(&path).unwrap();
        store
            .config_mut()
            .llm_profiles
            .insert("flash".into(), LlmProfile::default());
        store.config_mut().primary_llm = "flash".into();
        store.save().unwrap();

        let reopened = ConfigStore::open(&path).unwrap();
        assert_eq!(reopened.config().primary_llm, "flash");
    }
}
