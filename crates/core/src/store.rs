//! File-backed artifact persistence for one pipeline run.
//!
//! Each named artifact is a whole text document under the run's output
//! directory. Presence of an artifact is the resumption signal: a stage
//! that finds its artifact already written reads it back instead of
//! regenerating. Writes replace the whole file; stages only write after
//! the generating call returned non-empty.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CHARACTER_DYNAMICS_FILE: &str = "character_dynamics.txt";
pub const CHARACTER_STATE_FILE: &str = "character_state.txt";
pub const WORLD_BUILDING_FILE: &str = "world_building.txt";
pub const PLOT_CANONICAL_FILE: &str = "plot.txt";
pub const PLOT_COMPARISON_FILE: &str = "plot_comparison.txt";
pub const ARCHITECTURE_FILE: &str = "novel_architecture.txt";
pub const BLUEPRINT_FILE: &str = "novel_directory.txt";
pub const PART_PROGRESS_FILE: &str = "blueprint_part_progress.txt";

pub fn plot_candidate_file(backend: &str) -> String {
    format!("plot_{backend}.txt")
}

pub fn chapter_draft_file(chapter_number: u32) -> String {
    format!("chapters/chapter_{chapter_number}.txt")
}

pub fn chapter_summary_file(chapter_number: u32) -> String {
    format!("summaries/chapter_{chapter_number}_summary.txt")
}

pub fn character_state_snapshot_file(chapter_number: u32) -> String {
    format!("character_state_{chapter_number}.txt")
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to prepare output directory `{path}`: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("artifact `{name}` not found under `{root}`")]
    NotFound { root: PathBuf, name: String },
    #[error("failed to read artifact `{path}`: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write artifact `{path}`: {source}")]
    Write { path: PathBuf, source: io::Error },
}

#[derive(Clone, Debug)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Opens (creating if necessary) the run's output directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StoreError::CreateDir {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_of(name).is_file()
    }

    pub fn read(&self, name: &str) -> Result<String, StoreError> {
        self.read_optional(name)?.ok_or_else(|| StoreError::NotFound {
            root: self.root.clone(),
            name: name.to_string(),
        })
    }

    pub fn read_optional(&self, name: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_of(name);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Read { path, source }),
        }
    }

    /// Reads an artifact, treating absence as an empty document.
    pub fn read_or_default(&self, name: &str) -> Result<String, StoreError> {
        Ok(self.read_optional(name)?.unwrap_or_default())
    }

    /// Overwrites the named artifact, creating parent directories for
    /// nested names such as `chapters/chapter_3.txt`.
    pub fn write(&self, name: &str, content: &str) -> Result<(), StoreError> {
        let path = self.path_of(name);
        if let Some(parent) = path.parent() {
            if parent != self.root {
                fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        fs::write(&path, content).map_err(|source| StoreError::Write { path, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn exists_then_read_round_trip() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path().join("run")).unwrap();

        assert!(!store.exists(CHARACTER_STATE_FILE));
        store.write(CHARACTER_STATE_FILE, "角色一：测试").unwrap();
        assert!(store.exists(CHARACTER_STATE_FILE));
        assert_eq!(store.read(CHARACTER_STATE_FILE).unwrap(), "角色一：测试");
    }

    #[test]
    fn nested_names_create_parent_directories() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();

        let name = chapter_draft_file(7);
        store.write(&name, "第七章正文").unwrap();
        assert!(store.exists(&name));
        assert_eq!(store.read(&name).unwrap(), "第七章正文");
    }

    #[test]
    fn missing_artifact_is_typed_not_empty() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();

        assert!(matches!(
            store.read("nope.txt"),
            Err(StoreError::NotFound { .. })
        ));
        assert_eq!(store.read_optional("nope.txt").unwrap(), None);
        assert_eq!(store.read_or_default("nope.txt").unwrap(), "");
    }

    #[test]
    fn write_replaces_whole_document() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();

        store.write(BLUEPRINT_FILE, "第1章 - 开端").unwrap();
        store.write(BLUEPRINT_FILE, "第1章 - 重写").unwrap();
        assert_eq!(store.read(BLUEPRINT_FILE).unwrap(), "第1章 - 重写");
    }
}
