//! Knowledge-base registry (`knowledge_bases.json`)

use crate::error::{Result, StratumError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const REGISTRY_FILE: &str = "knowledge_bases.json";

/// One registered knowledge base
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub embedding_model_id: Option<String>,
    /// Fields owned by other tools, kept as they are
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RegistryFile {
    Bare(Vec<KnowledgeBase>),
    Wrapped { knowledge_bases: Vec<KnowledgeBase> },
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    kb_dir: PathBuf,
    entries: Vec<KnowledgeBase>,
}

impl Registry {
    pub fn new(kb_dir: impl Into<PathBuf>, entries: Vec<KnowledgeBase>) -> Self {
        Self {
            kb_dir: kb_dir.into(),
            entries,
        }
    }

    /// Read `<registry_dir>/knowledge_bases.json`; a missing file is an empty registry
    pub fn load(registry_dir: &Path, kb_dir: &Path) -> Result<Self> {
        let path = registry_dir.join(REGISTRY_FILE);
        if !path.exists() {
            debug!("No registry at {:?}", path);
            return Ok(Self::new(kb_dir, Vec::new()));
        }

        let data = std::fs::read(&path).map_err(|e| StratumError::Io {
            source: e,
            context: format!("Failed to read registry {:?}", path),
        })?;
        let entries = match serde_json::from_slice(&data).map_err(|e| StratumError::Json {
            source: e,
            context: format!("Failed to parse registry {:?}", path),
        })? {
            RegistryFile::Bare(entries) => entries,
            RegistryFile::Wrapped { knowledge_bases } => knowledge_bases,
        };

        debug!("Loaded {} knowledge bases from {:?}", entries.len(), path);
        Ok(Self::new(kb_dir, entries))
    }

    pub fn get(&self, id: &str) -> Option<&KnowledgeBase> {
        self.entries.iter().find(|kb| kb.id == id)
    }

    pub fn entries(&self) -> &[KnowledgeBase] {
        &self.entries
    }

    /// `<kb_dir>/<name>`
    pub fn kb_root(&self, kb: &KnowledgeBase) -> PathBuf {
        self.kb_dir.join(&kb.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_bare_and_wrapped_forms() {
        let temp = TempDir::new().unwrap();
        let kb_dir = temp.path().join("kbs");

        std::fs::write(
            temp.path().join(REGISTRY_FILE),
            r#"[{"id": "kb1", "name": "complaints", "embedding_model_id": "m1", "owner": "ops"}]"#,
        )
        .unwrap();
        let registry = Registry::load(temp.path(), &kb_dir).unwrap();
        let kb = registry.get("kb1").unwrap();
        assert_eq!(kb.embedding_model_id.as_deref(), Some("m1"));
        assert_eq!(kb.extra["owner"], Value::from("ops"));
        assert_eq!(registry.kb_root(kb), kb_dir.join("complaints"));

        std::fs::write(
            temp.path().join(REGISTRY_FILE),
            r#"{"knowledge_bases": [{"id": "kb2", "name": "notices"}]}"#,
        )
        .unwrap();
        let registry = Registry::load(temp.path(), &kb_dir).unwrap();
        assert!(registry.get("kb1").is_none());
        assert_eq!(registry.get("kb2").unwrap().embedding_model_id, None);
    }

    #[test]
    fn test_missing_and_malformed() {
        let temp = TempDir::new().unwrap();
        assert!(Registry::load(temp.path(), temp.path()).unwrap().entries().is_empty());

        std::fs::write(temp.path().join(REGISTRY_FILE), "{not json").unwrap();
        assert!(matches!(
            Registry::load(temp.path(), temp.path()),
            Err(StratumError::Json { .. })
        ));
    }
}
