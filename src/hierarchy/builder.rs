//! Two-level index: one summary per merged group over the chunk index

use super::merge::merge_similar_groups;
use super::summary::SummaryBuilder;
use crate::config::{HierarchyConfig, IndexingConfig};
use crate::document::{group_by_source, scoped_id, Fragment};
use crate::embedding::{
    backup_path, write_with_backup, EmbeddingProvider, VectorIndex, VectorIndexError,
};
use crate::entities::KeywordExtractor;
use crate::error::{Result, StratumError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const FLAT_INDEX_DIR: &str = "vector_store";
pub const HIERARCHICAL_DIR: &str = "hierarchical_vector_store";
pub const SUMMARY_INDEX_DIR: &str = "summary_vector_store";
pub const CHUNK_INDEX_DIR: &str = "chunk_vector_store";
pub const GROUPS_FILE: &str = "groups.json";

/// Paths of a knowledge base's index directories
pub fn flat_index_dir(kb_root: &Path) -> PathBuf {
    kb_root.join(FLAT_INDEX_DIR)
}

pub fn hierarchical_dir(kb_root: &Path) -> PathBuf {
    kb_root.join(HIERARCHICAL_DIR)
}

/// Contribution list of one merged group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupEntry {
    pub group_id: String,
    pub sources: Vec<String>,
    pub fragment_ids: Vec<String>,
}

/// Group id <-> fragment id mappings
#[derive(Debug, Clone, Default)]
pub struct GroupMapping {
    entries: Vec<GroupEntry>,
    fragment_to_group: HashMap<String, String>,
}

impl GroupMapping {
    pub fn new(entries: Vec<GroupEntry>) -> Self {
        let mut mapping = Self::default();
        mapping.extend(entries);
        mapping
    }

    fn extend(&mut self, entries: Vec<GroupEntry>) {
        for entry in &entries {
            for id in &entry.fragment_ids {
                self.fragment_to_group
                    .entry(id.clone())
                    .or_insert_with(|| entry.group_id.clone());
            }
        }
        self.entries.extend(entries);
    }

    /// Rebuild the mapping from summary fragment metadata
    pub fn from_summaries(summaries: &[Fragment]) -> Self {
        let strings = |f: &Fragment, key: &str| -> Vec<String> {
            f.metadata
                .get(key)
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default()
        };

        Self::new(
            summaries
                .iter()
                .map(|f| GroupEntry {
                    group_id: f.fragment_id.clone(),
                    sources: strings(f, "sources"),
                    fragment_ids: strings(f, "fragment_ids"),
                })
                .collect(),
        )
    }

    pub fn group_of(&self, fragment_id: &str) -> Option<&str> {
        self.fragment_to_group.get(fragment_id).map(String::as_str)
    }

    pub fn fragments_of(&self, group_id: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|e| e.group_id == group_id)
            .map(|e| e.fragment_ids.as_slice())
    }

    pub fn entries(&self) -> &[GroupEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Summary index, chunk index and their group mapping
#[derive(Clone)]
pub struct HierarchicalIndex {
    pub summaries: VectorIndex,
    pub chunks: VectorIndex,
    pub groups: GroupMapping,
}

impl HierarchicalIndex {
    pub fn exists(kb_root: &Path) -> bool {
        let dir = hierarchical_dir(kb_root);
        VectorIndex::exists(&dir.join(SUMMARY_INDEX_DIR))
            && VectorIndex::exists(&dir.join(CHUNK_INDEX_DIR))
    }

    /// Write both indices and `groups.json` under `<kb_root>/hierarchical_vector_store`
    pub fn save(&self, kb_root: &Path) -> Result<()> {
        let dir = hierarchical_dir(kb_root);
        self.summaries.save(&dir.join(SUMMARY_INDEX_DIR))?;
        self.chunks.save(&dir.join(CHUNK_INDEX_DIR))?;

        let groups = serde_json::to_vec_pretty(self.groups.entries()).map_err(|e| {
            StratumError::Json {
                source: e,
                context: "Failed to serialize group mapping".to_string(),
            }
        })?;
        write_with_backup(&dir.join(GROUPS_FILE), &groups).map_err(|e| StratumError::Io {
            source: e,
            context: format!("Failed to write {:?}", dir.join(GROUPS_FILE)),
        })?;

        info!(
            "Saved hierarchical index ({} summaries, {} chunks) to {:?}",
            self.summaries.len(),
            self.chunks.len(),
            dir
        );
        Ok(())
    }

    /// Load a saved index, retrying each part from its safe copy
    pub fn load(kb_root: &Path, options: &IndexingConfig) -> Result<Self> {
        let dir = hierarchical_dir(kb_root);
        let summaries = VectorIndex::load_with_backup(&dir.join(SUMMARY_INDEX_DIR), options)?;
        let chunks = VectorIndex::load_with_backup(&dir.join(CHUNK_INDEX_DIR), options)?;

        if summaries.dimension() != chunks.dimension() {
            return Err(StratumError::index_corrupt(
                dir,
                format!(
                    "summary dimension {} differs from chunk dimension {}",
                    summaries.dimension(),
                    chunks.dimension()
                ),
            ));
        }

        let groups = match load_groups(&dir.join(GROUPS_FILE)) {
            Some(entries) => GroupMapping::new(entries),
            None => {
                warn!("Group mapping unavailable in {:?}, deriving from summaries", dir);
                GroupMapping::from_summaries(summaries.fragments())
            }
        };

        Ok(Self {
            summaries,
            chunks,
            groups,
        })
    }

    /// Combine indices of several knowledge bases
    pub fn merge(self, other: HierarchicalIndex) -> Result<Self> {
        let summaries = self.summaries.merge(other.summaries)?;
        let chunks = self.chunks.merge(other.chunks)?;
        let mut groups = self.groups;
        groups.extend(other.groups.entries);
        Ok(Self {
            summaries,
            chunks,
            groups,
        })
    }

    pub fn dimension(&self) -> usize {
        self.chunks.dimension()
    }

    /// Prefix every fragment and group id with `<scope>:`
    ///
    /// Knowledge bases searched together may hold sources with equal paths;
    /// scoping keeps their ids apart once the indices are merged.
    pub fn scoped(self, scope: &str) -> Self {
        let prefix = |id: &str| scoped_id(scope, id);
        let chunks = self.chunks.scoped(scope);

        let mut summaries = self.summaries;
        for summary in summaries.fragments_mut() {
            summary.fragment_id = prefix(&summary.fragment_id);
            if let Some(Value::String(group)) = summary.metadata.get_mut("group_id") {
                *group = prefix(group);
            }
            if let Some(Value::Array(ids)) = summary.metadata.get_mut("fragment_ids") {
                for id in ids.iter_mut() {
                    if let Value::String(id) = id {
                        *id = prefix(id);
                    }
                }
            }
        }

        let groups = GroupMapping::new(
            self.groups
                .entries
                .into_iter()
                .map(|entry| GroupEntry {
                    group_id: prefix(&entry.group_id),
                    sources: entry.sources,
                    fragment_ids: entry.fragment_ids.iter().map(|id| prefix(id)).collect(),
                })
                .collect(),
        );

        Self {
            summaries,
            chunks,
            groups,
        }
    }
}

fn load_groups(path: &Path) -> Option<Vec<GroupEntry>> {
    let parse = |p: &Path| -> Option<Vec<GroupEntry>> {
        let data = std::fs::read(p).ok()?;
        serde_json::from_slice(&data).ok()
    };
    parse(path).or_else(|| parse(&backup_path(path)))
}

/// Builds a [`HierarchicalIndex`] from chunk fragments
pub struct HierarchicalIndexBuilder<'a> {
    extractor: &'a KeywordExtractor,
    hierarchy: &'a HierarchyConfig,
    indexing: &'a IndexingConfig,
}

impl<'a> HierarchicalIndexBuilder<'a> {
    pub fn new(
        extractor: &'a KeywordExtractor,
        hierarchy: &'a HierarchyConfig,
        indexing: &'a IndexingConfig,
    ) -> Self {
        Self {
            extractor,
            hierarchy,
            indexing,
        }
    }

    /// Embed `fragments` into a chunk index and build the summaries over it
    pub fn build(
        &self,
        kb: &str,
        fragments: Vec<Fragment>,
        provider: &dyn EmbeddingProvider,
    ) -> Result<HierarchicalIndex> {
        if fragments.is_empty() {
            return Err(StratumError::EmptyCorpus { kb: kb.to_string() });
        }
        let chunks = VectorIndex::build(fragments, provider, self.indexing)?;
        self.build_over(kb, chunks, provider)
    }

    /// Build summaries over an already embedded flat index, reusing its vectors
    pub fn build_from_flat(
        &self,
        kb: &str,
        flat: &VectorIndex,
        provider: &dyn EmbeddingProvider,
    ) -> Result<HierarchicalIndex> {
        if flat.is_empty() {
            return Err(StratumError::EmptyCorpus { kb: kb.to_string() });
        }
        if flat.dimension() != provider.dimension() {
            return Err(VectorIndexError::InvalidDimension {
                expected: flat.dimension(),
                actual: provider.dimension(),
            }
            .into());
        }
        self.build_over(kb, flat.clone(), provider)
    }

    fn build_over(
        &self,
        kb: &str,
        chunks: VectorIndex,
        provider: &dyn EmbeddingProvider,
    ) -> Result<HierarchicalIndex> {
        let groups = group_by_source(chunks.fragments());
        let group_count = groups.len();
        let merged = merge_similar_groups(groups, self.hierarchy, self.extractor);

        let summary_builder = SummaryBuilder::new(self.hierarchy, self.extractor);
        let summary_docs: Vec<_> = merged.iter().map(|g| summary_builder.summarize(g)).collect();

        let mapping = GroupMapping::new(
            summary_docs
                .iter()
                .map(|s| GroupEntry {
                    group_id: s.group_id.clone(),
                    sources: s.sources.clone(),
                    fragment_ids: s.fragment_ids.clone(),
                })
                .collect(),
        );

        let summary_fragments = summary_docs.iter().map(|s| s.to_fragment()).collect();
        let summaries = VectorIndex::build(summary_fragments, provider, self.indexing)?;

        info!(
            "Built hierarchical index for '{}': {} fragments, {} source groups, {} merged groups",
            kb,
            chunks.len(),
            group_count,
            mapping.len()
        );

        Ok(HierarchicalIndex {
            summaries,
            chunks,
            groups: mapping,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::test_support::fragment;
    use crate::embedding::HashEmbeddingProvider;
    use crate::entities::Lexicon;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn corpus() -> Vec<Fragment> {
        vec![
            fragment("complaints.csv", 1, "张女士投诉物业噪音扰民"),
            fragment("complaints.csv", 2, "李先生反映停车收费不合理"),
            fragment("notice.txt", 1, "关于开展安全检查的通知"),
            fragment("notice(修订版).txt", 1, "关于开展安全检查的通知，以此为准"),
            fragment("prices.csv", 1, "某餐厅价格欺诈被举报"),
        ]
    }

    fn build(fragments: Vec<Fragment>) -> Result<HierarchicalIndex> {
        let extractor = KeywordExtractor::new(Arc::new(Lexicon::builtin().unwrap()));
        let hierarchy = HierarchyConfig::default();
        let indexing = IndexingConfig::default();
        let provider = HashEmbeddingProvider::new(64);
        HierarchicalIndexBuilder::new(&extractor, &hierarchy, &indexing).build(
            "kb",
            fragments,
            &provider,
        )
    }

    #[test]
    fn test_empty_corpus() {
        assert!(matches!(build(Vec::new()), Err(StratumError::EmptyCorpus { .. })));
    }

    #[test]
    fn test_every_fragment_is_covered_once() {
        let fragments = corpus();
        let index = build(fragments.clone()).unwrap();

        assert_eq!(index.summaries.len(), 3);
        assert_eq!(index.chunks.len(), fragments.len());

        let mut covered = HashSet::new();
        for summary in index.summaries.fragments() {
            let ids = summary.metadata["fragment_ids"].as_array().unwrap();
            for id in ids {
                assert!(covered.insert(id.as_str().unwrap().to_string()));
            }
        }
        let all: HashSet<String> = fragments.iter().map(|f| f.fragment_id.clone()).collect();
        assert_eq!(covered, all);

        assert_eq!(index.groups.group_of("complaints.csv_row_1"), Some("complaints.csv"));
        assert_eq!(
            index.groups.group_of("notice.txt_row_1"),
            index.groups.group_of("notice(修订版).txt_row_1")
        );
    }

    #[test]
    fn test_build_is_deterministic() {
        let a = build(corpus()).unwrap();
        let b = build(corpus()).unwrap();
        let contents = |i: &HierarchicalIndex| {
            i.summaries
                .fragments()
                .iter()
                .map(|f| (f.fragment_id.clone(), f.content.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(contents(&a), contents(&b));
    }

    #[test]
    fn test_save_and_load_round_trip_layout() {
        let temp = TempDir::new().unwrap();
        let index = build(corpus()).unwrap();
        index.save(temp.path()).unwrap();

        let dir = temp.path().join(HIERARCHICAL_DIR);
        assert!(dir.join(SUMMARY_INDEX_DIR).join("index.bin").is_file());
        assert!(dir.join(CHUNK_INDEX_DIR).join("docstore.json").is_file());
        assert!(dir.join(GROUPS_FILE).is_file());
        assert!(HierarchicalIndex::exists(temp.path()));

        let loaded = HierarchicalIndex::load(temp.path(), &IndexingConfig::default()).unwrap();
        assert_eq!(loaded.summaries.len(), 3);
        assert_eq!(loaded.groups.entries(), index.groups.entries());
    }

    #[test]
    fn test_missing_group_file_is_derived_from_summaries() {
        let temp = TempDir::new().unwrap();
        let index = build(corpus()).unwrap();
        index.save(temp.path()).unwrap();
        std::fs::remove_file(temp.path().join(HIERARCHICAL_DIR).join(GROUPS_FILE)).unwrap();

        let loaded = HierarchicalIndex::load(temp.path(), &IndexingConfig::default()).unwrap();
        assert_eq!(loaded.groups.entries(), index.groups.entries());
    }

    #[test]
    fn test_missing_index_is_corrupt() {
        let temp = TempDir::new().unwrap();
        assert!(matches!(
            HierarchicalIndex::load(temp.path(), &IndexingConfig::default()),
            Err(StratumError::IndexCorrupt { .. })
        ));
    }

    #[test]
    fn test_scoped_indices_keep_equal_sources_apart() {
        let kb1 = build(corpus()).unwrap().scoped("kb1");
        let kb2 = build(corpus()).unwrap().scoped("kb2");
        let merged = kb1.merge(kb2).unwrap();

        assert_eq!(merged.chunks.len(), 10);
        assert_eq!(
            merged.groups.group_of("kb1:complaints.csv_row_1"),
            Some("kb1:complaints.csv")
        );
        assert_eq!(
            merged.groups.group_of("kb2:complaints.csv_row_1"),
            Some("kb2:complaints.csv")
        );

        let summary = merged
            .summaries
            .fragments()
            .iter()
            .find(|f| f.fragment_id == "kb2:complaints.csv")
            .unwrap();
        assert_eq!(summary.metadata["group_id"], "kb2:complaints.csv");
        assert_eq!(summary.metadata["fragment_ids"][0], "kb2:complaints.csv_row_1");
    }
}
