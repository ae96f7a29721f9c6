//! Fragments and the grouping types the hierarchical index is built from

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Metadata key naming the originating document
pub const SOURCE_KEY: &str = "source";

const UNKNOWN_SOURCE: &str = "unknown";

/// Smallest retrievable unit of text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub fragment_id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Fragment {
    /// Create a fragment whose id is derived from its source and position
    pub fn new(content: impl Into<String>, metadata: Map<String, Value>) -> Self {
        let content = content.into();
        let fragment_id = derive_fragment_id(&content, &metadata);
        Self {
            fragment_id,
            content,
            metadata,
        }
    }

    /// Create a fragment with an explicit id
    pub fn with_id(
        fragment_id: impl Into<String>,
        content: impl Into<String>,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            fragment_id: fragment_id.into(),
            content: content.into(),
            metadata,
        }
    }

    pub fn source(&self) -> Option<&str> {
        self.metadata.get(SOURCE_KEY).and_then(Value::as_str)
    }

    /// Source used for grouping; fragments without one share a single group
    pub fn group_source(&self) -> &str {
        self.source().unwrap_or(UNKNOWN_SOURCE)
    }

    /// Builder-style metadata insert
    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }
}

/// Derive `<source>_row_<n>`, `<source>_page_<n>` or `<source>_<n>` from metadata
///
/// `<source>` is the whole normalized source path, so `2023/report.csv`,
/// `2024/report.csv` and `report.pdf` never share an id.
pub fn derive_fragment_id(content: &str, metadata: &Map<String, Value>) -> String {
    let source = normalize_source(
        metadata
            .get(SOURCE_KEY)
            .and_then(Value::as_str)
            .unwrap_or(UNKNOWN_SOURCE),
    );

    let position = |key: &str| metadata.get(key).and_then(value_as_position);

    if let Some(row) = position("row") {
        format!("{}_row_{}", source, row)
    } else if let Some(page) = position("page") {
        format!("{}_page_{}", source, page)
    } else if let Some(n) = position("position").or_else(|| position("chunk_index")) {
        format!("{}_{}", source, n)
    } else {
        // No position: fall back to a content hash so ids stay stable
        let hash = blake3::hash(content.as_bytes()).to_hex();
        format!("{}_{}", source, &hash.as_str()[..12])
    }
}

/// Source path with `/` separators and no leading `./`
pub fn normalize_source(source: &str) -> String {
    let source = source.trim().replace('\\', "/");
    match source.strip_prefix("./") {
        Some(rest) => rest.to_string(),
        None => source,
    }
}

/// Id of a fragment searched alongside other knowledge bases
pub fn scoped_id(scope: &str, id: &str) -> String {
    format!("{}:{}", scope, id)
}

fn value_as_position(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// Every fragment sharing one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentGroup {
    pub source: String,
    pub fragments: Vec<Fragment>,
}

impl DocumentGroup {
    pub fn combined_content(&self) -> String {
        self.fragments
            .iter()
            .map(|f| f.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Group fragments by source, ordered by first appearance
pub fn group_by_source(fragments: &[Fragment]) -> Vec<DocumentGroup> {
    let mut order: HashMap<&str, usize> = HashMap::new();
    let mut groups: Vec<DocumentGroup> = Vec::new();

    for fragment in fragments {
        let source = fragment.group_source();
        match order.get(source) {
            Some(&idx) => groups[idx].fragments.push(fragment.clone()),
            None => {
                order.insert(source, groups.len());
                groups.push(DocumentGroup {
                    source: source.to_string(),
                    fragments: vec![fragment.clone()],
                });
            }
        }
    }

    groups
}

/// One or more document groups judged similar enough to summarise together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedGroup {
    pub id: String,
    pub members: Vec<DocumentGroup>,
}

impl MergedGroup {
    pub fn new(members: Vec<DocumentGroup>) -> Self {
        let first = members
            .first()
            .map(|g| g.source.clone())
            .unwrap_or_else(|| UNKNOWN_SOURCE.to_string());
        let id = if members.len() > 1 {
            format!("{}_merged_{}", first, members.len())
        } else {
            first
        };
        Self { id, members }
    }

    pub fn sources(&self) -> Vec<String> {
        self.members.iter().map(|g| g.source.clone()).collect()
    }

    pub fn fragments(&self) -> impl Iterator<Item = &Fragment> {
        self.members.iter().flat_map(|g| g.fragments.iter())
    }

    pub fn fragment_ids(&self) -> Vec<String> {
        self.fragments().map(|f| f.fragment_id.clone()).collect()
    }

    pub fn fragment_count(&self) -> usize {
        self.members.iter().map(|g| g.fragments.len()).sum()
    }

    pub fn combined_content(&self) -> String {
        self.members
            .iter()
            .map(DocumentGroup::combined_content)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Compact representative of a merged group, indexed at the coarse layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryDocument {
    pub group_id: String,
    pub content: String,
    pub fragment_count: usize,
    pub sources: Vec<String>,
    pub keywords: Vec<String>,
    pub fragment_ids: Vec<String>,
}

impl SummaryDocument {
    /// Convert into a fragment for the summary index
    pub fn to_fragment(&self) -> Fragment {
        let mut metadata = Map::new();
        metadata.insert("group_id".into(), Value::from(self.group_id.clone()));
        metadata.insert("fragment_count".into(), Value::from(self.fragment_count));
        metadata.insert("sources".into(), Value::from(self.sources.clone()));
        metadata.insert(
            SOURCE_KEY.into(),
            Value::from(self.sources.first().cloned().unwrap_or_default()),
        );
        metadata.insert("type".into(), Value::from("summary"));
        metadata.insert("keywords".into(), Value::from(self.keywords.clone()));
        metadata.insert("fragment_ids".into(), Value::from(self.fragment_ids.clone()));

        Fragment::with_id(self.group_id.clone(), self.content.clone(), metadata)
    }
}
