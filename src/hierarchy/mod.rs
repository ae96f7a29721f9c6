//! Hierarchical index construction and maintenance
//!
//! Fragments are grouped by source, similar groups are merged, and each
//! merged group gets one summary. Summaries form the coarse layer searched
//! first; the chunk index holds every fragment.

mod builder;
mod merge;
mod rebuild;
mod summary;

pub use builder::{
    flat_index_dir, hierarchical_dir, GroupEntry, GroupMapping, HierarchicalIndex,
    HierarchicalIndexBuilder, CHUNK_INDEX_DIR, FLAT_INDEX_DIR, GROUPS_FILE, HIERARCHICAL_DIR,
    SUMMARY_INDEX_DIR,
};
pub use merge::{char_jaccard, jaccard, merge_similar_groups, normalize_filename};
pub use rebuild::{
    needs_rebuild, rebuild_knowledge_base, RebuildAction, RebuildRecord, RebuildResult,
    RebuildStatus, RebuildTracker, REBUILD_RECORD_FILE,
};
pub use summary::{structured_summary, truncate_chars, SummaryBuilder};
