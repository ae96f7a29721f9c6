//! Greedy merging of similar document groups
//!
//! Two groups merge when their normalised file names, the opening of their
//! content, or their top keywords overlap enough (character or term set
//! Jaccard). Every later group is compared against the base group only, so
//! the result does not depend on how large a merged group has grown.

use crate::config::HierarchyConfig;
use crate::document::{DocumentGroup, MergedGroup};
use crate::entities::KeywordExtractor;
use std::collections::HashSet;
use std::hash::Hash;
use tracing::debug;

/// Jaccard index of two sets; two empty sets are not similar
pub fn jaccard<T: Eq + Hash>(a: &HashSet<T>, b: &HashSet<T>) -> f32 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f32 / union as f32
}

pub fn char_jaccard(a: &str, b: &str) -> f32 {
    let a: HashSet<char> = a.chars().collect();
    let b: HashSet<char> = b.chars().collect();
    jaccard(&a, &b)
}

/// Basename, lowercased, without extension, parentheticals or version tokens
pub fn normalize_filename(source: &str, version_tokens: &[String]) -> String {
    let base = source.rsplit(['/', '\\']).next().unwrap_or(source);
    let stem = match base.rfind('.') {
        Some(idx) if idx > 0 => &base[..idx],
        _ => base,
    };

    let mut name = strip_parentheticals(&stem.to_lowercase());
    for token in version_tokens {
        let token = token.to_lowercase();
        if !token.is_empty() {
            name = name.replace(&token, "");
        }
    }

    name.chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '_' | '-' | '.'))
        .collect()
}

fn strip_parentheticals(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut depth = 0usize;
    for c in text.chars() {
        match c {
            '(' | '（' => depth += 1,
            ')' | '）' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

/// Precomputed comparison features of one group
struct GroupProfile {
    name: String,
    sample: String,
    topics: HashSet<String>,
}

impl GroupProfile {
    fn new(group: &DocumentGroup, config: &HierarchyConfig, extractor: &KeywordExtractor) -> Self {
        let content = group.combined_content();
        let sample: String = content
            .to_lowercase()
            .chars()
            .take(config.content_sample_chars)
            .collect();
        let topics = extractor
            .extract_keywords(&content, config.topic_keywords, 2)
            .into_iter()
            .map(|k| k.term)
            .collect();

        Self {
            name: normalize_filename(&group.source, &config.version_tokens),
            sample,
            topics,
        }
    }

    fn similar_to(&self, other: &GroupProfile, config: &HierarchyConfig) -> Option<&'static str> {
        if char_jaccard(&self.name, &other.name) > config.filename_similarity {
            Some("filename")
        } else if char_jaccard(&self.sample, &other.sample) > config.content_similarity {
            Some("content")
        } else if jaccard(&self.topics, &other.topics) > config.topic_similarity {
            Some("topic")
        } else {
            None
        }
    }
}

/// Merge similar groups in a single greedy pass, preserving input order
pub fn merge_similar_groups(
    groups: Vec<DocumentGroup>,
    config: &HierarchyConfig,
    extractor: &KeywordExtractor,
) -> Vec<MergedGroup> {
    let profiles: Vec<GroupProfile> = groups
        .iter()
        .map(|g| GroupProfile::new(g, config, extractor))
        .collect();

    let mut slots: Vec<Option<DocumentGroup>> = groups.into_iter().map(Some).collect();
    let mut merged = Vec::new();

    for i in 0..slots.len() {
        let Some(base) = slots[i].take() else {
            continue;
        };
        let mut members = vec![base];

        for j in (i + 1)..slots.len() {
            if slots[j].is_none() {
                continue;
            }
            if let Some(reason) = profiles[i].similar_to(&profiles[j], config) {
                if let Some(group) = slots[j].take() {
                    debug!(
                        "Merging '{}' into '{}' ({} similarity)",
                        group.source, members[0].source, reason
                    );
                    members.push(group);
                }
            }
        }

        merged.push(MergedGroup::new(members));
    }

    merged
}
