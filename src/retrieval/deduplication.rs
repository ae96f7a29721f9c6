//! Result deduplication and entity-preserving truncation

use crate::retrieval::{sort_by_score, ScoredFragment};
use std::collections::HashSet;

/// Chars of content compared when deduplicating by text
pub const CONTENT_PREFIX_CHARS: usize = 100;

/// Deduplicate by fragment id, keeping the first instance
pub fn dedupe_by_id(hits: Vec<ScoredFragment>) -> Vec<ScoredFragment> {
    let mut seen: HashSet<String> = HashSet::new();

    hits.into_iter()
        .filter(|hit| seen.insert(hit.id().to_string()))
        .collect()
}

/// Deduplicate by the first [`CONTENT_PREFIX_CHARS`] chars of content
pub fn dedupe_by_content_prefix(hits: Vec<ScoredFragment>) -> Vec<ScoredFragment> {
    let mut seen: HashSet<String> = HashSet::new();

    hits.into_iter()
        .filter(|hit| seen.insert(content_prefix(hit.content())))
        .collect()
}

pub(crate) fn content_prefix(content: &str) -> String {
    content.chars().take(CONTENT_PREFIX_CHARS).collect()
}

/// Truncate to `limit`, first keeping the best hit mentioning each term
///
/// Terms are served in order, so earlier terms win when there are more terms
/// than slots. Remaining slots go to the best of the rest. The result is
/// sorted by descending score.
pub fn truncate_preserving_terms(
    hits: Vec<ScoredFragment>,
    terms: &[String],
    limit: usize,
) -> Vec<ScoredFragment> {
    if hits.len() <= limit {
        let mut hits = hits;
        sort_by_score(&mut hits);
        return hits;
    }

    let mut ranked = hits;
    sort_by_score(&mut ranked);

    let lowered: Vec<String> = ranked.iter().map(|h| h.content().to_lowercase()).collect();
    let mut taken = vec![false; ranked.len()];
    let mut count = 0;

    for term in terms {
        if count >= limit {
            break;
        }
        let term = term.to_lowercase();
        if term.is_empty() {
            continue;
        }
        let already = (0..ranked.len()).any(|i| taken[i] && lowered[i].contains(&term));
        if already {
            continue;
        }
        if let Some(i) = (0..ranked.len()).find(|&i| !taken[i] && lowered[i].contains(&term)) {
            taken[i] = true;
            count += 1;
        }
    }

    for flag in taken.iter_mut() {
        if count >= limit {
            break;
        }
        if !*flag {
            *flag = true;
            count += 1;
        }
    }

    ranked
        .into_iter()
        .zip(taken)
        .filter_map(|(hit, keep)| keep.then_some(hit))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::test_support::fragment;

    fn hit(row: usize, content: &str, score: f32) -> ScoredFragment {
        ScoredFragment::new(fragment("a.csv", row, content), score)
    }

    #[test]
    fn test_dedupe_by_id_keeps_first() {
        let hits = vec![hit(1, "text1", 0.9), hit(2, "text2", 0.8), hit(1, "text1", 0.7)];

        let deduped = dedupe_by_id(hits);

        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].id(), "a.csv_row_1");
        assert_eq!(deduped[0].score, 0.9);
    }

    #[test]
    fn test_dedupe_by_content_prefix() {
        let long = "x".repeat(150);
        let variant = format!("{}tail", &long[..120]);
        let hits = vec![hit(1, &long, 0.9), hit(2, &variant, 0.8), hit(3, "other", 0.5)];

        let deduped = dedupe_by_content_prefix(hits);
        let ids: Vec<&str> = deduped.iter().map(|h| h.id()).collect();
        assert_eq!(ids, vec!["a.csv_row_1", "a.csv_row_3"]);
    }

    #[test]
    fn test_truncation_keeps_one_hit_per_term() {
        let hits = vec![
            hit(1, "张女士投诉", 0.9),
            hit(2, "张女士反映", 0.8),
            hit(3, "张女士举报", 0.7),
            hit(4, "李先生投诉", 0.1),
        ];
        let terms = vec!["张女士".to_string(), "李先生".to_string()];

        let kept = truncate_preserving_terms(hits, &terms, 2);
        let ids: Vec<&str> = kept.iter().map(|h| h.id()).collect();
        assert_eq!(ids, vec!["a.csv_row_1", "a.csv_row_4"]);
    }

    #[test]
    fn test_truncation_fills_by_score() {
        let hits = vec![hit(1, "a", 0.2), hit(2, "b", 0.9), hit(3, "c", 0.5)];
        let kept = truncate_preserving_terms(hits, &[], 2);
        let ids: Vec<&str> = kept.iter().map(|h| h.id()).collect();
        assert_eq!(ids, vec!["a.csv_row_2", "a.csv_row_3"]);
    }
}
