//! Plain nearest-neighbour search over the flat index

use crate::embedding::{EmbeddingProvider, VectorIndex};
use crate::retrieval::{similarity, PathDeadline, RetrievalError, ScoredFragment, SearchConfig};
use std::sync::Arc;

pub struct FlatRetriever {
    provider: Arc<dyn EmbeddingProvider>,
}

impl FlatRetriever {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self { provider }
    }

    pub fn search(
        &self,
        index: &VectorIndex,
        query: &str,
        params: &SearchConfig,
        deadline: &PathDeadline,
    ) -> Result<Vec<ScoredFragment>, RetrievalError> {
        if index.is_empty() || params.top_k == 0 {
            return Ok(Vec::new());
        }
        let vector = self.provider.embed_query(query)?;
        deadline.check()?;

        Ok(index
            .search(&vector, params.top_k)?
            .into_iter()
            .map(|(fragment, distance)| ScoredFragment::new(fragment, similarity(distance)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexingConfig;
    use crate::document::test_support::fragment;
    use crate::embedding::HashEmbeddingProvider;

    #[test]
    fn test_flat_search_scores_are_similarities() {
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbeddingProvider::new(32));
        let fragments = vec![
            fragment("a.txt", 1, "物业噪音投诉"),
            fragment("a.txt", 2, "停车收费标准"),
            fragment("a.txt", 3, "食堂卫生检查"),
        ];
        let index =
            VectorIndex::build(fragments, provider.as_ref(), &IndexingConfig::default()).unwrap();
        let params = SearchConfig {
            top_k: 2,
            ..SearchConfig::default()
        };

        let hits = FlatRetriever::new(provider)
            .search(&index, "物业噪音投诉", &params, &PathDeadline::unbounded())
            .unwrap();

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id(), "a.txt_row_1");
        assert!((hits[0].score - 1.0).abs() < 1e-3);
        assert!(hits.iter().all(|h| (0.0..=1.0).contains(&h.score)));
    }
}
