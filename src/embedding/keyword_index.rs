/// Ephemeral in-memory tantivy index for BM25 keyword search
///
/// Documents arrive pre-tokenised; a whitespace analyzer keeps tantivy from
/// re-segmenting them, so CJK text is indexed exactly as our tokenizer split it.
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, Occur, Query, TermQuery};
use tantivy::schema::*;
use tantivy::tokenizer::{LowerCaser, TextAnalyzer, WhitespaceTokenizer};
use tantivy::{doc, Index, IndexReader, ReloadPolicy, TantivyError};
use thiserror::Error;

const TOKENIZER_NAME: &str = "ws";
const WRITER_MEMORY: usize = 15_000_000;

#[derive(Error, Debug)]
pub enum KeywordIndexError {
    #[error("Index initialization failed: {0}")]
    InitializationError(String),

    #[error("Insert failed: {0}")]
    InsertError(String),

    #[error("Search failed: {0}")]
    SearchError(String),

    #[error("Tantivy error: {0}")]
    TantivyError(#[from] TantivyError),
}

impl From<KeywordIndexError> for crate::error::StratumError {
    fn from(err: KeywordIndexError) -> Self {
        crate::error::StratumError::Other(anyhow::anyhow!(err))
    }
}

/// Search result with ID and relevance score
#[derive(Debug, Clone)]
pub struct KeywordSearchResult {
    /// Caller-assigned document id
    pub id: u64,
    /// BM25 relevance score
    pub score: f32,
}

pub struct KeywordIndex {
    reader: IndexReader,
    id_field: Field,
    text_field: Field,
    len: usize,
}

impl KeywordIndex {
    /// Build an index over `(id, tokens)` pairs
    pub fn build<I>(docs: I) -> Result<Self, KeywordIndexError>
    where
        I: IntoIterator<Item = (u64, Vec<String>)>,
    {
        let mut schema_builder = Schema::builder();

        let id_field = schema_builder.add_u64_field("id", INDEXED | STORED);
        let text_options = TextOptions::default().set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer(TOKENIZER_NAME)
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        );
        let text_field = schema_builder.add_text_field("text", text_options);

        let schema = schema_builder.build();
        let index = Index::create_in_ram(schema);
        index.tokenizers().register(
            TOKENIZER_NAME,
            TextAnalyzer::builder(WhitespaceTokenizer::default())
                .filter(LowerCaser)
                .build(),
        );

        let mut writer: tantivy::IndexWriter = index
            .writer_with_num_threads(1, WRITER_MEMORY)
            .map_err(|e| KeywordIndexError::InitializationError(e.to_string()))?;

        let mut len = 0;
        for (id, tokens) in docs {
            writer
                .add_document(doc!(
                    id_field => id,
                    text_field => tokens.join(" "),
                ))
                .map_err(|e| KeywordIndexError::InsertError(e.to_string()))?;
            len += 1;
        }

        writer
            .commit()
            .map_err(|e| KeywordIndexError::InsertError(e.to_string()))?;

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .map_err(|e| KeywordIndexError::InitializationError(e.to_string()))?;
        reader.reload()?;

        Ok(Self {
            reader,
            id_field,
            text_field,
            len,
        })
    }

    /// BM25 search for documents containing any of `terms`
    ///
    /// Returns results sorted by relevance.
    pub fn search(
        &self,
        terms: &[String],
        limit: usize,
    ) -> Result<Vec<KeywordSearchResult>, KeywordIndexError> {
        if terms.is_empty() || limit == 0 || self.len == 0 {
            return Ok(Vec::new());
        }

        let clauses: Vec<(Occur, Box<dyn Query>)> = terms
            .iter()
            .filter(|t| !t.is_empty())
            .map(|t| {
                let term = Term::from_field_text(self.text_field, &t.to_lowercase());
                let query: Box<dyn Query> =
                    Box::new(TermQuery::new(term, IndexRecordOption::WithFreqs));
                (Occur::Should, query)
            })
            .collect();
        let query = BooleanQuery::new(clauses);

        let searcher = self.reader.searcher();
        let top_docs = searcher
            .search(&query, &TopDocs::with_limit(limit))
            .map_err(|e| KeywordIndexError::SearchError(e.to_string()))?;

        let mut results = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            let retrieved_doc: tantivy::TantivyDocument = searcher
                .doc(doc_address)
                .map_err(|e| KeywordIndexError::SearchError(e.to_string()))?;

            let id = retrieved_doc
                .get_first(self.id_field)
                .and_then(|v| v.as_u64())
                .ok_or_else(|| {
                    KeywordIndexError::SearchError("Missing or invalid ID field".to_string())
                })?;

            results.push(KeywordSearchResult { id, score });
        }

        Ok(results)
    }

    /// Get the number of documents in the index
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if index is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(text: &str) -> Vec<String> {
        text.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn test_build_and_search_is_case_insensitive() {
        let index = KeywordIndex::build(vec![
            (1, tokens("Parking fee complaint from building A")),
            (2, tokens("noise complaint about the PARKING garage")),
            (3, tokens("greening maintenance schedule")),
        ])
        .unwrap();
        assert_eq!(index.len(), 3);

        let hits = index.search(&["parking".to_string()], 10).unwrap();
        let mut ids: Vec<u64> = hits.iter().map(|h| h.id).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);

        let hits = index.search(&["Greening".to_string()], 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 3);
        assert!(index.search(&["parking".to_string()], 0).unwrap().is_empty());
    }

    #[test]
    fn test_cjk_tokens_are_kept_whole() {
        let index = KeywordIndex::build(vec![
            (10, vec!["张女士".into(), "投诉".into(), "物业".into()]),
            (11, vec!["李先生".into(), "咨询".into()]),
        ])
        .unwrap();

        let results = index.search(&["投诉".to_string()], 5).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, 10);

        assert!(index.search(&["投".to_string()], 5).unwrap().is_empty());
    }

    #[test]
    fn test_more_matching_terms_rank_higher() {
        let index = KeywordIndex::build(vec![
            (1, tokens("alpha beta")),
            (2, tokens("alpha")),
            (3, tokens("gamma")),
        ])
        .unwrap();

        let results = index
            .search(&["alpha".to_string(), "beta".to_string()], 10)
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, 1);
    }

    #[test]
    fn test_empty_index_and_terms() {
        let index = KeywordIndex::build(Vec::new()).unwrap();
        assert!(index.is_empty());
        assert!(index.search(&["x".to_string()], 5).unwrap().is_empty());
    }
}
