/// Embedding provider trait and the local implementations
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitializationError(String),

    #[error("Embedding generation failed: {0}")]
    GenerationError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Remote request failed: {0}")]
    Remote(String),
}

impl From<EmbeddingError> for crate::error::StratumError {
    fn from(err: EmbeddingError) -> Self {
        crate::error::StratumError::provider_unavailable("embedding", err)
    }
}

/// Opaque identity of an embedding provider, hashed into cache keys
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderIdentity {
    pub provider: String,
    pub model_name: String,
    pub model_type: String,
}

impl ProviderIdentity {
    pub fn new(provider: &str, model_name: &str, model_type: &str) -> Self {
        Self {
            provider: provider.to_string(),
            model_name: model_name.to_string(),
            model_type: model_type.to_string(),
        }
    }

    /// Stable hex digest of the identity
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.provider.as_bytes());
        hasher.update(&[0]);
        hasher.update(self.model_name.as_bytes());
        hasher.update(&[0]);
        hasher.update(self.model_type.as_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

/// Trait for embedding providers
///
/// Implementations are synchronous; callers on the async path run them inside
/// `spawn_blocking`.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed documents for indexing, one vector per input in input order
    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Embed a single query
    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Get the embedding dimension
    fn dimension(&self) -> usize;

    /// Identity used to tell cached services apart
    fn identity(&self) -> ProviderIdentity;
}

/// FastEmbed provider for local embedding generation
///
/// Models are downloaded on first use to the fastembed cache directory.
pub struct FastEmbedProvider {
    model: Arc<TextEmbedding>,
    model_name: String,
    dimension: usize,
    batch_size: usize,
}

impl FastEmbedProvider {
    /// Create a new FastEmbed provider with the specified model
    ///
    /// Supported models:
    /// - all-MiniLM-L6-v2: 90MB (384 dims)
    /// - bge-small-en-v1.5: 130MB (384 dims)
    /// - bge-base-en-v1.5: 440MB (768 dims)
    /// - bge-small-zh-v1.5: 95MB (512 dims), for Chinese corpora
    /// - multilingual-e5-small: 450MB (384 dims)
    pub fn new(model_name: &str, batch_size: usize) -> Result<Self, EmbeddingError> {
        let (embedding_model, dimension, model_size_mb) = match model_name {
            "all-MiniLM-L6-v2" | "all-minilm-l6-v2" => (EmbeddingModel::AllMiniLML6V2, 384, 90),
            "bge-small-en-v1.5" => (EmbeddingModel::BGESmallENV15, 384, 130),
            "bge-base-en-v1.5" => (EmbeddingModel::BGEBaseENV15, 768, 440),
            "bge-small-zh-v1.5" => (EmbeddingModel::BGESmallZHV15, 512, 95),
            "multilingual-e5-small" => (EmbeddingModel::MultilingualE5Small, 384, 450),
            _ => {
                return Err(EmbeddingError::InitializationError(format!(
                    "Unsupported model: {}. Supported: all-MiniLM-L6-v2, bge-small-en-v1.5, \
                     bge-base-en-v1.5, bge-small-zh-v1.5, multilingual-e5-small",
                    model_name
                )));
            }
        };

        tracing::info!(
            "Initializing embedding model: {} ({}D, ~{}MB download if not cached)",
            model_name,
            dimension,
            model_size_mb
        );

        let init_options = InitOptions::new(embedding_model).with_show_download_progress(true);

        let model = TextEmbedding::try_new(init_options)
            .map_err(|e| EmbeddingError::InitializationError(e.to_string()))?;

        Ok(Self {
            model: Arc::new(model),
            model_name: model_name.to_string(),
            dimension,
            batch_size: batch_size.max(1),
        })
    }

    fn check_dimensions(&self, embeddings: &[Vec<f32>]) -> Result<(), EmbeddingError> {
        for embedding in embeddings {
            if embedding.len() != self.dimension {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: self.dimension,
                    actual: embedding.len(),
                });
            }
        }
        Ok(())
    }
}

impl EmbeddingProvider for FastEmbedProvider {
    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        // Empty strings keep their slot so vectors stay aligned with fragments
        let inputs: Vec<&str> = texts
            .iter()
            .map(|t| if t.trim().is_empty() { " " } else { t.as_str() })
            .collect();

        let embeddings = self
            .model
            .embed(inputs, Some(self.batch_size))
            .map_err(|e| EmbeddingError::GenerationError(e.to_string()))?;

        self.check_dimensions(&embeddings)?;
        Ok(embeddings)
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput("Empty text".to_string()));
        }

        let mut embeddings = self
            .model
            .embed(vec![text], None)
            .map_err(|e| EmbeddingError::GenerationError(e.to_string()))?;

        let embedding = embeddings
            .pop()
            .ok_or_else(|| EmbeddingError::GenerationError("No embeddings generated".into()))?;
        self.check_dimensions(std::slice::from_ref(&embedding))?;
        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn identity(&self) -> ProviderIdentity {
        ProviderIdentity::new("fastembed", &self.model_name, "local")
    }
}

/// Deterministic feature-hashing embedder
///
/// Characters and character bigrams (plus whole ASCII words) are hashed with
/// blake3 into `dimension` buckets and the result is L2-normalised. Needs no
/// model download, so it backs offline setups and the test suite.
pub struct HashEmbeddingProvider {
    dimension: usize,
}

impl HashEmbeddingProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let lowered = text.to_lowercase();

        let chars: Vec<char> = lowered
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect();

        for c in &chars {
            let mut buf = [0u8; 4];
            self.bump(&mut vector, c.encode_utf8(&mut buf).as_bytes(), 1.0);
        }
        for pair in chars.windows(2) {
            let feature: String = pair.iter().collect();
            self.bump(&mut vector, feature.as_bytes(), 1.0);
        }
        for word in lowered
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|w| w.len() > 1)
        {
            self.bump(&mut vector, format!("w:{}", word).as_bytes(), 1.5);
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }

    fn bump(&self, vector: &mut [f32], feature: &[u8], weight: f32) {
        let hash = blake3::hash(feature);
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&hash.as_bytes()[..8]);
        let bucket = (u64::from_le_bytes(bytes) % self.dimension as u64) as usize;
        vector[bucket] += weight;
    }
}

impl EmbeddingProvider for HashEmbeddingProvider {
    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput("Empty text".to_string()));
        }
        Ok(self.embed_text(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn identity(&self) -> ProviderIdentity {
        ProviderIdentity::new("hashing", &format!("hash-{}", self.dimension), "local")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        dot / (mag_a * mag_b)
    }

    #[test]
    fn test_hash_embedding_is_deterministic_and_normalised() {
        let provider = HashEmbeddingProvider::new(128);
        let a = provider.embed_query("张女士的投诉内容").unwrap();
        let b = provider.embed_query("张女士的投诉内容").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 128);

        let magnitude: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_hash_embedding_similarity_tracks_overlap() {
        let provider = HashEmbeddingProvider::new(256);
        let query = provider.embed_query("张女士投诉").unwrap();
        let close = provider.embed_query("张女士投诉物业服务").unwrap();
        let far = provider.embed_query("staffing plan").unwrap();

        assert!(cosine_similarity(&query, &close) > cosine_similarity(&query, &far));
    }

    #[test]
    fn test_hash_embedding_rejects_empty_query() {
        let provider = HashEmbeddingProvider::new(64);
        assert!(provider.embed_query("  ").is_err());
        assert_eq!(provider.embed_documents(&[String::new()]).unwrap().len(), 1);
    }

    #[test]
    fn test_identity_fingerprint_differs_by_model() {
        let a = HashEmbeddingProvider::new(64).identity();
        let b = HashEmbeddingProvider::new(128).identity();
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), HashEmbeddingProvider::new(64).identity().fingerprint());
    }

    #[test]
    #[ignore] // Requires model download (~90MB) - run with: cargo test -- --ignored
    fn test_fastembed_batch_embedding() {
        let provider = FastEmbedProvider::new("all-MiniLM-L6-v2", 32).unwrap();
        let texts = vec![
            "First test sentence.".to_string(),
            String::new(),
            "Third test sentence.".to_string(),
        ];

        let embeddings = provider.embed_documents(&texts).unwrap();
        assert_eq!(embeddings.len(), 3);
        for embedding in embeddings {
            assert_eq!(embedding.len(), 384);
        }
    }

    #[test]
    #[ignore] // Requires model download (~90MB) - run with: cargo test -- --ignored
    fn test_fastembed_semantic_similarity() {
        let provider = FastEmbedProvider::new("all-MiniLM-L6-v2", 32).unwrap();

        let emb1 = provider.embed_query("The cat sits on the mat.").unwrap();
        let emb2 = provider.embed_query("A feline rests on the rug.").unwrap();
        let emb3 = provider.embed_query("Python programming language.").unwrap();

        assert!(cosine_similarity(&emb1, &emb2) > cosine_similarity(&emb1, &emb3));
    }
}
