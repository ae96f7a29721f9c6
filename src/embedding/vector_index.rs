/// Vector index over fragments with exact and HNSW backends
use super::provider::{EmbeddingError, EmbeddingProvider};
use crate::config::{IndexBackendChoice, IndexingConfig};
use crate::document::{scoped_id, Fragment};
use crate::error::StratumError;
use hnsw_rs::prelude::*;
use ndarray::{ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Compressed vector snapshot
pub const INDEX_FILE: &str = "index.bin";
/// Fragments in slot order
pub const DOCSTORE_FILE: &str = "docstore.json";

const HNSW_MAX_LAYER: usize = 16;

#[derive(Error, Debug)]
pub enum VectorIndexError {
    #[error("Invalid dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Insert failed: {0}")]
    InsertError(String),

    #[error("Index at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
}

impl From<VectorIndexError> for StratumError {
    fn from(err: VectorIndexError) -> Self {
        match err {
            VectorIndexError::Corrupt { path, reason } => StratumError::IndexCorrupt { path, reason },
            VectorIndexError::Embedding(e) => e.into(),
            VectorIndexError::IoError(source) => StratumError::Io {
                source,
                context: "vector index".to_string(),
            },
            other => StratumError::Other(anyhow::anyhow!(other)),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    dimension: usize,
    vectors: Vec<f32>,
}

enum Backend {
    Exact,
    Hnsw(Box<Hnsw<'static, f32, DistCosine>>),
}

/// Cosine-distance index over fragments
///
/// Distances are `1 - cosine`, so lower is more similar. Vectors are stored
/// L2-normalised in one flat buffer; the exact backend scores them with a
/// single matrix-vector product.
pub struct VectorIndex {
    dimension: usize,
    options: IndexingConfig,
    fragments: Vec<Fragment>,
    vectors: Vec<f32>,
    backend: Backend,
}

impl VectorIndex {
    /// Create an empty index
    pub fn new(dimension: usize, options: &IndexingConfig) -> Self {
        Self {
            dimension,
            options: options.clone(),
            fragments: Vec::new(),
            vectors: Vec::new(),
            backend: Backend::Exact,
        }
    }

    /// Embed fragments with `provider` and index them
    pub fn build(
        fragments: Vec<Fragment>,
        provider: &dyn EmbeddingProvider,
        options: &IndexingConfig,
    ) -> Result<Self, VectorIndexError> {
        let texts: Vec<String> = fragments.iter().map(|f| f.content.clone()).collect();
        let vectors = provider.embed_documents(&texts)?;

        let mut index = Self::new(provider.dimension(), options);
        index.add(fragments, vectors)?;
        Ok(index)
    }

    /// Add fragments with their vectors
    pub fn add(
        &mut self,
        fragments: Vec<Fragment>,
        vectors: Vec<Vec<f32>>,
    ) -> Result<(), VectorIndexError> {
        if fragments.len() != vectors.len() {
            return Err(VectorIndexError::InsertError(format!(
                "{} fragments but {} vectors",
                fragments.len(),
                vectors.len()
            )));
        }

        for vector in &vectors {
            if vector.len() != self.dimension {
                return Err(VectorIndexError::InvalidDimension {
                    expected: self.dimension,
                    actual: vector.len(),
                });
            }
        }

        self.vectors.reserve(vectors.len() * self.dimension);
        for mut vector in vectors {
            normalize(&mut vector);
            self.vectors.extend_from_slice(&vector);
        }
        self.fragments.extend(fragments);
        self.rebuild_backend();

        Ok(())
    }

    /// Search for the `k` nearest fragments
    ///
    /// Returns `(fragment, distance)` pairs sorted by ascending distance.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(Fragment, f32)>, VectorIndexError> {
        let query = self.prepare_query(query)?;
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let hits = match &self.backend {
            Backend::Exact => self.exact_search(&query, k, None),
            Backend::Hnsw(hnsw) => {
                let ef = self.options.hnsw_ef_search.max(k);
                hnsw.search(&query, k, ef)
                    .into_iter()
                    .map(|n| (n.d_id, n.distance))
                    .collect()
            }
        };

        Ok(self.collect_hits(hits))
    }

    /// Exact search restricted to the given slots
    pub fn search_within(
        &self,
        query: &[f32],
        k: usize,
        slots: &[usize],
    ) -> Result<Vec<(Fragment, f32)>, VectorIndexError> {
        let query = self.prepare_query(query)?;
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }
        let hits = self.exact_search(&query, k, Some(slots));
        Ok(self.collect_hits(hits))
    }

    /// Merge two indices with the same dimension
    pub fn merge(mut self, other: VectorIndex) -> Result<Self, VectorIndexError> {
        if self.is_empty() {
            return Ok(other);
        }
        if other.is_empty() {
            return Ok(self);
        }
        if other.dimension != self.dimension {
            return Err(VectorIndexError::InvalidDimension {
                expected: self.dimension,
                actual: other.dimension,
            });
        }

        self.fragments.extend(other.fragments);
        self.vectors.extend(other.vectors);
        self.rebuild_backend();
        Ok(self)
    }

    /// Persist `index.bin` and `docstore.json` into `dir`
    ///
    /// Each file is written to a temporary path and renamed into place. The
    /// previous generation stays next to it with a `.bak` suffix.
    pub fn save(&self, dir: &Path) -> Result<(), VectorIndexError> {
        std::fs::create_dir_all(dir)?;

        let snapshot = Snapshot {
            dimension: self.dimension,
            vectors: self.vectors.clone(),
        };
        let json = serde_json::to_vec(&snapshot)
            .map_err(|e| VectorIndexError::SerializationError(e.to_string()))?;
        let compressed = zstd::encode_all(json.as_slice(), 3)?;
        write_with_backup(&dir.join(INDEX_FILE), &compressed)?;

        let docstore = serde_json::to_vec(&self.fragments)
            .map_err(|e| VectorIndexError::SerializationError(e.to_string()))?;
        write_with_backup(&dir.join(DOCSTORE_FILE), &docstore)?;

        tracing::debug!("Saved {} vectors to {:?}", self.len(), dir);
        Ok(())
    }

    /// Load an index saved by [`VectorIndex::save`]
    pub fn load(dir: &Path, options: &IndexingConfig) -> Result<Self, VectorIndexError> {
        Self::load_files(&dir.join(INDEX_FILE), &dir.join(DOCSTORE_FILE), options)
    }

    /// Load, retrying once from the `.bak` pair
    pub fn load_with_backup(dir: &Path, options: &IndexingConfig) -> Result<Self, VectorIndexError> {
        match Self::load(dir, options) {
            Ok(index) => Ok(index),
            Err(primary) => {
                tracing::warn!("Index load failed ({}), retrying from safe copy", primary);
                Self::load_files(
                    &backup_path(&dir.join(INDEX_FILE)),
                    &backup_path(&dir.join(DOCSTORE_FILE)),
                    options,
                )
                .map_err(|_| primary)
            }
        }
    }

    /// Whether a saved index exists in `dir`
    pub fn exists(dir: &Path) -> bool {
        dir.join(INDEX_FILE).is_file() && dir.join(DOCSTORE_FILE).is_file()
    }

    fn load_files(
        index_path: &Path,
        docstore_path: &Path,
        options: &IndexingConfig,
    ) -> Result<Self, VectorIndexError> {
        let corrupt = |path: &Path, reason: String| VectorIndexError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };

        let compressed =
            std::fs::read(index_path).map_err(|e| corrupt(index_path, e.to_string()))?;
        let json = zstd::decode_all(compressed.as_slice())
            .map_err(|e| corrupt(index_path, format!("decompress: {}", e)))?;
        let snapshot: Snapshot = serde_json::from_slice(&json)
            .map_err(|e| corrupt(index_path, format!("decode: {}", e)))?;

        let docstore =
            std::fs::read(docstore_path).map_err(|e| corrupt(docstore_path, e.to_string()))?;
        let fragments: Vec<Fragment> = serde_json::from_slice(&docstore)
            .map_err(|e| corrupt(docstore_path, format!("decode: {}", e)))?;

        if snapshot.dimension == 0 {
            return Err(corrupt(index_path, "zero dimension".to_string()));
        }
        if snapshot.vectors.len() != snapshot.dimension * fragments.len() {
            return Err(corrupt(
                index_path,
                format!(
                    "{} vectors of dimension {} for {} fragments",
                    snapshot.vectors.len() / snapshot.dimension,
                    snapshot.dimension,
                    fragments.len()
                ),
            ));
        }

        let mut index = Self {
            dimension: snapshot.dimension,
            options: options.clone(),
            fragments,
            vectors: snapshot.vectors,
            backend: Backend::Exact,
        };
        index.rebuild_backend();
        Ok(index)
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    /// Mutable fragment access; vectors and slots stay as they are
    pub(crate) fn fragments_mut(&mut self) -> &mut [Fragment] {
        &mut self.fragments
    }

    /// Prefix every fragment id with `<scope>:`
    pub fn scoped(mut self, scope: &str) -> Self {
        for fragment in &mut self.fragments {
            fragment.fragment_id = scoped_id(scope, &fragment.fragment_id);
        }
        self
    }

    /// Get the number of vectors in the index
    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    /// Check if index is empty
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Get vector dimension
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn is_approximate(&self) -> bool {
        matches!(self.backend, Backend::Hnsw(_))
    }

    fn prepare_query(&self, query: &[f32]) -> Result<Vec<f32>, VectorIndexError> {
        if query.len() != self.dimension {
            return Err(VectorIndexError::InvalidDimension {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        let mut query = query.to_vec();
        normalize(&mut query);
        Ok(query)
    }

    fn exact_search(&self, query: &[f32], k: usize, slots: Option<&[usize]>) -> Vec<(usize, f32)> {
        let matrix = match ArrayView2::from_shape((self.len(), self.dimension), &self.vectors) {
            Ok(matrix) => matrix,
            Err(e) => {
                tracing::warn!("Vector buffer has unexpected shape: {}", e);
                return Vec::new();
            }
        };
        let query = ArrayView1::from(query);
        let similarities = matrix.dot(&query);

        let mut hits: Vec<(usize, f32)> = match slots {
            Some(slots) => slots
                .iter()
                .filter(|&&slot| slot < self.len())
                .map(|&slot| (slot, 1.0 - similarities[slot]))
                .collect(),
            None => similarities
                .iter()
                .enumerate()
                .map(|(slot, sim)| (slot, 1.0 - sim))
                .collect(),
        };

        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        hits.truncate(k);
        hits
    }

    fn collect_hits(&self, hits: Vec<(usize, f32)>) -> Vec<(Fragment, f32)> {
        hits.into_iter()
            .filter_map(|(slot, distance)| {
                self.fragments
                    .get(slot)
                    .map(|f| (f.clone(), distance.clamp(0.0, 2.0)))
            })
            .collect()
    }

    fn rebuild_backend(&mut self) {
        let use_hnsw = match self.options.backend {
            IndexBackendChoice::Exact => false,
            IndexBackendChoice::Hnsw => true,
            IndexBackendChoice::Auto => self.len() >= self.options.exact_search_limit,
        };

        if !use_hnsw || self.is_empty() {
            self.backend = Backend::Exact;
            return;
        }

        let mut hnsw = Hnsw::<f32, DistCosine>::new(
            self.options.hnsw_m,
            self.len(),
            HNSW_MAX_LAYER,
            self.options.hnsw_ef_construction,
            DistCosine,
        );
        for (slot, row) in self.vectors.chunks(self.dimension).enumerate() {
            hnsw.insert((row, slot));
        }
        hnsw.set_searching_mode(true);

        tracing::debug!("Built HNSW graph over {} vectors", self.len());
        self.backend = Backend::Hnsw(Box::new(hnsw));
    }
}

impl Clone for VectorIndex {
    /// Copies fragments and vectors; an HNSW graph is rebuilt for the copy
    fn clone(&self) -> Self {
        let mut index = Self {
            dimension: self.dimension,
            options: self.options.clone(),
            fragments: self.fragments.clone(),
            vectors: self.vectors.clone(),
            backend: Backend::Exact,
        };
        index.rebuild_backend();
        index
    }
}

fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|x| *x /= norm);
    }
}

pub(crate) fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".bak");
    PathBuf::from(name)
}

pub(crate) fn write_with_backup(path: &Path, data: &[u8]) -> Result<(), std::io::Error> {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, data)?;
    if path.exists() {
        std::fs::rename(path, backup_path(path))?;
    }
    std::fs::rename(&tmp, path)
}
