//! Embedding backends for pattern signatures and sample content
//!
//! Uses a trait-based backend (`Embedder`) so production code can use
//! fastembed behind the `embeddings` feature while the default build and
//! tests use deterministic embedders.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use thiserror::Error;

/// Error type for embedding operations.
#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedding returned no results")]
    EmptyResult,

    #[error("embedding model error: {0}")]
    ModelError(String),
}

/// Trait for embedding text into vectors.
///
/// Implementations handle model loading and inference. Deterministic per
/// input is assumed but not guaranteed by every backend.
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, returning one vector per text.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedError>;

    /// Embed a single text.
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        self.embed_batch(&[text])?
            .into_iter()
            .next()
            .ok_or(EmbedError::EmptyResult)
    }
}

/// Dimensionality of `HashEmbedder` vectors.
const HASH_DIM: usize = 256;

/// Deterministic character-trigram hashing embedder.
///
/// Not a semantic model: two signatures score as similar when they share
/// character trigrams after normalization. Good enough to bootstrap
/// retrieval without a model download, and fully deterministic for tests.
pub struct HashEmbedder;

impl HashEmbedder {
    pub fn new() -> Self {
        Self
    }

    /// Lowercase and fold separators so `DR_TIER`, `dr-tier`, and
    /// `dr tier` produce the same trigrams.
    fn normalize(text: &str) -> String {
        let folded: String = text
            .to_lowercase()
            .chars()
            .map(|c| if c == '_' || c == '-' || c == '.' { ' ' } else { c })
            .collect();
        format!(" {} ", folded.split_whitespace().collect::<Vec<_>>().join(" "))
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl Embedder for HashEmbedder {
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            let normalized = Self::normalize(text);
            let chars: Vec<char> = normalized.chars().collect();
            let mut v = vec![0.0f32; HASH_DIM];
            for window in chars.windows(3) {
                let mut hasher = DefaultHasher::new();
                window.hash(&mut hasher);
                v[(hasher.finish() % HASH_DIM as u64) as usize] += 1.0;
            }
            let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                for x in v.iter_mut() {
                    *x /= norm;
                }
            }
            out.push(v);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// FastEmbedEmbedder — production embedder behind `embeddings` feature
// ---------------------------------------------------------------------------

#[cfg(feature = "embeddings")]
mod fastembed_impl {
    use super::{EmbedError, Embedder};
    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
    use std::sync::Mutex;

    /// Production embedder backed by fastembed (ONNX Runtime).
    ///
    /// Wraps `fastembed::TextEmbedding` in a `Mutex` because its `embed`
    /// method requires `&mut self`, while the `Embedder` trait uses `&self`.
    pub struct FastEmbedEmbedder {
        model: Mutex<TextEmbedding>,
    }

    impl FastEmbedEmbedder {
        /// Create a new FastEmbedEmbedder with a specific model.
        pub fn new(model: EmbeddingModel) -> Result<Self, EmbedError> {
            let options = InitOptions::new(model).with_show_download_progress(false);
            let embedding = TextEmbedding::try_new(options)
                .map_err(|e| EmbedError::ModelError(e.to_string()))?;
            Ok(Self {
                model: Mutex::new(embedding),
            })
        }

        /// Create a new FastEmbedEmbedder with the default model (nomic-embed-text-v1.5).
        pub fn default_model() -> Result<Self, EmbedError> {
            Self::new(EmbeddingModel::NomicEmbedTextV15)
        }
    }

    impl Embedder for FastEmbedEmbedder {
        fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedError> {
            if texts.is_empty() {
                return Ok(Vec::new());
            }
            let mut model = self.model.lock().unwrap();
            let embeddings = model
                .embed(texts.to_vec(), None)
                .map_err(|e| EmbedError::ModelError(e.to_string()))?;
            if embeddings.is_empty() {
                return Err(EmbedError::EmptyResult);
            }
            Ok(embeddings)
        }
    }
}

#[cfg(feature = "embeddings")]
pub use fastembed_impl::FastEmbedEmbedder;

/// Cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Cosine distance (1 - similarity), clamped to [0, 2].
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

/// Combined distance over the signature and content embeddings: the average
/// of the two cosine distances. Lower ranks higher.
pub fn combined_distance(
    sig_a: &[f32],
    sig_b: &[f32],
    content_a: &[f32],
    content_b: &[f32],
) -> f32 {
    (cosine_distance(sig_a, sig_b) + cosine_distance(content_a, content_b)) / 2.0
}
