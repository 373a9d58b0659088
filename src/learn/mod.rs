//! Pattern learning engine
//!
//! Everything that learns from engagements: embeddings, the tenant-scoped
//! pattern store, adaptive confidence thresholds, the suggestion engine,
//! and the self-training synthesizer that bootstraps new tenants.

pub mod embedder;
pub mod pattern;
pub mod store;
pub mod suggest;
pub mod synthesize;
pub mod thresholds;

pub use embedder::{combined_distance, cosine_distance, cosine_similarity, EmbedError, Embedder, HashEmbedder};
#[cfg(feature = "embeddings")]
pub use embedder::FastEmbedEmbedder;
pub use pattern::{Pattern, PatternId, PatternLifecycle, PatternScope};
pub use store::{Candidate, PatternStore};
pub use suggest::{Decision, Suggester, Suggestion};
pub use synthesize::{SeedExample, Synthesizer};
pub use thresholds::{Adjustment, OperationType, ThresholdManager, Thresholds};

use thiserror::Error;

/// Error type for learning operations.
#[derive(Debug, Error)]
pub enum LearnError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbedError),

    #[error("pattern not found: {0}")]
    PatternNotFound(String),

    #[error("concurrent update conflict: {0}")]
    Conflict(String),

    #[error("corrupt stored data: {0}")]
    Corrupt(String),
}

pub type LearnResult<T> = Result<T, LearnError>;
