//! Vector engine
//!
//! In-memory, flat, exhaustive cosine-similarity index with chunked streaming
//! ingest and optional worker-pool fan-out at query time.

pub mod chunker;
pub mod engine;
pub mod similarity;

pub use chunker::{split, ChunkingParams, SplitOutcome};
pub use engine::{
    vector_hash, EmbedFn, IngestOutcome, VectorEngine, VectorEntry, VectorFilter, VectorResult,
    VectorStats,
};
pub use similarity::{cosine_similarity, cosine_with_norms, norm};
