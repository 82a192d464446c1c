//! ragdb — two-stage retrieval engine for private document knowledge bases
//!
//! Given a natural-language query scoped to a tenant `(user, org, app)`, the
//! engine returns the document shards most likely to answer it. It is built
//! to front an LLM chat layer: the output is the retrieved context the model
//! consumes.
//!
//! ## Architecture
//! - Tokenizer: per-language segmentation, stop words, stemming, spell-correct
//! - TF-IDF engine: sharded, cluster-distributed inverted index
//! - Vector engine: in-memory flat cosine index with chunked ingest
//! - Hybrid orchestrator: keyword filter → semantic refine
//! - File-indexing coordinator: drive events → both engines, with quota and
//!   progress reporting
//! - Persistence: atomic JSON/NDJSON snapshots per tenant

pub mod cancel;
pub mod cluster;
pub mod config;
pub mod hybrid;
pub mod indexer;
pub mod metadata;
pub mod persist;
pub mod registry;
pub mod tfidf;
pub mod tokenize;
pub mod vector;

mod error;

pub use error::{RagError, Result};

// Primary public API
pub use cancel::CancelToken;
pub use cluster::{BusOptions, ClusterBus, LocalBus, RpcMessage};
pub use config::{EngineConfig, ModelParams, TenantId, TfIdfConfig};
pub use hybrid::{HybridOptions, HybridOutput, HybridResult, HybridSearcher};
pub use indexer::{Drive, FileEvent, FileIndexingCoordinator, IngestPlugin, LocalDrive, Quota, UsageLog};
pub use metadata::DocumentMetadata;
pub use persist::Persistence;
pub use registry::{TenantHandle, TenantRegistry};
pub use tfidf::{QueryOptions, ScoredDoc, TfIdfEngine};
pub use vector::{ChunkingParams, EmbedFn, VectorEngine, VectorEntry, VectorResult};

// Tokenizer building blocks for callers that customize the pipeline
pub mod tokenizers {
    pub use crate::tokenize::{detect_lang, StopwordStore, TextTokenizer};
}
