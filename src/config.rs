//! Engine configuration
//!
//! Provides flexible configuration options for balancing recall, latency and
//! cluster behavior. All structs are serde round-trippable so deployments can
//! ship them as JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Scope of one pair of indexes: `(user, org, application)`.
///
/// Every index the engine owns is keyed by a tenant; cross-tenant reads are
/// rejected at the registry boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId {
    pub user_id: String,
    pub org: String,
    pub app_id: String,
}

impl TenantId {
    pub fn new(
        user_id: impl Into<String>,
        org: impl Into<String>,
        app_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            org: org.into(),
            app_id: app_id.into(),
        }
    }

    /// Directory name for this tenant under the storage root.
    pub fn dir_name(&self) -> String {
        format!("{}_{}_{}", self.user_id, self.org, self.app_id)
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.user_id, self.org, self.app_id)
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Snapshot dirty indexes on a timer.
    pub autosave: bool,

    /// Autosave period in milliseconds.
    pub autosave_frequency_ms: u64,

    /// Participate in cluster-distributed queries and mutation broadcasts.
    pub distributed: bool,

    /// Upper bound for any single cluster RPC, in milliseconds. On expiry the
    /// caller degrades to its local view.
    pub cluster_timeout_ms: u64,

    /// Fan vector search out over a worker pool (`cores - 1` ranges).
    pub multithreaded: bool,

    /// Languages for which keyword search is preferred over vector search.
    pub tfidf_search_langs: Vec<String>,

    /// Per-AI-model retrieval parameters, keyed by model name.
    pub models: HashMap<String, ModelParams>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            autosave: true,
            autosave_frequency_ms: 30_000,
            distributed: false,
            cluster_timeout_ms: 2_000,
            multithreaded: false,
            tfidf_search_langs: vec!["ja".into(), "zh".into(), "th".into()],
            models: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Single-node configuration without background snapshots. Used by tests.
    pub fn for_testing() -> Self {
        Self {
            autosave: false,
            distributed: false,
            ..Default::default()
        }
    }

    /// Cluster member configuration.
    pub fn for_cluster(timeout_ms: u64) -> Self {
        Self {
            distributed: true,
            cluster_timeout_ms: timeout_ms,
            ..Default::default()
        }
    }

    /// Parameters for a model, falling back to defaults for unknown names.
    pub fn model_params(&self, model: &str) -> ModelParams {
        self.models.get(model).cloned().unwrap_or_default()
    }
}

/// Retrieval parameters tied to one embeddings model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelParams {
    /// Candidate documents taken from the keyword stage.
    pub top_k_tfidf: usize,

    /// Relative score cutoff for the keyword stage, in `[0, 1]`.
    pub cutoff_score_tfidf: f64,

    /// Shards returned from the vector stage.
    pub top_k_vectors: usize,

    /// Minimum cosine similarity for a vector hit.
    pub min_distance_vectors: f64,

    /// Ingest chunk size in bytes.
    pub chunk_size: usize,

    /// Separators the chunker may cut on, in preference order.
    pub split_separators: Vec<String>,

    /// Overlap between adjacent chunks in bytes.
    pub overlap: usize,

    /// Embeddings model identifier, passed through to the embedder.
    pub embeddings_model: String,

    /// Text encoding of the drive files.
    pub encoding: String,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            top_k_tfidf: 25,
            cutoff_score_tfidf: 0.6,
            top_k_vectors: 5,
            min_distance_vectors: 0.5,
            chunk_size: 1_000,
            split_separators: vec![".".into(), "?".into(), "!".into(), "\n".into()],
            overlap: 50,
            embeddings_model: "text-embedding-3-small".into(),
            encoding: "utf-8".into(),
        }
    }
}

/// Per-tenant TF-IDF shard configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TfIdfConfig {
    /// Metadata key carrying the stable document id.
    pub docid_key: String,

    /// Metadata key carrying the ISO language code.
    pub langid_key: String,

    /// Skip stemming entirely (exact-term tenants).
    pub no_stemming: bool,

    /// Externally supplied stop-word lists, ISO code → words. When absent the
    /// shard derives lists once it holds enough documents.
    pub stopwords: Option<HashMap<String, Vec<String>>>,

    /// Mirrors `EngineConfig::distributed` for the owning engine.
    pub distributed: bool,
}

impl Default for TfIdfConfig {
    fn default() -> Self {
        Self {
            docid_key: "docid".into(),
            langid_key: "langid".into(),
            no_stemming: false,
            stopwords: None,
            distributed: false,
        }
    }
}
