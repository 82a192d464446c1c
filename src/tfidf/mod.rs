//! TF-IDF keyword engine
//!
//! Sharded inverted index with streaming ingest, cluster-merged queries and
//! configurable scoring (raw TF-IDF, BM25 length adjustment, small-document
//! penalty, query-coordination boost).

pub mod engine;
pub mod posting;
pub mod score;

pub use engine::{MetadataFilter, TfIdfEngine, TfIdfStats};
pub use posting::{DocId, MergedPostings, TfIdfDocument, WordPosting};
pub use score::{LengthAdjustment, QueryOptions, ScoredDoc, DEFAULT_MAX_COORD_BOOST};
