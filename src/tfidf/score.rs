//! Scoring knobs and result records for the keyword query

use crate::metadata::DocumentMetadata;
use serde::{Deserialize, Serialize};

/// Default ceiling of the query-coordination boost.
pub const DEFAULT_MAX_COORD_BOOST: f64 = 0.10;

/// How term frequency is adjusted for document length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LengthAdjustment {
    /// Raw TF, no adjustment.
    #[default]
    None,
    /// BM25 variant: multiply TF by `avg_local_len / doc_len`.
    Bm25,
    /// Small-document penalty: `1 - (1 - min(doc_len/avg, 1))^2`.
    PunishSmall,
}

impl LengthAdjustment {
    pub fn factor(&self, doc_len: usize, avg_len: f64) -> f64 {
        if doc_len == 0 || avg_len <= 0.0 {
            return 0.0;
        }
        match self {
            LengthAdjustment::None => 1.0,
            LengthAdjustment::Bm25 => avg_len / doc_len as f64,
            LengthAdjustment::PunishSmall => {
                let ratio = (doc_len as f64 / avg_len).min(1.0);
                1.0 - (1.0 - ratio).powi(2)
            }
        }
    }
}

/// Per-query scoring options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOptions {
    pub length_adjustment: LengthAdjustment,

    /// Disable the coordination boost entirely.
    pub ignore_coord: bool,

    /// Ceiling of the coordination boost.
    pub max_coord_boost: f64,

    /// Score with IDF pinned to 1.
    pub no_idf: bool,

    /// Apply the metadata filter after scoring instead of before.
    pub filter_metadata_last: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            length_adjustment: LengthAdjustment::None,
            ignore_coord: false,
            max_coord_boost: DEFAULT_MAX_COORD_BOOST,
            no_idf: false,
            filter_metadata_last: false,
        }
    }
}

impl QueryOptions {
    pub fn bm25() -> Self {
        Self {
            length_adjustment: LengthAdjustment::Bm25,
            ..Default::default()
        }
    }

    pub fn coord_multiplier(&self, found: usize, total: usize) -> f64 {
        if self.ignore_coord || total == 0 {
            return 1.0;
        }
        1.0 + self.max_coord_boost * (found as f64 / total as f64)
    }
}

/// One scored hit from the keyword stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredDoc {
    pub metadata: DocumentMetadata,

    /// Final score: `tfidf_score × coord_score`.
    pub score: f64,

    /// Coordination multiplier that was applied.
    pub coord_score: f64,

    /// Sum of length-adjusted term frequencies, before IDF.
    pub tf_score: f64,

    /// Score before the coordination boost (`score / coord_score`).
    pub tfidf_score: f64,

    pub query_tokens_found: usize,
    pub total_query_tokens: usize,

    /// `score / highest_query_score`; what the relative cutoff compares.
    pub cutoff_scaled_score: f64,

    /// Best score in this result set.
    pub highest_query_score: f64,
}
