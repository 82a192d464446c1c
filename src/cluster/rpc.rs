//! Typed cluster messages
//!
//! Cross-node traffic is a closed set of verbs with typed payloads; a peer
//! dispatches on the variant instead of calling functions by name. Every
//! index-addressed verb carries [`CreationData`] so the receiving node can
//! resolve (or reopen) the right tenant handle before executing.

use crate::config::{TenantId, TfIdfConfig};
use crate::metadata::DocumentMetadata;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Everything a peer needs to materialize a tenant handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreationData {
    pub tenant: TenantId,
    pub tfidf: TfIdfConfig,
}

/// Progress blackboard update, broadcast by the file-indexing coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub user_id: String,
    pub org: String,
    pub cmspath: String,
    pub fullpath: String,
    /// `processing` | `progress` | `processed`.
    pub kind: String,
    /// Pipeline step just finished, for percent computation.
    pub step_num: usize,
    pub total_steps: usize,
    /// Terminal outcome; `None` while still in flight.
    pub result: Option<bool>,
    /// Origin event, e.g. `file_created`.
    pub subtype: String,
}

impl ProgressUpdate {
    /// Blackboard key: `(id,org)/cmspath`.
    pub fn board_key(&self) -> String {
        format!("{},{}/{}", self.user_id, self.org, self.cmspath)
    }

    pub fn percent(&self) -> u8 {
        if self.total_steps == 0 {
            return 0;
        }
        ((self.step_num as f64 / self.total_steps as f64) * 100.0).round() as u8
    }
}

/// The closed verb set carried by the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcMessage {
    /// Ask peers for their postings for the given stems.
    QueryPostings {
        creation: CreationData,
        words: Vec<String>,
    },
    /// Reply: stem → (docid → term frequency) from one peer's local shard.
    QueryPostingsReply {
        postings: HashMap<String, HashMap<String, u32>>,
    },

    /// Ask peers for the docids they hold for a tenant.
    CountDocs { creation: CreationData },
    CountDocsReply { docids: Vec<String> },

    /// Execute a delete on the receiving node's local shard.
    ApplyDelete {
        creation: CreationData,
        metadata: DocumentMetadata,
    },

    /// Execute a metadata rewrite on the receiving node's local shard.
    ApplyUpdate {
        creation: CreationData,
        old_metadata: DocumentMetadata,
        new_metadata: DocumentMetadata,
    },

    /// File-indexing progress for the shared blackboard.
    Progress(ProgressUpdate),

    /// Generic acknowledgement.
    Ack,
}

/// Well-known topics.
pub mod topics {
    /// Cross-node query verbs (`QueryPostings`, `CountDocs`).
    pub const TFIDF_RPC: &str = "tfidf.functioncall";
    /// Delete broadcasts.
    pub const TFIDF_RMDOC: &str = "tfidf.rmdoc";
    /// Update broadcasts.
    pub const TFIDF_UPDATEDOC: &str = "tfidf.updatedoc";
    /// File-indexing progress fan-out.
    pub const FILE_PROCESSING: &str = "aidb.file.processing";
    pub const FILE_PROGRESS: &str = "aidb.file.progress";
    pub const FILE_PROCESSED: &str = "aidb.file.processed";
}
