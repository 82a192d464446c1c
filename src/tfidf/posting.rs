//! Posting lists and document records for the keyword shard

use crate::metadata::DocumentMetadata;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Stable, opaque document identifier.
pub type DocId = String;

/// One record per distinct stem in the local shard: which documents contain
/// the stem and how often. Counts are strictly positive; a count that would
/// reach zero removes the entry instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WordPosting {
    pub word: String,
    pub docs: HashMap<DocId, u32>,
}

impl WordPosting {
    pub fn new(word: impl Into<String>) -> Self {
        Self {
            word: word.into(),
            docs: HashMap::new(),
        }
    }

    pub fn increment(&mut self, docid: &str, by: u32) {
        *self.docs.entry(docid.to_string()).or_insert(0) += by;
    }

    pub fn remove_doc(&mut self, docid: &str) -> bool {
        self.docs.remove(docid).is_some()
    }

    /// Move the count filed under `old` to `new`, keeping the value.
    pub fn rekey_doc(&mut self, old: &str, new: &str) {
        if let Some(count) = self.docs.remove(old) {
            self.docs.insert(new.to_string(), count);
        }
    }

    /// Document frequency of this stem in the local shard.
    pub fn doc_count(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

/// A document as the keyword shard sees it. Created on ingest, replaced by
/// update, destroyed on delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TfIdfDocument {
    pub metadata: DocumentMetadata,
    /// Token count after normalization; the denominator of raw TF.
    pub length: usize,
    pub date_created: u64,
    pub date_modified: u64,
}

impl TfIdfDocument {
    pub fn new(metadata: DocumentMetadata, length: usize) -> Self {
        let now = epoch_secs();
        Self {
            metadata,
            length,
            date_created: now,
            date_modified: now,
        }
    }
}

pub(crate) fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Postings for the query's stems after merging local and peer views.
///
/// Merge rule: a docid held locally keeps its local count untouched; counts
/// for docids only peers hold are summed across peers.
#[derive(Debug, Default)]
pub struct MergedPostings {
    /// stem → (docid → term frequency)
    pub words: HashMap<String, HashMap<DocId, u32>>,
}

impl MergedPostings {
    /// Seed with the local shard's postings for the query stems.
    pub fn from_local<'a>(postings: impl Iterator<Item = &'a WordPosting>) -> Self {
        let mut words = HashMap::new();
        for p in postings {
            words.insert(p.word.clone(), p.docs.clone());
        }
        Self { words }
    }

    /// Fold one peer's postings in. `is_local` reports whether a docid exists
    /// in the local doc store (local wins).
    pub fn merge_peer(
        &mut self,
        peer: HashMap<String, HashMap<DocId, u32>>,
        is_local: impl Fn(&str) -> bool,
    ) {
        for (word, docs) in peer {
            let slot = self.words.entry(word).or_default();
            for (docid, count) in docs {
                if is_local(&docid) {
                    continue;
                }
                *slot.entry(docid).or_insert(0) += count;
            }
        }
    }

    /// Document frequency of `word` in the merged view.
    pub fn doc_freq(&self, word: &str) -> usize {
        self.words.get(word).map(|d| d.len()).unwrap_or(0)
    }

    /// Union of docids across all merged postings.
    pub fn candidate_docids(&self) -> Vec<DocId> {
        let mut seen = std::collections::HashSet::new();
        for docs in self.words.values() {
            for docid in docs.keys() {
                seen.insert(docid.clone());
            }
        }
        seen.into_iter().collect()
    }

    pub fn count(&self, word: &str, docid: &str) -> u32 {
        self.words
            .get(word)
            .and_then(|d| d.get(docid))
            .copied()
            .unwrap_or(0)
    }
}
