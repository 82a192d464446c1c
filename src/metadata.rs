//! Document metadata
//!
//! Tenant-attached key/value map carried by every indexed artifact. The
//! engines treat it as opaque apart from the well-known keys below.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Well-known metadata keys.
pub const KEY_DOCID: &str = "docid";
pub const KEY_LANGID: &str = "langid";
pub const KEY_CMSPATH: &str = "cmspath";
pub const KEY_FULLPATH: &str = "fullpath";
pub const KEY_REFERENCELINK: &str = "referencelink";
pub const KEY_CHUNK_ID: &str = "chunk_id";

/// Key/value metadata attached to documents and vector shards.
///
/// Backed by a `BTreeMap` so the serialized form (and therefore the identity
/// hash of docid-less metadata) is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentMetadata {
    entries: BTreeMap<String, String>,
}

impl DocumentMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Convenience accessor for the document id under a configurable key.
    pub fn docid(&self, docid_key: &str) -> Option<&str> {
        self.get(docid_key)
    }

    /// Identity of this metadata object: the value under `docid_key` when
    /// present, otherwise an MD5 digest of the case-folded map.
    ///
    /// Two metadata objects differing only in key/value casing hash the same,
    /// so re-uploads with cosmetic metadata edits keep their identity.
    pub fn hash_key(&self, docid_key: &str) -> String {
        if let Some(id) = self.get(docid_key) {
            return id.to_string();
        }
        let folded: BTreeMap<String, String> = self
            .entries
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.to_lowercase()))
            .collect();
        let json = serde_json::to_string(&folded).unwrap_or_default();
        format!("{:x}", md5::compute(json.as_bytes()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for DocumentMetadata {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}
