//! Stop-word lists
//!
//! A tenant either supplies its lists per language or lets the shard derive
//! them from its own inverted index. Learning is an explicit phase driven by
//! the TF-IDF engine after ingest; tokenization only ever reads an immutable
//! snapshot, so a query and the ingest that races it see consistent lists.

use ahash::{HashMap, HashMapExt};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;

/// Minimum local document count before a list may be derived.
pub const LEARN_MIN_DOCS: usize = 5;

/// A word is a stop word when it appears in at least this share of documents.
pub const LEARN_DOC_RATIO: f64 = 0.95;

pub struct StopwordStore {
    /// Externally supplied lists, used verbatim and never overwritten.
    external: HashMap<String, Arc<HashSet<String>>>,

    /// Lists derived from the local shard, one per language.
    learned: RwLock<HashMap<String, Arc<HashSet<String>>>>,
}

impl StopwordStore {
    pub fn new(external: Option<std::collections::HashMap<String, Vec<String>>>) -> Self {
        let external = external
            .unwrap_or_default()
            .into_iter()
            .map(|(lang, words)| (lang, Arc::new(words.into_iter().collect::<HashSet<_>>())))
            .collect();
        Self {
            external,
            learned: RwLock::new(HashMap::new()),
        }
    }

    /// Immutable snapshot of the list for `lang`, external list first.
    pub fn snapshot(&self, lang: &str) -> Option<Arc<HashSet<String>>> {
        if let Some(list) = self.external.get(lang) {
            return Some(Arc::clone(list));
        }
        self.learned.read().get(lang).map(Arc::clone)
    }

    /// Whether any list (external or learned) exists for `lang`.
    pub fn has_list(&self, lang: &str) -> bool {
        self.external.contains_key(lang) || self.learned.read().contains_key(lang)
    }

    /// Derive the stop list for `lang` from document frequencies.
    ///
    /// No-op when an external list exists, when one was already learned, or
    /// when the shard is still below [`LEARN_MIN_DOCS`]. `doc_freq` yields
    /// `(word, number of documents containing it)` over the inverted index.
    pub fn learn<I>(&self, lang: &str, total_docs: usize, doc_freq: I)
    where
        I: IntoIterator<Item = (String, usize)>,
    {
        if self.has_list(lang) || total_docs < LEARN_MIN_DOCS {
            return;
        }
        let threshold = (total_docs as f64 * LEARN_DOC_RATIO).ceil() as usize;
        let list: HashSet<String> = doc_freq
            .into_iter()
            .filter(|(_, df)| *df >= threshold)
            .map(|(word, _)| word)
            .collect();
        log::debug!(
            "learned {} stop words for '{}' from {} docs",
            list.len(),
            lang,
            total_docs
        );
        self.learned.write().insert(lang.to_string(), Arc::new(list));
    }
}
