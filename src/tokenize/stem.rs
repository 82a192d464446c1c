//! Per-language stemming
//!
//! Snowball stemmers for the languages the engine ships dictionaries for;
//! identity for everything else (CJK segments are already minimal units).

use rust_stemmers::{Algorithm, Stemmer};
use std::collections::HashMap;

/// Holds one lazily-built Snowball stemmer per supported language.
pub struct StemmerSet {
    stemmers: HashMap<&'static str, Stemmer>,
}

impl Default for StemmerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl StemmerSet {
    pub fn new() -> Self {
        let mut stemmers = HashMap::new();
        for (lang, algo) in [
            ("en", Algorithm::English),
            ("es", Algorithm::Spanish),
            ("ru", Algorithm::Russian),
            ("fr", Algorithm::French),
            ("de", Algorithm::German),
        ] {
            stemmers.insert(lang, Stemmer::create(algo));
        }
        Self { stemmers }
    }

    /// Stem `word` for `lang`, returning the word unchanged for languages
    /// without a stemmer.
    pub fn stem(&self, word: &str, lang: &str) -> String {
        match self.stemmers.get(lang) {
            Some(stemmer) => stemmer.stem(word).to_string(),
            None => word.to_string(),
        }
    }

    pub fn supports(&self, lang: &str) -> bool {
        self.stemmers.contains_key(lang)
    }
}
