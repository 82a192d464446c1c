//! Tokenizer pipeline
//!
//! Turns a text blob plus an ISO language code into an ordered sequence of
//! normalized stems:
//!
//! ```text
//! segment → strip punctuation → lowercase → stop words → stem → spell-correct
//! ```
//!
//! The output is deterministic given the blob, the language, and the
//! vocabulary and stop-list snapshots passed in. Language is auto-detected
//! from the blob when absent.

pub mod lang;
pub mod segment;
pub mod spell;
pub mod stem;
pub mod stopwords;

pub use lang::detect_lang;
pub use stopwords::StopwordStore;

use stem::StemmerSet;
use std::collections::HashSet;
use std::sync::Arc;

/// Configurable tokenizer shared by one tenant's engines.
pub struct TextTokenizer {
    stopwords: StopwordStore,
    stemmers: StemmerSet,
    no_stemming: bool,
}

impl TextTokenizer {
    pub fn new(
        external_stopwords: Option<std::collections::HashMap<String, Vec<String>>>,
        no_stemming: bool,
    ) -> Self {
        Self {
            stopwords: StopwordStore::new(external_stopwords),
            stemmers: StemmerSet::new(),
            no_stemming,
        }
    }

    /// The stop-word store, for the ingest-side learning phase.
    pub fn stopwords(&self) -> &StopwordStore {
        &self.stopwords
    }

    /// Resolve the effective language: the caller's code, else detection.
    pub fn resolve_lang<'a>(&self, text: &str, lang: Option<&'a str>) -> &'a str {
        match lang {
            Some(l) if !l.is_empty() => l,
            _ => detect_lang(text),
        }
    }

    /// Run the full pipeline over `text`.
    ///
    /// `vocabulary` is the stem vocabulary of the owning shard; it gates
    /// spell-correction (English only) and is only consulted when
    /// `autocorrect` is set.
    pub fn tokenize(
        &self,
        text: &str,
        lang: &str,
        vocabulary: Option<&HashSet<String>>,
        autocorrect: bool,
    ) -> Vec<String> {
        let stop_list: Option<Arc<HashSet<String>>> = self.stopwords.snapshot(lang);

        let mut out = Vec::new();
        for raw in segment::segment(text, lang) {
            let trimmed: &str = raw.trim_matches(|c: char| !c.is_alphanumeric());
            if trimmed.is_empty() {
                continue;
            }
            let lowered = trimmed.to_lowercase();

            if let Some(list) = &stop_list {
                if list.contains(&lowered) {
                    continue;
                }
            }

            let stemmed = if self.no_stemming {
                lowered
            } else {
                self.stemmers.stem(&lowered, lang)
            };

            let token = match (autocorrect && lang == "en", vocabulary) {
                (true, Some(vocab)) => spell::correct(&stemmed, vocab).unwrap_or(stemmed),
                _ => stemmed,
            };
            out.push(token);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer_with(stop: &[&str]) -> TextTokenizer {
        let mut ext = std::collections::HashMap::new();
        ext.insert(
            "en".to_string(),
            stop.iter().map(|w| w.to_string()).collect::<Vec<_>>(),
        );
        TextTokenizer::new(Some(ext), false)
    }

    #[test]
    fn test_pipeline_stops_and_stems() {
        let tok = tokenizer_with(&["the", "over"]);
        let stems = tok.tokenize(
            "The quick brown fox jumps over the lazy dog",
            "en",
            None,
            false,
        );
        assert_eq!(stems, vec!["quick", "brown", "fox", "jump", "lazi", "dog"]);
    }

    #[test]
    fn test_punctuation_stripped() {
        let tok = TextTokenizer::new(None, true);
        let stems = tok.tokenize("hello, world! (really)", "en", None, false);
        assert_eq!(stems, vec!["hello", "world", "really"]);
    }

    #[test]
    fn test_no_stemming_flag() {
        let tok = TextTokenizer::new(None, true);
        let stems = tok.tokenize("jumping foxes", "en", None, false);
        assert_eq!(stems, vec!["jumping", "foxes"]);
    }

    #[test]
    fn test_autocorrect_against_vocabulary() {
        let tok = TextTokenizer::new(None, false);
        let vocab: HashSet<String> = ["quick", "fox"].iter().map(|s| s.to_string()).collect();
        let stems = tok.tokenize("quik fox", "en", Some(&vocab), true);
        assert_eq!(stems, vec!["quick", "fox"]);
    }

    #[test]
    fn test_autocorrect_ignored_for_non_english() {
        let tok = TextTokenizer::new(None, false);
        let vocab: HashSet<String> = ["быстрый".to_string()].into_iter().collect();
        let stems = tok.tokenize("быстрая", "ru", Some(&vocab), true);
        // Russian stems, but never spell-corrects.
        assert_eq!(stems.len(), 1);
        assert_ne!(stems[0], "быстрый");
    }

    #[test]
    fn test_resolve_lang_detection() {
        let tok = TextTokenizer::new(None, false);
        assert_eq!(tok.resolve_lang("plain text", None), "en");
        assert_eq!(tok.resolve_lang("ภาษาไทย", None), "th");
        assert_eq!(tok.resolve_lang("whatever", Some("de")), "de");
    }
}
