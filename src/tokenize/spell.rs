//! Spell correction against the tenant vocabulary
//!
//! English-only typo tolerance for query tokens: a candidate replacement is
//! accepted only when it already exists in the shard's vocabulary, so
//! correction can never introduce a term the index has not seen.

use std::collections::HashSet;

/// Maximum edit distance a correction may span.
const MAX_EDIT_DISTANCE: usize = 2;

/// Words shorter than this are left alone; the distance budget would allow
/// nearly arbitrary rewrites.
const MIN_WORD_LEN: usize = 4;

/// Suggest an in-vocabulary replacement for `word`, or `None` when the word
/// is already known, too short, or nothing plausible exists.
pub fn correct(word: &str, vocabulary: &HashSet<String>) -> Option<String> {
    if word.len() < MIN_WORD_LEN || vocabulary.contains(word) {
        return None;
    }

    let mut best: Option<(f64, &String)> = None;
    for candidate in vocabulary {
        if candidate.len().abs_diff(word.len()) > MAX_EDIT_DISTANCE {
            continue;
        }
        if strsim::levenshtein(word, candidate) > MAX_EDIT_DISTANCE {
            continue;
        }
        let score = strsim::jaro_winkler(word, candidate);
        match best {
            Some((prev, _)) if prev >= score => {}
            _ => best = Some((score, candidate)),
        }
    }

    best.map(|(_, candidate)| candidate.clone())
}
