//! Per-language word segmentation
//!
//! Chinese uses the jieba plugin when the `tokenizer-jieba` feature is on,
//! mirroring the optional-plugin layout of the rest of the tokenizer stack.
//! Japanese and Thai go through UAX-29 word boundaries; everything else is
//! split on whitespace, commas and periods.

use unicode_segmentation::UnicodeSegmentation;

/// Split `text` into raw word candidates for `lang`.
///
/// Output is unnormalized: casing and surrounding punctuation are handled by
/// the pipeline stages after segmentation.
pub fn segment(text: &str, lang: &str) -> Vec<String> {
    match lang {
        "zh" => segment_zh(text),
        "ja" | "th" => text.unicode_words().map(str::to_string).collect(),
        _ => text
            .split(|c: char| c.is_whitespace() || c == ',' || c == '.')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    }
}

#[cfg(feature = "tokenizer-jieba")]
fn segment_zh(text: &str) -> Vec<String> {
    use std::sync::OnceLock;
    static JIEBA: OnceLock<jieba_rs::Jieba> = OnceLock::new();
    let jieba = JIEBA.get_or_init(jieba_rs::Jieba::new);

    jieba
        .cut_for_search(text, false)
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(not(feature = "tokenizer-jieba"))]
fn segment_zh(text: &str) -> Vec<String> {
    // Without the plugin, UAX-29 yields one word per Han character, which
    // still indexes and matches consistently.
    text.unicode_words().map(str::to_string).collect()
}
