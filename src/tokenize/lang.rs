//! Script-based language detection
//!
//! Classifies a blob by counting the Unicode script of its characters. Good
//! enough to route text to the right segmenter and stemmer; tenants that need
//! exact tagging supply `langid` in metadata instead.

use unicode_script::{Script, UnicodeScript};

/// Detect the dominant language of `text`, returning an ISO 639-1 code.
///
/// Latin-script text falls back to `"en"`; empty input does too.
pub fn detect_lang(text: &str) -> &'static str {
    let mut han = 0usize;
    let mut kana = 0usize;
    let mut thai = 0usize;
    let mut hangul = 0usize;
    let mut cyrillic = 0usize;
    let mut latin = 0usize;

    for c in text.chars() {
        match c.script() {
            Script::Han => han += 1,
            Script::Hiragana | Script::Katakana => kana += 1,
            Script::Thai => thai += 1,
            Script::Hangul => hangul += 1,
            Script::Cyrillic => cyrillic += 1,
            Script::Latin => latin += 1,
            _ => {}
        }
    }

    // Kana anywhere means Japanese even when Han dominates.
    if kana > 0 && kana * 20 >= han {
        return "ja";
    }

    let max = han.max(thai).max(hangul).max(cyrillic).max(latin);
    if max == 0 {
        return "en";
    }
    if max == han {
        "zh"
    } else if max == thai {
        "th"
    } else if max == hangul {
        "ko"
    } else if max == cyrillic {
        "ru"
    } else {
        "en"
    }
}
