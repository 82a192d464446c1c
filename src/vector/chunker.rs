//! Separator-aware document splitter
//!
//! Cuts a document into chunks of at most `chunk_size` bytes, preferring to
//! end a chunk just after the last configured separator inside the window.
//! Adjacent chunks overlap by `overlap` bytes so context spanning a cut is
//! embedded on both sides.

/// Chunking parameters, usually lifted from `ModelParams`.
#[derive(Debug, Clone)]
pub struct ChunkingParams {
    pub chunk_size: usize,
    pub separators: Vec<String>,
    pub overlap: usize,
}

impl ChunkingParams {
    pub fn new(chunk_size: usize, separators: Vec<String>, overlap: usize) -> Self {
        Self {
            chunk_size,
            separators,
            overlap,
        }
    }
}

/// Result of one split pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitOutcome {
    pub chunks: Vec<String>,
    /// Trailing partial chunk, held back when the caller is stitching a
    /// stream and will prepend it to the next buffer.
    pub tail: Option<String>,
}

/// Largest char-boundary index `<= at`.
fn floor_char_boundary(s: &str, at: usize) -> usize {
    let mut i = at.min(s.len());
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Last separator occurrence strictly inside `window`, returned as the byte
/// index just past the separator (relative to the window start).
fn last_separator_end(window: &str, separators: &[String]) -> Option<usize> {
    separators
        .iter()
        .filter(|sep| !sep.is_empty())
        .filter_map(|sep| window.rfind(sep.as_str()).map(|i| i + sep.len()))
        .max()
}

/// Split `document` per the parameters. With `return_tail` the final partial
/// chunk is returned unemitted instead of becoming a chunk of its own.
pub fn split(document: &str, params: &ChunkingParams, return_tail: bool) -> SplitOutcome {
    let mut chunks = Vec::new();
    if document.is_empty() {
        return SplitOutcome { chunks, tail: None };
    }
    let chunk_size = params.chunk_size.max(1);
    let overlap = params.overlap.min(chunk_size.saturating_sub(1));

    let mut start = 0usize;
    loop {
        let remaining = &document[start..];
        if remaining.len() <= chunk_size {
            if return_tail {
                return SplitOutcome {
                    chunks,
                    tail: Some(remaining.to_string()),
                };
            }
            if !remaining.is_empty() {
                chunks.push(remaining.to_string());
            }
            return SplitOutcome { chunks, tail: None };
        }

        // Look backward from start + chunk_size for a separator to cut on;
        // fall back to a hard cut at the window edge.
        let window_end = floor_char_boundary(remaining, chunk_size);
        let window = &remaining[..window_end];
        let cut = match last_separator_end(window, &params.separators) {
            Some(end) if end > 0 => end,
            _ => window_end,
        };

        chunks.push(remaining[..cut].to_string());

        let advance = cut.saturating_sub(overlap).max(1);
        start += floor_char_boundary(remaining, advance).max(1);
    }
}
