//! Cosine similarity
//!
//! Entry norms are computed once at ingest and cached on the entry, so a
//! query pays one dot product per candidate.

use crate::error::{RagError, Result};

/// Euclidean norm of `v`.
pub fn norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

/// Cosine similarity using precomputed norms. Zero-norm operands score 0.
///
/// Dimension mismatch is fatal to the calling operation.
pub fn cosine_with_norms(a: &[f64], norm_a: f64, b: &[f64], norm_b: f64) -> Result<f64> {
    if a.len() != b.len() {
        return Err(RagError::Validation(format!(
            "vector dimension mismatch: {} vs {}",
            a.len(),
            b.len()
        )));
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    Ok((dot / (norm_a * norm_b)).clamp(-1.0, 1.0))
}

/// Convenience form that computes both norms.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> Result<f64> {
    cosine_with_norms(a, norm(a), b, norm(b))
}
