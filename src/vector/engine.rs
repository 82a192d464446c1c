//! Flat cosine-similarity vector engine
//!
//! Exhaustive in-memory index over f64 vectors, one per ingested text shard.
//! Entries are addressed by the SHA-1 of their vector; the shard text lives
//! beside the entry and is persisted as its own file. Search is a full scan,
//! optionally fanned out over a worker pool.

use crate::cancel::CancelToken;
use crate::config::TenantId;
use crate::error::{RagError, Result};
use crate::metadata::{DocumentMetadata, KEY_CHUNK_ID};
use crate::vector::chunker::{self, ChunkingParams};
use crate::vector::similarity::{cosine_with_norms, norm};
use parking_lot::RwLock;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Embedding callback: text in, fixed-dimension vector out, `None` on
/// embedder failure.
pub type EmbedFn = dyn Fn(&str) -> Option<Vec<f64>> + Send + Sync;

/// Metadata filter used by queries and cascades.
pub type VectorFilter = dyn Fn(&DocumentMetadata) -> bool + Send + Sync;

/// One indexed vector with its precomputed norm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorEntry {
    pub vector: Vec<f64>,
    pub hash: String,
    pub metadata: DocumentMetadata,
    /// Euclidean norm, fixed for the entry's lifetime.
    pub length: f64,
}

/// One similarity hit.
#[derive(Debug, Clone)]
pub struct VectorResult {
    pub hash: String,
    pub metadata: DocumentMetadata,
    pub similarity: f64,
    pub text: Option<String>,
}

/// Outcome of one `ingest` call.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    /// Hashes of the vectors created, in chunk order.
    pub hashes: Vec<String>,
    /// Unemitted trailing chunk when tail return was requested.
    pub tail: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VectorStats {
    pub total_vectors: usize,
    pub dimension: Option<usize>,
}

#[derive(Default)]
struct VectorState {
    index: HashMap<String, VectorEntry>,
    /// Text shards addressed by vector hash. Every entry in `index` has a
    /// record here; delete removes both.
    texts: HashMap<String, String>,
    dimension: Option<usize>,
}

pub struct VectorEngine {
    tenant: TenantId,
    state: RwLock<VectorState>,
    embedder: Arc<EmbedFn>,
    multithreaded: bool,
    /// When set, text shards are written through to disk as they are created.
    shard_dir: RwLock<Option<PathBuf>>,
    dirty: AtomicBool,
    inconsistent: AtomicBool,
}

/// SHA-1 over the vector's little-endian f64 bytes.
pub fn vector_hash(vector: &[f64]) -> String {
    let mut hasher = Sha1::new();
    for value in vector {
        hasher.update(value.to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}

impl VectorEngine {
    pub fn new(tenant: TenantId, embedder: Arc<EmbedFn>, multithreaded: bool) -> Self {
        Self {
            tenant,
            state: RwLock::new(VectorState::default()),
            embedder,
            multithreaded,
            shard_dir: RwLock::new(None),
            dirty: AtomicBool::new(false),
            inconsistent: AtomicBool::new(false),
        }
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Attach the directory text shards are written through to.
    pub fn attach_storage(&self, dir: PathBuf) {
        *self.shard_dir.write() = Some(dir);
    }

    fn text_shard_path(&self, hash: &str) -> Option<PathBuf> {
        self.shard_dir
            .read()
            .as_ref()
            .map(|dir| dir.join(format!("text_{}.txt", hash)))
    }

    fn check_dimension(state: &mut VectorState, vector: &[f64]) -> Result<()> {
        if vector.is_empty() {
            return Err(RagError::Validation("empty vector".into()));
        }
        match state.dimension {
            Some(d) if d != vector.len() => Err(RagError::Validation(format!(
                "vector dimension {} does not match index dimension {}",
                vector.len(),
                d
            ))),
            Some(_) => Ok(()),
            None => {
                state.dimension = Some(vector.len());
                Ok(())
            }
        }
    }

    //=========================================================================
    // CRUD
    //=========================================================================

    /// Add one vector with its text shard. The vector is generated through
    /// the embedder when not supplied. No-op when the hash already exists.
    ///
    /// The text shard is persisted first; a shard write failure leaves the
    /// index untouched.
    pub fn create(
        &self,
        vector: Option<Vec<f64>>,
        metadata: DocumentMetadata,
        text: &str,
    ) -> Result<String> {
        let vector = match vector {
            Some(v) => v,
            None => (self.embedder)(text).ok_or_else(|| {
                RagError::Embedding(format!("{}: embedder returned null", self.tenant))
            })?,
        };
        let hash = vector_hash(&vector);

        let mut state = self.state.write();
        if state.index.contains_key(&hash) {
            return Ok(hash);
        }
        Self::check_dimension(&mut state, &vector)?;

        if let Some(path) = self.text_shard_path(&hash) {
            crate::persist::atomic_write(&path, text.as_bytes())?;
        }

        let length = norm(&vector);
        state.texts.insert(hash.clone(), text.to_string());
        state.index.insert(
            hash.clone(),
            VectorEntry {
                vector,
                hash: hash.clone(),
                metadata,
                length,
            },
        );
        drop(state);
        self.dirty.store(true, Ordering::SeqCst);
        Ok(hash)
    }

    /// Exact lookup by vector.
    pub fn read(&self, vector: &[f64], with_text: bool) -> Option<(VectorEntry, Option<String>)> {
        let hash = vector_hash(vector);
        let state = self.state.read();
        let entry = state.index.get(&hash)?.clone();
        let text = if with_text {
            state.texts.get(&hash).cloned()
        } else {
            None
        };
        Some((entry, text))
    }

    /// Replace the entry addressed by `old_vector` with a re-embedded shard.
    ///
    /// The old entry is snapshotted and restored on any failure, including
    /// the embedder returning null.
    pub fn update(
        &self,
        old_vector: &[f64],
        metadata: DocumentMetadata,
        text: &str,
    ) -> Result<String> {
        let old_hash = vector_hash(old_vector);
        let snapshot = {
            let state = self.state.read();
            match state.index.get(&old_hash) {
                Some(entry) => (entry.clone(), state.texts.get(&old_hash).cloned()),
                None => {
                    return Err(RagError::NotFound(format!(
                        "vector '{}' not in index",
                        old_hash
                    )))
                }
            }
        };

        // Embed before touching anything: a null embedding must leave the
        // original entry readable.
        let new_vector = (self.embedder)(text).ok_or_else(|| {
            RagError::Embedding(format!("{}: embedder returned null during update", self.tenant))
        })?;

        let replaced = self
            .delete(old_vector)
            .and_then(|_| self.create(Some(new_vector), metadata, text));
        match replaced {
            Ok(hash) => Ok(hash),
            Err(e) => {
                self.restore_entry(&old_hash, snapshot);
                Err(e)
            }
        }
    }

    /// Put a snapshotted entry back, text shard file included.
    fn restore_entry(&self, old_hash: &str, snapshot: (VectorEntry, Option<String>)) {
        let (entry, text) = snapshot;
        if let (Some(t), Some(path)) = (&text, self.text_shard_path(old_hash)) {
            if let Err(e) = crate::persist::atomic_write(&path, t.as_bytes()) {
                log::error!(
                    "{}: could not restore text shard '{}': {}",
                    self.tenant,
                    old_hash,
                    e
                );
                self.inconsistent.store(true, Ordering::SeqCst);
            }
        }
        let mut state = self.state.write();
        if state.dimension.is_none() {
            state.dimension = Some(entry.vector.len());
        }
        if let Some(t) = text {
            state.texts.insert(old_hash.to_string(), t);
        }
        state.index.insert(old_hash.to_string(), entry);
        drop(state);
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Remove an entry and its text shard.
    pub fn delete(&self, vector: &[f64]) -> Result<bool> {
        self.delete_hash(&vector_hash(vector))
    }

    pub fn delete_hash(&self, hash: &str) -> Result<bool> {
        let removed = {
            let mut state = self.state.write();
            let removed = state.index.remove(hash).is_some();
            state.texts.remove(hash);
            if state.index.is_empty() {
                state.dimension = None;
            }
            removed
        };
        if removed {
            if let Some(path) = self.text_shard_path(hash) {
                if path.exists() {
                    std::fs::remove_file(&path)?;
                }
            }
            self.dirty.store(true, Ordering::SeqCst);
        }
        Ok(removed)
    }

    /// Text shard of an entry.
    pub fn text_of(&self, hash: &str) -> Option<String> {
        self.state.read().texts.get(hash).cloned()
    }

    /// Metadata of an entry.
    pub fn metadata_of(&self, hash: &str) -> Option<DocumentMetadata> {
        self.state.read().index.get(hash).map(|e| e.metadata.clone())
    }

    /// Hashes of entries whose metadata matches `filter`.
    pub fn find_hashes(&self, filter: &VectorFilter) -> Vec<String> {
        self.state
            .read()
            .index
            .values()
            .filter(|e| filter(&e.metadata))
            .map(|e| e.hash.clone())
            .collect()
    }

    /// Rewrite metadata in place on every matching entry. Returns how many
    /// entries were touched.
    pub fn rewrite_metadata(
        &self,
        filter: &VectorFilter,
        mutate: &(dyn Fn(&mut DocumentMetadata) + Sync),
    ) -> usize {
        let mut state = self.state.write();
        let mut touched = 0;
        for entry in state.index.values_mut() {
            if filter(&entry.metadata) {
                mutate(&mut entry.metadata);
                touched += 1;
            }
        }
        drop(state);
        if touched > 0 {
            self.dirty.store(true, Ordering::SeqCst);
        }
        touched
    }

    //=========================================================================
    // Query
    //=========================================================================

    /// Exhaustive similarity search.
    pub fn query(
        &self,
        target: &[f64],
        top_k: Option<usize>,
        min_distance: Option<f64>,
        filter: Option<&VectorFilter>,
        with_text: bool,
        filter_after: bool,
    ) -> Result<Vec<VectorResult>> {
        self.query_with_cancel(target, top_k, min_distance, filter, with_text, filter_after, None)
    }

    /// Like [`VectorEngine::query`], but a tripped token aborts the fan-out
    /// early and returns the partially scored results.
    #[allow(clippy::too_many_arguments)]
    pub fn query_with_cancel(
        &self,
        target: &[f64],
        top_k: Option<usize>,
        min_distance: Option<f64>,
        filter: Option<&VectorFilter>,
        with_text: bool,
        filter_after: bool,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<VectorResult>> {
        let state = self.state.read();
        if let Some(d) = state.dimension {
            if d != target.len() {
                return Err(RagError::Validation(format!(
                    "query dimension {} does not match index dimension {}",
                    target.len(),
                    d
                )));
            }
        }
        let target_norm = norm(target);

        let candidates: Vec<&VectorEntry> = state
            .index
            .values()
            .filter(|e| match (filter, filter_after) {
                (Some(f), false) => f(&e.metadata),
                _ => true,
            })
            .collect();

        let cancelled = || cancel.map(|t| t.is_cancelled()).unwrap_or(false);
        let mut scored: Vec<(f64, &VectorEntry)> = if self.multithreaded && candidates.len() > 1 {
            // One contiguous range per worker, cores - 1 workers. A tripped
            // cancel token makes the remaining ranges return nothing.
            let workers = std::thread::available_parallelism()
                .map(|n| n.get().saturating_sub(1))
                .unwrap_or(1)
                .max(1);
            let range = candidates.len().div_ceil(workers);
            candidates
                .par_chunks(range)
                .map(|chunk| {
                    if cancelled() {
                        return Ok(Vec::new());
                    }
                    chunk
                        .iter()
                        .map(|e| {
                            cosine_with_norms(target, target_norm, &e.vector, e.length)
                                .map(|sim| (sim, *e))
                        })
                        .collect::<Result<Vec<_>>>()
                })
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .flatten()
                .collect()
        } else {
            let mut scored = Vec::with_capacity(candidates.len());
            for e in &candidates {
                if cancelled() {
                    break;
                }
                let sim = cosine_with_norms(target, target_norm, &e.vector, e.length)?;
                scored.push((sim, *e));
            }
            scored
        };

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        if let Some(min) = min_distance {
            scored.retain(|(sim, _)| *sim >= min);
        }
        if filter_after {
            if let Some(f) = filter {
                scored.retain(|(_, e)| f(&e.metadata));
            }
        }
        if let Some(k) = top_k {
            scored.truncate(k);
        }

        let results = scored
            .into_iter()
            .map(|(sim, e)| VectorResult {
                hash: e.hash.clone(),
                metadata: e.metadata.clone(),
                similarity: sim,
                text: if with_text {
                    state.texts.get(&e.hash).cloned()
                } else {
                    None
                },
            })
            .collect();
        Ok(results)
    }

    //=========================================================================
    // Ingest
    //=========================================================================

    /// Chunk `document`, embed each chunk and add it under `metadata` plus a
    /// running chunk index (starting at `chunk_offset`). Any failure rolls
    /// back every vector this call created.
    pub fn ingest(
        &self,
        metadata: &DocumentMetadata,
        document: &str,
        params: &ChunkingParams,
        return_tail: bool,
        chunk_offset: usize,
    ) -> Result<IngestOutcome> {
        let outcome = chunker::split(document, params, return_tail);
        let mut created: Vec<String> = Vec::new();

        for (i, chunk) in outcome.chunks.iter().enumerate() {
            let mut chunk_meta = metadata.clone();
            chunk_meta.set(KEY_CHUNK_ID, (chunk_offset + i).to_string());

            match self.create(None, chunk_meta, chunk) {
                Ok(hash) => created.push(hash),
                Err(e) => {
                    self.rollback(&created);
                    return Err(e);
                }
            }
        }

        Ok(IngestOutcome {
            hashes: created,
            tail: outcome.tail,
        })
    }

    /// Streaming ingest: buffer until at least one chunk fits, ingest with
    /// tail return, stitch the tail onto the next buffer, flush the remainder
    /// at end of stream. All vectors created by the call are rolled back on
    /// failure or cancellation.
    pub fn ingest_stream<R: Read>(
        &self,
        metadata: &DocumentMetadata,
        mut reader: R,
        params: &ChunkingParams,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<String>> {
        let mut created: Vec<String> = Vec::new();
        let mut pending_bytes: Vec<u8> = Vec::new();
        let mut buffer = String::new();
        let mut chunk_offset = 0usize;
        let mut read_buf = vec![0u8; 64 * 1024];

        let run = (|| -> Result<()> {
            loop {
                if let Some(token) = cancel {
                    if token.is_cancelled() {
                        return Err(RagError::Cancelled("vector ingest cancelled".into()));
                    }
                }
                let n = reader.read(&mut read_buf)?;
                if n == 0 {
                    break;
                }
                pending_bytes.extend_from_slice(&read_buf[..n]);
                let valid_up_to = match std::str::from_utf8(&pending_bytes) {
                    Ok(_) => pending_bytes.len(),
                    Err(e) => e.valid_up_to(),
                };
                if valid_up_to == 0 {
                    continue;
                }
                buffer.push_str(&String::from_utf8_lossy(&pending_bytes[..valid_up_to]));
                pending_bytes.drain(..valid_up_to);

                if buffer.len() < params.chunk_size {
                    continue;
                }
                let outcome = self.ingest(metadata, &buffer, params, true, chunk_offset)?;
                chunk_offset += outcome.hashes.len();
                created.extend(outcome.hashes);
                buffer = outcome.tail.unwrap_or_default();
            }

            if !pending_bytes.is_empty() {
                return Err(RagError::Validation("stream is not valid UTF-8".into()));
            }
            if !buffer.is_empty() {
                let outcome = self.ingest(metadata, &buffer, params, false, chunk_offset)?;
                created.extend(outcome.hashes);
            }
            Ok(())
        })();

        match run {
            Ok(()) => Ok(created),
            Err(e) => {
                self.rollback(&created);
                Err(e)
            }
        }
    }

    /// Best-effort removal of vectors created by a failed ingest. A failure
    /// inside the rollback itself marks the index inconsistent.
    fn rollback(&self, hashes: &[String]) {
        for hash in hashes {
            if let Err(e) = self.delete_hash(hash) {
                log::error!("{}: rollback failed for '{}': {}", self.tenant, hash, e);
                self.inconsistent.store(true, Ordering::SeqCst);
            }
        }
    }

    //=========================================================================
    // Maintenance / persistence surface
    //=========================================================================

    pub fn stats(&self) -> VectorStats {
        let state = self.state.read();
        VectorStats {
            total_vectors: state.index.len(),
            dimension: state.dimension,
        }
    }

    pub fn len(&self) -> usize {
        self.state.read().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().index.is_empty()
    }

    pub fn mark_inconsistent(&self) {
        self.inconsistent.store(true, Ordering::SeqCst);
    }

    pub fn is_inconsistent(&self) -> bool {
        self.inconsistent.load(Ordering::SeqCst)
    }

    /// Consistent export for snapshots: entries plus text shards.
    pub fn export(&self) -> (Vec<VectorEntry>, HashMap<String, String>) {
        let state = self.state.read();
        (
            state.index.values().cloned().collect(),
            state.texts.clone(),
        )
    }

    /// Replace engine contents from a snapshot.
    pub fn import(&self, entries: Vec<VectorEntry>, texts: HashMap<String, String>) {
        let mut state = self.state.write();
        state.dimension = entries.first().map(|e| e.vector.len());
        state.index = entries.into_iter().map(|e| (e.hash.clone(), e)).collect();
        state.texts = texts;
        self.dirty.store(false, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::KEY_DOCID;

    /// Deterministic fake embedder: hashes words into a small dense vector.
    fn test_embedder() -> Arc<EmbedFn> {
        Arc::new(|text: &str| {
            let mut v = vec![0.0f64; 8];
            for (i, word) in text.split_whitespace().enumerate() {
                let h = word
                    .bytes()
                    .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
                v[(h as usize + i) % 8] += 1.0;
            }
            if v.iter().all(|x| *x == 0.0) {
                v[0] = 1.0;
            }
            Some(v)
        })
    }

    fn null_embedder() -> Arc<EmbedFn> {
        Arc::new(|_: &str| None)
    }

    fn engine() -> VectorEngine {
        VectorEngine::new(
            TenantId::new("u1", "acme", "chat"),
            test_embedder(),
            false,
        )
    }

    fn meta(docid: &str) -> DocumentMetadata {
        [(KEY_DOCID, docid)].iter().copied().collect()
    }

    #[test]
    fn test_create_read_delete() {
        let e = engine();
        let hash = e
            .create(Some(vec![1.0, 2.0, 3.0]), meta("d1"), "some text")
            .unwrap();

        let (entry, text) = e.read(&[1.0, 2.0, 3.0], true).unwrap();
        assert_eq!(entry.hash, hash);
        assert_eq!(text.as_deref(), Some("some text"));
        assert!((entry.length - (14.0f64).sqrt()).abs() < 1e-12);

        assert!(e.delete(&[1.0, 2.0, 3.0]).unwrap());
        assert!(e.read(&[1.0, 2.0, 3.0], false).is_none());
        // Idempotent.
        assert!(!e.delete(&[1.0, 2.0, 3.0]).unwrap());
    }

    #[test]
    fn test_create_duplicate_is_noop() {
        let e = engine();
        let h1 = e
            .create(Some(vec![1.0, 0.0]), meta("d1"), "text one")
            .unwrap();
        let h2 = e
            .create(Some(vec![1.0, 0.0]), meta("d2"), "text two")
            .unwrap();
        assert_eq!(h1, h2);
        assert_eq!(e.len(), 1);
        // First write wins.
        let (entry, text) = e.read(&[1.0, 0.0], true).unwrap();
        assert_eq!(entry.metadata.get(KEY_DOCID), Some("d1"));
        assert_eq!(text.as_deref(), Some("text one"));
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let e = engine();
        e.create(Some(vec![1.0, 2.0]), meta("d1"), "t").unwrap();
        let err = e.create(Some(vec![1.0, 2.0, 3.0]), meta("d2"), "t");
        assert!(matches!(err, Err(RagError::Validation(_))));

        let qerr = e.query(&[1.0, 2.0, 3.0], None, None, None, false, false);
        assert!(matches!(qerr, Err(RagError::Validation(_))));
    }

    #[test]
    fn test_query_ranking_and_min_distance() {
        let e = engine();
        e.create(Some(vec![1.0, 0.0]), meta("east"), "east").unwrap();
        e.create(Some(vec![0.0, 1.0]), meta("north"), "north").unwrap();
        e.create(Some(vec![1.0, 0.2]), meta("near-east"), "near east")
            .unwrap();

        let hits = e
            .query(&[1.0, 0.0], Some(10), None, None, false, false)
            .unwrap();
        assert_eq!(hits[0].metadata.get(KEY_DOCID), Some("east"));
        assert!((hits[0].similarity - 1.0).abs() < 1e-12);
        assert_eq!(hits[1].metadata.get(KEY_DOCID), Some("near-east"));

        let strict = e
            .query(&[1.0, 0.0], Some(10), Some(0.9), None, false, false)
            .unwrap();
        assert_eq!(strict.len(), 2);
    }

    #[test]
    fn test_query_filter_before_and_after() {
        let e = engine();
        e.create(Some(vec![1.0, 0.0]), meta("a"), "a").unwrap();
        e.create(Some(vec![0.9, 0.1]), meta("b"), "b").unwrap();

        let only_b: Box<VectorFilter> =
            Box::new(|m: &DocumentMetadata| m.get(KEY_DOCID) == Some("b"));

        let pre = e
            .query(&[1.0, 0.0], Some(1), None, Some(only_b.as_ref()), false, false)
            .unwrap();
        assert_eq!(pre.len(), 1);
        assert_eq!(pre[0].metadata.get(KEY_DOCID), Some("b"));

        // Deferred filter: top-1 is taken after filtering, so "b" survives.
        let post = e
            .query(&[1.0, 0.0], Some(1), None, Some(only_b.as_ref()), false, true)
            .unwrap();
        assert_eq!(post.len(), 1);
        assert_eq!(post[0].metadata.get(KEY_DOCID), Some("b"));
    }

    #[test]
    fn test_update_restores_on_null_embedding() {
        let tenant = TenantId::new("u1", "acme", "chat");
        let e = VectorEngine::new(tenant, null_embedder(), false);
        e.create(Some(vec![1.0, 2.0]), meta("d1"), "original").unwrap();

        let err = e.update(&[1.0, 2.0], meta("d1"), "replacement");
        assert!(matches!(err, Err(RagError::Embedding(_))));

        let (entry, text) = e.read(&[1.0, 2.0], true).unwrap();
        assert_eq!(entry.metadata.get(KEY_DOCID), Some("d1"));
        assert_eq!(text.as_deref(), Some("original"));
    }

    #[test]
    fn test_update_replaces_entry() {
        let e = engine();
        e.create(Some(vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]), meta("d1"), "old")
            .unwrap();

        let new_hash = e
            .update(
                &[1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
                meta("d1"),
                "brand new shard text",
            )
            .unwrap();

        assert!(e.read(&[1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0], false).is_none());
        let found = e.find_hashes(&|m| m.get(KEY_DOCID) == Some("d1"));
        assert_eq!(found, vec![new_hash]);
    }

    #[test]
    fn test_ingest_chunks_and_rollback() {
        let e = engine();
        let params = ChunkingParams::new(10, vec![".".into(), " ".into()], 3);
        let out = e
            .ingest(&meta("d1"), "a b c d e f g h i j. k l m", &params, false, 0)
            .unwrap();
        assert!(out.hashes.len() >= 3);
        assert_eq!(e.len(), out.hashes.len());

        // Chunk ids are stamped in order.
        let mut ids: Vec<usize> = e
            .find_hashes(&|_| true)
            .iter()
            .filter_map(|h| {
                e.state.read().index.get(h).and_then(|entry| {
                    entry
                        .metadata
                        .get(KEY_CHUNK_ID)
                        .and_then(|s| s.parse().ok())
                })
            })
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..out.hashes.len()).collect::<Vec<_>>());
    }

    #[test]
    fn test_ingest_rolls_back_on_embedder_failure() {
        let tenant = TenantId::new("u1", "acme", "chat");
        let flaky_calls = std::sync::atomic::AtomicUsize::new(0);
        let embedder: Arc<EmbedFn> = Arc::new(move |text: &str| {
            let n = flaky_calls.fetch_add(1, Ordering::SeqCst);
            if n >= 2 {
                return None;
            }
            Some(vec![text.len() as f64, 1.0])
        });
        let e = VectorEngine::new(tenant, embedder, false);

        let params = ChunkingParams::new(5, vec![" ".into()], 0);
        let err = e.ingest(&meta("d1"), "aaaa bbbb cccc dddd eeee", &params, false, 0);
        assert!(matches!(err, Err(RagError::Embedding(_))));
        assert_eq!(e.len(), 0);
    }

    #[test]
    fn test_ingest_stream_stitches_tail() {
        let e = engine();
        let doc = "alpha beta gamma delta epsilon zeta eta theta iota kappa";
        let params = ChunkingParams::new(16, vec![" ".into()], 4);

        let streamed = e
            .ingest_stream(&meta("d1"), doc.as_bytes(), &params, None)
            .unwrap();
        assert!(!streamed.is_empty());

        // Same document ingested in one shot produces the same chunk count.
        let tenant = TenantId::new("u2", "acme", "chat");
        let e2 = VectorEngine::new(tenant, test_embedder(), false);
        let whole = e2.ingest(&meta("d1"), doc, &params, false, 0).unwrap();
        assert_eq!(streamed.len(), whole.hashes.len());
    }

    #[test]
    fn test_parallel_query_matches_serial() {
        let tenant = TenantId::new("u1", "acme", "chat");
        let serial = VectorEngine::new(tenant.clone(), test_embedder(), false);
        let parallel = VectorEngine::new(tenant, test_embedder(), true);

        for i in 0..50 {
            let v: Vec<f64> = (0..8).map(|j| ((i * 7 + j * 3) % 11) as f64).collect();
            serial.create(Some(v.clone()), meta(&format!("d{}", i)), "t").unwrap();
            parallel.create(Some(v), meta(&format!("d{}", i)), "t").unwrap();
        }

        let target: Vec<f64> = (0..8).map(|j| j as f64).collect();
        let a = serial.query(&target, Some(10), None, None, false, false).unwrap();
        let b = parallel.query(&target, Some(10), None, None, false, false).unwrap();

        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x.similarity - y.similarity).abs() < 1e-12);
        }
    }

    #[test]
    fn test_cancelled_query_returns_empty() {
        let e = engine();
        for i in 0..20 {
            e.create(
                Some(vec![i as f64 + 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]),
                meta(&format!("d{}", i)),
                "t",
            )
            .unwrap();
        }
        let token = CancelToken::new();
        token.cancel();

        let hits = e
            .query_with_cancel(
                &[1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
                None,
                None,
                None,
                false,
                false,
                Some(&token),
            )
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_text_shard_write_through() {
        let dir = tempfile::TempDir::new().unwrap();
        let e = engine();
        e.attach_storage(dir.path().to_path_buf());

        let hash = e.create(Some(vec![1.0, 2.0]), meta("d1"), "shard text").unwrap();
        let path = dir.path().join(format!("text_{}.txt", hash));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "shard text");

        e.delete(&[1.0, 2.0]).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_export_import_round_trip() {
        let e = engine();
        e.create(Some(vec![1.0, 0.0]), meta("d1"), "one").unwrap();
        e.create(Some(vec![0.0, 1.0]), meta("d2"), "two").unwrap();

        let (entries, texts) = e.export();
        let e2 = engine();
        e2.import(entries, texts);

        assert_eq!(e2.len(), 2);
        let (entry, text) = e2.read(&[1.0, 0.0], true).unwrap();
        assert_eq!(entry.metadata.get(KEY_DOCID), Some("d1"));
        assert_eq!(text.as_deref(), Some("one"));
    }
}
