//! TF-IDF keyword engine
//!
//! One instance is one local shard of a (possibly cluster-distributed)
//! inverted index. Mutations are local-first: a delete or update that finds
//! nothing locally is broadcast so the owning peer applies it. Queries merge
//! peer postings into the local view before scoring.

use crate::cancel::CancelToken;
use crate::cluster::rpc::{topics, CreationData, RpcMessage};
use crate::cluster::{BusOptions, ClusterBus};
use crate::config::{TenantId, TfIdfConfig};
use crate::error::{RagError, Result};
use crate::metadata::DocumentMetadata;
use crate::tfidf::posting::{epoch_secs, DocId, MergedPostings, TfIdfDocument, WordPosting};
use crate::tfidf::score::{QueryOptions, ScoredDoc};
use crate::tokenize::stopwords::LEARN_MIN_DOCS;
use crate::tokenize::TextTokenizer;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Read granularity of the streaming ingest path.
const INGEST_CHUNK_BYTES: usize = 64 * 1024;

/// Metadata filter applied by queries.
pub type MetadataFilter = dyn Fn(&DocumentMetadata) -> bool + Send + Sync;

/// Doc store plus inverted index, guarded as one unit so readers always see
/// a consistent shard.
#[derive(Default)]
struct ShardState {
    docs: HashMap<DocId, TfIdfDocument>,
    iindex: HashMap<String, WordPosting>,
}

/// Shard statistics.
#[derive(Debug, Clone)]
pub struct TfIdfStats {
    pub total_docs: usize,
    pub total_terms: usize,
    pub avg_doc_length: f64,
}

pub struct TfIdfEngine {
    tenant: TenantId,
    config: TfIdfConfig,
    tokenizer: Arc<TextTokenizer>,
    state: RwLock<ShardState>,
    dirty: AtomicBool,
    bus: Option<Arc<dyn ClusterBus>>,
    cluster_timeout: Duration,
}

impl TfIdfEngine {
    pub fn new(tenant: TenantId, config: TfIdfConfig, cluster_timeout_ms: u64) -> Self {
        let tokenizer = Arc::new(TextTokenizer::new(
            config.stopwords.clone(),
            config.no_stemming,
        ));
        Self {
            tenant,
            config,
            tokenizer,
            state: RwLock::new(ShardState::default()),
            dirty: AtomicBool::new(false),
            bus: None,
            cluster_timeout: Duration::from_millis(cluster_timeout_ms),
        }
    }

    /// Attach the cluster transport. Without one the engine behaves as a
    /// single node regardless of `config.distributed`.
    pub fn with_bus(mut self, bus: Arc<dyn ClusterBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn config(&self) -> &TfIdfConfig {
        &self.config
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn tokenizer(&self) -> &Arc<TextTokenizer> {
        &self.tokenizer
    }

    fn creation_data(&self) -> CreationData {
        CreationData {
            tenant: self.tenant.clone(),
            tfidf: self.config.clone(),
        }
    }

    //=========================================================================
    // Ingest
    //=========================================================================

    /// Index a whole document already held in memory.
    pub fn create(
        &self,
        text: &str,
        metadata: DocumentMetadata,
        lang: Option<&str>,
    ) -> Result<DocumentMetadata> {
        self.create_stream(text.as_bytes(), metadata, lang, None)
    }

    /// Streaming ingest. The document is tokenized chunk by chunk and the
    /// postings are updated in place; any mid-stream error (or cancellation)
    /// rolls the partial document back out of the index.
    ///
    /// Idempotent per docid: an already-indexed document is skipped. To
    /// replace one, delete first.
    pub fn create_stream<R: Read>(
        &self,
        mut reader: R,
        mut metadata: DocumentMetadata,
        lang: Option<&str>,
        cancel: Option<&CancelToken>,
    ) -> Result<DocumentMetadata> {
        let docid = metadata
            .get(&self.config.docid_key)
            .ok_or_else(|| {
                RagError::Validation(format!(
                    "ingest requires metadata key '{}'",
                    self.config.docid_key
                ))
            })?
            .to_string();

        if self.state.read().docs.contains_key(&docid) {
            log::debug!("{}: docid '{}' already indexed, skipping", self.tenant, docid);
            return Ok(metadata);
        }

        let mut resolved_lang: Option<String> = lang
            .map(str::to_string)
            .or_else(|| metadata.get(&self.config.langid_key).map(str::to_string));

        let mut pending_bytes: Vec<u8> = Vec::new();
        let mut carry_text = String::new();
        let mut buf = vec![0u8; INGEST_CHUNK_BYTES];
        let mut length = 0usize;

        let result: Result<String> = (|| {
            loop {
                if let Some(token) = cancel {
                    if token.is_cancelled() {
                        return Err(RagError::Cancelled(format!(
                            "ingest of '{}' cancelled",
                            docid
                        )));
                    }
                }

                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                pending_bytes.extend_from_slice(&buf[..n]);

                // Largest valid UTF-8 prefix; an incomplete trailing sequence
                // waits for the next chunk.
                let valid_up_to = match std::str::from_utf8(&pending_bytes) {
                    Ok(_) => pending_bytes.len(),
                    Err(e) => e.valid_up_to(),
                };
                if valid_up_to == 0 {
                    continue;
                }
                carry_text.push_str(&String::from_utf8_lossy(&pending_bytes[..valid_up_to]));
                pending_bytes.drain(..valid_up_to);

                let lang_ref = resolved_lang
                    .get_or_insert_with(|| {
                        crate::tokenize::detect_lang(&carry_text).to_string()
                    })
                    .clone();

                // Hold the trailing partial word back for the next chunk.
                let cut = carry_text
                    .rfind(char::is_whitespace)
                    .map(|i| i + 1)
                    .unwrap_or(0);
                if cut > 0 {
                    let (head, tail) = carry_text.split_at(cut);
                    let head = head.to_string();
                    carry_text = tail.to_string();
                    length += self.index_fragment(&docid, &head, &lang_ref);
                }
            }

            // Flush the remainder (and any undecodable trailing bytes are an
            // error, not silent loss).
            if !pending_bytes.is_empty() {
                return Err(RagError::Validation(format!(
                    "document '{}' is not valid UTF-8",
                    docid
                )));
            }
            let lang_ref = resolved_lang
                .get_or_insert_with(|| crate::tokenize::detect_lang(&carry_text).to_string())
                .clone();
            if !carry_text.is_empty() {
                let tail = std::mem::take(&mut carry_text);
                length += self.index_fragment(&docid, &tail, &lang_ref);
            }
            Ok(lang_ref)
        })();

        let lang_final = match result {
            Ok(lang) => lang,
            Err(e) => {
                self.purge_doc(&docid);
                return Err(e);
            }
        };

        if metadata.get(&self.config.langid_key).is_none() {
            metadata.set(self.config.langid_key.clone(), lang_final.clone());
        }

        {
            let mut state = self.state.write();
            state
                .docs
                .insert(docid.clone(), TfIdfDocument::new(metadata.clone(), length));
        }
        self.dirty.store(true, Ordering::SeqCst);

        self.learn_stopwords_if_due(&lang_final);
        log::debug!(
            "{}: indexed '{}' ({} tokens, lang {})",
            self.tenant,
            docid,
            length,
            lang_final
        );
        Ok(metadata)
    }

    /// Tokenize one fragment and fold it into the postings. Returns the
    /// number of tokens indexed.
    fn index_fragment(&self, docid: &str, fragment: &str, lang: &str) -> usize {
        let tokens = self.tokenizer.tokenize(fragment, lang, None, false);
        if tokens.is_empty() {
            return 0;
        }
        let mut state = self.state.write();
        for token in &tokens {
            state
                .iindex
                .entry(token.clone())
                .or_insert_with(|| WordPosting::new(token.clone()))
                .increment(docid, 1);
        }
        tokens.len()
    }

    /// Remove every trace of `docid` from the postings and the doc store.
    fn purge_doc(&self, docid: &str) {
        let mut state = self.state.write();
        state.docs.remove(docid);
        state.iindex.retain(|_, posting| {
            posting.remove_doc(docid);
            !posting.is_empty()
        });
    }

    /// Explicit stop-word acquisition phase: runs after ingest once the shard
    /// holds enough documents and no list exists for `lang` yet.
    fn learn_stopwords_if_due(&self, lang: &str) {
        if self.tokenizer.stopwords().has_list(lang) {
            return;
        }
        let state = self.state.read();
        if state.docs.len() < LEARN_MIN_DOCS {
            return;
        }
        let df: Vec<(String, usize)> = state
            .iindex
            .values()
            .map(|p| (p.word.clone(), p.doc_count()))
            .collect();
        let total = state.docs.len();
        drop(state);
        self.tokenizer.stopwords().learn(lang, total, df);
    }

    //=========================================================================
    // Delete / update
    //=========================================================================

    /// Delete by metadata identity. Returns whether a local document was
    /// removed. When nothing is found locally and `local` is false, the
    /// delete is broadcast for the owning peer to apply.
    pub fn delete(&self, metadata: &DocumentMetadata, local: bool) -> Result<bool> {
        let docid = metadata.hash_key(&self.config.docid_key);

        let removed = {
            let mut state = self.state.write();
            if state.docs.remove(&docid).is_some() {
                state.iindex.retain(|_, posting| {
                    posting.remove_doc(&docid);
                    !posting.is_empty()
                });
                true
            } else {
                false
            }
        };

        if removed {
            self.dirty.store(true, Ordering::SeqCst);
            return Ok(true);
        }

        if !local && self.config.distributed {
            if let Some(bus) = &self.bus {
                bus.publish(
                    topics::TFIDF_RMDOC,
                    RpcMessage::ApplyDelete {
                        creation: self.creation_data(),
                        metadata: metadata.clone(),
                    },
                    &BusOptions::external(),
                )?;
            }
        }
        Ok(false)
    }

    /// Rewrite a document's metadata (and identity, when the docid changes).
    /// Postings keep their counts; only the docid key is rewritten.
    pub fn update(
        &self,
        old_metadata: &DocumentMetadata,
        new_metadata: &DocumentMetadata,
        local: bool,
    ) -> Result<bool> {
        let old_id = old_metadata.hash_key(&self.config.docid_key);
        let new_id = new_metadata.hash_key(&self.config.docid_key);

        let rewritten = {
            let mut state = self.state.write();
            match state.docs.remove(&old_id) {
                Some(mut doc) => {
                    doc.metadata = new_metadata.clone();
                    doc.date_modified = epoch_secs();
                    state.docs.insert(new_id.clone(), doc);
                    if old_id != new_id {
                        for posting in state.iindex.values_mut() {
                            posting.rekey_doc(&old_id, &new_id);
                        }
                    }
                    true
                }
                None => false,
            }
        };

        if rewritten {
            self.dirty.store(true, Ordering::SeqCst);
            return Ok(true);
        }

        if !local && self.config.distributed {
            if let Some(bus) = &self.bus {
                bus.publish(
                    topics::TFIDF_UPDATEDOC,
                    RpcMessage::ApplyUpdate {
                        creation: self.creation_data(),
                        old_metadata: old_metadata.clone(),
                        new_metadata: new_metadata.clone(),
                    },
                    &BusOptions::external(),
                )?;
            }
        }
        Ok(false)
    }

    //=========================================================================
    // Query
    //=========================================================================

    /// Scored keyword query over the merged cluster view.
    #[allow(clippy::too_many_arguments)]
    pub fn query(
        &self,
        query_text: &str,
        top_k: Option<usize>,
        filter: Option<&MetadataFilter>,
        cutoff_score: Option<f64>,
        options: &QueryOptions,
        lang: Option<&str>,
        autocorrect: bool,
    ) -> Result<Vec<ScoredDoc>> {
        let lang = self.tokenizer.resolve_lang(query_text, lang);

        let vocabulary: Option<HashSet<String>> = if autocorrect {
            Some(self.state.read().iindex.keys().cloned().collect())
        } else {
            None
        };
        let tokens =
            self.tokenizer
                .tokenize(query_text, lang, vocabulary.as_ref(), autocorrect);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        // Local view of postings and docids under one read lock.
        let (mut merged, local_docids, avg_len, local_docs) = {
            let state = self.state.read();
            let merged = MergedPostings::from_local(
                tokens.iter().filter_map(|t| state.iindex.get(t)),
            );
            let local_docids: HashSet<DocId> = state.docs.keys().cloned().collect();
            let total_len: usize = state.docs.values().map(|d| d.length).sum();
            let avg_len = if state.docs.is_empty() {
                0.0
            } else {
                total_len as f64 / state.docs.len() as f64
            };
            let local_docs: HashMap<DocId, TfIdfDocument> = state.docs.clone();
            (merged, local_docids, avg_len, local_docs)
        };

        // Cluster merge: peer postings plus the distinct docid union.
        let mut cluster_docids = local_docids.clone();
        if self.config.distributed {
            if let Some(bus) = &self.bus {
                self.merge_cluster_view(bus, &tokens, &local_docids, &mut merged, &mut cluster_docids);
            }
        }
        let total_distinct = cluster_docids.len();

        // Score candidates that have a local document record.
        let mut results: Vec<ScoredDoc> = Vec::new();
        for docid in merged.candidate_docids() {
            let Some(doc) = local_docs.get(&docid) else {
                continue;
            };
            if let Some(f) = filter {
                if !options.filter_metadata_last && !f(&doc.metadata) {
                    continue;
                }
            }
            if doc.length == 0 {
                continue;
            }

            let adjustment = options.length_adjustment.factor(doc.length, avg_len);
            let mut tf_sum = 0.0f64;
            let mut tfidf_sum = 0.0f64;
            let mut found = 0usize;

            for token in &tokens {
                let count = merged.count(token, &docid);
                if count == 0 {
                    continue;
                }
                let tf = (count as f64 / doc.length as f64) * adjustment;
                let idf = if options.no_idf {
                    1.0
                } else {
                    let df = merged.doc_freq(token);
                    1.0 + (total_distinct as f64 / (df as f64 + 1.0)).log10()
                };
                tf_sum += tf;
                tfidf_sum += tf * idf;
                found += 1;
            }
            if found == 0 {
                continue;
            }

            let coord = options.coord_multiplier(found, tokens.len());
            results.push(ScoredDoc {
                metadata: doc.metadata.clone(),
                score: tfidf_sum * coord,
                coord_score: coord,
                tf_score: tf_sum,
                tfidf_score: tfidf_sum,
                query_tokens_found: found,
                total_query_tokens: tokens.len(),
                cutoff_scaled_score: 0.0,
                highest_query_score: 0.0,
            });
        }

        if let Some(f) = filter {
            if options.filter_metadata_last {
                results.retain(|r| f(&r.metadata));
            }
        }

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        if let Some(max) = results.first().map(|r| r.score).filter(|s| *s > 0.0) {
            for r in &mut results {
                r.highest_query_score = max;
                r.cutoff_scaled_score = r.score / max;
            }
            if let Some(cutoff) = cutoff_score {
                results.retain(|r| r.cutoff_scaled_score >= cutoff);
            }
        }

        if let Some(k) = top_k {
            results.truncate(k);
        }
        Ok(results)
    }

    /// Pull peer postings and docids, degrading to the local view on any
    /// transport failure.
    fn merge_cluster_view(
        &self,
        bus: &Arc<dyn ClusterBus>,
        tokens: &[String],
        local_docids: &HashSet<DocId>,
        merged: &mut MergedPostings,
        cluster_docids: &mut HashSet<DocId>,
    ) {
        let opts = BusOptions::external();
        let postings_req = RpcMessage::QueryPostings {
            creation: self.creation_data(),
            words: tokens.to_vec(),
        };
        match bus.request(topics::TFIDF_RPC, postings_req, self.cluster_timeout, &opts) {
            Ok(replies) => {
                for reply in replies {
                    if let RpcMessage::QueryPostingsReply { postings } = reply {
                        merged.merge_peer(postings, |id| local_docids.contains(id));
                    }
                }
            }
            Err(e) => {
                log::warn!(
                    "{}: peer postings unavailable, using local view: {}",
                    self.tenant,
                    e
                );
            }
        }

        let count_req = RpcMessage::CountDocs {
            creation: self.creation_data(),
        };
        match bus.request(topics::TFIDF_RPC, count_req, self.cluster_timeout, &opts) {
            Ok(replies) => {
                for reply in replies {
                    if let RpcMessage::CountDocsReply { docids } = reply {
                        cluster_docids.extend(docids);
                    }
                }
            }
            Err(e) => {
                log::warn!(
                    "{}: peer doc count unavailable, using local count: {}",
                    self.tenant,
                    e
                );
            }
        }
    }

    //=========================================================================
    // RPC service surface (called by the registry's bus handlers)
    //=========================================================================

    /// Local postings for the given stems, in wire shape.
    pub fn postings_subset(&self, words: &[String]) -> HashMap<String, HashMap<DocId, u32>> {
        let state = self.state.read();
        words
            .iter()
            .filter_map(|w| state.iindex.get(w))
            .map(|p| (p.word.clone(), p.docs.clone()))
            .collect()
    }

    pub fn local_docids(&self) -> Vec<DocId> {
        self.state.read().docs.keys().cloned().collect()
    }

    pub fn contains(&self, docid: &str) -> bool {
        self.state.read().docs.contains_key(docid)
    }

    pub fn doc_count(&self) -> usize {
        self.state.read().docs.len()
    }

    /// Metadata of a locally held document.
    pub fn metadata_of(&self, docid: &str) -> Option<DocumentMetadata> {
        self.state.read().docs.get(docid).map(|d| d.metadata.clone())
    }

    //=========================================================================
    // Maintenance / persistence surface
    //=========================================================================

    /// The shard's stem vocabulary, sorted for stable output.
    pub fn vocabulary(&self) -> Vec<String> {
        let mut words: Vec<String> = self.state.read().iindex.keys().cloned().collect();
        words.sort();
        words
    }

    /// Rebuild the inverted index, dropping postings that no longer reference
    /// a live document and entries with no documents at all.
    pub fn defragment(&self) {
        let mut state = self.state.write();
        let live: HashSet<DocId> = state.docs.keys().cloned().collect();
        state.iindex.retain(|_, posting| {
            posting.docs.retain(|docid, count| live.contains(docid) && *count > 0);
            !posting.is_empty()
        });
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn stats(&self) -> TfIdfStats {
        let state = self.state.read();
        let total_docs = state.docs.len();
        let total_len: usize = state.docs.values().map(|d| d.length).sum();
        TfIdfStats {
            total_docs,
            total_terms: state.iindex.len(),
            avg_doc_length: if total_docs == 0 {
                0.0
            } else {
                total_len as f64 / total_docs as f64
            },
        }
    }

    /// Consistent export for snapshots: postings plus documents.
    pub fn export(&self) -> (Vec<WordPosting>, Vec<(DocId, TfIdfDocument)>) {
        let state = self.state.read();
        let postings = state.iindex.values().cloned().collect();
        let docs = state
            .docs
            .iter()
            .map(|(id, doc)| (id.clone(), doc.clone()))
            .collect();
        (postings, docs)
    }

    /// Replace the shard contents from a snapshot.
    pub fn import(&self, postings: Vec<WordPosting>, docs: Vec<(DocId, TfIdfDocument)>) {
        let mut state = self.state.write();
        state.iindex = postings
            .into_iter()
            .map(|p| (p.word.clone(), p))
            .collect();
        state.docs = docs.into_iter().collect();
        self.dirty.store(false, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Clear the dirty flag, returning its previous value. The snapshot path
    /// calls this right before exporting so a racing mutation re-arms it.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }
}
