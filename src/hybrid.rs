//! Hybrid search orchestrator
//!
//! Two-stage retrieval: the keyword engine nominates candidate documents,
//! then only vectors belonging to those documents are searched semantically.
//! TF-IDF scoring fields are reinfused into the winning shards so the caller
//! sees both signals on every hit.

use crate::config::{ModelParams, TenantId, TfIdfConfig};
use crate::error::{RagError, Result};
use crate::metadata::DocumentMetadata;
use crate::registry::TenantRegistry;
use crate::tfidf::{QueryOptions, ScoredDoc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Caller-supplied re-ranking hook applied after score reinfusion.
pub type ReSort = dyn Fn(&mut Vec<HybridResult>) + Send + Sync;

/// Options for one hybrid search.
pub struct HybridOptions {
    /// Keyword-stage scoring options (BM25, small-doc penalty, coord, IDF).
    pub tfidf: QueryOptions,
    pub autocorrect: bool,
    pub lang: Option<String>,
    /// Return one joined text payload instead of per-shard results.
    pub join_text: bool,
    pub re_sort: Option<Box<ReSort>>,
}

impl Default for HybridOptions {
    fn default() -> Self {
        Self {
            tfidf: QueryOptions::default(),
            autocorrect: false,
            lang: None,
            join_text: false,
            re_sort: None,
        }
    }
}

/// One retrieved shard with both scoring signals.
#[derive(Debug, Clone)]
pub struct HybridResult {
    pub text: Option<String>,
    pub metadata: DocumentMetadata,
    pub similarity: f64,
    /// Keyword-stage scores of the owning document.
    pub tfidf: Option<ScoredDoc>,
}

/// Search output: individual shards or a single stitched context payload.
#[derive(Debug)]
pub enum HybridOutput {
    Results(Vec<HybridResult>),
    Joined(String),
}

pub struct HybridSearcher {
    registry: Arc<TenantRegistry>,
}

impl HybridSearcher {
    pub fn new(registry: Arc<TenantRegistry>) -> Self {
        Self { registry }
    }

    /// Run the two-stage search for `(user, org)` across one or more
    /// applications.
    pub fn search(
        &self,
        user_id: &str,
        org: &str,
        app_ids: &[String],
        query_text: &str,
        params: &ModelParams,
        options: &HybridOptions,
    ) -> Result<HybridOutput> {
        // 1. Resolve engine pairs per application.
        let mut handles = Vec::new();
        for app_id in app_ids {
            let tenant = TenantId::new(user_id, org, app_id.clone());
            let handle = self.registry.open(&tenant, TfIdfConfig::default())?;
            handles.push(handle);
        }
        if handles.is_empty() {
            return Ok(HybridOutput::Results(Vec::new()));
        }

        // 2. Keyword stage over every shard; keep the global top slice by TF.
        let mut candidates: Vec<ScoredDoc> = Vec::new();
        for handle in &handles {
            let hits = handle.tfidf.query(
                query_text,
                Some(params.top_k_tfidf),
                None,
                Some(params.cutoff_score_tfidf),
                &options.tfidf,
                options.lang.as_deref(),
                options.autocorrect,
            )?;
            candidates.extend(hits);
        }
        candidates.sort_by(|a, b| {
            b.tf_score
                .partial_cmp(&a.tf_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(params.top_k_tfidf);
        if candidates.is_empty() {
            return Ok(self.empty(options));
        }

        // 3. Candidate docid set.
        let mut by_docid: HashMap<String, ScoredDoc> = HashMap::new();
        let mut docids: HashSet<String> = HashSet::new();
        for doc in candidates {
            if let Some(docid) = doc.metadata.get(crate::metadata::KEY_DOCID) {
                docids.insert(docid.to_string());
                by_docid.entry(docid.to_string()).or_insert(doc);
            }
        }

        // Keyword-preferred languages skip the semantic stage entirely: the
        // candidates' own shards are returned in keyword order.
        let lang = match options.lang.as_deref() {
            Some(l) if !l.is_empty() => l.to_string(),
            _ => crate::tokenize::detect_lang(query_text).to_string(),
        };
        if self.registry.config().tfidf_search_langs.iter().any(|l| l == &lang) {
            let mut results = self.keyword_only(&handles, &by_docid, params);
            if let Some(re_sort) = &options.re_sort {
                re_sort(&mut results);
            }
            results.truncate(params.top_k_vectors);
            return Ok(self.finish(results, options));
        }

        // 4. Query embedding; a null embedding aborts the search.
        let embedding = (self.registry.embedder())(query_text).ok_or_else(|| {
            RagError::Embedding("query embedding returned null".into())
        })?;

        // 5. Semantic stage, restricted to the candidate documents.
        let docid_set = docids.clone();
        let filter = move |m: &DocumentMetadata| {
            m.get(crate::metadata::KEY_DOCID)
                .map(|d| docid_set.contains(d))
                .unwrap_or(false)
        };

        let mut merged: Vec<HybridResult> = Vec::new();
        for handle in &handles {
            if handle.vector.is_empty() {
                continue;
            }
            let hits = handle.vector.query(
                &embedding,
                Some(params.top_k_vectors),
                Some(params.min_distance_vectors),
                Some(&filter),
                true,
                false,
            )?;
            for hit in hits {
                let tfidf = hit
                    .metadata
                    .get(crate::metadata::KEY_DOCID)
                    .and_then(|d| by_docid.get(d))
                    .cloned();
                merged.push(HybridResult {
                    text: hit.text,
                    metadata: hit.metadata,
                    similarity: hit.similarity,
                    tfidf,
                });
            }
        }

        // 6. Similarity order, then the caller's re-sort if supplied.
        merged.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        if let Some(re_sort) = &options.re_sort {
            re_sort(&mut merged);
        }

        // 7. Final slice.
        merged.truncate(params.top_k_vectors);
        Ok(self.finish(merged, options))
    }

    /// Shards of the keyword candidates, in keyword order, without a
    /// semantic pass. Used for `tfidf_search_langs` languages.
    fn keyword_only(
        &self,
        handles: &[Arc<crate::registry::TenantHandle>],
        by_docid: &HashMap<String, ScoredDoc>,
        params: &ModelParams,
    ) -> Vec<HybridResult> {
        let mut ordered: Vec<&ScoredDoc> = by_docid.values().collect();
        ordered.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut results = Vec::new();
        'outer: for doc in ordered {
            let Some(docid) = doc.metadata.get(crate::metadata::KEY_DOCID) else {
                continue;
            };
            let docid = docid.to_string();
            for handle in handles {
                let owned = docid.clone();
                let hashes = handle
                    .vector
                    .find_hashes(&move |m: &DocumentMetadata| {
                        m.get(crate::metadata::KEY_DOCID) == Some(owned.as_str())
                    });
                for hash in hashes {
                    results.push(HybridResult {
                        text: handle.vector.text_of(&hash),
                        metadata: handle
                            .vector
                            .metadata_of(&hash)
                            .unwrap_or_else(|| doc.metadata.clone()),
                        similarity: doc.cutoff_scaled_score,
                        tfidf: Some(doc.clone()),
                    });
                    if results.len() >= params.top_k_vectors {
                        break 'outer;
                    }
                }
            }
        }
        results
    }

    fn finish(&self, results: Vec<HybridResult>, options: &HybridOptions) -> HybridOutput {
        if options.join_text {
            let joined = results
                .iter()
                .filter_map(|r| r.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n");
            HybridOutput::Joined(joined)
        } else {
            HybridOutput::Results(results)
        }
    }

    fn empty(&self, options: &HybridOptions) -> HybridOutput {
        if options.join_text {
            HybridOutput::Joined(String::new())
        } else {
            HybridOutput::Results(Vec::new())
        }
    }
}
