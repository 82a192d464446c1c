//! File-indexing coordinator
//!
//! Translates drive events into engine mutations: created and modified files
//! are tokenized into the keyword shard and chunk-embedded into the vector
//! index, deletes uningest from both, renames rewrite path metadata in both.
//! Progress is reported on the cluster-shared board; ingest is gated by the
//! tenant's quota.

pub mod drive;
pub mod events;

pub use drive::{Drive, LocalDrive};
pub use events::{FileEvent, ProgressBoard, KIND_PROCESSED, KIND_PROCESSING, KIND_PROGRESS};

use crate::cancel::CancelToken;
use crate::cluster::rpc::ProgressUpdate;
use crate::cluster::ClusterBus;
use crate::config::TenantId;
use crate::error::Result;
use crate::metadata::{DocumentMetadata, KEY_CMSPATH, KEY_DOCID, KEY_FULLPATH};
use crate::registry::{TenantHandle, TenantRegistry};
use crate::vector::ChunkingParams;
use std::path::Path;
use std::sync::Arc;

/// Pipeline steps reported per file: quota/metadata, keyword ingest, vector
/// ingest, done.
const TOTAL_STEPS: usize = 4;

/// Per-tenant usage budget, consumed before any ingest.
pub trait Quota: Send + Sync {
    /// Errors with [`crate::RagError::Quota`] when `incoming_bytes` would
    /// exceed the tenant's budget.
    fn check(&self, user_id: &str, org: &str, incoming_bytes: u64) -> Result<()>;
}

/// Usage bookkeeping, fed after successful ingest.
pub trait UsageLog: Send + Sync {
    fn record(&self, user_id: &str, org: &str, bytes: u64);
}

/// Pre-processing hook ahead of the default text pipeline (e.g. a web-spider
/// that expands a `.url` file into page text).
pub trait IngestPlugin: Send + Sync {
    fn matches(&self, cms_path: &str) -> bool;
    fn extract(&self, drive: &dyn Drive, full_path: &Path) -> Result<String>;
}

pub struct FileIndexingCoordinator {
    registry: Arc<TenantRegistry>,
    drive: Arc<dyn Drive>,
    quota: Option<Arc<dyn Quota>>,
    usage: Option<Arc<dyn UsageLog>>,
    plugins: Vec<Arc<dyn IngestPlugin>>,
    board: Arc<ProgressBoard>,
    chunking: ChunkingParams,
}

impl FileIndexingCoordinator {
    pub fn new(
        registry: Arc<TenantRegistry>,
        drive: Arc<dyn Drive>,
        chunking: ChunkingParams,
        bus: Option<Arc<dyn ClusterBus>>,
    ) -> Self {
        let board = Arc::new(ProgressBoard::new(bus.clone()));

        // Fold peer progress into the local board.
        if let Some(bus) = &bus {
            use crate::cluster::rpc::{topics, RpcMessage};
            let weak = Arc::downgrade(&board);
            for topic in [
                topics::FILE_PROCESSING,
                topics::FILE_PROGRESS,
                topics::FILE_PROCESSED,
            ] {
                let weak = weak.clone();
                let handler = move |msg: &RpcMessage| -> Option<RpcMessage> {
                    if let RpcMessage::Progress(update) = msg {
                        if let Some(board) = weak.upgrade() {
                            board.apply_remote(update);
                        }
                    }
                    None
                };
                if let Err(e) = bus.subscribe(topic, Arc::new(handler)) {
                    log::warn!("could not subscribe to {}: {}", topic, e);
                }
            }
        }

        Self {
            registry,
            drive,
            quota: None,
            usage: None,
            plugins: Vec::new(),
            board,
            chunking,
        }
    }

    pub fn with_quota(mut self, quota: Arc<dyn Quota>) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn with_usage_log(mut self, usage: Arc<dyn UsageLog>) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn register_plugin(&mut self, plugin: Arc<dyn IngestPlugin>) {
        self.plugins.push(plugin);
    }

    pub fn board(&self) -> &Arc<ProgressBoard> {
        &self.board
    }

    /// React to one drive event for a tenant.
    pub fn handle_event(
        &self,
        tenant: &TenantId,
        event: &FileEvent,
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        match event {
            FileEvent::Created { path } => self.ingest_file(tenant, path, "file_created", cancel),
            FileEvent::Modified { path } => {
                self.uningest_file(tenant, path)?;
                self.ingest_file(tenant, path, "file_modified", cancel)
            }
            FileEvent::Deleted { path } => self.uningest_file(tenant, path),
            FileEvent::Renamed { from, to } => self.rename_file(tenant, from, to),
        }
    }

    fn file_metadata(&self, path: &Path) -> Result<DocumentMetadata> {
        let cms_path = self.drive.get_root_relative(path)?;
        let mut metadata = DocumentMetadata::new();
        metadata.set(KEY_DOCID, cms_path.clone());
        metadata.set(KEY_CMSPATH, cms_path);
        metadata.set(KEY_FULLPATH, path.to_string_lossy().into_owned());
        Ok(metadata)
    }

    fn progress(
        &self,
        tenant: &TenantId,
        cms_path: &str,
        full_path: &Path,
        kind: &str,
        step_num: usize,
        result: Option<bool>,
        subtype: &str,
    ) {
        self.board.publish(ProgressUpdate {
            user_id: tenant.user_id.clone(),
            org: tenant.org.clone(),
            cmspath: cms_path.to_string(),
            fullpath: full_path.to_string_lossy().into_owned(),
            kind: kind.to_string(),
            step_num,
            total_steps: TOTAL_STEPS,
            result,
            subtype: subtype.to_string(),
        });
    }

    //=========================================================================
    // Ingest
    //=========================================================================

    fn ingest_file(
        &self,
        tenant: &TenantId,
        path: &Path,
        subtype: &str,
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        let metadata = self.file_metadata(path)?;
        let cms_path = metadata.get(KEY_CMSPATH).unwrap_or_default().to_string();

        self.progress(tenant, &cms_path, path, KIND_PROCESSING, 0, None, subtype);

        let outcome = self.ingest_file_inner(tenant, path, &metadata, cancel, &cms_path, subtype);
        match &outcome {
            Ok(()) => {
                self.progress(
                    tenant,
                    &cms_path,
                    path,
                    KIND_PROCESSED,
                    TOTAL_STEPS,
                    Some(true),
                    subtype,
                );
            }
            Err(e) => {
                log::warn!("{}: indexing {:?} failed: {}", tenant, path, e);
                self.progress(
                    tenant,
                    &cms_path,
                    path,
                    KIND_PROCESSED,
                    TOTAL_STEPS,
                    Some(false),
                    subtype,
                );
            }
        }
        outcome
    }

    fn ingest_file_inner(
        &self,
        tenant: &TenantId,
        path: &Path,
        metadata: &DocumentMetadata,
        cancel: Option<&CancelToken>,
        cms_path: &str,
        subtype: &str,
    ) -> Result<()> {
        // Step 1: quota gate.
        let size = self.drive.file_size(path)?;
        if let Some(quota) = &self.quota {
            quota.check(&tenant.user_id, &tenant.org, size)?;
        }
        let handle = self
            .registry
            .open(tenant, crate::config::TfIdfConfig::default())?;
        self.progress(tenant, cms_path, path, KIND_PROGRESS, 1, None, subtype);

        let _guard = handle.write_guard();

        // Optional plugin replaces the default text pipeline's source.
        let plugin_text = match self.plugins.iter().find(|p| p.matches(cms_path)) {
            Some(plugin) => Some(plugin.extract(self.drive.as_ref(), path)?),
            None => None,
        };

        // Step 2: keyword ingest (streaming unless a plugin produced text).
        let indexed_meta = match &plugin_text {
            Some(text) => handle.tfidf.create(text, metadata.clone(), None)?,
            None => {
                let stream = self.drive.get_read_stream(path)?;
                handle
                    .tfidf
                    .create_stream(stream, metadata.clone(), None, cancel)?
            }
        };
        self.progress(tenant, cms_path, path, KIND_PROGRESS, 2, None, subtype);

        // Step 3: vector ingest; a failure here also rolls the keyword side
        // back so the file is either fully indexed or absent.
        let vector_result = match &plugin_text {
            Some(text) => handle
                .vector
                .ingest(&indexed_meta, text, &self.chunking, false, 0)
                .map(|o| o.hashes),
            None => {
                let stream = self.drive.get_read_stream(path)?;
                handle
                    .vector
                    .ingest_stream(&indexed_meta, stream, &self.chunking, cancel)
            }
        };
        if let Err(e) = vector_result {
            if let Err(del) = handle.tfidf.delete(&indexed_meta, true) {
                log::error!("{}: keyword rollback failed for {:?}: {}", tenant, path, del);
            }
            return Err(e);
        }
        self.progress(tenant, cms_path, path, KIND_PROGRESS, 3, None, subtype);

        if let Some(usage) = &self.usage {
            usage.record(&tenant.user_id, &tenant.org, size);
        }
        Ok(())
    }

    //=========================================================================
    // Uningest
    //=========================================================================

    fn uningest_file(&self, tenant: &TenantId, path: &Path) -> Result<()> {
        let metadata = self.file_metadata(path)?;
        let Some(handle) = self.registry.get(tenant) else {
            return Ok(());
        };
        let _guard = handle.write_guard();

        handle.tfidf.delete(&metadata, false)?;
        self.delete_vectors_for_path(&handle, path)?;
        Ok(())
    }

    /// Delete every vector whose `fullpath` matches. Partial failures mark
    /// the tenant index inconsistent and the sweep continues.
    fn delete_vectors_for_path(&self, handle: &TenantHandle, path: &Path) -> Result<()> {
        let full = path.to_string_lossy().into_owned();
        let hashes = handle
            .vector
            .find_hashes(&move |m: &DocumentMetadata| m.get(KEY_FULLPATH) == Some(full.as_str()));

        let mut failures = 0usize;
        for hash in &hashes {
            if let Err(e) = handle.vector.delete_hash(hash) {
                failures += 1;
                log::error!(
                    "{}: vector delete failed for '{}': {}",
                    handle.tenant(),
                    hash,
                    e
                );
            }
        }
        if failures > 0 {
            handle.vector.mark_inconsistent();
            log::error!(
                "{}: {} of {} vector deletes failed for {:?}; index marked inconsistent",
                handle.tenant(),
                failures,
                hashes.len(),
                path
            );
        }
        Ok(())
    }

    //=========================================================================
    // Rename
    //=========================================================================

    fn rename_file(&self, tenant: &TenantId, from: &Path, to: &Path) -> Result<()> {
        let old_cms = self.drive.get_root_relative(from)?;
        let new_cms = self.drive.get_root_relative(to)?;
        let new_full = to.to_string_lossy().into_owned();

        let handle = self
            .registry
            .open(tenant, crate::config::TfIdfConfig::default())?;
        let _guard = handle.write_guard();

        // Keyword side: rewrite the stored metadata, rekeying the document.
        let old_min = self.file_metadata(from)?;
        let new_metadata = match handle.tfidf.metadata_of(&old_cms) {
            Some(mut stored) => {
                stored.set(KEY_DOCID, new_cms.clone());
                stored.set(KEY_CMSPATH, new_cms.clone());
                stored.set(KEY_FULLPATH, new_full.clone());
                stored
            }
            None => self.file_metadata(to)?,
        };
        handle.tfidf.update(&old_min, &new_metadata, false)?;

        // Vector side: rewrite paths on every shard of the document.
        let old_full = from.to_string_lossy().into_owned();
        let filter = move |m: &DocumentMetadata| m.get(KEY_FULLPATH) == Some(old_full.as_str());
        let new_cms_clone = new_cms.clone();
        let new_full_clone = new_full.clone();
        let touched = handle.vector.rewrite_metadata(&filter, &move |m| {
            m.set(KEY_DOCID, new_cms_clone.clone());
            m.set(KEY_CMSPATH, new_cms_clone.clone());
            m.set(KEY_FULLPATH, new_full_clone.clone());
        });
        log::debug!(
            "{}: renamed {:?} -> {:?} ({} vector shards)",
            tenant,
            from,
            to,
            touched
        );
        Ok(())
    }
}
