//! Tenant index registry
//!
//! Process-owned map of open tenant indexes with lifecycle
//! `open → use → close`. Each handle pairs one keyword shard with one vector
//! index and carries the per-tenant writer lock; the registry also owns the
//! autosave timer and answers cluster RPCs for every tenant it holds.

use crate::cluster::rpc::{topics, CreationData, RpcMessage};
use crate::cluster::ClusterBus;
use crate::config::{EngineConfig, TenantId, TfIdfConfig};
use crate::error::Result;
use crate::persist::Persistence;
use crate::tfidf::TfIdfEngine;
use crate::vector::{EmbedFn, VectorEngine};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// One open tenant: the engine pair plus the single-writer lock.
pub struct TenantHandle {
    tenant: TenantId,
    pub tfidf: Arc<TfIdfEngine>,
    pub vector: Arc<VectorEngine>,
    write_lock: Mutex<()>,
}

impl TenantHandle {
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Serialize logical mutations for this tenant. Mutation sequences
    /// (delete-then-ingest, rename cascades) run under this guard.
    pub fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock()
    }

    pub fn is_dirty(&self) -> bool {
        self.tfidf.is_dirty() || self.vector.is_dirty()
    }
}

pub struct TenantRegistry {
    config: EngineConfig,
    persistence: Persistence,
    embedder: Arc<EmbedFn>,
    bus: Option<Arc<dyn ClusterBus>>,
    tenants: DashMap<TenantId, Arc<TenantHandle>>,
    autosave_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
}

impl TenantRegistry {
    pub fn new(
        root: impl Into<PathBuf>,
        config: EngineConfig,
        embedder: Arc<EmbedFn>,
    ) -> Arc<Self> {
        Self::build(root, config, embedder, None)
    }

    pub fn with_bus(
        root: impl Into<PathBuf>,
        config: EngineConfig,
        embedder: Arc<EmbedFn>,
        bus: Arc<dyn ClusterBus>,
    ) -> Arc<Self> {
        Self::build(root, config, embedder, Some(bus))
    }

    fn build(
        root: impl Into<PathBuf>,
        config: EngineConfig,
        embedder: Arc<EmbedFn>,
        bus: Option<Arc<dyn ClusterBus>>,
    ) -> Arc<Self> {
        let registry = Arc::new(Self {
            config,
            persistence: Persistence::new(root),
            embedder,
            bus,
            tenants: DashMap::new(),
            autosave_thread: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
        });
        registry.register_bus_handlers();
        registry.start_autosave();
        registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn embedder(&self) -> Arc<EmbedFn> {
        Arc::clone(&self.embedder)
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    //=========================================================================
    // Lifecycle
    //=========================================================================

    /// Open (or return the already-open) handle for a tenant, restoring any
    /// on-disk snapshot.
    pub fn open(&self, tenant: &TenantId, tfidf_config: TfIdfConfig) -> Result<Arc<TenantHandle>> {
        if let Some(handle) = self.tenants.get(tenant) {
            return Ok(Arc::clone(&handle));
        }

        let mut tfidf_config = tfidf_config;
        tfidf_config.distributed = self.config.distributed;

        let mut tfidf = TfIdfEngine::new(
            tenant.clone(),
            tfidf_config,
            self.config.cluster_timeout_ms,
        );
        if let Some(bus) = &self.bus {
            tfidf = tfidf.with_bus(Arc::clone(bus));
        }
        let vector = VectorEngine::new(
            tenant.clone(),
            Arc::clone(&self.embedder),
            self.config.multithreaded,
        );

        self.persistence.ensure_dirs(tenant)?;
        self.persistence.load_tfidf(tenant, &tfidf)?;
        self.persistence.load_vector(tenant, &vector)?;

        let handle = Arc::new(TenantHandle {
            tenant: tenant.clone(),
            tfidf: Arc::new(tfidf),
            vector: Arc::new(vector),
            write_lock: Mutex::new(()),
        });
        self.tenants.insert(tenant.clone(), Arc::clone(&handle));
        log::debug!("opened tenant {}", tenant);
        Ok(handle)
    }

    pub fn get(&self, tenant: &TenantId) -> Option<Arc<TenantHandle>> {
        self.tenants.get(tenant).map(|h| Arc::clone(&h))
    }

    /// Snapshot a tenant's dirty engines.
    pub fn flush(&self, tenant: &TenantId) -> Result<()> {
        let Some(handle) = self.get(tenant) else {
            return Ok(());
        };
        if handle.tfidf.is_dirty() {
            self.persistence.save_tfidf(tenant, &handle.tfidf)?;
        }
        if handle.vector.is_dirty() {
            self.persistence.save_vector(tenant, &handle.vector)?;
        }
        Ok(())
    }

    /// Snapshot every dirty tenant; per-tenant failures are logged and do
    /// not stop the sweep.
    pub fn flush_all(&self) {
        let tenants: Vec<TenantId> = self.tenants.iter().map(|e| e.key().clone()).collect();
        for tenant in tenants {
            if let Err(e) = self.flush(&tenant) {
                log::warn!("autosave failed for {}: {}", tenant, e);
            }
        }
    }

    /// Final snapshot, then release the handle.
    pub fn close(&self, tenant: &TenantId) -> Result<()> {
        self.flush(tenant)?;
        self.tenants.remove(tenant);
        log::debug!("closed tenant {}", tenant);
        Ok(())
    }

    //=========================================================================
    // Cluster RPC service
    //=========================================================================

    fn register_bus_handlers(self: &Arc<Self>) {
        let Some(bus) = &self.bus else {
            return;
        };

        let weak = Arc::downgrade(self);
        let handler = {
            let weak = weak.clone();
            move |msg: &RpcMessage| -> Option<RpcMessage> {
                let registry = weak.upgrade()?;
                registry.handle_rpc(msg)
            }
        };
        if let Err(e) = bus.subscribe(topics::TFIDF_RPC, Arc::new(handler)) {
            log::warn!("could not subscribe to {}: {}", topics::TFIDF_RPC, e);
        }

        for topic in [topics::TFIDF_RMDOC, topics::TFIDF_UPDATEDOC] {
            let weak = weak.clone();
            let handler = move |msg: &RpcMessage| -> Option<RpcMessage> {
                let registry = weak.upgrade()?;
                registry.handle_rpc(msg)
            };
            if let Err(e) = bus.subscribe(topic, Arc::new(handler)) {
                log::warn!("could not subscribe to {}: {}", topic, e);
            }
        }
    }

    fn resolve(&self, creation: &CreationData) -> Option<Arc<TenantHandle>> {
        match self.open(&creation.tenant, creation.tfidf.clone()) {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::warn!("could not resolve tenant {}: {}", creation.tenant, e);
                None
            }
        }
    }

    fn handle_rpc(&self, msg: &RpcMessage) -> Option<RpcMessage> {
        match msg {
            RpcMessage::QueryPostings { creation, words } => {
                let handle = self.resolve(creation)?;
                Some(RpcMessage::QueryPostingsReply {
                    postings: handle.tfidf.postings_subset(words),
                })
            }
            RpcMessage::CountDocs { creation } => {
                let handle = self.resolve(creation)?;
                Some(RpcMessage::CountDocsReply {
                    docids: handle.tfidf.local_docids(),
                })
            }
            RpcMessage::ApplyDelete { creation, metadata } => {
                let handle = self.resolve(creation)?;
                let _guard = handle.write_guard();
                if let Err(e) = handle.tfidf.delete(metadata, true) {
                    log::warn!("broadcast delete failed on {}: {}", creation.tenant, e);
                }
                None
            }
            RpcMessage::ApplyUpdate {
                creation,
                old_metadata,
                new_metadata,
            } => {
                let handle = self.resolve(creation)?;
                let _guard = handle.write_guard();
                if let Err(e) = handle.tfidf.update(old_metadata, new_metadata, true) {
                    log::warn!("broadcast update failed on {}: {}", creation.tenant, e);
                }
                None
            }
            _ => None,
        }
    }

    //=========================================================================
    // Autosave
    //=========================================================================

    fn start_autosave(self: &Arc<Self>) {
        if !self.config.autosave {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let shutdown = Arc::clone(&self.shutdown);
        let period = Duration::from_millis(self.config.autosave_frequency_ms.max(100));

        let thread = std::thread::Builder::new()
            .name("ragdb-autosave".into())
            .spawn(move || {
                let tick = Duration::from_millis(100);
                let mut elapsed = Duration::ZERO;
                loop {
                    std::thread::sleep(tick);
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    elapsed += tick;
                    if elapsed < period {
                        continue;
                    }
                    elapsed = Duration::ZERO;
                    match weak.upgrade() {
                        Some(registry) => registry.flush_all(),
                        None => break,
                    }
                }
            });
        match thread {
            Ok(handle) => *self.autosave_thread.lock() = Some(handle),
            Err(e) => log::warn!("could not start autosave thread: {}", e),
        }
    }
}

impl Drop for TenantRegistry {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.autosave_thread.lock().take() {
            let _ = handle.join();
        }
    }
}
