//! End-to-end retrieval scenarios: file events through both engines, hybrid
//! search, snapshot round-trips, and multi-node convergence.

use ragdb::{
    ChunkingParams, DocumentMetadata, EmbedFn, EngineConfig, FileEvent, FileIndexingCoordinator,
    HybridOptions, HybridOutput, HybridSearcher, LocalBus, LocalDrive, ModelParams, QueryOptions,
    TenantId, TenantRegistry, TfIdfConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

const KEY_DOCID: &str = "docid";
const KEY_CMSPATH: &str = "cmspath";

/// Deterministic embedder: texts sharing words land close in vector space.
fn embedder() -> Arc<EmbedFn> {
    Arc::new(|text: &str| {
        let mut v = vec![0.0f64; 16];
        for word in text.split_whitespace() {
            let h = word
                .to_lowercase()
                .bytes()
                .fold(7u64, |acc, b| acc.wrapping_mul(131).wrapping_add(b as u64));
            v[(h % 16) as usize] += 1.0;
        }
        if v.iter().all(|x| *x == 0.0) {
            v[0] = 1.0;
        }
        Some(v)
    })
}

struct World {
    _storage: TempDir,
    _drive_dir: TempDir,
    registry: Arc<TenantRegistry>,
    drive: Arc<LocalDrive>,
    coordinator: FileIndexingCoordinator,
    tenant: TenantId,
}

fn world() -> World {
    let storage = TempDir::new().unwrap();
    let drive_dir = TempDir::new().unwrap();
    let registry = TenantRegistry::new(storage.path(), EngineConfig::for_testing(), embedder());
    let drive = Arc::new(LocalDrive::new(drive_dir.path()));
    let coordinator = FileIndexingCoordinator::new(
        Arc::clone(&registry),
        drive.clone(),
        ChunkingParams::new(80, vec![".".into(), " ".into()], 10),
        None,
    );
    World {
        _storage: storage,
        _drive_dir: drive_dir,
        registry,
        drive,
        coordinator,
        tenant: TenantId::new("u1", "acme", "chat"),
    }
}

fn add_file(w: &World, cms: &str, body: &str) -> PathBuf {
    use ragdb::Drive;
    let full = w.drive.get_full_path(cms).unwrap();
    w.drive.write_file(&full, body.as_bytes()).unwrap();
    w.coordinator
        .handle_event(&w.tenant, &FileEvent::Created { path: full.clone() }, None)
        .unwrap();
    full
}

fn model_params() -> ModelParams {
    ModelParams {
        top_k_tfidf: 10,
        cutoff_score_tfidf: 0.0,
        top_k_vectors: 5,
        min_distance_vectors: 0.0,
        ..Default::default()
    }
}

#[test]
fn drive_to_hybrid_answer() {
    let w = world();
    add_file(
        &w,
        "/kb/rust.md",
        "The borrow checker enforces ownership rules in the rust compiler. \
         Lifetimes describe how long references live.",
    );
    add_file(
        &w,
        "/kb/cooking.md",
        "Preheat the oven before baking. A good recipe balances salt and acid.",
    );

    let searcher = HybridSearcher::new(Arc::clone(&w.registry));
    let out = searcher
        .search(
            "u1",
            "acme",
            &["chat".to_string()],
            "borrow checker ownership",
            &model_params(),
            &HybridOptions::default(),
        )
        .unwrap();

    let HybridOutput::Results(results) = out else {
        panic!("expected results");
    };
    assert!(!results.is_empty());
    for r in &results {
        assert_eq!(r.metadata.get(KEY_CMSPATH), Some("/kb/rust.md"));
        assert!(r.text.is_some());
        let tfidf = r.tfidf.as_ref().unwrap();
        assert!(tfidf.query_tokens_found > 0);
    }
}

#[test]
fn delete_then_query_is_empty() {
    let w = world();
    let path = add_file(&w, "/kb/doc.md", "unique sentinel content in this file");

    let handle = w.registry.get(&w.tenant).unwrap();
    assert_eq!(handle.tfidf.doc_count(), 1);

    w.coordinator
        .handle_event(&w.tenant, &FileEvent::Deleted { path }, None)
        .unwrap();

    let hits = handle
        .tfidf
        .query(
            "sentinel",
            None,
            None,
            None,
            &QueryOptions::default(),
            Some("en"),
            false,
        )
        .unwrap();
    assert!(hits.is_empty());
    assert_eq!(handle.vector.len(), 0);

    // Idempotent: deleting again is a no-op.
    let full = {
        use ragdb::Drive;
        w.drive.get_full_path("/kb/doc.md").unwrap()
    };
    w.coordinator
        .handle_event(&w.tenant, &FileEvent::Deleted { path: full }, None)
        .unwrap();
}

#[test]
fn rename_shifts_both_engines() {
    use ragdb::Drive;
    let w = world();
    let from = add_file(&w, "/kb/before.md", "rename survives in content and vectors");
    let to = w.drive.get_full_path("/kb/after.md").unwrap();

    w.coordinator
        .handle_event(
            &w.tenant,
            &FileEvent::Renamed {
                from,
                to: to.clone(),
            },
            None,
        )
        .unwrap();

    let handle = w.registry.get(&w.tenant).unwrap();

    let filter: Box<ragdb::tfidf::MetadataFilter> =
        Box::new(|m: &DocumentMetadata| m.get(KEY_CMSPATH) == Some("/kb/after.md"));
    let hits = handle
        .tfidf
        .query(
            "rename survives",
            None,
            Some(filter.as_ref()),
            None,
            &QueryOptions::default(),
            Some("en"),
            false,
        )
        .unwrap();
    assert_eq!(hits.len(), 1);

    let stale = handle
        .vector
        .find_hashes(&|m: &DocumentMetadata| m.get(KEY_CMSPATH) == Some("/kb/before.md"));
    assert!(stale.is_empty());
}

#[test]
fn snapshot_round_trip_preserves_query_results() {
    let storage = TempDir::new().unwrap();
    let tenant = TenantId::new("u1", "acme", "chat");
    let query = |registry: &Arc<TenantRegistry>| {
        let handle = registry.open(&tenant, TfIdfConfig::default()).unwrap();
        handle
            .tfidf
            .query(
                "persistent index",
                None,
                None,
                None,
                &QueryOptions::default(),
                Some("en"),
                false,
            )
            .unwrap()
    };

    let before = {
        let registry =
            TenantRegistry::new(storage.path(), EngineConfig::for_testing(), embedder());
        let handle = registry.open(&tenant, TfIdfConfig::default()).unwrap();
        let meta: DocumentMetadata = [(KEY_DOCID, "d1")].iter().copied().collect();
        handle
            .tfidf
            .create("a persistent index outlives the process", meta.clone(), Some("en"))
            .unwrap();
        handle
            .vector
            .create(None, meta, "a persistent index outlives the process")
            .unwrap();
        let hits = query(&registry);
        registry.close(&tenant).unwrap();
        hits
    };

    let registry = TenantRegistry::new(storage.path(), EngineConfig::for_testing(), embedder());
    let after = query(&registry);

    assert_eq!(before.len(), after.len());
    assert_eq!(before[0].metadata, after[0].metadata);
    assert!((before[0].score - after[0].score).abs() < 1e-12);
    assert_eq!(
        registry.open(&tenant, TfIdfConfig::default()).unwrap().vector.len(),
        1
    );
}

#[test]
fn broadcast_delete_converges_across_nodes() {
    let fabric = LocalBus::new();
    let dirs = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let tenant = TenantId::new("u1", "acme", "chat");

    let mut config = EngineConfig::for_testing();
    config.distributed = true;

    let node_a = TenantRegistry::with_bus(
        dirs.0.path(),
        config.clone(),
        embedder(),
        Arc::new(fabric.node("a")),
    );
    let node_b = TenantRegistry::with_bus(
        dirs.1.path(),
        config,
        embedder(),
        Arc::new(fabric.node("b")),
    );

    let handle_a = node_a.open(&tenant, TfIdfConfig::default()).unwrap();
    let handle_b = node_b.open(&tenant, TfIdfConfig::default()).unwrap();

    let meta_b: DocumentMetadata = [(KEY_DOCID, "held-by-b")].iter().copied().collect();
    let meta_keep: DocumentMetadata = [(KEY_DOCID, "keeper")].iter().copied().collect();
    handle_b
        .tfidf
        .create("cluster topic doomed", meta_b.clone(), Some("en"))
        .unwrap();
    handle_a
        .tfidf
        .create("cluster topic keeper", meta_keep, Some("en"))
        .unwrap();

    // Peer A deletes B's document through the bus.
    handle_a.tfidf.delete(&meta_b, false).unwrap();
    assert!(!handle_b.tfidf.contains("held-by-b"));

    // Both nodes now agree a query only finds the survivor.
    for handle in [&handle_a, &handle_b] {
        let hits = handle
            .tfidf
            .query(
                "cluster topic",
                None,
                None,
                None,
                &QueryOptions::default(),
                Some("en"),
                false,
            )
            .unwrap();
        let docids: Vec<_> = hits
            .iter()
            .filter_map(|h| h.metadata.get(KEY_DOCID))
            .collect();
        assert!(!docids.contains(&"held-by-b"));
    }
    let hits_a = handle_a
        .tfidf
        .query(
            "cluster topic",
            None,
            None,
            None,
            &QueryOptions::default(),
            Some("en"),
            false,
        )
        .unwrap();
    assert_eq!(hits_a.len(), 1);
    assert_eq!(hits_a[0].metadata.get(KEY_DOCID), Some("keeper"));
}

#[test]
fn stopword_learning_is_tenant_local() {
    let w = world();
    // Six docs sharing the word "common"; it becomes a stop word and stops
    // matching queries on this shard.
    for i in 0..6 {
        add_file(
            &w,
            &format!("/kb/doc{}.md", i),
            &format!("common subject{} detail{}", i, i),
        );
    }

    let handle = w.registry.get(&w.tenant).unwrap();
    let hits = handle
        .tfidf
        .query(
            "common",
            None,
            None,
            None,
            &QueryOptions::default(),
            Some("en"),
            false,
        )
        .unwrap();
    assert!(hits.is_empty());

    let specific = handle
        .tfidf
        .query(
            "subject3",
            None,
            None,
            None,
            &QueryOptions::default(),
            Some("en"),
            false,
        )
        .unwrap();
    assert_eq!(specific.len(), 1);
}
