//! Snapshot persistence
//!
//! On-disk layout per tenant, under `<root>/<user>_<org>_<app>/`:
//!
//! ```text
//! tfidfdb/
//!   iindex            NDJSON, one WordPosting per line
//!   vocabulary        JSON array of stems (informational)
//!   <md5(docid)>      JSON document record
//! vectordb/
//!   dbindex.json      the full vector index
//!   text_<sha1>.txt   one text shard per entry
//! ```
//!
//! Every file is written atomically (temp file + rename). A failed save
//! re-arms the engine's dirty flag so the next autosave tick retries; the
//! in-memory state is never touched by persistence errors.

use crate::config::TenantId;
use crate::error::{RagError, Result};
use crate::metadata::DocumentMetadata;
use crate::tfidf::{TfIdfDocument, TfIdfEngine, WordPosting};
use crate::vector::{VectorEngine, VectorEntry};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

const TFIDF_DIR: &str = "tfidfdb";
const VECTOR_DIR: &str = "vectordb";
const IINDEX_FILE: &str = "iindex";
const VOCABULARY_FILE: &str = "vocabulary";
const VECTOR_INDEX_FILE: &str = "dbindex.json";

/// Write `bytes` to `path` atomically: temp file in the same directory, fsync,
/// rename over the target.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| RagError::Validation(format!("no parent directory for {:?}", path)))?;
    fs::create_dir_all(dir)?;

    let tmp = dir.join(format!(
        ".{}.tmp",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("snapshot")
    ));
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// On-disk shape of one TF-IDF document record.
#[derive(Serialize, Deserialize)]
struct StoredDoc {
    docid: String,
    metadata: DocumentMetadata,
    length: usize,
    date_created: u64,
    date_modified: u64,
}

/// On-disk shape of the vector index.
#[derive(Serialize, Deserialize)]
struct StoredVectorIndex {
    dimension: Option<usize>,
    entries: Vec<VectorEntry>,
}

/// Filesystem snapshot adapter for one storage root.
pub struct Persistence {
    root: PathBuf,
}

impl Persistence {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tenant_dir(&self, tenant: &TenantId) -> PathBuf {
        self.root.join(tenant.dir_name())
    }

    pub fn tfidf_dir(&self, tenant: &TenantId) -> PathBuf {
        self.tenant_dir(tenant).join(TFIDF_DIR)
    }

    pub fn vector_dir(&self, tenant: &TenantId) -> PathBuf {
        self.tenant_dir(tenant).join(VECTOR_DIR)
    }

    /// Directory bootstrap for a tenant.
    pub fn ensure_dirs(&self, tenant: &TenantId) -> Result<()> {
        fs::create_dir_all(self.tfidf_dir(tenant))?;
        fs::create_dir_all(self.vector_dir(tenant))?;
        Ok(())
    }

    /// Whether a tenant has anything on disk.
    pub fn exists(&self, tenant: &TenantId) -> bool {
        self.tfidf_dir(tenant).join(IINDEX_FILE).exists()
            || self.vector_dir(tenant).join(VECTOR_INDEX_FILE).exists()
    }

    //=========================================================================
    // TF-IDF snapshot
    //=========================================================================

    /// Snapshot the keyword shard. Clears the dirty flag up front and re-arms
    /// it on failure so the autosave timer retries.
    pub fn save_tfidf(&self, tenant: &TenantId, engine: &TfIdfEngine) -> Result<()> {
        engine.take_dirty();
        match self.save_tfidf_inner(tenant, engine) {
            Ok(()) => Ok(()),
            Err(e) => {
                engine.mark_dirty();
                Err(e)
            }
        }
    }

    fn save_tfidf_inner(&self, tenant: &TenantId, engine: &TfIdfEngine) -> Result<()> {
        let dir = self.tfidf_dir(tenant);
        fs::create_dir_all(&dir)?;
        let (postings, docs) = engine.export();

        let mut ndjson = String::new();
        for posting in &postings {
            ndjson.push_str(&serde_json::to_string(posting)?);
            ndjson.push('\n');
        }
        atomic_write(&dir.join(IINDEX_FILE), ndjson.as_bytes())?;

        let vocabulary: Vec<&str> = postings.iter().map(|p| p.word.as_str()).collect();
        atomic_write(
            &dir.join(VOCABULARY_FILE),
            serde_json::to_vec(&vocabulary)?.as_slice(),
        )?;

        let mut expected: HashSet<String> = HashSet::new();
        for (docid, doc) in &docs {
            let name = format!("{:x}", md5::compute(docid.as_bytes()));
            let stored = StoredDoc {
                docid: docid.clone(),
                metadata: doc.metadata.clone(),
                length: doc.length,
                date_created: doc.date_created,
                date_modified: doc.date_modified,
            };
            atomic_write(&dir.join(&name), serde_json::to_vec(&stored)?.as_slice())?;
            expected.insert(name);
        }

        // Drop records of documents deleted since the previous snapshot.
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == IINDEX_FILE || name == VOCABULARY_FILE || name.starts_with('.') {
                continue;
            }
            if !expected.contains(&name) {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    /// Restore the keyword shard into `engine`. Missing files load as empty.
    pub fn load_tfidf(&self, tenant: &TenantId, engine: &TfIdfEngine) -> Result<()> {
        let dir = self.tfidf_dir(tenant);
        let iindex_path = dir.join(IINDEX_FILE);
        if !iindex_path.exists() {
            return Ok(());
        }

        let mut postings: Vec<WordPosting> = Vec::new();
        let reader = BufReader::new(fs::File::open(&iindex_path)?);
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            postings.push(serde_json::from_str(&line)?);
        }

        let mut docs: Vec<(String, TfIdfDocument)> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == IINDEX_FILE || name == VOCABULARY_FILE || name.starts_with('.') {
                continue;
            }
            let stored: StoredDoc = serde_json::from_slice(&fs::read(entry.path())?)?;
            docs.push((
                stored.docid,
                TfIdfDocument {
                    metadata: stored.metadata,
                    length: stored.length,
                    date_created: stored.date_created,
                    date_modified: stored.date_modified,
                },
            ));
        }

        engine.import(postings, docs);
        Ok(())
    }

    //=========================================================================
    // Vector snapshot
    //=========================================================================

    pub fn save_vector(&self, tenant: &TenantId, engine: &VectorEngine) -> Result<()> {
        engine.take_dirty();
        match self.save_vector_inner(tenant, engine) {
            Ok(()) => Ok(()),
            Err(e) => {
                engine.mark_dirty();
                Err(e)
            }
        }
    }

    fn save_vector_inner(&self, tenant: &TenantId, engine: &VectorEngine) -> Result<()> {
        let dir = self.vector_dir(tenant);
        fs::create_dir_all(&dir)?;
        let (entries, texts) = engine.export();

        let stored = StoredVectorIndex {
            dimension: entries.first().map(|e| e.vector.len()),
            entries,
        };
        atomic_write(
            &dir.join(VECTOR_INDEX_FILE),
            serde_json::to_vec(&stored)?.as_slice(),
        )?;

        let mut expected: HashSet<String> = HashSet::new();
        for (hash, text) in &texts {
            let name = format!("text_{}.txt", hash);
            atomic_write(&dir.join(&name), text.as_bytes())?;
            expected.insert(name);
        }

        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with("text_") {
                continue;
            }
            if !expected.contains(&name) {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    /// Restore the vector index into `engine` and attach write-through
    /// storage for future text shards.
    pub fn load_vector(&self, tenant: &TenantId, engine: &VectorEngine) -> Result<()> {
        let dir = self.vector_dir(tenant);
        engine.attach_storage(dir.clone());

        let index_path = dir.join(VECTOR_INDEX_FILE);
        if !index_path.exists() {
            return Ok(());
        }
        let stored: StoredVectorIndex = serde_json::from_slice(&fs::read(&index_path)?)?;

        let mut texts: HashMap<String, String> = HashMap::new();
        for entry in &stored.entries {
            let path = dir.join(format!("text_{}.txt", entry.hash));
            if path.exists() {
                texts.insert(entry.hash.clone(), fs::read_to_string(&path)?);
            } else {
                log::warn!(
                    "{}: text shard missing for vector '{}'",
                    tenant,
                    entry.hash
                );
            }
        }

        engine.import(stored.entries, texts);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TfIdfConfig;
    use crate::metadata::KEY_DOCID;
    use crate::tfidf::QueryOptions;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn tenant() -> TenantId {
        TenantId::new("u1", "acme", "chat")
    }

    fn meta(docid: &str) -> DocumentMetadata {
        [(KEY_DOCID, docid)].iter().copied().collect()
    }

    fn tfidf_engine() -> TfIdfEngine {
        TfIdfEngine::new(tenant(), TfIdfConfig::default(), 1_000)
    }

    fn vector_engine() -> VectorEngine {
        VectorEngine::new(
            tenant(),
            Arc::new(|_: &str| Some(vec![1.0, 2.0, 3.0])),
            false,
        )
    }

    #[test]
    fn test_atomic_write_creates_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/c.txt");
        atomic_write(&path, b"payload").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "payload");
    }

    #[test]
    fn test_tfidf_snapshot_round_trip() {
        let dir = TempDir::new().unwrap();
        let persist = Persistence::new(dir.path());
        let engine = tfidf_engine();
        engine
            .create("the quick brown fox", meta("d1"), Some("en"))
            .unwrap();
        engine.create("lazy dog sleeps", meta("d2"), Some("en")).unwrap();

        persist.save_tfidf(&tenant(), &engine).unwrap();
        assert!(!engine.is_dirty());

        let restored = tfidf_engine();
        persist.load_tfidf(&tenant(), &restored).unwrap();

        let a = engine
            .query("quick fox", None, None, None, &QueryOptions::default(), Some("en"), false)
            .unwrap();
        let b = restored
            .query("quick fox", None, None, None, &QueryOptions::default(), Some("en"), false)
            .unwrap();
        assert_eq!(a.len(), b.len());
        assert!((a[0].score - b[0].score).abs() < 1e-12);
        assert_eq!(a[0].metadata, b[0].metadata);
    }

    #[test]
    fn test_tfidf_snapshot_prunes_deleted_docs() {
        let dir = TempDir::new().unwrap();
        let persist = Persistence::new(dir.path());
        let engine = tfidf_engine();
        engine.create("alpha", meta("d1"), Some("en")).unwrap();
        engine.create("beta", meta("d2"), Some("en")).unwrap();
        persist.save_tfidf(&tenant(), &engine).unwrap();

        engine.delete(&meta("d2"), true).unwrap();
        persist.save_tfidf(&tenant(), &engine).unwrap();

        let restored = tfidf_engine();
        persist.load_tfidf(&tenant(), &restored).unwrap();
        assert_eq!(restored.doc_count(), 1);
        assert!(restored.contains("d1"));
    }

    #[test]
    fn test_vector_snapshot_round_trip() {
        let dir = TempDir::new().unwrap();
        let persist = Persistence::new(dir.path());
        let engine = vector_engine();
        engine
            .create(Some(vec![1.0, 0.0]), meta("d1"), "first shard")
            .unwrap();
        engine
            .create(Some(vec![0.0, 1.0]), meta("d2"), "second shard")
            .unwrap();

        persist.save_vector(&tenant(), &engine).unwrap();

        let restored = vector_engine();
        persist.load_vector(&tenant(), &restored).unwrap();
        assert_eq!(restored.len(), 2);

        let (entry, text) = restored.read(&[1.0, 0.0], true).unwrap();
        assert_eq!(entry.metadata.get(KEY_DOCID), Some("d1"));
        assert_eq!(text.as_deref(), Some("first shard"));

        // Text shard files exist on disk, one per entry.
        let vdir = persist.vector_dir(&tenant());
        let shard_count = fs::read_dir(&vdir)
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with("text_")
            })
            .count();
        assert_eq!(shard_count, 2);
    }

    #[test]
    fn test_vector_snapshot_removes_stale_shards() {
        let dir = TempDir::new().unwrap();
        let persist = Persistence::new(dir.path());
        let engine = vector_engine();
        engine.create(Some(vec![1.0, 0.0]), meta("d1"), "one").unwrap();
        engine.create(Some(vec![0.0, 1.0]), meta("d2"), "two").unwrap();
        persist.save_vector(&tenant(), &engine).unwrap();

        engine.delete(&[0.0, 1.0]).unwrap();
        persist.save_vector(&tenant(), &engine).unwrap();

        let restored = vector_engine();
        persist.load_vector(&tenant(), &restored).unwrap();
        assert_eq!(restored.len(), 1);

        let vdir = persist.vector_dir(&tenant());
        let shard_count = fs::read_dir(&vdir)
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with("text_")
            })
            .count();
        assert_eq!(shard_count, 1);
    }

    #[test]
    fn test_dirty_flag_discipline() {
        let dir = TempDir::new().unwrap();
        let persist = Persistence::new(dir.path());
        let engine = tfidf_engine();
        engine.create("alpha", meta("d1"), Some("en")).unwrap();
        assert!(engine.is_dirty());

        persist.save_tfidf(&tenant(), &engine).unwrap();
        assert!(!engine.is_dirty());

        engine.create("beta", meta("d2"), Some("en")).unwrap();
        assert!(engine.is_dirty());
    }
}
