//! Chaos Testing for Multichannel Store
//!
//! Failure scenarios driven by a [`FailingBackend`] wrapper that injects
//! storage errors into commits and into the reads used by background jobs.
//! Every scenario checks that a failed operation leaves storage, caches and
//! the attribute directory as they were, and that the next attempt succeeds.
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use multichannel_store::channel::{Channel, ChannelNode};
use multichannel_store::model::{
    AttributeKind, AttributeRow, AttributeType, AttributeValue, ChangeRecord, ChannelId, ChannelsetId,
    ContentObject, ObjectId, ObjectRow, ObjectType, ObjectTypeId,
};
use multichannel_store::storage::traits::TxWork;
use multichannel_store::storage::{MemoryBackend, RelationalBackend, ScopedQuery, StorageError};
use multichannel_store::{
    Datasource, DatasourceConfig, DatasourceError, Expression, ManualClock, RemovalReport, SyncFlags,
    Synchronizer,
};

// =============================================================================
// Failing Backend Wrapper - Precise Error Injection
// =============================================================================

/// Delegates to an inner backend, failing on demand.
pub struct FailingBackend {
    inner: Arc<dyn RelationalBackend>,
    /// Roll back every transaction after its work ran
    fail_commits: AtomicBool,
    /// Fail watermark and file-reference reads
    fail_reads: AtomicBool,
    injected: AtomicU64,
}

impl FailingBackend {
    pub fn new(inner: Arc<dyn RelationalBackend>) -> Self {
        Self {
            inner,
            fail_commits: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            injected: AtomicU64::new(0),
        }
    }

    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Number of errors injected so far.
    pub fn injected(&self) -> u64 {
        self.injected.load(Ordering::SeqCst)
    }

    fn injected_error(&self, what: &str) -> StorageError {
        self.injected.fetch_add(1, Ordering::SeqCst);
        StorageError::Backend(format!("injected failure: {what}"))
    }

    fn check_read(&self, what: &str) -> Result<(), StorageError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(self.injected_error(what));
        }
        Ok(())
    }
}

impl RelationalBackend for FailingBackend {
    fn load_channel_nodes(&self) -> Result<Vec<ChannelNode>, StorageError> {
        self.inner.load_channel_nodes()
    }

    fn load_object_types(&self) -> Result<Vec<ObjectType>, StorageError> {
        self.inner.load_object_types()
    }

    fn select_objects(&self, ids: &[ObjectId]) -> Result<Vec<ObjectRow>, StorageError> {
        self.inner.select_objects(ids)
    }

    fn select_variants(&self, channelsets: &[ChannelsetId]) -> Result<Vec<ObjectRow>, StorageError> {
        self.inner.select_variants(channelsets)
    }

    fn select_by_content_id(&self, content_id: &str) -> Result<Option<ObjectRow>, StorageError> {
        self.inner.select_by_content_id(content_id)
    }

    fn select_attribute(&self, name: &str, ids: &[ObjectId]) -> Result<Vec<AttributeRow>, StorageError> {
        self.inner.select_attribute(name, ids)
    }

    fn select_matching(&self, query: &ScopedQuery<'_>) -> Result<Vec<ObjectId>, StorageError> {
        self.inner.select_matching(query)
    }

    fn count_matching(&self, query: &ScopedQuery<'_>) -> Result<usize, StorageError> {
        self.inner.count_matching(query)
    }

    fn select_changed(&self, channel: ChannelId, since: i64) -> Result<Vec<ChangeRecord>, StorageError> {
        self.check_read("select_changed")?;
        self.inner.select_changed(channel, since)
    }

    fn last_update(&self, channel: ChannelId) -> Result<Option<i64>, StorageError> {
        self.check_read("last_update")?;
        self.inner.last_update(channel)
    }

    fn replication_mark(&self, channel: ChannelId) -> Result<Option<i64>, StorageError> {
        self.inner.replication_mark(channel)
    }

    fn select_ids_in_channel(&self, channel: ChannelId) -> Result<Vec<ObjectId>, StorageError> {
        self.inner.select_ids_in_channel(channel)
    }

    fn count_attribute_rows(&self, name: &str) -> Result<usize, StorageError> {
        self.inner.count_attribute_rows(name)
    }

    fn is_file_referenced(&self, path: &Path) -> Result<bool, StorageError> {
        self.check_read("is_file_referenced")?;
        self.inner.is_file_referenced(path)
    }

    fn transact(&self, work: &mut TxWork<'_>) -> Result<(), DatasourceError> {
        let fail = self.fail_commits.load(Ordering::SeqCst);
        self.inner.transact(&mut |tx| {
            work(tx)?;
            if fail {
                return Err(self.injected_error("commit").into());
            }
            Ok(())
        })
    }
}

// =============================================================================
// Helpers
// =============================================================================

const DOC: ObjectTypeId = 1;

fn doc_type() -> ObjectType {
    ObjectType::new(DOC, "doc")
        .with_attribute(AttributeType::new("title", AttributeKind::Text))
        .with_attribute(AttributeType::new("name", AttributeKind::Text).optimized())
        .with_attribute(AttributeType::new("body", AttributeKind::LongText).filesystem())
}

fn setup(root: Option<PathBuf>) -> (Arc<FailingBackend>, Arc<ManualClock>, Datasource) {
    let backend = Arc::new(FailingBackend::new(Arc::new(MemoryBackend::new())));
    let clock = Arc::new(ManualClock::new(10_000));
    let config = DatasourceConfig {
        filesystem_root: root,
        ..Default::default()
    };
    let ds = Datasource::with_clock(backend.clone(), config, clock.clone()).unwrap();
    ds.save_structure(vec![Channel::new(1, "Master").with_child(Channel::new(2, "Web"))])
        .unwrap();
    ds.save_object_type(doc_type()).unwrap();
    (backend, clock, ds)
}

/// Regular files below `root`, ignoring the temp directory.
fn stored_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.file_name().is_some_and(|name| name == ".tmp") {
                continue;
            }
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files
}

fn count_docs(ds: &Datasource) -> usize {
    let filter = ds.filter(Expression::obj_type(DOC)).unwrap();
    ds.get_count(&filter).unwrap()
}

// =============================================================================
// Store / Delete Rollback
// =============================================================================

#[test]
fn chaos_failed_commit_stores_nothing() {
    let (backend, _, ds) = setup(None);
    backend.fail_commits(true);

    let mut docs = vec![
        ContentObject::new(DOC, 1).with("title", "a").with("name", "a"),
        ContentObject::new(DOC, 2).with("title", "b"),
    ];
    let err = ds.store(&mut docs).unwrap_err();
    assert!(matches!(err, DatasourceError::Storage(StorageError::Backend(_))), "{err}");
    assert!(docs.iter().all(|doc| doc.id.is_none()));
    assert_eq!(backend.injected(), 1);

    backend.fail_commits(false);
    assert_eq!(count_docs(&ds), 0);
    assert_eq!(backend.last_update(1).unwrap(), None);

    // the same objects store cleanly afterwards
    ds.store(&mut docs).unwrap();
    assert_eq!(count_docs(&ds), 1);
    ds.set_channel(2).unwrap();
    assert_eq!(count_docs(&ds), 2);
}

#[test]
fn chaos_failed_update_keeps_cached_value() {
    let (backend, clock, ds) = setup(None);
    let mut doc = ContentObject::new(DOC, 1).with("title", "before");
    ds.store(std::slice::from_mut(&mut doc)).unwrap();
    assert_eq!(ds.get_attribute(&doc, "title").unwrap(), AttributeValue::from("before"));

    clock.advance(1);
    backend.fail_commits(true);
    let mut update = doc.clone();
    update.attributes.clear();
    update.set("title", "after");
    assert!(ds.store(std::slice::from_mut(&mut update)).is_err());
    assert_eq!(update.updated_at, doc.updated_at);

    let reader = ds.session();
    assert_eq!(reader.get_attribute(&doc, "title").unwrap(), AttributeValue::from("before"));
    ds.clear_caches();
    assert_eq!(reader.get_attribute(&doc, "title").unwrap(), AttributeValue::from("before"));
}

#[test]
fn chaos_failed_delete_keeps_object_and_files() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, _, ds) = setup(Some(dir.path().to_path_buf()));
    let mut doc = ContentObject::new(DOC, 1).with("body", "kept on disk");
    ds.store(std::slice::from_mut(&mut doc)).unwrap();
    let path = ds.get_attribute_path(&doc, "body", 0).unwrap();

    backend.fail_commits(true);
    assert!(ds.delete(std::slice::from_ref(&doc)).is_err());
    backend.fail_commits(false);

    assert!(ds.get_by_id(doc.id.unwrap()).unwrap().is_some());
    assert_eq!(ds.remove_pending_files().unwrap().removed, 0);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "kept on disk");

    assert_eq!(ds.delete(std::slice::from_ref(&doc)).unwrap(), 1);
    assert_eq!(ds.remove_pending_files().unwrap().removed, 1);
    assert!(!path.exists());
}

// =============================================================================
// Filesystem Rollback
// =============================================================================

#[test]
fn chaos_rolled_back_files_are_unlinked() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, _, ds) = setup(Some(dir.path().to_path_buf()));

    backend.fail_commits(true);
    let mut docs: Vec<ContentObject> = (0..3)
        .map(|i| ContentObject::new(DOC, 1).with("body", format!("body {i}")))
        .collect();
    assert!(ds.store(&mut docs).is_err());
    assert!(stored_files(dir.path()).is_empty());

    backend.fail_commits(false);
    ds.store(&mut docs).unwrap();
    assert_eq!(stored_files(dir.path()).len(), 3);
}

#[test]
fn chaos_rolled_back_rewrite_keeps_previous_file() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, _, ds) = setup(Some(dir.path().to_path_buf()));
    let mut doc = ContentObject::new(DOC, 1).with("body", "v1");
    ds.store(std::slice::from_mut(&mut doc)).unwrap();
    let original = ds.get_attribute_path(&doc, "body", 0).unwrap();

    backend.fail_commits(true);
    let mut update = doc.clone();
    update.attributes.clear();
    update.set("body", "v2");
    assert!(ds.store(std::slice::from_mut(&mut update)).is_err());
    backend.fail_commits(false);

    assert_eq!(stored_files(dir.path()), vec![original.clone()]);
    assert_eq!(ds.remove_pending_files().unwrap(), RemovalReport::default());
    assert_eq!(ds.get_attribute(&doc, "body").unwrap(), AttributeValue::from("v1"));
}

// =============================================================================
// Background Job Failures
// =============================================================================

#[test]
fn chaos_remover_requeues_on_backend_failure() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, _, ds) = setup(Some(dir.path().to_path_buf()));
    let mut doc = ContentObject::new(DOC, 1).with("body", "old");
    ds.store(std::slice::from_mut(&mut doc)).unwrap();
    let old = ds.get_attribute_path(&doc, "body", 0).unwrap();

    let mut update = doc.clone();
    update.attributes.clear();
    update.set("body", "new");
    ds.store(std::slice::from_mut(&mut update)).unwrap();

    backend.fail_reads(true);
    assert!(ds.remove_pending_files().is_err());
    assert!(old.exists());

    backend.fail_reads(false);
    let report = ds.remove_pending_files().unwrap();
    assert_eq!(report.removed, 1);
    assert!(!old.exists());
}

#[test]
fn chaos_checker_retries_after_failure() {
    let (backend, clock, writer) = setup(None);
    let reader = Datasource::with_clock(backend.clone(), DatasourceConfig::default(), clock.clone()).unwrap();

    let mut doc = ContentObject::new(DOC, 1).with("title", "one");
    writer.store(std::slice::from_mut(&mut doc)).unwrap();
    reader.check_for_changes().unwrap();
    assert_eq!(reader.get_attribute(&doc, "title").unwrap(), AttributeValue::from("one"));

    clock.advance(5);
    let mut update = doc.clone();
    update.attributes.clear();
    update.set("title", "two");
    writer.store(std::slice::from_mut(&mut update)).unwrap();

    backend.fail_reads(true);
    assert!(reader.check_for_changes().is_err());
    assert_eq!(reader.get_attribute(&doc, "title").unwrap(), AttributeValue::from("one"));

    backend.fail_reads(false);
    let report = reader.check_for_changes().unwrap();
    assert_eq!(report.changed_channels, vec![1]);
    assert_eq!(reader.get_attribute(&doc, "title").unwrap(), AttributeValue::from("two"));
}

#[tokio::test(start_paused = true)]
async fn chaos_failing_job_keeps_ticking() {
    let (backend, clock, ds) = setup(None);
    let mut config = DatasourceConfig::default();
    config.sync_checking.enabled = true;
    config.sync_checking.interval_ms = 500;
    let reader = Datasource::with_clock(ds.backend(), config, clock.clone()).unwrap();

    backend.fail_reads(true);
    reader.start().unwrap();
    let checker = reader.sync_checker().unwrap();
    checker.wait_for_ticks(3).await;
    assert!(backend.injected() >= 3);
    assert!(checker.is_running());

    backend.fail_reads(false);
    let mut doc = ContentObject::new(DOC, 1).with("title", "late");
    ds.store(std::slice::from_mut(&mut doc)).unwrap();
    let ticks = checker.ticks();
    checker.wait_for_ticks(ticks + 1).await;
    assert_eq!(reader.get_attribute(&doc, "title").unwrap(), AttributeValue::from("late"));

    reader.shutdown();
}

// =============================================================================
// Replication Failures
// =============================================================================

#[test]
fn chaos_interrupted_replication_resumes() {
    let (_, clock, source) = setup(None);
    let target_backend = Arc::new(FailingBackend::new(Arc::new(MemoryBackend::new())));
    let target = Datasource::with_clock(target_backend.clone(), DatasourceConfig::default(), clock.clone()).unwrap();
    let flags = SyncFlags {
        structure: true,
        types: true,
        ..Default::default()
    };
    Synchronizer::new(&source, &target).flags(flags).run().unwrap();

    let mut docs: Vec<ContentObject> = (0..6)
        .map(|i| ContentObject::new(DOC, 1).with("title", format!("doc {i}")))
        .collect();
    source.store(&mut docs).unwrap();

    target_backend.fail_commits(true);
    assert!(Synchronizer::new(&source, &target).batch_size(4).run().is_err());
    target_backend.fail_commits(false);
    assert_eq!(target_backend.last_update(1).unwrap(), None);
    assert_eq!(target_backend.replication_mark(1).unwrap(), None);
    assert_eq!(count_docs(&target), 0);

    let report = Synchronizer::new(&source, &target).batch_size(4).run().unwrap();
    assert_eq!(report.inserted, 6);
    assert_eq!(count_docs(&target), 6);
    for doc in &docs {
        assert_eq!(
            target.get_attribute(doc, "title").unwrap(),
            source.get_attribute(doc, "title").unwrap()
        );
    }
}
