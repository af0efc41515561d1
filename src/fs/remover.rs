//! Deferred removal of obsolete files.
//!
//! A queued path is only unlinked when no side-table row references it any
//! more: hard-linked duplicates and rewrites of identical content keep theirs.
//! The check and the unlink happen under the store's exclusive gate, so no
//! write in flight can start referencing the path in between.

use std::fs;
use std::path::Path;
use tracing::{debug, warn};

use super::FsAttributeStore;
use crate::error::Result;
use crate::metrics;
use crate::storage::RelationalBackend;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemovalReport {
    pub removed: usize,
    /// Still referenced, dropped from the queue
    pub referenced: usize,
    /// Requeued for the next run
    pub failed: usize,
}

impl FsAttributeStore {
    /// Process the removal queue once.
    ///
    /// A backend failure requeues everything not yet handled and is returned.
    pub fn remove_pending(&self, backend: &dyn RelationalBackend) -> Result<RemovalReport> {
        let mut queue = self.take_pending();
        queue.sort();
        queue.dedup();

        let mut report = RemovalReport::default();
        let mut retry = Vec::new();
        let mut remaining = queue.into_iter();

        while let Some(relative) = remaining.next() {
            let _gate = self.enter_exclusive();
            let referenced = match backend.is_file_referenced(&relative) {
                Ok(referenced) => referenced,
                Err(e) => {
                    retry.push(relative);
                    retry.extend(remaining);
                    report.failed = retry.len();
                    self.queue_removals(retry);
                    metrics::record_file_removal("failed", report.failed);
                    return Err(e.into());
                }
            };
            if referenced {
                report.referenced += 1;
                continue;
            }

            let path = self.absolute(&relative);
            match fs::remove_file(&path) {
                Ok(()) => {
                    report.removed += 1;
                    prune_empty_dirs(self.root(), &path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => report.removed += 1,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to remove obsolete file");
                    report.failed += 1;
                    retry.push(relative);
                }
            }
        }

        self.queue_removals(retry);
        metrics::set_pending_removals(self.pending_removals());
        metrics::record_file_removal("removed", report.removed);
        metrics::record_file_removal("referenced", report.referenced);
        metrics::record_file_removal("failed", report.failed);
        if report != RemovalReport::default() {
            debug!(?report, "Processed file removals");
        }
        Ok(report)
    }
}

/// Remove the (at most two) shard directories above `file` once empty.
fn prune_empty_dirs(root: &Path, file: &Path) {
    let mut dir = file.parent();
    for _ in 0..2 {
        match dir {
            Some(d) if d != root && fs::remove_dir(d).is_ok() => dir = d.parent(),
            _ => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttributeRow, FileRef, StoredValue};
    use crate::storage::{MemoryBackend, WriteTx};
    use std::time::Duration;

    fn reference(tx: &mut dyn WriteTx, file: &FileRef) -> crate::error::Result<()> {
        let rows = [AttributeRow {
            object_id: 1,
            name: "body".into(),
            sortorder: 0,
            value: StoredValue::File(file.clone()),
        }];
        Ok(tx.replace_attribute(1, "body", &rows)?)
    }

    #[test]
    fn test_unreferenced_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsAttributeStore::open(dir.path()).unwrap();
        let backend = MemoryBackend::new();

        let mut file = None;
        backend
            .transact(&mut |tx| {
                let mut files = store.begin();
                file = Some(files.write(tx, 1, 1, "body", 0, b"old")?);
                files.commit();
                Ok(())
            })
            .unwrap();
        let file = file.unwrap();
        store.queue_removals(vec![file.path.clone()]);

        let report = store.remove_pending(&backend).unwrap();
        assert_eq!(report.removed, 1);
        assert!(!store.absolute(&file.path).exists());
        // empty shard directories are pruned, the root stays
        assert!(!store.absolute(&file.path).parent().unwrap().exists());
        assert!(store.root().exists());
    }

    #[test]
    fn test_referenced_file_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsAttributeStore::open(dir.path()).unwrap();
        let backend = MemoryBackend::new();

        let mut file = None;
        backend
            .transact(&mut |tx| {
                let mut files = store.begin();
                let written = files.write(tx, 1, 1, "body", 0, b"kept")?;
                tx.replace_attribute(
                    1,
                    "body",
                    &[AttributeRow {
                        object_id: 1,
                        name: "body".into(),
                        sortorder: 0,
                        value: StoredValue::File(written.clone()),
                    }],
                )?;
                file = Some(written);
                files.commit();
                Ok(())
            })
            .unwrap();
        let file = file.unwrap();
        store.queue_removals(vec![file.path.clone(), file.path.clone()]);

        let report = store.remove_pending(&backend).unwrap();
        assert_eq!(report.referenced, 1);
        assert_eq!(report.removed, 0);
        assert!(store.absolute(&file.path).exists());
        assert_eq!(store.pending_removals(), 0);
    }

    #[test]
    fn test_missing_file_counts_as_removed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsAttributeStore::open(dir.path()).unwrap();
        store.queue_removals(vec!["aa/bb/gone".into()]);
        let report = store.remove_pending(&MemoryBackend::new()).unwrap();
        assert_eq!(report.removed, 1);
    }

    #[test]
    fn test_queued_path_reused_by_open_write_survives() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsAttributeStore::open(dir.path()).unwrap();
        let backend = MemoryBackend::new();

        // stored, then dropped from its row and queued as obsolete
        let mut file = None;
        backend
            .transact(&mut |tx| {
                let mut files = store.begin();
                file = Some(files.write(tx, 1, 1, "body", 0, b"same")?);
                files.commit();
                Ok(())
            })
            .unwrap();
        let file = file.unwrap();
        store.queue_removals(vec![file.path.clone()]);

        // a store of the same content reuses the path while the remover runs
        let files = store.begin();
        std::thread::scope(|scope| {
            let remover = scope.spawn(|| store.remove_pending(&backend).unwrap());
            std::thread::sleep(Duration::from_millis(50));
            assert!(!remover.is_finished());

            let mut files = Some(files);
            backend
                .transact(&mut |tx| {
                    if let Some(files) = files.as_mut() {
                        let written = files.write(tx, 1, 1, "body", 0, b"same")?;
                        assert_eq!(written, file);
                        assert_eq!(files.created(), 0);
                    }
                    reference(tx, &file)
                })
                .unwrap();
            files.take().unwrap().commit();

            let report = remover.join().unwrap();
            assert_eq!(report.referenced, 1);
            assert_eq!(report.removed, 0);
        });

        assert_eq!(store.read(&file).unwrap(), b"same");
    }

    #[test]
    fn test_removal_waits_for_rolled_back_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsAttributeStore::open(dir.path()).unwrap();
        let backend = MemoryBackend::new();

        let mut file = None;
        backend
            .transact(&mut |tx| {
                let mut files = store.begin();
                file = Some(files.write(tx, 1, 1, "body", 0, b"gone")?);
                files.commit();
                Ok(())
            })
            .unwrap();
        let file = file.unwrap();
        store.queue_removals(vec![file.path.clone()]);

        let files = store.begin();
        std::thread::scope(|scope| {
            let remover = scope.spawn(|| store.remove_pending(&backend).unwrap());
            std::thread::sleep(Duration::from_millis(50));
            assert!(!remover.is_finished());
            files.rollback();
            assert_eq!(remover.join().unwrap().removed, 1);
        });
        assert!(!store.absolute(&file.path).exists());
    }
}
