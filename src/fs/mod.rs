// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Content-addressed filesystem attribute store.
//!
//! Values of `filesystem` attributes live in files below a root directory.
//! The side-table row only holds a [`FileRef`] (relative path, SHA-256, length).
//!
//! # Layout
//!
//! ```text
//! <root>/
//!   .tmp/<uuid>.tmp                         ← in-flight writes
//!   ab/cd/<type>.<id>.<attr>.<sortorder>.<sha256>.<length>
//! ```
//!
//! The path is a pure function of the object, attribute slot and content, so
//! storing the same bytes twice touches nothing. A new path whose content is
//! already stored elsewhere is created as a hard link to the existing file.
//!
//! Open [`FsTransaction`]s hold the store's gate shared; the remover takes it
//! exclusively around each reference check and unlink, so a path reused by
//! an uncommitted write is never removed underneath it.

pub mod remover;
pub mod transaction;

pub use remover::RemovalReport;
pub use transaction::FsTransaction;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{DatasourceError, Result};
use crate::metrics;
use crate::model::{FileRef, ObjectId, ObjectTypeId};

const TEMP_DIR: &str = ".tmp";

pub struct FsAttributeStore {
    root: PathBuf,
    /// Relative paths waiting for the remover job
    pending: Mutex<Vec<PathBuf>>,
    /// Shared by open transactions, exclusive while removing
    gate: RwLock<()>,
}

impl FsAttributeStore {
    /// Open (and create if needed) the store below `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let temp = root.join(TEMP_DIR);
        fs::create_dir_all(&temp).map_err(|e| DatasourceError::io(&temp, e))?;
        info!(root = %root.display(), "Filesystem attribute store opened");
        Ok(Self {
            root,
            pending: Mutex::new(Vec::new()),
            gate: RwLock::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic location of one value, relative to the root.
    pub fn relative_path(
        obj_type: ObjectTypeId,
        id: ObjectId,
        attribute: &str,
        sortorder: u32,
        hash: &str,
        length: u64,
    ) -> PathBuf {
        let shard_a = hash.get(0..2).unwrap_or("00");
        let shard_b = hash.get(2..4).unwrap_or("00");
        PathBuf::from(shard_a)
            .join(shard_b)
            .join(format!("{obj_type}.{id}.{attribute}.{sortorder}.{hash}.{length}"))
    }

    pub fn absolute(&self, relative: &Path) -> PathBuf {
        self.root.join(relative)
    }

    pub(crate) fn temp_path(&self) -> PathBuf {
        self.root
            .join(TEMP_DIR)
            .join(format!("{}.tmp", uuid::Uuid::new_v4()))
    }

    /// Hex SHA-256 and length of `bytes`.
    pub fn digest(bytes: &[u8]) -> (String, u64) {
        (hex::encode(Sha256::digest(bytes)), bytes.len() as u64)
    }

    /// Open a stored value for reading.
    pub fn open_stream(&self, file: &FileRef) -> Result<File> {
        let path = self.absolute(&file.path);
        File::open(&path).map_err(|e| DatasourceError::io(path, e))
    }

    pub fn read(&self, file: &FileRef) -> Result<Vec<u8>> {
        let path = self.absolute(&file.path);
        fs::read(&path).map_err(|e| DatasourceError::io(path, e))
    }

    pub fn begin(&self) -> FsTransaction<'_> {
        FsTransaction::new(self)
    }

    pub(crate) fn enter_shared(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read_recursive()
    }

    pub(crate) fn enter_exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write()
    }

    /// Hand committed obsolete paths to the remover.
    pub(crate) fn queue_removals(&self, paths: Vec<PathBuf>) {
        if paths.is_empty() {
            return;
        }
        let mut pending = self.pending.lock();
        pending.extend(paths);
        metrics::set_pending_removals(pending.len());
    }

    pub(crate) fn take_pending(&self) -> Vec<PathBuf> {
        std::mem::take(&mut *self.pending.lock())
    }

    pub fn pending_removals(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_is_deterministic_and_sharded() {
        let (hash, len) = FsAttributeStore::digest(b"hello");
        let a = FsAttributeStore::relative_path(10007, 4, "body", 0, &hash, len);
        let b = FsAttributeStore::relative_path(10007, 4, "body", 0, &hash, len);
        assert_eq!(a, b);
        assert!(a.starts_with(&hash[0..2]));
        assert!(a.to_string_lossy().ends_with(&format!("10007.4.body.0.{hash}.5")));
    }

    #[test]
    fn test_digest() {
        let (hash, len) = FsAttributeStore::digest(b"");
        assert_eq!(
            hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(len, 0);
    }

    #[test]
    fn test_open_creates_root_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsAttributeStore::open(dir.path().join("files")).unwrap();
        assert!(store.root().join(".tmp").is_dir());

        let (hash, length) = FsAttributeStore::digest(b"abc");
        let path = FsAttributeStore::relative_path(1, 1, "blob", 0, &hash, length);
        fs::create_dir_all(store.absolute(&path).parent().unwrap()).unwrap();
        fs::write(store.absolute(&path), b"abc").unwrap();

        let file = FileRef { path, hash, length };
        assert_eq!(store.read(&file).unwrap(), b"abc");
        assert!(store.open_stream(&file).is_ok());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsAttributeStore::open(dir.path()).unwrap();
        let file = FileRef {
            path: PathBuf::from("no/such/file"),
            hash: String::new(),
            length: 0,
        };
        assert!(matches!(store.read(&file), Err(DatasourceError::Io { .. })));
    }

    #[test]
    fn test_pending_queue() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsAttributeStore::open(dir.path()).unwrap();
        store.queue_removals(vec![PathBuf::from("a"), PathBuf::from("b")]);
        assert_eq!(store.pending_removals(), 2);
        assert_eq!(store.take_pending().len(), 2);
        assert_eq!(store.pending_removals(), 0);
    }
}
