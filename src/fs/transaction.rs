//! File effects of one backend transaction.
//!
//! ```text
//! write ──→ temp file + digest ──→ target exists?     → drop temp (unchanged)
//!                                └→ same hash stored? → hard link (linked)
//!                                └→ otherwise         → rename temp (written)
//!
//! commit   → staged paths go to the remover queue
//! rollback → files created here are unlinked, staged paths are forgotten
//! ```
//!
//! Dropping an uncommitted transaction rolls it back. A transaction holds the
//! store's gate shared from `begin` until it commits or rolls back, which
//! must happen after the backend transaction has finished.

use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use parking_lot::RwLockReadGuard;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::FsAttributeStore;
use crate::error::{DatasourceError, Result};
use crate::metrics;
use crate::model::{FileRef, ObjectId, ObjectTypeId};
use crate::storage::WriteTx;

const CHUNK: usize = 64 * 1024;

pub struct FsTransaction<'a> {
    store: &'a FsAttributeStore,
    /// Absolute paths created by this transaction
    created: Vec<PathBuf>,
    /// Relative paths that become obsolete on commit
    staged: Vec<PathBuf>,
    committed: bool,
    _gate: RwLockReadGuard<'a, ()>,
}

impl<'a> FsTransaction<'a> {
    pub(super) fn new(store: &'a FsAttributeStore) -> Self {
        Self {
            store,
            _gate: store.enter_shared(),
            created: Vec::new(),
            staged: Vec::new(),
            committed: false,
        }
    }

    /// Store one value and return its reference.
    #[allow(clippy::too_many_arguments)]
    pub fn write(
        &mut self,
        tx: &mut dyn WriteTx,
        obj_type: ObjectTypeId,
        id: ObjectId,
        attribute: &str,
        sortorder: u32,
        bytes: &[u8],
    ) -> Result<FileRef> {
        let temp = self.store.temp_path();
        let (hash, length) = match write_hashed(&temp, bytes) {
            Ok(digest) => digest,
            Err(e) => {
                remove_quietly(&temp);
                return Err(DatasourceError::io(&temp, e));
            }
        };

        let relative = FsAttributeStore::relative_path(obj_type, id, attribute, sortorder, &hash, length);
        let target = self.store.absolute(&relative);
        let file = FileRef {
            path: relative.clone(),
            hash,
            length,
        };

        if target.exists() {
            remove_quietly(&temp);
            metrics::record_file_write("unchanged");
            return Ok(file);
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| DatasourceError::io(parent, e))?;
        }

        let existing = tx
            .find_file_by_hash(&file.hash, file.length)?
            .map(|path| self.store.absolute(&path))
            .filter(|path| path.exists());
        let linked = match existing {
            Some(source) => match fs::hard_link(&source, &target) {
                Ok(()) => true,
                Err(e) => {
                    debug!(error = %e, source = %source.display(), "Hard link failed, storing a copy");
                    false
                }
            },
            None => false,
        };

        if linked {
            remove_quietly(&temp);
            metrics::record_file_write("linked");
        } else {
            if let Err(e) = fs::rename(&temp, &target) {
                remove_quietly(&temp);
                return Err(DatasourceError::io(&target, e));
            }
            metrics::record_file_write("written");
        }
        self.created.push(target);
        Ok(file)
    }

    /// Mark a path obsolete once the transaction commits.
    pub fn stage_removal(&mut self, relative: PathBuf) {
        self.staged.push(relative);
    }

    pub fn created(&self) -> usize {
        self.created.len()
    }

    pub fn commit(mut self) {
        self.committed = true;
        let staged = std::mem::take(&mut self.staged);
        debug!(created = self.created.len(), staged = staged.len(), "File transaction committed");
        self.store.queue_removals(staged);
    }

    pub fn rollback(mut self) {
        self.undo();
    }

    fn undo(&mut self) {
        for path in self.created.drain(..) {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to remove file of rolled back transaction");
                }
            }
        }
        self.staged.clear();
    }
}

impl Drop for FsTransaction<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.undo();
        }
    }
}

/// Write `bytes` to `path`, hashing them on the way through.
fn write_hashed(path: &Path, bytes: &[u8]) -> std::io::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut out = BufWriter::new(File::create(path)?);
    for chunk in bytes.chunks(CHUNK) {
        hasher.update(chunk);
        out.write_all(chunk)?;
    }
    out.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    Ok((hex::encode(hasher.finalize()), bytes.len() as u64))
}

fn remove_quietly(path: &Path) {
    let _ = fs::remove_file(path);
}
