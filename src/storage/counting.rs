//! Statement-counting backend wrapper.
//!
//! Used to assert round-trip bounds: a warm cache costs zero statements, a
//! prefetch of one attribute costs one, and so on.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::traits::{RelationalBackend, ScopedQuery, StorageError, TxWork, WriteTx};
use crate::channel::ChannelNode;
use crate::error::DatasourceError;
use crate::model::{
    AttributeRow, ChangeRecord, ChannelId, ChannelsetId, FileRef, ObjectId, ObjectRow,
    ObjectType, ObjectTypeId,
};

pub struct CountingBackend {
    inner: Arc<dyn RelationalBackend>,
    statements: AtomicU64,
}

impl CountingBackend {
    pub fn new(inner: Arc<dyn RelationalBackend>) -> Self {
        Self {
            inner,
            statements: AtomicU64::new(0),
        }
    }

    /// Statements issued since creation or the last [`reset`](Self::reset).
    pub fn statements(&self) -> u64 {
        self.statements.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.statements.store(0, Ordering::SeqCst);
    }

    fn count(&self) {
        self.statements.fetch_add(1, Ordering::SeqCst);
    }
}

impl RelationalBackend for CountingBackend {
    fn load_channel_nodes(&self) -> Result<Vec<ChannelNode>, StorageError> {
        self.count();
        self.inner.load_channel_nodes()
    }

    fn load_object_types(&self) -> Result<Vec<ObjectType>, StorageError> {
        self.count();
        self.inner.load_object_types()
    }

    fn select_objects(&self, ids: &[ObjectId]) -> Result<Vec<ObjectRow>, StorageError> {
        self.count();
        self.inner.select_objects(ids)
    }

    fn select_variants(&self, channelsets: &[ChannelsetId]) -> Result<Vec<ObjectRow>, StorageError> {
        self.count();
        self.inner.select_variants(channelsets)
    }

    fn select_by_content_id(&self, content_id: &str) -> Result<Option<ObjectRow>, StorageError> {
        self.count();
        self.inner.select_by_content_id(content_id)
    }

    fn select_attribute(&self, name: &str, ids: &[ObjectId]) -> Result<Vec<AttributeRow>, StorageError> {
        self.count();
        self.inner.select_attribute(name, ids)
    }

    fn select_matching(&self, query: &ScopedQuery<'_>) -> Result<Vec<ObjectId>, StorageError> {
        self.count();
        self.inner.select_matching(query)
    }

    fn count_matching(&self, query: &ScopedQuery<'_>) -> Result<usize, StorageError> {
        self.count();
        self.inner.count_matching(query)
    }

    fn select_changed(&self, channel: ChannelId, since: i64) -> Result<Vec<ChangeRecord>, StorageError> {
        self.count();
        self.inner.select_changed(channel, since)
    }

    fn last_update(&self, channel: ChannelId) -> Result<Option<i64>, StorageError> {
        self.count();
        self.inner.last_update(channel)
    }

    fn replication_mark(&self, channel: ChannelId) -> Result<Option<i64>, StorageError> {
        self.count();
        self.inner.replication_mark(channel)
    }

    fn select_ids_in_channel(&self, channel: ChannelId) -> Result<Vec<ObjectId>, StorageError> {
        self.count();
        self.inner.select_ids_in_channel(channel)
    }

    fn count_attribute_rows(&self, name: &str) -> Result<usize, StorageError> {
        self.count();
        self.inner.count_attribute_rows(name)
    }

    fn is_file_referenced(&self, path: &Path) -> Result<bool, StorageError> {
        self.count();
        self.inner.is_file_referenced(path)
    }

    fn transact(&self, work: &mut TxWork<'_>) -> Result<(), DatasourceError> {
        self.inner.transact(&mut |tx| {
            let mut counted = CountingTx {
                inner: tx,
                statements: &self.statements,
            };
            work(&mut counted)
        })
    }
}

struct CountingTx<'a> {
    inner: &'a mut dyn WriteTx,
    statements: &'a AtomicU64,
}

impl CountingTx<'_> {
    fn count(&self) {
        self.statements.fetch_add(1, Ordering::SeqCst);
    }
}

impl WriteTx for CountingTx<'_> {
    fn replace_channel_nodes(&mut self, nodes: &[ChannelNode]) -> Result<(), StorageError> {
        self.count();
        self.inner.replace_channel_nodes(nodes)
    }

    fn save_object_type(&mut self, object_type: &ObjectType) -> Result<(), StorageError> {
        self.count();
        self.inner.save_object_type(object_type)
    }

    fn allocate_id(&mut self) -> Result<ObjectId, StorageError> {
        self.count();
        self.inner.allocate_id()
    }

    fn select_objects(&mut self, ids: &[ObjectId]) -> Result<Vec<ObjectRow>, StorageError> {
        self.count();
        self.inner.select_objects(ids)
    }

    fn select_objects_of_types(&mut self, types: &[ObjectTypeId]) -> Result<Vec<ObjectRow>, StorageError> {
        self.count();
        self.inner.select_objects_of_types(types)
    }

    fn select_variants(&mut self, channelsets: &[ChannelsetId]) -> Result<Vec<ObjectRow>, StorageError> {
        self.count();
        self.inner.select_variants(channelsets)
    }

    fn insert_object(&mut self, row: &ObjectRow) -> Result<(), StorageError> {
        self.count();
        self.inner.insert_object(row)
    }

    fn update_object(&mut self, row: &ObjectRow) -> Result<(), StorageError> {
        self.count();
        self.inner.update_object(row)
    }

    fn delete_object(&mut self, id: ObjectId) -> Result<(), StorageError> {
        self.count();
        self.inner.delete_object(id)
    }

    fn record_deletion(&mut self, change: &ChangeRecord) -> Result<(), StorageError> {
        self.count();
        self.inner.record_deletion(change)
    }

    fn select_attribute(&mut self, name: &str, ids: &[ObjectId]) -> Result<Vec<AttributeRow>, StorageError> {
        self.count();
        self.inner.select_attribute(name, ids)
    }

    fn select_attribute_rows(&mut self, name: &str) -> Result<Vec<AttributeRow>, StorageError> {
        self.count();
        self.inner.select_attribute_rows(name)
    }

    fn select_object_files(&mut self, id: ObjectId) -> Result<Vec<FileRef>, StorageError> {
        self.count();
        self.inner.select_object_files(id)
    }

    fn replace_attribute(&mut self, id: ObjectId, name: &str, rows: &[AttributeRow]) -> Result<(), StorageError> {
        self.count();
        self.inner.replace_attribute(id, name, rows)
    }

    fn find_file_by_hash(&mut self, hash: &str, length: u64) -> Result<Option<PathBuf>, StorageError> {
        self.count();
        self.inner.find_file_by_hash(hash, length)
    }

    fn last_update(&mut self, channel: ChannelId) -> Result<Option<i64>, StorageError> {
        self.count();
        self.inner.last_update(channel)
    }

    fn set_last_update(&mut self, channel: ChannelId, timestamp: i64) -> Result<(), StorageError> {
        self.count();
        self.inner.set_last_update(channel, timestamp)
    }

    fn set_replication_mark(&mut self, channel: ChannelId, watermark: i64) -> Result<(), StorageError> {
        self.count();
        self.inner.set_replication_mark(channel, watermark)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryBackend;

    #[test]
    fn test_counts_reads_and_transaction_statements() {
        let backend = CountingBackend::new(Arc::new(MemoryBackend::new()));
        backend.select_objects(&[1, 2]).unwrap();
        backend.last_update(1).unwrap();
        assert_eq!(backend.statements(), 2);

        backend
            .transact(&mut |tx| {
                let id = tx.allocate_id()?;
                tx.set_last_update(1, id as i64)?;
                Ok(())
            })
            .unwrap();
        assert_eq!(backend.statements(), 4);

        backend.reset();
        assert_eq!(backend.statements(), 0);
    }
}
