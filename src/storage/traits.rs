// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relational backend interface.
//!
//! Every method is one typed, parameterized statement, so wrapping a backend
//! in [`CountingBackend`](super::counting::CountingBackend) yields the number
//! of round-trips an operation costs. Writes go through [`RelationalBackend::transact`]:
//! the closure's effects become visible to readers all at once on commit, or
//! not at all.

use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::channel::{ChannelNode, ChannelScope};
use crate::error::DatasourceError;
use crate::model::{
    AttributeRow, ChangeRecord, ChannelId, ChannelsetId, FileRef, ObjectId, ObjectRow,
    ObjectType, ObjectTypeId, TypeCatalog,
};
use crate::query::Expression;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object {0} not found")]
    NotFound(ObjectId),
    #[error("Object {0} already exists")]
    Conflict(ObjectId),
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Data corruption detected for '{id}': {reason}")]
    Corruption { id: String, reason: String },
}

/// A filter restricted to the variants visible from a channel scope.
#[derive(Debug, Clone, Copy)]
pub struct ScopedQuery<'a> {
    pub expression: &'a Expression,
    pub scope: &'a ChannelScope,
    pub catalog: &'a TypeCatalog,
}

/// Work performed inside [`RelationalBackend::transact`]. Returning an error
/// rolls the transaction back.
pub type TxWork<'a> = dyn FnMut(&mut dyn WriteTx) -> Result<(), DatasourceError> + 'a;

pub trait RelationalBackend: Send + Sync {
    /// All channel rows, ordered by `left`.
    fn load_channel_nodes(&self) -> Result<Vec<ChannelNode>, StorageError>;

    fn load_object_types(&self) -> Result<Vec<ObjectType>, StorageError>;

    /// Rows for `ids`, ordered by id. Unknown ids are skipped.
    fn select_objects(&self, ids: &[ObjectId]) -> Result<Vec<ObjectRow>, StorageError>;

    /// Every variant of the given channelsets.
    fn select_variants(&self, channelsets: &[ChannelsetId]) -> Result<Vec<ObjectRow>, StorageError>;

    /// One variant carrying `content_id`, lowest id first.
    fn select_by_content_id(&self, content_id: &str) -> Result<Option<ObjectRow>, StorageError>;

    /// Side-table rows of one attribute for `ids`, ordered by object id and sortorder.
    fn select_attribute(&self, name: &str, ids: &[ObjectId]) -> Result<Vec<AttributeRow>, StorageError>;

    /// Ids of visible variants matching the query, ordered by id.
    fn select_matching(&self, query: &ScopedQuery<'_>) -> Result<Vec<ObjectId>, StorageError>;

    fn count_matching(&self, query: &ScopedQuery<'_>) -> Result<usize, StorageError>;

    /// Rows of `channel` changed or deleted after `since`.
    fn select_changed(&self, channel: ChannelId, since: i64) -> Result<Vec<ChangeRecord>, StorageError>;

    /// Committed change watermark of `channel`.
    fn last_update(&self, channel: ChannelId) -> Result<Option<i64>, StorageError>;

    /// Source watermark up to which `channel` has been replicated into this
    /// backend. Independent of local writes.
    fn replication_mark(&self, channel: ChannelId) -> Result<Option<i64>, StorageError>;

    /// Ids of all rows materialized in `channel`.
    fn select_ids_in_channel(&self, channel: ChannelId) -> Result<Vec<ObjectId>, StorageError>;

    fn count_attribute_rows(&self, name: &str) -> Result<usize, StorageError>;

    /// Whether any side-table row still points at `path`.
    fn is_file_referenced(&self, path: &Path) -> Result<bool, StorageError>;

    fn transact(&self, work: &mut TxWork<'_>) -> Result<(), DatasourceError>;
}

/// Statements available inside a write transaction.
pub trait WriteTx {
    fn replace_channel_nodes(&mut self, nodes: &[ChannelNode]) -> Result<(), StorageError>;

    fn save_object_type(&mut self, object_type: &ObjectType) -> Result<(), StorageError>;

    fn allocate_id(&mut self) -> Result<ObjectId, StorageError>;

    fn select_objects(&mut self, ids: &[ObjectId]) -> Result<Vec<ObjectRow>, StorageError>;

    fn select_objects_of_types(&mut self, types: &[ObjectTypeId]) -> Result<Vec<ObjectRow>, StorageError>;

    fn select_variants(&mut self, channelsets: &[ChannelsetId]) -> Result<Vec<ObjectRow>, StorageError>;

    /// Fails with [`StorageError::Conflict`] if the id is taken.
    fn insert_object(&mut self, row: &ObjectRow) -> Result<(), StorageError>;

    /// Fails with [`StorageError::NotFound`] if the id is unknown.
    fn update_object(&mut self, row: &ObjectRow) -> Result<(), StorageError>;

    /// Delete the row and all of its side-table rows.
    fn delete_object(&mut self, id: ObjectId) -> Result<(), StorageError>;

    /// Keep a tombstone so the sync checker and replication see the deletion.
    fn record_deletion(&mut self, change: &ChangeRecord) -> Result<(), StorageError>;

    fn select_attribute(&mut self, name: &str, ids: &[ObjectId]) -> Result<Vec<AttributeRow>, StorageError>;

    /// Every side-table row of one attribute, across all objects.
    fn select_attribute_rows(&mut self, name: &str) -> Result<Vec<AttributeRow>, StorageError>;

    /// File references held by any attribute of `id`.
    fn select_object_files(&mut self, id: ObjectId) -> Result<Vec<FileRef>, StorageError>;

    /// Replace all rows of (`id`, `name`). An empty slice deletes the attribute.
    fn replace_attribute(&mut self, id: ObjectId, name: &str, rows: &[AttributeRow]) -> Result<(), StorageError>;

    /// Path of some stored file with this content.
    fn find_file_by_hash(&mut self, hash: &str, length: u64) -> Result<Option<PathBuf>, StorageError>;

    fn last_update(&mut self, channel: ChannelId) -> Result<Option<i64>, StorageError>;

    fn set_last_update(&mut self, channel: ChannelId, timestamp: i64) -> Result<(), StorageError>;

    fn set_replication_mark(&mut self, channel: ChannelId, watermark: i64) -> Result<(), StorageError>;
}
