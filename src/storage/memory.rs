//! In-memory relational backend.
//!
//! Tables live in one immutable snapshot behind an `Arc`. A transaction works
//! on a private copy and swaps it in on commit, so readers observe a whole
//! transaction or none of it.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::traits::{RelationalBackend, ScopedQuery, StorageError, TxWork, WriteTx};
use crate::channel::ChannelNode;
use crate::error::DatasourceError;
use crate::model::{
    AttributeRow, ChangeRecord, ChannelId, ChannelsetId, FileRef, ObjectId, ObjectRow,
    ObjectType, ObjectTypeId, Scalar, StoredValue,
};
use crate::query::{CoreField, Operand};

#[derive(Debug, Clone, Default)]
struct Tables {
    channels: Vec<ChannelNode>,
    types: BTreeMap<ObjectTypeId, ObjectType>,
    objects: BTreeMap<ObjectId, ObjectRow>,
    attributes: BTreeMap<(ObjectId, String), Vec<AttributeRow>>,
    deletions: Vec<ChangeRecord>,
    last_update: BTreeMap<ChannelId, i64>,
    replication_marks: BTreeMap<ChannelId, i64>,
    next_id: ObjectId,
}

impl Tables {
    fn select_objects(&self, ids: &[ObjectId]) -> Vec<ObjectRow> {
        let wanted: BTreeSet<_> = ids.iter().collect();
        wanted
            .into_iter()
            .filter_map(|id| self.objects.get(id).cloned())
            .collect()
    }

    fn select_variants(&self, channelsets: &[ChannelsetId]) -> Vec<ObjectRow> {
        let wanted: BTreeSet<_> = channelsets.iter().collect();
        self.objects
            .values()
            .filter(|row| wanted.contains(&row.channelset_id))
            .cloned()
            .collect()
    }

    fn select_attribute(&self, name: &str, ids: &[ObjectId]) -> Vec<AttributeRow> {
        let wanted: BTreeSet<_> = ids.iter().collect();
        wanted
            .into_iter()
            .filter_map(|id| self.attributes.get(&(*id, name.to_string())))
            .flatten()
            .cloned()
            .collect()
    }

    fn files(&self) -> impl Iterator<Item = &FileRef> {
        self.attributes.values().flatten().filter_map(AttributeRow::file)
    }

    fn matching(&self, query: &ScopedQuery<'_>) -> Vec<ObjectId> {
        let mut visible: HashMap<ChannelsetId, &ObjectRow> = HashMap::new();
        for row in self.objects.values() {
            let Some(rank) = query.scope.rank(row.channel_id) else {
                continue;
            };
            visible
                .entry(row.channelset_id)
                .and_modify(|current| {
                    let current_rank = query.scope.rank(current.channel_id).unwrap_or(usize::MAX);
                    if rank < current_rank {
                        *current = row;
                    }
                })
                .or_insert(row);
        }

        let mut ids: Vec<ObjectId> = visible
            .into_values()
            .filter(|row| {
                let mut values = |operand: &Operand| self.operand_values(row, operand, query);
                query.expression.matches(&mut values)
            })
            .map(|row| row.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn operand_values(&self, row: &ObjectRow, operand: &Operand, query: &ScopedQuery<'_>) -> Vec<Scalar> {
        match operand {
            Operand::Field(field) => vec![match field {
                CoreField::Id => Scalar::Long(row.id as i64),
                CoreField::ObjType => Scalar::Long(i64::from(row.obj_type)),
                CoreField::ChannelsetId => Scalar::Long(row.channelset_id as i64),
                CoreField::ChannelId => Scalar::Long(i64::from(row.channel_id)),
                CoreField::ContentId => Scalar::Text(row.content_id.clone()),
                CoreField::UpdatedAt => Scalar::Long(row.updated_at),
            }],
            Operand::Attribute(name) => match query.catalog.attribute(name) {
                None => Vec::new(),
                Some(attr) if attr.optimized => row
                    .optimized
                    .get(name)
                    .map(|v| v.values().to_vec())
                    .unwrap_or_default(),
                Some(_) => self
                    .attributes
                    .get(&(row.id, name.clone()))
                    .into_iter()
                    .flatten()
                    .filter_map(|r| match &r.value {
                        StoredValue::Inline(scalar) => Some(scalar.clone()),
                        StoredValue::File(_) => None,
                    })
                    .collect(),
            },
        }
    }
}

/// Reference backend keeping all tables in memory.
pub struct MemoryBackend {
    state: RwLock<Arc<Tables>>,
    writer: Mutex<()>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Arc::new(Tables {
                next_id: 1,
                ..Tables::default()
            })),
            writer: Mutex::new(()),
        }
    }

    fn snapshot(&self) -> Arc<Tables> {
        self.state.read().clone()
    }

    /// Number of object rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot().objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot().objects.is_empty()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RelationalBackend for MemoryBackend {
    fn load_channel_nodes(&self) -> Result<Vec<ChannelNode>, StorageError> {
        let mut nodes = self.snapshot().channels.clone();
        nodes.sort_by_key(|n| n.left);
        Ok(nodes)
    }

    fn load_object_types(&self) -> Result<Vec<ObjectType>, StorageError> {
        Ok(self.snapshot().types.values().cloned().collect())
    }

    fn select_objects(&self, ids: &[ObjectId]) -> Result<Vec<ObjectRow>, StorageError> {
        Ok(self.snapshot().select_objects(ids))
    }

    fn select_variants(&self, channelsets: &[ChannelsetId]) -> Result<Vec<ObjectRow>, StorageError> {
        Ok(self.snapshot().select_variants(channelsets))
    }

    fn select_by_content_id(&self, content_id: &str) -> Result<Option<ObjectRow>, StorageError> {
        Ok(self
            .snapshot()
            .objects
            .values()
            .find(|row| row.content_id == content_id)
            .cloned())
    }

    fn select_attribute(&self, name: &str, ids: &[ObjectId]) -> Result<Vec<AttributeRow>, StorageError> {
        Ok(self.snapshot().select_attribute(name, ids))
    }

    fn select_matching(&self, query: &ScopedQuery<'_>) -> Result<Vec<ObjectId>, StorageError> {
        Ok(self.snapshot().matching(query))
    }

    fn count_matching(&self, query: &ScopedQuery<'_>) -> Result<usize, StorageError> {
        Ok(self.snapshot().matching(query).len())
    }

    fn select_changed(&self, channel: ChannelId, since: i64) -> Result<Vec<ChangeRecord>, StorageError> {
        let tables = self.snapshot();
        let mut changes: Vec<ChangeRecord> = tables
            .objects
            .values()
            .filter(|row| row.channel_id == channel && row.updated_at > since)
            .map(ChangeRecord::from)
            .collect();
        changes.extend(
            tables
                .deletions
                .iter()
                .filter(|d| d.channel_id == channel && d.updated_at > since)
                .cloned(),
        );
        changes.sort_by_key(|c| (c.updated_at, c.id));
        Ok(changes)
    }

    fn last_update(&self, channel: ChannelId) -> Result<Option<i64>, StorageError> {
        Ok(self.snapshot().last_update.get(&channel).copied())
    }

    fn replication_mark(&self, channel: ChannelId) -> Result<Option<i64>, StorageError> {
        Ok(self.snapshot().replication_marks.get(&channel).copied())
    }

    fn select_ids_in_channel(&self, channel: ChannelId) -> Result<Vec<ObjectId>, StorageError> {
        Ok(self
            .snapshot()
            .objects
            .values()
            .filter(|row| row.channel_id == channel)
            .map(|row| row.id)
            .collect())
    }

    fn count_attribute_rows(&self, name: &str) -> Result<usize, StorageError> {
        Ok(self
            .snapshot()
            .attributes
            .iter()
            .filter(|((_, attr), _)| attr == name)
            .map(|(_, rows)| rows.len())
            .sum())
    }

    fn is_file_referenced(&self, path: &Path) -> Result<bool, StorageError> {
        Ok(self.snapshot().files().any(|f| f.path == path))
    }

    fn transact(&self, work: &mut TxWork<'_>) -> Result<(), DatasourceError> {
        let _writer = self.writer.lock();
        let mut working = (*self.snapshot()).clone();
        work(&mut MemoryTx {
            tables: &mut working,
        })?;
        *self.state.write() = Arc::new(working);
        Ok(())
    }
}

struct MemoryTx<'a> {
    tables: &'a mut Tables,
}

impl WriteTx for MemoryTx<'_> {
    fn replace_channel_nodes(&mut self, nodes: &[ChannelNode]) -> Result<(), StorageError> {
        self.tables.channels = nodes.to_vec();
        Ok(())
    }

    fn save_object_type(&mut self, object_type: &ObjectType) -> Result<(), StorageError> {
        self.tables.types.insert(object_type.id, object_type.clone());
        Ok(())
    }

    fn allocate_id(&mut self) -> Result<ObjectId, StorageError> {
        let id = self.tables.next_id.max(1);
        self.tables.next_id = id + 1;
        Ok(id)
    }

    fn select_objects(&mut self, ids: &[ObjectId]) -> Result<Vec<ObjectRow>, StorageError> {
        Ok(self.tables.select_objects(ids))
    }

    fn select_objects_of_types(&mut self, types: &[ObjectTypeId]) -> Result<Vec<ObjectRow>, StorageError> {
        Ok(self
            .tables
            .objects
            .values()
            .filter(|row| types.contains(&row.obj_type))
            .cloned()
            .collect())
    }

    fn select_variants(&mut self, channelsets: &[ChannelsetId]) -> Result<Vec<ObjectRow>, StorageError> {
        Ok(self.tables.select_variants(channelsets))
    }

    fn insert_object(&mut self, row: &ObjectRow) -> Result<(), StorageError> {
        if self.tables.objects.contains_key(&row.id) {
            return Err(StorageError::Conflict(row.id));
        }
        self.tables.next_id = self.tables.next_id.max(row.id + 1);
        self.tables.objects.insert(row.id, row.clone());
        Ok(())
    }

    fn update_object(&mut self, row: &ObjectRow) -> Result<(), StorageError> {
        match self.tables.objects.get_mut(&row.id) {
            Some(existing) => {
                *existing = row.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound(row.id)),
        }
    }

    fn delete_object(&mut self, id: ObjectId) -> Result<(), StorageError> {
        self.tables.objects.remove(&id);
        self.tables.attributes.retain(|(object_id, _), _| *object_id != id);
        Ok(())
    }

    fn record_deletion(&mut self, change: &ChangeRecord) -> Result<(), StorageError> {
        self.tables.deletions.push(change.clone());
        Ok(())
    }

    fn select_attribute(&mut self, name: &str, ids: &[ObjectId]) -> Result<Vec<AttributeRow>, StorageError> {
        Ok(self.tables.select_attribute(name, ids))
    }

    fn select_attribute_rows(&mut self, name: &str) -> Result<Vec<AttributeRow>, StorageError> {
        Ok(self
            .tables
            .attributes
            .iter()
            .filter(|((_, attr), _)| attr == name)
            .flat_map(|(_, rows)| rows.iter().cloned())
            .collect())
    }

    fn select_object_files(&mut self, id: ObjectId) -> Result<Vec<FileRef>, StorageError> {
        Ok(self
            .tables
            .attributes
            .iter()
            .filter(|((object_id, _), _)| *object_id == id)
            .flat_map(|(_, rows)| rows.iter().filter_map(AttributeRow::file).cloned())
            .collect())
    }

    fn replace_attribute(&mut self, id: ObjectId, name: &str, rows: &[AttributeRow]) -> Result<(), StorageError> {
        let key = (id, name.to_string());
        if rows.is_empty() {
            self.tables.attributes.remove(&key);
        } else {
            let mut rows = rows.to_vec();
            rows.sort_by_key(|r| r.sortorder);
            self.tables.attributes.insert(key, rows);
        }
        Ok(())
    }

    fn find_file_by_hash(&mut self, hash: &str, length: u64) -> Result<Option<PathBuf>, StorageError> {
        Ok(self
            .tables
            .files()
            .find(|f| f.hash == hash && f.length == length)
            .map(|f| f.path.clone()))
    }

    fn last_update(&mut self, channel: ChannelId) -> Result<Option<i64>, StorageError> {
        Ok(self.tables.last_update.get(&channel).copied())
    }

    fn set_last_update(&mut self, channel: ChannelId, timestamp: i64) -> Result<(), StorageError> {
        self.tables.last_update.insert(channel, timestamp);
        Ok(())
    }

    fn set_replication_mark(&mut self, channel: ChannelId, watermark: i64) -> Result<(), StorageError> {
        self.tables.replication_marks.insert(channel, watermark);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, ChannelScope, ChannelTree};
    use crate::model::{AttributeKind, AttributeType, TypeCatalog};
    use crate::query::{CompareOp, Expression};

    fn row(id: ObjectId, channelset_id: ChannelsetId, channel_id: ChannelId) -> ObjectRow {
        ObjectRow {
            id,
            obj_type: 1,
            channelset_id,
            channel_id,
            content_id: format!("1.{id}"),
            updated_at: 10,
            optimized: BTreeMap::new(),
        }
    }

    fn int_row(id: ObjectId, value: i32) -> AttributeRow {
        AttributeRow {
            object_id: id,
            name: "int".into(),
            sortorder: 0,
            value: StoredValue::Inline(Scalar::Int(value)),
        }
    }

    #[test]
    fn test_commit_is_atomic() {
        let backend = MemoryBackend::new();
        let result = backend.transact(&mut |tx| {
            tx.insert_object(&row(1, 1, 1))?;
            Err(DatasourceError::Config("abort".into()))
        });
        assert!(result.is_err());
        assert!(backend.is_empty());

        backend
            .transact(&mut |tx| {
                tx.insert_object(&row(1, 1, 1))?;
                tx.insert_object(&row(2, 2, 1))?;
                Ok(())
            })
            .unwrap();
        assert_eq!(backend.len(), 2);
    }

    #[test]
    fn test_insert_conflict_and_id_allocation() {
        let backend = MemoryBackend::new();
        backend
            .transact(&mut |tx| {
                tx.insert_object(&row(5, 5, 1))?;
                assert_eq!(tx.allocate_id()?, 6);
                assert!(matches!(tx.insert_object(&row(5, 5, 1)), Err(StorageError::Conflict(5))));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_matching_uses_nearest_variant() {
        let backend = MemoryBackend::new();
        backend
            .transact(&mut |tx| {
                tx.insert_object(&row(1, 1, 1))?;
                tx.insert_object(&row(2, 1, 2))?;
                tx.replace_attribute(1, "int", &[int_row(1, 42)])?;
                tx.replace_attribute(2, "int", &[int_row(2, 44)])?;
                Ok(())
            })
            .unwrap();

        let tree = ChannelTree::new(vec![Channel::new(1, "Master").with_child(Channel::new(2, "Channel"))]).unwrap();
        let catalog = TypeCatalog::new(vec![ObjectType::new(1, "t")
            .with_attribute(AttributeType::new("int", AttributeKind::Int))]);
        let expr = Expression::attr("int", CompareOp::Gt, Scalar::Int(0));

        let master = ChannelScope::for_channel(&tree, 1).unwrap();
        let query = ScopedQuery { expression: &expr, scope: &master, catalog: &catalog };
        assert_eq!(backend.select_matching(&query).unwrap(), vec![1]);

        let channel = ChannelScope::for_channel(&tree, 2).unwrap();
        let query = ScopedQuery { expression: &expr, scope: &channel, catalog: &catalog };
        assert_eq!(backend.select_matching(&query).unwrap(), vec![2]);
        assert_eq!(backend.count_matching(&query).unwrap(), 1);
    }

    #[test]
    fn test_changes_include_deletions() {
        let backend = MemoryBackend::new();
        backend
            .transact(&mut |tx| {
                tx.insert_object(&row(1, 1, 1))?;
                tx.insert_object(&row(2, 2, 1))?;
                Ok(())
            })
            .unwrap();
        backend
            .transact(&mut |tx| {
                tx.delete_object(2)?;
                tx.record_deletion(&ChangeRecord {
                    updated_at: 20,
                    deleted: true,
                    ..ChangeRecord::from(&row(2, 2, 1))
                })?;
                Ok(tx.set_last_update(1, 20)?)
            })
            .unwrap();

        let changes = backend.select_changed(1, 10).unwrap();
        assert_eq!(changes.len(), 1);
        assert!(changes[0].deleted);
        assert_eq!(backend.select_changed(1, 0).unwrap().len(), 2);
        assert_eq!(backend.last_update(1).unwrap(), Some(20));

        backend
            .transact(&mut |tx| Ok(tx.set_replication_mark(1, 15)?))
            .unwrap();
        assert_eq!(backend.replication_mark(1).unwrap(), Some(15));
        assert_eq!(backend.last_update(1).unwrap(), Some(20));
    }

    #[test]
    fn test_file_references() {
        let backend = MemoryBackend::new();
        let file = FileRef {
            path: PathBuf::from("ab/cd/file"),
            hash: "abcd".into(),
            length: 3,
        };
        backend
            .transact(&mut |tx| {
                tx.insert_object(&row(1, 1, 1))?;
                tx.replace_attribute(
                    1,
                    "body",
                    &[AttributeRow {
                        object_id: 1,
                        name: "body".into(),
                        sortorder: 0,
                        value: StoredValue::File(file.clone()),
                    }],
                )?;
                assert_eq!(tx.find_file_by_hash("abcd", 3)?, Some(file.path.clone()));
                assert_eq!(tx.find_file_by_hash("abcd", 4)?, None);
                Ok(())
            })
            .unwrap();
        assert!(backend.is_file_referenced(Path::new("ab/cd/file")).unwrap());
        backend.transact(&mut |tx| Ok(tx.delete_object(1)?)).unwrap();
        assert!(!backend.is_file_referenced(Path::new("ab/cd/file")).unwrap());
    }
}
