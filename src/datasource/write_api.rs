//! Write operations: create, store, delete and channel watermarks.
//!
//! All effects of one call share one backend transaction, including files
//! written to the filesystem store. Validation happens before anything is
//! touched; on failure the transaction rolls back and newly created files
//! are unlinked.

use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use super::{observed, Core, Datasource, StoreMode};
use crate::cache::Invalidation;
use crate::channel::ChannelTree;
use crate::error::{DatasourceError, Result};
use crate::fs::FsAttributeStore;
use crate::model::{
    default_content_id, AttributeRow, ChangeRecord, ChannelId, ChannelsetId, ContentObject,
    ObjectId, ObjectRow, ObjectTypeId, StoredValue, TypeCatalog,
};
use crate::storage::{StorageError, WriteTx};
use crate::time_operation;

/// Change timestamps of one transaction, one per channel.
struct Stamps {
    now: i64,
    per_channel: HashMap<ChannelId, i64>,
}

impl Stamps {
    fn new(now: i64) -> Self {
        Self {
            now,
            per_channel: HashMap::new(),
        }
    }

    /// Timestamp for changes in `channel`: the clock, but strictly after the
    /// channel's previous change.
    fn stamp(&mut self, tx: &mut dyn WriteTx, channel: ChannelId) -> Result<i64, StorageError> {
        if let Some(ts) = self.per_channel.get(&channel) {
            return Ok(*ts);
        }
        let previous = tx.last_update(channel)?;
        let ts = previous.map_or(self.now, |p| self.now.max(p + 1));
        self.per_channel.insert(channel, ts);
        Ok(ts)
    }

    /// Record a timestamp carried over from elsewhere.
    fn observe(&mut self, channel: ChannelId, ts: i64) {
        let entry = self.per_channel.entry(channel).or_insert(ts);
        *entry = (*entry).max(ts);
    }

    /// Advance the watermark of every touched channel.
    fn apply(&self, tx: &mut dyn WriteTx) -> Result<(), StorageError> {
        for (channel, ts) in &self.per_channel {
            if tx.last_update(*channel)?.is_none_or(|previous| *ts > previous) {
                tx.set_last_update(*channel, *ts)?;
            }
        }
        Ok(())
    }
}

/// Identity assigned to a stored object.
struct Assigned {
    id: ObjectId,
    channelset_id: ChannelsetId,
    content_id: String,
    updated_at: i64,
}

impl Core {
    fn validate(&self, object: &ContentObject, catalog: &TypeCatalog, tree: &ChannelTree) -> Result<()> {
        catalog.object_type(object.obj_type)?;
        if !tree.contains(object.channel_id) {
            return Err(DatasourceError::UnknownChannel(object.channel_id));
        }
        for (name, value) in &object.attributes {
            let attribute = catalog.attribute_for(object.obj_type, name)?;
            attribute.check_value(value)?;
            if attribute.filesystem {
                self.file_store(name)?;
            }
        }
        Ok(())
    }

    /// Upsert `objects` in one transaction and write their identities back.
    pub(crate) fn store_objects(&self, objects: &mut [ContentObject], mode: StoreMode) -> Result<usize> {
        if objects.is_empty() {
            return Ok(0);
        }
        let catalog = self.catalog()?;
        let tree = self.tree()?;
        for object in objects.iter_mut() {
            self.validate(object, &catalog, &tree)?;
            let obj_type = object.obj_type;
            for (name, value) in object.attributes.iter_mut() {
                let attribute = catalog.attribute_for(obj_type, name)?;
                *value = attribute.normalize(std::mem::take(value));
            }
        }

        let now = self.clock.now_millis();
        let mut files = self.files.as_ref().map(FsAttributeStore::begin);
        let mut assigned: Vec<Assigned> = Vec::with_capacity(objects.len());
        let mut invalidation = Invalidation::default();
        let pending: &[ContentObject] = objects;

        let result = self.backend.transact(&mut |tx| {
            assigned.clear();
            invalidation = Invalidation::default();
            let mut stamps = Stamps::new(now);
            let mut slots: HashSet<(ChannelsetId, ChannelId)> = HashSet::new();

            for object in pending {
                let existing = match object.id {
                    Some(id) => tx.select_objects(&[id])?.into_iter().next(),
                    None => None,
                };
                match (&existing, object.id, mode) {
                    (Some(row), _, _) if row.channel_id != object.channel_id || row.obj_type != object.obj_type => {
                        return Err(DatasourceError::invalid_value(
                            "channel_id",
                            format!("object {} cannot move to another channel or type", row.id),
                        ));
                    }
                    (None, Some(id), StoreMode::Stamp) => return Err(StorageError::NotFound(id).into()),
                    _ => {}
                }

                let id = match object.id {
                    Some(id) => id,
                    None => tx.allocate_id()?,
                };
                let channelset_id = object
                    .channelset_id
                    .or(existing.as_ref().map(|row| row.channelset_id))
                    .unwrap_or(id);
                if existing.is_none() {
                    let taken = tx
                        .select_variants(&[channelset_id])?
                        .into_iter()
                        .find(|variant| variant.channel_id == object.channel_id);
                    if let Some(other) = taken {
                        return Err(StorageError::Conflict(other.id).into());
                    }
                    if !slots.insert((channelset_id, object.channel_id)) {
                        return Err(StorageError::Conflict(id).into());
                    }
                }
                let content_id = object
                    .content_id
                    .clone()
                    .or_else(|| existing.as_ref().map(|row| row.content_id.clone()))
                    .unwrap_or_else(|| default_content_id(object.obj_type, id));
                let updated_at = match mode {
                    StoreMode::Stamp => stamps.stamp(tx, object.channel_id)?,
                    StoreMode::Replicate => {
                        stamps.observe(object.channel_id, object.updated_at);
                        object.updated_at
                    }
                };

                let mut optimized = existing
                    .as_ref()
                    .map(|row| row.optimized.clone())
                    .unwrap_or_default();
                for (name, value) in &object.attributes {
                    if catalog.attribute_for(object.obj_type, name)?.optimized {
                        if value.is_null() {
                            optimized.remove(name);
                        } else {
                            optimized.insert(name.clone(), value.clone());
                        }
                    }
                }

                let row = ObjectRow {
                    id,
                    obj_type: object.obj_type,
                    channelset_id,
                    channel_id: object.channel_id,
                    content_id: content_id.clone(),
                    updated_at,
                    optimized,
                };
                if existing.is_some() {
                    tx.update_object(&row)?;
                } else {
                    tx.insert_object(&row)?;
                }

                for (name, value) in &object.attributes {
                    let attribute = catalog.attribute_for(object.obj_type, name)?;
                    if attribute.optimized {
                        continue;
                    }
                    let rows = if attribute.filesystem {
                        let files = files.as_mut().ok_or_else(|| {
                            DatasourceError::Config(format!("no attribute.path configured for '{name}'"))
                        })?;
                        if existing.is_some() {
                            for old in tx.select_attribute(name, &[id])? {
                                if let Some(file) = old.file() {
                                    files.stage_removal(file.path.clone());
                                }
                            }
                        }
                        let mut rows = Vec::with_capacity(value.values().len());
                        for (sortorder, scalar) in value.values().iter().enumerate() {
                            let bytes = scalar.as_bytes().ok_or_else(|| {
                                DatasourceError::invalid_value(name, "filesystem values must be text or binary")
                            })?;
                            let sortorder = sortorder as u32;
                            let file = files.write(tx, object.obj_type, id, name, sortorder, bytes)?;
                            rows.push(AttributeRow {
                                object_id: id,
                                name: name.clone(),
                                sortorder,
                                value: StoredValue::File(file),
                            });
                        }
                        rows
                    } else {
                        inline_rows(id, name, value.values())
                    };
                    tx.replace_attribute(id, name, &rows)?;
                }

                if let Some(previous) = &existing {
                    invalidation.add_row(previous);
                }
                invalidation.add(id, channelset_id, &content_id);
                assigned.push(Assigned {
                    id,
                    channelset_id,
                    content_id,
                    updated_at,
                });
            }

            stamps.apply(tx)?;
            Ok(())
        });

        finish_files(files, result.is_ok());
        result?;

        self.cache.invalidate_objects(&invalidation, "store");
        for (object, identity) in objects.iter_mut().zip(assigned) {
            object.id = Some(identity.id);
            object.channelset_id = Some(identity.channelset_id);
            object.content_id = Some(identity.content_id);
            object.updated_at = identity.updated_at;
        }
        debug!(objects = objects.len(), "Stored objects");
        Ok(objects.len())
    }

    /// Delete variants by id, leaving tombstones for the sync checker.
    /// Tombstones are stamped `at` when given, from the clock otherwise.
    pub(crate) fn delete_objects(&self, ids: &[ObjectId], at: Option<i64>) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let now = self.clock.now_millis();
        let mut files = self.files.as_ref().map(FsAttributeStore::begin);
        let mut invalidation = Invalidation::default();
        let mut deleted = 0;

        let result = self.backend.transact(&mut |tx| {
            invalidation = Invalidation::default();
            deleted = 0;
            let mut stamps = Stamps::new(now);

            for row in tx.select_objects(ids)? {
                if let Some(files) = files.as_mut() {
                    for file in tx.select_object_files(row.id)? {
                        files.stage_removal(file.path);
                    }
                }
                tx.delete_object(row.id)?;
                let updated_at = match at {
                    Some(ts) => {
                        stamps.observe(row.channel_id, ts);
                        ts
                    }
                    None => stamps.stamp(tx, row.channel_id)?,
                };
                tx.record_deletion(&ChangeRecord {
                    updated_at,
                    deleted: true,
                    ..ChangeRecord::from(&row)
                })?;
                invalidation.add_row(&row);
                deleted += 1;
            }

            stamps.apply(tx)?;
            Ok(())
        });

        finish_files(files, result.is_ok());
        result?;

        self.cache.invalidate_objects(&invalidation, "delete");
        Ok(deleted)
    }

    pub(crate) fn set_last_update(&self, channel: ChannelId, timestamp: i64) -> Result<()> {
        if !self.tree()?.contains(channel) {
            return Err(DatasourceError::UnknownChannel(channel));
        }
        self.backend
            .transact(&mut |tx| Ok(tx.set_last_update(channel, timestamp)?))
    }
}

pub(super) fn inline_rows(id: ObjectId, name: &str, values: &[crate::model::Scalar]) -> Vec<AttributeRow> {
    values
        .iter()
        .enumerate()
        .map(|(sortorder, scalar)| AttributeRow {
            object_id: id,
            name: name.to_string(),
            sortorder: sortorder as u32,
            value: StoredValue::Inline(scalar.clone()),
        })
        .collect()
}

pub(super) fn finish_files(files: Option<crate::fs::FsTransaction<'_>>, committed: bool) {
    match files {
        Some(files) if committed => files.commit(),
        Some(files) => files.rollback(),
        None => {}
    }
}

impl Datasource {
    /// New unsaved object in the selected channel of the first forest.
    pub fn create(&self, obj_type: ObjectTypeId) -> Result<ContentObject> {
        let tree = self.core.tree()?;
        let channel = self
            .selection
            .read()
            .channels(&tree)
            .first()
            .copied()
            .ok_or(DatasourceError::UnknownChannel(0))?;
        self.create_in(obj_type, channel)
    }

    /// New unsaved object in `channel`.
    pub fn create_in(&self, obj_type: ObjectTypeId, channel: ChannelId) -> Result<ContentObject> {
        self.core.catalog()?.object_type(obj_type)?;
        if !self.core.tree()?.contains(channel) {
            return Err(DatasourceError::UnknownChannel(channel));
        }
        Ok(ContentObject::new(obj_type, channel))
    }

    /// Insert or update objects. Only the attributes present on each object
    /// are written; `Null` deletes. Returns the number of stored objects.
    ///
    /// All-or-nothing: on error nothing is stored.
    #[tracing::instrument(skip(self, objects), fields(count = objects.len()))]
    pub fn store(&self, objects: &mut [ContentObject]) -> Result<usize> {
        let _timer = time_operation!("store");
        let result = self.core.store_objects(objects, StoreMode::Stamp);
        if let Ok(stored) = &result {
            info!(stored, "Objects stored");
        }
        observed("store", result)
    }

    /// Delete stored objects. Unstored or already deleted objects are skipped.
    #[tracing::instrument(skip(self, objects), fields(count = objects.len()))]
    pub fn delete(&self, objects: &[ContentObject]) -> Result<usize> {
        let _timer = time_operation!("delete");
        let ids: Vec<ObjectId> = objects.iter().filter_map(|object| object.id).collect();
        let result = self.core.delete_objects(&ids, None);
        if let Ok(deleted) = &result {
            info!(deleted, "Objects deleted");
        }
        observed("delete", result)
    }

    /// Set the committed change watermark of a channel.
    pub fn set_last_update(&self, channel: ChannelId, timestamp: i64) -> Result<()> {
        observed("set_last_update", self.core.set_last_update(channel, timestamp))
    }
}
