// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Incremental replication from one datasource into another.
//!
//! Per source channel, everything changed since the target's replication
//! mark for that channel is copied in batches:
//!
//! ```text
//! source.select_changed(channel, target replication mark)
//!   ├─ tombstones        → target delete (source timestamps)
//!   └─ live ids, batched → source prefetch (forced)
//!                         → absent in target: insert with every value
//!                         → present: write only differing attributes
//! target replication mark = source watermark
//! ```
//!
//! The replication mark is kept apart from the target's own change
//! watermark, which local writes on the target also advance.
//!
//! Ids, channelsets, content ids and timestamps are preserved, so a second
//! run with no source changes does nothing. Filesystem values are written
//! again through the target's own store.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::channel::ChannelScope;
use crate::datasource::{Datasource, StoreMode};
use crate::error::Result;
use crate::metrics;
use crate::model::{AttributeValue, ChannelId, ContentObject, ObjectId, ObjectRow};

/// Default number of objects copied per target transaction.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Optional steps of a replication run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncFlags {
    /// Copy the channel forest first
    pub structure: bool,
    /// Copy the object types first
    pub types: bool,
    /// Delete target objects that do not exist in the source channel
    pub delete_missing: bool,
    /// Compare every object instead of only those changed since the watermark
    pub ignore_watermark: bool,
}

/// Totals of one replication run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    /// Channels that had anything to copy
    pub channels: Vec<ChannelId>,
}

/// Copies changes from a source datasource into a target.
pub struct Synchronizer<'a> {
    source: &'a Datasource,
    target: &'a Datasource,
    flags: SyncFlags,
    batch_size: usize,
}

impl<'a> Synchronizer<'a> {
    pub fn new(source: &'a Datasource, target: &'a Datasource) -> Self {
        Self {
            source,
            target,
            flags: SyncFlags::default(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    #[must_use]
    pub fn flags(mut self, flags: SyncFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Run once. Safe to repeat; each run continues from the target's
    /// replication marks.
    #[tracing::instrument(skip(self), fields(flags = ?self.flags, batch_size = self.batch_size))]
    pub fn run(&self) -> Result<SyncReport> {
        let source = &self.source.core;
        let target = &self.target.core;

        if self.flags.structure {
            let tree = source.tree()?;
            self.target.save_structure(tree.roots().to_vec())?;
        }
        if self.flags.types {
            let types = source.catalog()?.types().cloned().collect();
            target.apply_type_changes(types)?;
        }

        let tree = source.tree()?;
        let target_tree = target.tree()?;
        let mut report = SyncReport::default();

        for &channel in tree.channel_ids() {
            if !target_tree.contains(channel) {
                warn!(channel, "Channel missing in target, skipping");
                continue;
            }
            let Some(watermark) = source.backend.last_update(channel)? else {
                continue;
            };
            let since = if self.flags.ignore_watermark {
                i64::MIN
            } else {
                target.backend.replication_mark(channel)?.unwrap_or(i64::MIN)
            };
            if since >= watermark && !self.flags.delete_missing {
                continue;
            }

            let before = (report.inserted, report.updated, report.deleted);
            let changes = if since < watermark {
                source.backend.select_changed(channel, since)?
            } else {
                Vec::new()
            };

            let tombstones: HashMap<ObjectId, i64> = changes
                .iter()
                .filter(|change| change.deleted)
                .map(|change| (change.id, change.updated_at))
                .collect();
            for (id, at) in &tombstones {
                report.deleted += target.delete_objects(&[*id], Some(*at))?;
            }

            let live: Vec<ObjectId> = changes
                .iter()
                .filter(|change| !change.deleted)
                .map(|change| change.id)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            let scope = ChannelScope::for_channel(&tree, channel)?;
            let target_scope = ChannelScope::for_channel(&target_tree, channel)?;
            for batch in live.chunks(self.batch_size) {
                self.copy_batch(batch, &scope, &target_scope, &mut report)?;
            }

            if self.flags.delete_missing {
                let present: HashSet<ObjectId> = source.backend.select_ids_in_channel(channel)?.into_iter().collect();
                let missing: Vec<ObjectId> = target
                    .backend
                    .select_ids_in_channel(channel)?
                    .into_iter()
                    .filter(|id| !present.contains(id))
                    .collect();
                if !missing.is_empty() {
                    report.deleted += target.delete_objects(&missing, Some(watermark))?;
                }
            }

            target
                .backend
                .transact(&mut |tx| Ok(tx.set_replication_mark(channel, watermark)?))?;
            let (inserted, updated, deleted) = (
                report.inserted - before.0,
                report.updated - before.1,
                report.deleted - before.2,
            );
            metrics::record_sync(channel, inserted, updated, deleted);
            if inserted + updated + deleted > 0 {
                report.channels.push(channel);
            }
            debug!(channel, inserted, updated, deleted, "Channel replicated");
        }

        info!(
            inserted = report.inserted,
            updated = report.updated,
            deleted = report.deleted,
            unchanged = report.unchanged,
            "Replication finished"
        );
        Ok(report)
    }

    fn copy_batch(
        &self,
        ids: &[ObjectId],
        scope: &ChannelScope,
        target_scope: &ChannelScope,
        report: &mut SyncReport,
    ) -> Result<()> {
        let source = &self.source.core;
        let target = &self.target.core;
        let source_catalog = source.catalog()?;
        let target_catalog = target.catalog()?;

        let rows = source.rows(ids)?;
        let names: Vec<String> = rows
            .iter()
            .filter_map(|row| source_catalog.object_type(row.obj_type).ok())
            .flat_map(|ty| ty.attributes.iter().map(|a| a.name.clone()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        source.prefetch(&rows, &names, scope, true)?;

        let existing: HashMap<ObjectId, Arc<ObjectRow>> =
            target.rows(ids)?.into_iter().map(|row| (row.id, row)).collect();
        let existing_rows: Vec<Arc<ObjectRow>> = existing.values().cloned().collect();
        target.prefetch(&existing_rows, &names, target_scope, true)?;

        let mut batch = Vec::with_capacity(rows.len());
        for row in &rows {
            let object_type = source_catalog.object_type(row.obj_type)?;
            let mut object = ContentObject::from_row(row);
            object.attributes.clear();

            let previous = existing.get(&row.id);
            for attribute in &object_type.attributes {
                let value = source.attribute_value(row, attribute)?;
                match previous {
                    None => {
                        if !value.is_null() {
                            object.attributes.insert(attribute.name.clone(), value);
                        }
                    }
                    Some(previous) => {
                        let current = target_catalog
                            .attribute_for(previous.obj_type, &attribute.name)
                            .and_then(|target_attribute| target.attribute_value(previous, target_attribute))
                            .unwrap_or(AttributeValue::Null);
                        if current != value {
                            object.attributes.insert(attribute.name.clone(), value);
                        }
                    }
                }
            }

            match previous {
                None => report.inserted += 1,
                Some(previous)
                    if object.attributes.is_empty()
                        && previous.content_id == row.content_id
                        && previous.updated_at == row.updated_at =>
                {
                    report.unchanged += 1;
                    continue;
                }
                Some(_) => report.updated += 1,
            }
            batch.push(object);
        }

        target.store_objects(&mut batch, StoreMode::Replicate)?;
        Ok(())
    }
}
