//! Read operations: identity lookups, attributes, results and file streams.
//!
//! Every lookup goes cache first. A miss reads through the backend and fills
//! the cache with the epoch taken before the read, so fills that raced an
//! invalidation are dropped.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{observed, Core, Datasource};
use crate::cache::{AttributeEntry, Cached, QueryKey};
use crate::channel::ChannelScope;
use crate::error::{DatasourceError, Result};
use crate::fs::FsAttributeStore;
use crate::metrics;
use crate::model::{
    AttributeKind, AttributeType, AttributeValue, ChannelsetId, ContentObject, FileRef, ObjectId,
    ObjectRow, Scalar, TypeCatalog,
};
use crate::prefetch::{self, entry_from_rows, group_entries, split_path};
use crate::query::{Expression, Filter, QueryOptions, SortSpec};
use crate::storage::ScopedQuery;
use crate::time_operation;

impl Core {
    pub(crate) fn row(&self, id: ObjectId) -> Result<Option<Arc<ObjectRow>>> {
        if let Some(cached) = self.cache.object(id) {
            return Ok(cached.into_option());
        }
        let epoch = self.cache.epoch();
        let row = self.backend.select_objects(&[id])?.into_iter().next().map(Arc::new);
        self.cache.put_object(epoch, id, row.clone().into());
        Ok(row)
    }

    /// Rows for `ids` in input order, unknown ids skipped. All uncached ids
    /// are read with one statement.
    pub(crate) fn rows(&self, ids: &[ObjectId]) -> Result<Vec<Arc<ObjectRow>>> {
        let mut found: HashMap<ObjectId, Option<Arc<ObjectRow>>> = HashMap::with_capacity(ids.len());
        let mut missing = Vec::new();
        for id in ids {
            match self.cache.object(*id) {
                Some(cached) => {
                    found.insert(*id, cached.into_option());
                }
                None => missing.push(*id),
            }
        }
        missing.sort_unstable();
        missing.dedup();

        if !missing.is_empty() {
            let epoch = self.cache.epoch();
            let mut loaded: HashMap<ObjectId, Arc<ObjectRow>> = self
                .backend
                .select_objects(&missing)?
                .into_iter()
                .map(|row| (row.id, Arc::new(row)))
                .collect();
            for id in missing {
                let row = loaded.remove(&id);
                self.cache.put_object(epoch, id, row.clone().into());
                found.insert(id, row);
            }
        }

        Ok(ids.iter().filter_map(|id| found.get(id).cloned().flatten()).collect())
    }

    /// The variant nearest the scope's selection for each channelset, in
    /// input order. Uncached channelsets cost one variant statement in total.
    pub(crate) fn variants(
        &self,
        channelsets: &[ChannelsetId],
        scope: &ChannelScope,
    ) -> Result<Vec<Arc<ObjectRow>>> {
        let key = scope.key();
        let mut picked: HashMap<ChannelsetId, ObjectId> = HashMap::new();
        let mut missing = Vec::new();
        for channelset in channelsets {
            match self.cache.channelset(*channelset, &key) {
                Some(Cached::Present(id)) => {
                    picked.insert(*channelset, id);
                }
                Some(Cached::Absent) => {}
                None => missing.push(*channelset),
            }
        }
        missing.sort_unstable();
        missing.dedup();

        let mut rows: HashMap<ObjectId, Arc<ObjectRow>> = HashMap::new();
        if !missing.is_empty() {
            let epoch = self.cache.epoch();
            let mut grouped: HashMap<ChannelsetId, Vec<ObjectRow>> = HashMap::new();
            for row in self.backend.select_variants(&missing)? {
                grouped.entry(row.channelset_id).or_default().push(row);
            }
            for channelset in &missing {
                let variants = grouped.remove(channelset).unwrap_or_default();
                let choice = scope.pick(variants.iter()).map(|row| row.id);
                for row in variants {
                    let row = Arc::new(row);
                    self.cache.put_object(epoch, row.id, Cached::Present(Arc::clone(&row)));
                    rows.insert(row.id, row);
                }
                self.cache.put_channelset(epoch, *channelset, &key, choice.into());
                if let Some(id) = choice {
                    picked.insert(*channelset, id);
                }
            }
        }

        let cached: Vec<ObjectId> = picked
            .values()
            .filter(|id| !rows.contains_key(id))
            .copied()
            .collect();
        for row in self.rows(&cached)? {
            rows.insert(row.id, row);
        }

        Ok(channelsets
            .iter()
            .filter_map(|channelset| picked.get(channelset))
            .filter_map(|id| rows.get(id).cloned())
            .collect())
    }

    pub(crate) fn by_content_id(&self, content_id: &str, scope: &ChannelScope) -> Result<Option<Arc<ObjectRow>>> {
        let channelset = match self.cache.content_id(content_id) {
            Some(cached) => cached.into_option(),
            None => {
                let epoch = self.cache.epoch();
                let row = self.backend.select_by_content_id(content_id)?;
                let channelset = row.as_ref().map(|row| row.channelset_id);
                if let Some(row) = row {
                    self.cache.put_object(epoch, row.id, Cached::Present(Arc::new(row)));
                }
                self.cache.put_content_id(epoch, content_id, channelset.into());
                channelset
            }
        };
        match channelset {
            Some(channelset) => Ok(self.variants(&[channelset], scope)?.into_iter().next()),
            None => Ok(None),
        }
    }

    /// Link targets resolved in the scope: the target variants' channelsets
    /// re-picked for the current selection.
    pub(crate) fn resolve_links(&self, targets: &[ObjectId], scope: &ChannelScope) -> Result<Vec<Arc<ObjectRow>>> {
        let channelsets: Vec<ChannelsetId> = self
            .rows(targets)?
            .iter()
            .map(|row| row.channelset_id)
            .collect();
        self.variants(&channelsets, scope)
    }

    pub(crate) fn attribute_entry(&self, row: &ObjectRow, attribute: &AttributeType) -> Result<Arc<AttributeEntry>> {
        if attribute.optimized {
            let value = row.optimized.get(&attribute.name).cloned().unwrap_or_default();
            return Ok(Arc::new(AttributeEntry::Inline(value)));
        }

        let caching = self.config.read().attribute_cache(&attribute.name);
        if caching.enabled {
            if let Some(entry) = self.cache.attribute(&caching.region, row.id, &attribute.name) {
                return Ok(entry);
            }
        }

        let epoch = self.cache.epoch();
        let rows = self.backend.select_attribute(&attribute.name, &[row.id])?;
        let entry = Arc::new(entry_from_rows(attribute, rows));
        if caching.enabled {
            self.cache
                .put_attribute(epoch, &caching.region, row.id, &attribute.name, Arc::clone(&entry));
        }
        Ok(entry)
    }

    pub(crate) fn attribute_value(&self, row: &ObjectRow, attribute: &AttributeType) -> Result<AttributeValue> {
        match &*self.attribute_entry(row, attribute)? {
            AttributeEntry::Inline(value) => Ok(value.clone()),
            AttributeEntry::Files(files) => {
                let store = self.file_store(&attribute.name)?;
                let values = files
                    .iter()
                    .map(|file| {
                        store
                            .read(file)
                            .and_then(|bytes| attribute.kind.scalar_from_bytes(&attribute.name, bytes))
                    })
                    .collect::<Result<Vec<Scalar>>>()?;
                Ok(AttributeValue::from_values(attribute.multivalue, values))
            }
        }
    }

    pub(crate) fn file_store(&self, attribute: &str) -> Result<&FsAttributeStore> {
        self.files.as_ref().ok_or_else(|| {
            DatasourceError::Config(format!(
                "attribute '{attribute}' is stored on the filesystem but no attribute.path is configured"
            ))
        })
    }

    // ─── batch loading ─────────────────────────────────────────────

    /// Prefetch attribute paths for `rows`. Dotted paths hop through link
    /// attributes; a hop only happens when the link values are cached.
    pub(crate) fn prefetch(
        &self,
        rows: &[Arc<ObjectRow>],
        paths: &[String],
        scope: &ChannelScope,
        force: bool,
    ) -> Result<()> {
        if rows.is_empty() || paths.is_empty() {
            return Ok(());
        }
        let catalog = self.catalog()?;

        for path in paths {
            let segments = split_path(path);
            let mut current: Vec<Arc<ObjectRow>> = rows.to_vec();
            for (depth, name) in segments.iter().enumerate() {
                let Some(attribute) = catalog.attribute(name) else {
                    warn!(path = %path, attribute = %name, "Skipping prefetch of unknown attribute");
                    break;
                };
                let holders: Vec<Arc<ObjectRow>> = current
                    .iter()
                    .filter(|row| catalog.attribute_for(row.obj_type, name).is_ok())
                    .cloned()
                    .collect();
                let ready = self.load_batch(&holders, attribute, force)?;

                if depth + 1 == segments.len() || !ready {
                    break;
                }
                if attribute.kind != AttributeKind::Link {
                    warn!(path = %path, attribute = %name, "Prefetch path continues after a non-link attribute");
                    break;
                }

                let mut targets = Vec::new();
                for row in &holders {
                    if let AttributeEntry::Inline(value) = &*self.attribute_entry(row, attribute)? {
                        targets.extend(value.values().iter().filter_map(Scalar::as_link));
                    }
                }
                targets.sort_unstable();
                targets.dedup();
                current = self.resolve_links(&targets, scope)?;
                if current.is_empty() {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Load one attribute for `rows` with a single statement when the
    /// thresholds (or `force`) say so. Returns whether every value is now
    /// available without further statements.
    fn load_batch(&self, rows: &[Arc<ObjectRow>], attribute: &AttributeType, force: bool) -> Result<bool> {
        if attribute.optimized {
            return Ok(true);
        }
        let (caching, thresholds) = {
            let config = self.config.read();
            (config.attribute_cache(&attribute.name), config.prefetch.clone())
        };
        if !caching.enabled {
            return Ok(false);
        }

        let mut missing: Vec<ObjectId> = rows
            .iter()
            .map(|row| row.id)
            .filter(|id| !self.cache.has_attribute(&caching.region, *id, &attribute.name))
            .collect();
        missing.sort_unstable();
        missing.dedup();

        let Some(trigger) = prefetch::decide(&thresholds, rows.len(), missing.len(), force) else {
            return Ok(missing.is_empty());
        };

        let epoch = self.cache.epoch();
        let loaded = self.backend.select_attribute(&attribute.name, &missing)?;
        for (id, entry) in group_entries(attribute, &missing, loaded) {
            self.cache
                .put_attribute(epoch, &caching.region, id, &attribute.name, Arc::new(entry));
        }
        metrics::record_prefetch(trigger.as_str(), missing.len());
        debug!(
            attribute = %attribute.name,
            objects = rows.len(),
            loaded = missing.len(),
            trigger = trigger.as_str(),
            "Prefetched attribute"
        );
        Ok(true)
    }

    // ─── results ───────────────────────────────────────────────────

    pub(crate) fn result_ids(
        &self,
        filter: &Filter,
        scope: &ChannelScope,
        options: &QueryOptions,
    ) -> Result<Arc<Vec<ObjectId>>> {
        let key: QueryKey = (filter.key().to_string(), scope.key(), options.key());
        if let Some(ids) = self.cache.query_result(&key) {
            return Ok(ids);
        }

        let epoch = self.cache.epoch();
        let catalog = self.catalog()?;
        let mut ids = self.backend.select_matching(&ScopedQuery {
            expression: filter.expression(),
            scope,
            catalog: &catalog,
        })?;
        if !options.sort.is_empty() {
            let rows = self.rows(&ids)?;
            ids = self.sorted(rows, &options.sort, scope, &catalog)?;
        }

        let page: Vec<ObjectId> = ids
            .into_iter()
            .skip(options.start)
            .take(options.count.unwrap_or(usize::MAX))
            .collect();
        let page = Arc::new(page);
        self.cache.put_query_result(epoch, key, Arc::clone(&page));
        Ok(page)
    }

    pub(crate) fn count(&self, filter: &Filter, scope: &ChannelScope) -> Result<usize> {
        let key: QueryKey = (filter.key().to_string(), scope.key(), String::new());
        if let Some(count) = self.cache.query_count(&key) {
            return Ok(count);
        }
        let epoch = self.cache.epoch();
        let catalog = self.catalog()?;
        let count = self.backend.count_matching(&ScopedQuery {
            expression: filter.expression(),
            scope,
            catalog: &catalog,
        })?;
        self.cache.put_query_count(epoch, key, count);
        Ok(count)
    }

    /// Order rows by the first value of each sort attribute. Missing values
    /// sort last; ties fall back to the id.
    fn sorted(
        &self,
        rows: Vec<Arc<ObjectRow>>,
        sort: &[SortSpec],
        scope: &ChannelScope,
        catalog: &TypeCatalog,
    ) -> Result<Vec<ObjectId>> {
        let mut attributes = Vec::with_capacity(sort.len());
        for spec in sort {
            match catalog.attribute(&spec.attribute) {
                Some(attribute) if !attribute.filesystem => attributes.push(attribute.clone()),
                _ => return Err(DatasourceError::FilterUnsupported(spec.attribute.clone())),
            }
        }
        let names: Vec<String> = attributes.iter().map(|a| a.name.clone()).collect();
        self.prefetch(&rows, &names, scope, true)?;

        let mut keyed = Vec::with_capacity(rows.len());
        for row in rows {
            let mut key = Vec::with_capacity(attributes.len());
            for attribute in &attributes {
                let value = if catalog.attribute_for(row.obj_type, &attribute.name).is_ok() {
                    self.attribute_value(&row, attribute)?.first().cloned()
                } else {
                    None
                };
                key.push(value);
            }
            keyed.push((key, row.id));
        }

        keyed.sort_by(|(a, a_id), (b, b_id)| {
            for ((x, y), spec) in a.iter().zip(b).zip(sort) {
                let ordering = match (x, y) {
                    (Some(x), Some(y)) => x.compare(y).unwrap_or(Ordering::Equal),
                    (Some(_), None) => return Ordering::Less,
                    (None, Some(_)) => return Ordering::Greater,
                    (None, None) => Ordering::Equal,
                };
                let ordering = if spec.ascending { ordering } else { ordering.reverse() };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a_id.cmp(b_id)
        });
        Ok(keyed.into_iter().map(|(_, id)| id).collect())
    }

    fn file_ref(&self, object: &ContentObject, name: &str, ordinal: usize) -> Result<FileRef> {
        let catalog = self.catalog()?;
        let attribute = catalog.attribute_for(object.obj_type, name)?;
        let unavailable = || DatasourceError::StreamUnavailable(name.to_string());
        if !attribute.filesystem {
            return Err(unavailable());
        }
        let id = object.id.ok_or_else(unavailable)?;
        let row = self.row(id)?.ok_or_else(unavailable)?;
        match &*self.attribute_entry(&row, attribute)? {
            AttributeEntry::Files(files) if !files.is_empty() => {
                files.get(ordinal).cloned().ok_or(DatasourceError::StreamRange {
                    attribute: name.to_string(),
                    ordinal,
                    count: files.len(),
                })
            }
            _ => Err(unavailable()),
        }
    }
}

impl Datasource {
    /// The stored variant with this internal id, whatever the selection.
    #[tracing::instrument(skip(self))]
    pub fn get_by_id(&self, id: ObjectId) -> Result<Option<ContentObject>> {
        let _timer = time_operation!("get_by_id");
        let result = self.core.row(id).map(|row| row.map(|row| ContentObject::from_row(&row)));
        observed("get_by_id", result)
    }

    /// The variant of a channelset nearest the selected channels.
    #[tracing::instrument(skip(self))]
    pub fn get_by_channelset_id(&self, channelset_id: ChannelsetId) -> Result<Option<ContentObject>> {
        let _timer = time_operation!("get_by_channelset_id");
        let result = self.scope().and_then(|scope| {
            Ok(self
                .core
                .variants(&[channelset_id], &scope)?
                .first()
                .map(|row| ContentObject::from_row(row)))
        });
        observed("get_by_channelset_id", result)
    }

    #[tracing::instrument(skip(self))]
    pub fn get_by_content_id(&self, content_id: &str) -> Result<Option<ContentObject>> {
        let _timer = time_operation!("get_by_content_id");
        let result = self.scope().and_then(|scope| {
            Ok(self
                .core
                .by_content_id(content_id, &scope)?
                .map(|row| ContentObject::from_row(&row)))
        });
        observed("get_by_content_id", result)
    }

    /// Current value of one attribute. Unstored objects answer from their
    /// own attribute map.
    #[tracing::instrument(skip(self, object), fields(id = ?object.id))]
    pub fn get_attribute(&self, object: &ContentObject, name: &str) -> Result<AttributeValue> {
        let _timer = time_operation!("get_attribute");
        let result: Result<AttributeValue> = (|| {
            let catalog = self.core.catalog()?;
            let attribute = catalog.attribute_for(object.obj_type, name)?;
            let Some(id) = object.id else {
                return Ok(object.get(name).cloned().unwrap_or_default());
            };
            let row = self
                .core
                .row(id)?
                .ok_or(crate::storage::StorageError::NotFound(id))?;
            self.core.attribute_value(&row, attribute)
        })();
        observed("get_attribute", result)
    }

    /// Objects referenced by a link attribute, each resolved to the variant
    /// visible from this session's selection.
    pub fn get_linked(&self, object: &ContentObject, name: &str) -> Result<Vec<ContentObject>> {
        let targets: Vec<ObjectId> = self
            .get_attribute(object, name)?
            .values()
            .iter()
            .filter_map(Scalar::as_link)
            .collect();
        let scope = self.scope()?;
        Ok(self
            .core
            .resolve_links(&targets, &scope)?
            .iter()
            .map(|row| ContentObject::from_row(row))
            .collect())
    }

    /// Validate an expression against the current object types.
    pub fn filter(&self, expression: Expression) -> Result<Filter> {
        Filter::new(expression, &*self.core.catalog()?)
    }

    /// Objects matching `filter` as seen from the selected channels.
    #[tracing::instrument(skip(self, filter, options), fields(filter = filter.key()))]
    pub fn get_result(&self, filter: &Filter, options: &QueryOptions) -> Result<Vec<ContentObject>> {
        let _timer = time_operation!("get_result");
        let result: Result<Vec<ContentObject>> = (|| {
            let scope = self.scope()?;
            let ids = self.core.result_ids(filter, &scope, options)?;
            let rows = self.core.rows(&ids)?;
            self.core.prefetch(&rows, &options.prefetch, &scope, false)?;
            Ok(rows.iter().map(|row| ContentObject::from_row(row)).collect())
        })();
        observed("get_result", result)
    }

    #[tracing::instrument(skip(self, filter), fields(filter = filter.key()))]
    pub fn get_count(&self, filter: &Filter) -> Result<usize> {
        let _timer = time_operation!("get_count");
        let result = self.scope().and_then(|scope| self.core.count(filter, &scope));
        observed("get_count", result)
    }

    /// Absolute path of one stored filesystem value.
    pub fn get_attribute_path(&self, object: &ContentObject, name: &str, ordinal: usize) -> Result<PathBuf> {
        let file = self.core.file_ref(object, name, ordinal)?;
        Ok(self.core.file_store(name)?.absolute(&file.path))
    }

    /// Open one stored filesystem value for reading.
    pub fn stream_attribute(&self, object: &ContentObject, name: &str, ordinal: usize) -> Result<File> {
        let file = self.core.file_ref(object, name, ordinal)?;
        self.core.file_store(name)?.open_stream(&file)
    }
}
