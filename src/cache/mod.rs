// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Object, attribute, query and metadata caches.
//!
//! # Regions
//!
//! ```text
//! object-by-id          id                      → Present(row) | Absent
//! object-by-channelset  (channelset, scope key) → Present(id)  | Absent
//! object-by-contentid   content id              → Present(channelset) | Absent
//! <attribute region>    (id, attribute)         → inline value | file refs
//! type-metadata         ()                      → catalog snapshot
//! channel-tree          ()                      → forest snapshot
//! query-result          (filter, scope, opts)   → ids
//! query-count           (filter, scope)         → count
//! ```
//!
//! The channelset and content-id regions only store ids, so every identity
//! path converges on the single object-by-id entry.
//!
//! # Stale fills
//!
//! Readers take an [`epoch`](ObjectCache::epoch) before going to storage and
//! hand it back with the fill. Every invalidation bumps the epoch under the
//! write side of a gate, so a fill that raced an invalidation is dropped
//! instead of re-inserting the value it read before the change.

pub mod region;

pub use region::{CacheRegion, RegionStats};

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::channel::ChannelTree;
use crate::config::DatasourceConfig;
use crate::metrics;
use crate::model::{
    AttributeValue, ChannelId, ChannelsetId, FileRef, ObjectId, ObjectRow, TypeCatalog,
};

pub const OBJECTS_REGION: &str = "object-by-id";
pub const CHANNELSET_REGION: &str = "object-by-channelset";
pub const CONTENT_ID_REGION: &str = "object-by-contentid";
pub const TYPES_REGION: &str = "type-metadata";
pub const STRUCTURE_REGION: &str = "channel-tree";
pub const QUERY_RESULT_REGION: &str = "query-result";
pub const QUERY_COUNT_REGION: &str = "query-count";

/// Negative lookups are cached as `Absent`; a missing key means "not yet resolved".
#[derive(Debug, Clone, PartialEq)]
pub enum Cached<T> {
    Present(T),
    Absent,
}

impl<T> Cached<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Cached::Present(value) => Some(value),
            Cached::Absent => None,
        }
    }
}

impl<T> From<Option<T>> for Cached<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => Cached::Present(value),
            None => Cached::Absent,
        }
    }
}

/// Cached value of one attribute on one object.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeEntry {
    Inline(AttributeValue),
    /// Filesystem attribute; values are read through the file store.
    Files(Vec<FileRef>),
}

/// Objects whose cache entries must go.
#[derive(Debug, Clone, Default)]
pub struct Invalidation {
    pub ids: HashSet<ObjectId>,
    pub channelsets: HashSet<ChannelsetId>,
    pub content_ids: HashSet<String>,
}

impl Invalidation {
    pub fn add(&mut self, id: ObjectId, channelset: ChannelsetId, content_id: &str) {
        self.ids.insert(id);
        self.channelsets.insert(channelset);
        self.content_ids.insert(content_id.to_string());
    }

    pub fn add_row(&mut self, row: &ObjectRow) {
        self.add(row.id, row.channelset_id, &row.content_id);
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.channelsets.is_empty() && self.content_ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }
}

/// (filter key, scope key, options key)
pub type QueryKey = (String, Vec<ChannelId>, String);

type AttributeRegion = CacheRegion<(ObjectId, String), Arc<AttributeEntry>>;

/// Statistics of every region
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub regions: Vec<RegionStats>,
}

impl CacheStats {
    pub fn region(&self, name: &str) -> Option<&RegionStats> {
        self.regions.iter().find(|r| r.name == name)
    }
}

pub struct ObjectCache {
    objects: CacheRegion<ObjectId, Cached<Arc<ObjectRow>>>,
    by_channelset: CacheRegion<(ChannelsetId, Vec<ChannelId>), Cached<ObjectId>>,
    by_content_id: CacheRegion<String, Cached<ChannelsetId>>,
    /// Attribute regions by region name, created on first use
    attributes: DashMap<String, Arc<AttributeRegion>>,
    types: CacheRegion<(), Arc<TypeCatalog>>,
    structure: CacheRegion<(), Arc<ChannelTree>>,
    query_results: CacheRegion<QueryKey, Arc<Vec<ObjectId>>>,
    query_counts: CacheRegion<QueryKey, usize>,
    region_bounds: RwLock<HashMap<String, usize>>,
    epoch: AtomicU64,
    gate: RwLock<()>,
}

impl ObjectCache {
    pub fn new(config: &DatasourceConfig) -> Self {
        let bound = |name: &str| config.region_max_entries(name);
        let query_bound = |name: &str| Some(bound(name).unwrap_or(config.query_max_entries));
        Self {
            objects: CacheRegion::new(OBJECTS_REGION, bound(OBJECTS_REGION)),
            by_channelset: CacheRegion::new(CHANNELSET_REGION, bound(CHANNELSET_REGION)),
            by_content_id: CacheRegion::new(CONTENT_ID_REGION, bound(CONTENT_ID_REGION)),
            attributes: DashMap::new(),
            types: CacheRegion::new(TYPES_REGION, None),
            structure: CacheRegion::new(STRUCTURE_REGION, None),
            query_results: CacheRegion::new(QUERY_RESULT_REGION, query_bound(QUERY_RESULT_REGION)),
            query_counts: CacheRegion::new(QUERY_COUNT_REGION, query_bound(QUERY_COUNT_REGION)),
            region_bounds: RwLock::new(
                config
                    .regions
                    .iter()
                    .filter_map(|(name, r)| r.max_entries.map(|m| (name.clone(), m)))
                    .collect(),
            ),
            epoch: AtomicU64::new(0),
            gate: RwLock::new(()),
        }
    }

    /// Current invalidation epoch; pass it back with fills.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Run `fill` unless an invalidation happened since `epoch`.
    fn fill<F: FnOnce()>(&self, epoch: u64, fill: F) -> bool {
        let _gate = self.gate.read();
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!(epoch, "Dropping cache fill that raced an invalidation");
            return false;
        }
        fill();
        true
    }

    fn invalidate<F: FnOnce()>(&self, invalidate: F) {
        let _gate = self.gate.write();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        invalidate();
    }

    // ─── identity regions ──────────────────────────────────────────

    pub fn object(&self, id: ObjectId) -> Option<Cached<Arc<ObjectRow>>> {
        self.objects.get(&id)
    }

    pub fn put_object(&self, epoch: u64, id: ObjectId, value: Cached<Arc<ObjectRow>>) -> bool {
        self.fill(epoch, || self.objects.insert(id, value))
    }

    pub fn channelset(&self, channelset: ChannelsetId, scope: &[ChannelId]) -> Option<Cached<ObjectId>> {
        self.by_channelset.get(&(channelset, scope.to_vec()))
    }

    pub fn put_channelset(
        &self,
        epoch: u64,
        channelset: ChannelsetId,
        scope: &[ChannelId],
        value: Cached<ObjectId>,
    ) -> bool {
        self.fill(epoch, || self.by_channelset.insert((channelset, scope.to_vec()), value))
    }

    pub fn content_id(&self, content_id: &str) -> Option<Cached<ChannelsetId>> {
        self.by_content_id.get(&content_id.to_string())
    }

    pub fn put_content_id(&self, epoch: u64, content_id: &str, value: Cached<ChannelsetId>) -> bool {
        self.fill(epoch, || self.by_content_id.insert(content_id.to_string(), value))
    }

    // ─── attributes ────────────────────────────────────────────────

    fn attribute_region(&self, region: &str) -> Arc<AttributeRegion> {
        if let Some(existing) = self.attributes.get(region) {
            return Arc::clone(existing.value());
        }
        let bound = self.region_bounds.read().get(region).copied();
        Arc::clone(
            self.attributes
                .entry(region.to_string())
                .or_insert_with(|| Arc::new(CacheRegion::new(region, bound)))
                .value(),
        )
    }

    pub fn attribute(&self, region: &str, id: ObjectId, name: &str) -> Option<Arc<AttributeEntry>> {
        self.attribute_region(region).get(&(id, name.to_string()))
    }

    /// Presence check that does not count as a lookup.
    pub fn has_attribute(&self, region: &str, id: ObjectId, name: &str) -> bool {
        self.attribute_region(region).contains(&(id, name.to_string()))
    }

    pub fn put_attribute(
        &self,
        epoch: u64,
        region: &str,
        id: ObjectId,
        name: &str,
        entry: Arc<AttributeEntry>,
    ) -> bool {
        let target = self.attribute_region(region);
        self.fill(epoch, || target.insert((id, name.to_string()), entry))
    }

    // ─── metadata ──────────────────────────────────────────────────

    pub fn types(&self) -> Option<Arc<TypeCatalog>> {
        self.types.get(&())
    }

    pub fn put_types(&self, epoch: u64, catalog: Arc<TypeCatalog>) -> bool {
        self.fill(epoch, || self.types.insert((), catalog))
    }

    pub fn structure(&self) -> Option<Arc<ChannelTree>> {
        self.structure.get(&())
    }

    pub fn put_structure(&self, epoch: u64, tree: Arc<ChannelTree>) -> bool {
        self.fill(epoch, || self.structure.insert((), tree))
    }

    // ─── queries ───────────────────────────────────────────────────

    pub fn query_result(&self, key: &QueryKey) -> Option<Arc<Vec<ObjectId>>> {
        self.query_results.get(key)
    }

    pub fn put_query_result(&self, epoch: u64, key: QueryKey, ids: Arc<Vec<ObjectId>>) -> bool {
        self.fill(epoch, || self.query_results.insert(key, ids))
    }

    pub fn query_count(&self, key: &QueryKey) -> Option<usize> {
        self.query_counts.get(key)
    }

    pub fn put_query_count(&self, epoch: u64, key: QueryKey, count: usize) -> bool {
        self.fill(epoch, || self.query_counts.insert(key, count))
    }

    // ─── invalidation ──────────────────────────────────────────────

    /// Drop every identity key and attribute entry of the given objects,
    /// plus all query results.
    pub fn invalidate_objects(&self, target: &Invalidation, reason: &str) {
        if target.is_empty() {
            return;
        }
        self.invalidate(|| {
            for id in &target.ids {
                self.objects.remove(id);
            }
            self.by_channelset
                .retain(|(channelset, _), _| !target.channelsets.contains(channelset));
            self.by_content_id.retain(|content_id, value| {
                !target.content_ids.contains(content_id)
                    && !matches!(value, Cached::Present(cs) if target.channelsets.contains(cs))
            });
            for region in self.attributes.iter() {
                region.retain(|(id, _), _| !target.ids.contains(id));
            }
            self.query_results.clear();
            self.query_counts.clear();
        });
        metrics::record_invalidation(reason, target.len());
        debug!(objects = target.len(), reason, "Invalidated cached objects");
    }

    /// Drop all query results, e.g. after a change nobody can attribute to
    /// specific objects.
    pub fn invalidate_queries(&self) {
        self.invalidate(|| {
            self.query_results.clear();
            self.query_counts.clear();
        });
    }

    /// Drop the type catalog and everything derived from attribute layout.
    pub fn invalidate_types(&self) {
        self.invalidate(|| self.types.clear());
    }

    /// Drop the channel forest and every channel-scoped entry.
    pub fn invalidate_structure(&self) {
        self.invalidate(|| {
            self.structure.clear();
            self.by_channelset.clear();
            self.query_results.clear();
            self.query_counts.clear();
        });
    }

    pub fn clear_all(&self) {
        self.invalidate(|| {
            self.objects.clear();
            self.by_channelset.clear();
            self.by_content_id.clear();
            for region in self.attributes.iter() {
                region.clear();
            }
            self.types.clear();
            self.structure.clear();
            self.query_results.clear();
            self.query_counts.clear();
        });
        metrics::record_invalidation("clear", 0);
        debug!("Cleared all cache regions");
    }

    pub fn stats(&self) -> CacheStats {
        let mut regions = vec![
            self.objects.stats(),
            self.by_channelset.stats(),
            self.by_content_id.stats(),
            self.types.stats(),
            self.structure.stats(),
            self.query_results.stats(),
            self.query_counts.stats(),
        ];
        let mut attribute_regions: Vec<RegionStats> =
            self.attributes.iter().map(|region| region.stats()).collect();
        attribute_regions.sort_by(|a, b| a.name.cmp(&b.name));
        regions.extend(attribute_regions);
        CacheStats { regions }
    }
}
