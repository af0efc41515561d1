// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Differential sync checker and cache warming.
//!
//! Every writer bumps the committed change watermark of each channel it
//! touched inside its own transaction. The checker keeps its own watermark
//! per channel and, on each tick, compares the two:
//!
//! ```text
//! committed == own  → nothing
//! committed >  own  → select_changed(channel, own)
//!                     → invalidate changed ids (or flush everything)
//!                     → clear query regions
//!                     → own = committed
//!                     → warm changed objects matching the warm filter
//! ```
//!
//! Because the watermark commits with the rows, a multi-row transaction is
//! observed entirely or not at all.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::cache::Invalidation;
use crate::channel::{ChannelScope, ChannelTree};
use crate::datasource::Core;
use crate::error::Result;
use crate::metrics;
use crate::model::{ChannelId, ObjectId};
use crate::query::{Expression, Filter};
use crate::storage::ScopedQuery;

/// Outcome of one checker tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    /// Channels whose committed watermark moved past the checker's
    pub changed_channels: Vec<ChannelId>,
    /// Changed or deleted objects whose cache entries were dropped
    pub invalidated: usize,
    /// Changed objects eagerly reloaded
    pub warmed: usize,
}

impl CheckReport {
    pub fn is_empty(&self) -> bool {
        self.changed_channels.is_empty()
    }
}

/// Per-channel watermarks owned by the checker.
pub(crate) struct SyncChecker {
    watermarks: Mutex<HashMap<ChannelId, i64>>,
    /// Watermark of channels not seen yet. Anything committed before the
    /// datasource existed cannot be cached.
    initial: i64,
}

impl SyncChecker {
    pub(crate) fn new(initial: i64) -> Self {
        Self {
            watermarks: Mutex::new(HashMap::new()),
            initial,
        }
    }

    pub(crate) fn watermark(&self, channel: ChannelId) -> i64 {
        self.watermarks
            .lock()
            .get(&channel)
            .copied()
            .unwrap_or(self.initial)
    }

    fn advance(&self, channel: ChannelId, to: i64) {
        let mut watermarks = self.watermarks.lock();
        let entry = watermarks.entry(channel).or_insert(self.initial);
        *entry = (*entry).max(to);
    }
}

impl Core {
    /// Run one checker pass over every channel of the forest.
    pub(crate) fn check_for_changes(&self) -> Result<CheckReport> {
        let started = Instant::now();
        let tree = self.tree()?;
        let (differential, warm_attributes, warm_filter) = {
            let config = self.config.read();
            (
                config.sync_checking.differential,
                config.sync_checking.warm_attributes.clone(),
                config.sync_checking.warm_filter.clone(),
            )
        };

        let mut report = CheckReport::default();
        for &channel in tree.channel_ids() {
            let own = self.checker.watermark(channel);
            let Some(committed) = self.backend.last_update(channel)? else {
                continue;
            };
            if committed <= own {
                continue;
            }

            let changes = self.backend.select_changed(channel, own)?;
            let mut invalidation = Invalidation::default();
            let mut survivors: Vec<ObjectId> = Vec::new();
            for change in &changes {
                invalidation.add(change.id, change.channelset_id, &change.content_id);
                if !change.deleted {
                    survivors.push(change.id);
                }
            }

            if differential {
                self.cache.invalidate_objects(&invalidation, "sync-check");
            } else {
                self.cache.clear_all();
            }
            self.cache.invalidate_queries();
            self.checker.advance(channel, committed);
            debug!(channel, own, committed, changed = changes.len(), "Channel changed");

            report.changed_channels.push(channel);
            report.invalidated += invalidation.len();

            if let Some(filter) = &warm_filter {
                if !survivors.is_empty() {
                    let scope = ChannelScope::for_channel(&tree, channel)?;
                    let expression = filter.clone().and(Expression::ids_in(&survivors));
                    report.warmed += self.warm(&scope, expression, &warm_attributes)?;
                }
            }
        }

        metrics::record_checker_tick(report.changed_channels.len(), report.invalidated, started.elapsed());
        if report.warmed > 0 {
            metrics::record_warmed(report.warmed);
        }
        if !report.is_empty() {
            info!(
                channels = report.changed_channels.len(),
                invalidated = report.invalidated,
                warmed = report.warmed,
                "Sync check invalidated changed objects"
            );
        }
        Ok(report)
    }

    /// Load the objects matching `expression` in `scope` and force-prefetch
    /// `attributes` for them. Returns the number of objects loaded.
    pub(crate) fn warm(&self, scope: &ChannelScope, expression: Expression, attributes: &[String]) -> Result<usize> {
        let catalog = self.catalog()?;
        let filter = Filter::new(expression, &catalog)?;
        let ids = self.backend.select_matching(&ScopedQuery {
            expression: filter.expression(),
            scope,
            catalog: &catalog,
        })?;
        let rows = self.rows(&ids)?;
        self.prefetch(&rows, attributes, scope, true)?;
        Ok(rows.len())
    }

    /// Warm every forest from its root channel.
    pub(crate) fn warm_all(&self, tree: &Arc<ChannelTree>) -> Result<usize> {
        let (attributes, filter) = {
            let config = self.config.read();
            (
                config.sync_checking.warm_attributes.clone(),
                config.sync_checking.warm_filter.clone(),
            )
        };
        let Some(filter) = filter else {
            return Ok(0);
        };
        let mut warmed = 0;
        for root in tree.root_ids() {
            let scope = ChannelScope::for_channel(tree, root)?;
            warmed += self.warm(&scope, filter.clone(), &attributes)?;
        }
        metrics::record_warmed(warmed);
        Ok(warmed)
    }
}
