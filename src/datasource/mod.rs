// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Multichannel datasource facade.
//!
//! The [`Datasource`] ties together all components:
//! - the channel forest and the per-session channel selection
//! - the object, attribute, query and metadata caches
//! - the batch attribute loader
//! - the filesystem attribute store
//! - the background sync checker and file remover
//!
//! # Sessions
//!
//! Caches, storage and background jobs are shared by every session created
//! with [`Datasource::session`]; the selected channels are not.
//!
//! ```text
//! Datasource ──┐
//! session() ───┼──→ Core (config, backend, cache, files, checker, jobs)
//! session() ───┘
//!   └─ own ChannelSelection each
//! ```
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use multichannel_store::channel::Channel;
//! use multichannel_store::model::{AttributeKind, AttributeType, ContentObject, ObjectType};
//! use multichannel_store::storage::MemoryBackend;
//! use multichannel_store::{Datasource, DatasourceConfig};
//!
//! let ds = Datasource::new(Arc::new(MemoryBackend::new()), DatasourceConfig::default()).unwrap();
//! ds.save_structure(vec![Channel::new(1, "Master").with_child(Channel::new(2, "Web"))]).unwrap();
//! ds.save_object_type(
//!     ObjectType::new(10, "page").with_attribute(AttributeType::new("title", AttributeKind::Text)),
//! )
//! .unwrap();
//!
//! let mut page = ContentObject::new(10, 1).with("title", "Hello");
//! ds.store(std::slice::from_mut(&mut page)).unwrap();
//!
//! ds.set_channel(2).unwrap();
//! let seen = ds.get_by_channelset_id(page.channelset_id.unwrap()).unwrap().unwrap();
//! assert_eq!(seen.channel_id, 1); // falls back to the master variant
//! ```

mod lifecycle;
mod read_api;
mod schema_api;
mod structure_api;
mod types;
mod write_api;

pub use types::DatasourceState;
pub(crate) use types::StoreMode;

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use crate::cache::ObjectCache;
use crate::channel::{ChannelScope, ChannelSelection, ChannelTree};
use crate::checker::SyncChecker;
use crate::clock::{Clock, SystemClock};
use crate::config::DatasourceConfig;
use crate::error::Result;
use crate::fs::FsAttributeStore;
use crate::jobs::OwnedScheduler;
use crate::metrics;
use crate::model::TypeCatalog;
use crate::storage::RelationalBackend;

/// Count the outcome of a public operation.
pub(crate) fn observed<T>(operation: &'static str, result: Result<T>) -> Result<T> {
    let status = if result.is_ok() { "success" } else { "error" };
    metrics::record_operation(operation, status);
    result
}

/// State shared by all sessions of one datasource.
pub(crate) struct Core {
    pub(crate) config: RwLock<DatasourceConfig>,
    pub(crate) backend: Arc<dyn RelationalBackend>,
    pub(crate) cache: ObjectCache,
    pub(crate) files: Option<FsAttributeStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) checker: SyncChecker,
    pub(crate) jobs: Mutex<Vec<OwnedScheduler>>,
    pub(crate) state: watch::Sender<DatasourceState>,
}

impl Core {
    /// Type catalog, from cache or one bulk read.
    pub(crate) fn catalog(&self) -> Result<Arc<TypeCatalog>> {
        if let Some(catalog) = self.cache.types() {
            return Ok(catalog);
        }
        let epoch = self.cache.epoch();
        let catalog = Arc::new(TypeCatalog::new(self.backend.load_object_types()?));
        self.cache.put_types(epoch, Arc::clone(&catalog));
        Ok(catalog)
    }

    /// Channel forest, from cache or one bulk read ordered by `left`.
    pub(crate) fn tree(&self) -> Result<Arc<ChannelTree>> {
        if let Some(tree) = self.cache.structure() {
            return Ok(tree);
        }
        let epoch = self.cache.epoch();
        let tree = Arc::new(ChannelTree::from_nodes(self.backend.load_channel_nodes()?)?);
        self.cache.put_structure(epoch, Arc::clone(&tree));
        Ok(tree)
    }
}

/// Multichannel content datasource.
///
/// # Thread Safety
///
/// `Send + Sync`. Operations are synchronous; background jobs run on tokio
/// once [`start`](Self::start) is called from within a runtime.
pub struct Datasource {
    pub(crate) core: Arc<Core>,
    selection: RwLock<ChannelSelection>,
}

impl Datasource {
    /// Create a datasource over `backend` using the wall clock.
    pub fn new(backend: Arc<dyn RelationalBackend>, config: DatasourceConfig) -> Result<Self> {
        Self::with_clock(backend, config, Arc::new(SystemClock))
    }

    /// Create a datasource with an injected clock for change timestamps.
    pub fn with_clock(
        backend: Arc<dyn RelationalBackend>,
        config: DatasourceConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let files = config
            .filesystem_root
            .as_ref()
            .map(|root| FsAttributeStore::open(root.clone()))
            .transpose()?;
        let (state, _) = watch::channel(DatasourceState::Created);
        let checker = SyncChecker::new(clock.now_millis() - 1);

        info!(
            filesystem = files.is_some(),
            sync_checking = config.sync_checking.enabled,
            "Datasource created"
        );

        Ok(Self {
            core: Arc::new(Core {
                cache: ObjectCache::new(&config),
                config: RwLock::new(config),
                backend,
                files,
                clock,
                checker,
                jobs: Mutex::new(Vec::new()),
                state,
            }),
            selection: RwLock::new(ChannelSelection::default()),
        })
    }

    /// Another session over the same caches, storage and jobs, starting
    /// with every forest at its root channel.
    #[must_use]
    pub fn session(&self) -> Datasource {
        Datasource {
            core: Arc::clone(&self.core),
            selection: RwLock::new(ChannelSelection::default()),
        }
    }

    pub fn backend(&self) -> Arc<dyn RelationalBackend> {
        Arc::clone(&self.core.backend)
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> DatasourceConfig {
        self.core.config.read().clone()
    }

    /// Visible channels of this session, nearest first per forest.
    pub(crate) fn scope(&self) -> Result<ChannelScope> {
        let tree = self.core.tree()?;
        Ok(self.selection.read().scope(&tree))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    #[test]
    fn test_sessions_share_core_not_selection() {
        let ds = Datasource::new(Arc::new(MemoryBackend::new()), DatasourceConfig::default()).unwrap();
        let other = ds.session();
        assert!(Arc::ptr_eq(&ds.core, &other.core));
        assert!(!std::ptr::eq(&ds.selection, &other.selection));
        assert_eq!(ds.state(), DatasourceState::Created);
    }

    #[test]
    fn test_filesystem_root_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatasourceConfig {
            filesystem_root: Some(dir.path().join("attrs")),
            ..Default::default()
        };
        let ds = Datasource::new(Arc::new(MemoryBackend::new()), config).unwrap();
        assert!(ds.core.files.is_some());
        assert!(dir.path().join("attrs").is_dir());
    }
}
