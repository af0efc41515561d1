//! # Multichannel Store
//!
//! A multichannel content datasource: objects have one variant per channel,
//! channels form a forest, and callers read "the object as seen from the
//! selected channel", falling back toward ancestor channels.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Datasource (facade)                     │
//! │  • Per-session channel selection                           │
//! │  • create / store / delete / get_* / get_result            │
//! └─────────────────────────────────────────────────────────────┘
//!          │                    │                     │
//!          ▼                    ▼                     ▼
//! ┌──────────────────┐ ┌──────────────────┐ ┌──────────────────┐
//! │   Channel Tree   │ │   Object Cache   │ │  Batch Loader    │
//! │  • MPTT forest   │ │  • Id/channelset │ │  • Threshold OR  │
//! │  • Fallback      │ │    /content id   │ │  • Link hops     │
//! │    scope         │ │  • Attribute,    │ │  • One statement │
//! │                  │ │    query, type   │ │    per attribute │
//! └──────────────────┘ └──────────────────┘ └──────────────────┘
//!                               ▲
//!                 (watermark diff, invalidate + warm)
//!                               │
//! ┌──────────────────┐ ┌──────────────────┐ ┌──────────────────┐
//! │  Sync Checker    │ │  FS Attribute    │ │  Relational      │
//! │  • Scheduler     │ │  Store           │ │  Backend         │
//! │  • Per-channel   │ │  • SHA-256 paths │ │  • Memory        │
//! │    watermarks    │ │  • Hard links    │ │  • SQLite        │
//! │                  │ │  • Deferred rm   │ │  • Counting      │
//! └──────────────────┘ └──────────────────┘ └──────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use multichannel_store::channel::Channel;
//! use multichannel_store::model::{AttributeKind, AttributeType, AttributeValue, ObjectType};
//! use multichannel_store::storage::MemoryBackend;
//! use multichannel_store::{Datasource, DatasourceConfig};
//!
//! let ds = Datasource::new(Arc::new(MemoryBackend::new()), DatasourceConfig::default()).unwrap();
//! ds.save_structure(vec![Channel::new(1, "Master")]).unwrap();
//! ds.save_object_type(
//!     ObjectType::new(1, "article").with_attribute(AttributeType::new("name", AttributeKind::Text)),
//! )
//! .unwrap();
//!
//! let mut article = ds.create(1).unwrap().with("name", "Hello");
//! ds.store(std::slice::from_mut(&mut article)).unwrap();
//!
//! let id = article.id.unwrap();
//! let loaded = ds.get_by_id(id).unwrap().unwrap();
//! assert_eq!(ds.get_attribute(&loaded, "name").unwrap(), AttributeValue::from("Hello"));
//! ```
//!
//! ## Modules
//!
//! - [`datasource`]: The [`Datasource`] facade and its sessions
//! - [`channel`]: Channel forest, MPTT numbering and selection
//! - [`cache`]: Cache regions, negative caching and invalidation
//! - [`prefetch`]: Batch attribute loading decisions
//! - [`checker`]: Differential sync checker and warming
//! - [`fs`]: Content-addressed filesystem attribute store
//! - [`replication`]: Incremental copy between datasources
//! - [`storage`]: Relational backends (Memory, SQLite, Counting)
//! - [`jobs`]: Background job scheduler

pub mod cache;
pub mod channel;
pub mod checker;
pub mod clock;
pub mod config;
pub mod datasource;
pub mod error;
pub mod fs;
pub mod jobs;
pub mod metrics;
pub mod model;
pub mod prefetch;
pub mod query;
pub mod replication;
pub mod storage;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use cache::{CacheStats, RegionStats};
pub use channel::{Channel, ChannelTree, ConsistencyReport};
pub use checker::CheckReport;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DatasourceConfig, PrefetchThresholds};
pub use datasource::{Datasource, DatasourceState};
pub use error::{DatasourceError, Result};
pub use fs::{FsAttributeStore, RemovalReport};
pub use jobs::Scheduler;
pub use metrics::LatencyTimer;
pub use model::{AttributeValue, ContentObject, ObjectType, Scalar};
pub use query::{Expression, Filter, QueryOptions, SortSpec};
pub use replication::{SyncFlags, SyncReport, Synchronizer};
pub use storage::{RelationalBackend, StorageError};
