//! Relational backends.

pub mod counting;
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod traits;

pub use counting::CountingBackend;
pub use memory::MemoryBackend;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;
pub use traits::{RelationalBackend, ScopedQuery, StorageError, WriteTx};
