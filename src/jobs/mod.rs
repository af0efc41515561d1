//! Background jobs.

pub mod scheduler;

pub use scheduler::Scheduler;
pub(crate) use scheduler::OwnedScheduler;

pub const SYNC_CHECKER: &str = "sync-checker";
pub const FILE_REMOVER: &str = "file-remover";
