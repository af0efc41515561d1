//! Datasource lifecycle: background jobs, warming and cache control.
//!
//! Background jobs hold only a weak reference to the shared core, so
//! dropping the last session stops them.

use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use super::{observed, Core, Datasource, DatasourceState};
use crate::cache::CacheStats;
use crate::checker::CheckReport;
use crate::config::PrefetchThresholds;
use crate::error::Result;
use crate::fs::RemovalReport;
use crate::jobs::{OwnedScheduler, Scheduler, FILE_REMOVER, SYNC_CHECKER};

impl Core {
    pub(crate) fn remove_pending_files(&self) -> Result<RemovalReport> {
        match &self.files {
            Some(files) => files.remove_pending(self.backend.as_ref()),
            None => Ok(RemovalReport::default()),
        }
    }

    fn job(&self, name: &'static str) -> Option<Scheduler> {
        self.jobs
            .lock()
            .iter()
            .find(|job| job.0.name() == name)
            .map(|job| job.0.clone())
    }
}

/// Build a scheduler whose ticks run `work` against the core while it lives.
fn background(
    core: Weak<Core>,
    name: &'static str,
    interval_ms: u64,
    work: fn(&Core) -> Result<()>,
) -> Scheduler {
    Scheduler::new(name, Duration::from_millis(interval_ms.max(1)), move || match core.upgrade() {
        Some(core) => work(&core),
        None => Ok(()),
    })
}

impl Datasource {
    /// Start the background jobs: the sync checker when enabled and the file
    /// remover when a filesystem root is configured.
    ///
    /// Must be called from within a tokio runtime. Calling it again restarts
    /// the jobs with the current configuration.
    #[tracing::instrument(skip(self))]
    pub fn start(&self) -> Result<()> {
        let config = self.config();
        let mut jobs = Vec::new();

        // ========== Sync checker ==========
        if config.sync_checking.enabled {
            let checker = background(
                Arc::downgrade(&self.core),
                SYNC_CHECKER,
                config.sync_checking.interval_ms,
                |core| core.check_for_changes().map(drop),
            );
            checker.start()?;
            jobs.push(OwnedScheduler(checker));
        }

        // ========== File remover ==========
        if self.core.files.is_some() {
            let remover = background(
                Arc::downgrade(&self.core),
                FILE_REMOVER,
                config.file_remove_interval_ms,
                |core| core.remove_pending_files().map(drop),
            );
            remover.start()?;
            jobs.push(OwnedScheduler(remover));
        }

        let started = jobs.len();
        *self.core.jobs.lock() = jobs;
        self.core.state.send_replace(DatasourceState::Running);
        info!(jobs = started, "Datasource started");
        Ok(())
    }

    /// Stop the background jobs and flush pending file removals once.
    #[tracing::instrument(skip(self))]
    pub fn shutdown(&self) {
        let jobs = std::mem::take(&mut *self.core.jobs.lock());
        drop(jobs);

        match self.core.remove_pending_files() {
            Ok(report) if report.failed > 0 => {
                warn!(failed = report.failed, "Some obsolete files could not be removed at shutdown");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to flush file removals at shutdown"),
        }

        self.core.state.send_replace(DatasourceState::ShutDown);
        info!("Datasource shut down");
    }

    pub fn state(&self) -> DatasourceState {
        *self.core.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn state_receiver(&self) -> watch::Receiver<DatasourceState> {
        self.core.state.subscribe()
    }

    /// The running sync checker job, for pausing or manual ticks.
    pub fn sync_checker(&self) -> Option<Scheduler> {
        self.core.job(SYNC_CHECKER)
    }

    pub fn file_remover(&self) -> Option<Scheduler> {
        self.core.job(FILE_REMOVER)
    }

    /// Run one sync checker pass on the calling thread.
    pub fn check_for_changes(&self) -> Result<CheckReport> {
        observed("check_for_changes", self.core.check_for_changes())
    }

    /// Remove queued obsolete files that nothing references any more.
    pub fn remove_pending_files(&self) -> Result<RemovalReport> {
        observed("remove_pending_files", self.core.remove_pending_files())
    }

    /// Load every object matching the warm filter, in every forest, with its
    /// warm attributes. Returns the number of objects loaded.
    #[tracing::instrument(skip(self))]
    pub fn warm_up(&self) -> Result<usize> {
        let result = self.core.tree().and_then(|tree| self.core.warm_all(&tree));
        if let Ok(warmed) = &result {
            info!(warmed, "Cache warmed");
        }
        observed("warm_up", result)
    }

    /// Drop every cached entry in every region.
    pub fn clear_caches(&self) {
        self.core.cache.clear_all();
        info!("Caches cleared");
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.core.cache.stats()
    }

    pub fn set_prefetch_thresholds(&self, thresholds: PrefetchThresholds) {
        self.core.config.write().prefetch = thresholds;
    }

    pub fn prefetch_thresholds(&self) -> PrefetchThresholds {
        self.core.config.read().prefetch.clone()
    }
}
