// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Interval scheduler for background jobs.
//!
//! A [`Scheduler`] runs one synchronous job on a fixed interval. Each tick
//! is executed with `spawn_blocking`, so jobs may do blocking backend and
//! filesystem I/O. Ticks are counted on a watch channel tests can await.
//!
//! ```text
//! start() ──→ interval tick ──→ paused? skip
//!                            └─→ spawn_blocking(job) ──→ ticks += 1
//! trigger_now() ─────────────────→ job on caller thread ──→ ticks += 1
//! stop() ──→ loop exits after the current tick
//! ```

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{DatasourceError, Result};
use crate::metrics;

type Job = dyn Fn() -> Result<()> + Send + Sync;

struct Inner {
    name: &'static str,
    interval: Duration,
    job: Box<Job>,
    paused: AtomicBool,
    ticks: watch::Sender<u64>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    /// Serializes scheduled ticks with `trigger_now`
    running: Mutex<()>,
}

impl Inner {
    fn run_once(&self) -> Result<()> {
        let _running = self.running.lock();
        let result = (self.job)();
        if let Err(e) = &result {
            warn!(job = self.name, error = %e, "Background job failed, retrying next tick");
            metrics::record_job_error(self.name);
        }
        self.ticks.send_modify(|ticks| *ticks += 1);
        result
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}

/// Handle to one background job. Clones share the job.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.inner.name)
            .field("interval", &self.inner.interval)
            .field("paused", &self.is_paused())
            .field("ticks", &self.ticks())
            .finish()
    }
}

impl Scheduler {
    pub fn new<F>(name: &'static str, interval: Duration, job: F) -> Self
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        let (ticks, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                name,
                interval: interval.max(Duration::from_millis(1)),
                job: Box::new(job),
                paused: AtomicBool::new(false),
                ticks,
                shutdown: Mutex::new(None),
                handle: Mutex::new(None),
                running: Mutex::new(()),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Spawn the interval loop on the current tokio runtime.
    ///
    /// Starting a running scheduler is a no-op.
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| DatasourceError::Scheduler(format!("{}: {e}", self.inner.name)))?;

        let mut handle = self.inner.handle.lock();
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.inner.shutdown.lock() = Some(shutdown_tx);
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.interval;
        *handle = Some(runtime.spawn(run_loop(weak, interval, shutdown_rx)));

        info!(job = self.inner.name, interval_ms = interval.as_millis() as u64, "Background job started");
        Ok(())
    }

    /// Stop the loop. A tick in progress finishes first.
    pub fn stop(&self) {
        if let Some(shutdown) = self.inner.shutdown.lock().take() {
            let _ = shutdown.send(true);
        }
        self.inner.handle.lock().take();
        info!(job = self.inner.name, "Background job stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Skip scheduled ticks until [`resume`](Self::resume). `trigger_now` still runs.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        debug!(job = self.inner.name, "Background job paused");
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        debug!(job = self.inner.name, "Background job resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Run the job once on the calling thread.
    pub fn trigger_now(&self) -> Result<()> {
        self.inner.run_once()
    }

    /// Ticks completed so far, failed ones included.
    pub fn ticks(&self) -> u64 {
        *self.inner.ticks.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.ticks.subscribe()
    }

    /// Wait until at least `count` ticks completed.
    pub async fn wait_for_ticks(&self, count: u64) {
        let mut rx = self.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|ticks| *ticks >= count).await;
    }
}

async fn run_loop(inner: Weak<Inner>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                let Some(job) = inner.upgrade() else { break };
                if job.paused.load(Ordering::SeqCst) {
                    continue;
                }
                let name = job.name;
                if let Err(e) = tokio::task::spawn_blocking(move || job.run_once()).await {
                    error!(job = name, error = %e, "Background job panicked");
                    metrics::record_job_error(name);
                }
            }
        }
    }
}

/// Scheduler that is started when built and stopped when dropped.
pub(crate) struct OwnedScheduler(pub(crate) Scheduler);

impl Drop for OwnedScheduler {
    fn drop(&mut self) {
        self.0.stop();
    }
}
