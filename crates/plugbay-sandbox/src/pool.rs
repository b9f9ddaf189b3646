//! Elastic worker pool.
//!
//! The pool owns the shared wasmtime engine (and its epoch ticker) and hands
//! out [`Worker`]s up to a hard cap.  Capacity is a [`Semaphore`]: when all
//! slots are taken, [`WorkerPool::acquire`] suspends until one frees up, so
//! callers queue instead of failing.  Released slots shrink back toward the
//! target size; slots beyond it are destroyed rather than kept idle.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use uuid::Uuid;
use wasmtime::Engine;

use plugbay_manifest::PluginManifest;

use crate::context::{self, SandboxContext};
use crate::error::{Result, SandboxError};
use crate::policy::PermissionPolicy;
use crate::worker::{ResourceUsage, Worker, WorkerInfo, WorkerState};

/// Pool sizing and tuning knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Hard cap on concurrently live workers.
    pub max_size: usize,
    /// Size the pool shrinks back toward when load subsides.
    pub target_size: usize,
    /// Grace period added on top of a plugin's own deadline before the
    /// host gives up waiting for a context response.
    pub call_grace_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 8,
            target_size: 4,
            call_grace_ms: 1000,
        }
    }
}

impl PoolConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    #[must_use]
    pub fn with_target_size(mut self, target_size: usize) -> Self {
        self.target_size = target_size;
        self
    }

    #[must_use]
    pub fn with_call_grace_ms(mut self, ms: u64) -> Self {
        self.call_grace_ms = ms;
        self
    }
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    pub max_size: usize,
    pub target_size: usize,
    /// Tracked worker records, idle ones included.
    pub total: usize,
    pub idle: usize,
    pub ready: usize,
    pub executing: usize,
    pub faulted: usize,
    /// Slots currently free for acquisition.
    pub available_slots: usize,
}

pub(crate) struct PoolInner {
    engine: Engine,
    config: PoolConfig,
    workers: DashMap<Uuid, WorkerInfo>,
    slots: Arc<Semaphore>,
}

impl PoolInner {
    pub(crate) fn set_state(&self, id: Uuid, state: WorkerState) {
        if let Some(mut record) = self.workers.get_mut(&id) {
            tracing::trace!(worker = %id, from = %record.state, to = %state, "worker state");
            record.state = state;
        }
    }

    pub(crate) fn mark_faulted(&self, id: Uuid, error: String) {
        if let Some(mut record) = self.workers.get_mut(&id) {
            record.state = WorkerState::Faulted;
            record.last_error = Some(error);
        }
    }

    pub(crate) fn remove(&self, id: Uuid) {
        self.set_state(id, WorkerState::Destroyed);
        self.workers.remove(&id);
    }

    fn idle_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|r| r.state == WorkerState::Idle)
            .count()
    }
}

/// Shared handle to the worker pool.  Cheap to clone.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create the pool, its engine, and the epoch ticker.
    pub fn new(config: PoolConfig) -> Result<Self> {
        let engine = context::build_engine()?;
        let slots = Arc::new(Semaphore::new(config.max_size));
        tracing::info!(
            max_size = config.max_size,
            target_size = config.target_size,
            "worker pool initialized"
        );
        Ok(Self {
            inner: Arc::new(PoolInner {
                engine,
                config,
                workers: DashMap::new(),
                slots,
            }),
        })
    }

    /// Acquire a worker for `manifest`, suspending while the pool is full.
    ///
    /// Every acquisition yields a fresh context with a fresh id; idle
    /// records only represent reserved capacity, never a reusable guest
    /// instance.
    pub async fn acquire(&self, manifest: &PluginManifest, module_bytes: Vec<u8>) -> Result<Worker> {
        let permit = Arc::clone(&self.inner.slots)
            .acquire_owned()
            .await
            .map_err(|_| SandboxError::WorkerUnavailable {
                reason: "pool is shut down".into(),
            })?;

        // Recycle one idle record: its slot is being put back to work.
        let recycled = self
            .inner
            .workers
            .iter()
            .find(|r| r.state == WorkerState::Idle)
            .map(|r| r.id);
        if let Some(old) = recycled {
            self.inner.workers.remove(&old);
        }

        let id = Uuid::now_v7();
        let policy = Arc::new(PermissionPolicy::from_spec(&manifest.permissions));
        let ctx = SandboxContext::spawn(
            self.inner.engine.clone(),
            module_bytes,
            policy,
            manifest.name.clone(),
            std::time::Duration::from_millis(self.inner.config.call_grace_ms),
        )?;

        self.inner.workers.insert(
            id,
            WorkerInfo {
                id,
                state: WorkerState::Initializing,
                hosted_plugin: Some(manifest.name.clone()),
                spawned_at: chrono::Utc::now(),
                last_error: None,
            },
        );

        tracing::debug!(worker = %id, plugin = %manifest.name, "worker acquired");
        Ok(Worker::new(
            id,
            manifest.name.clone(),
            ctx,
            Arc::clone(&self.inner),
            permit,
        ))
    }

    /// Release a worker back to the pool.
    ///
    /// Faulted workers are always destroyed.  Healthy ones leave an idle
    /// record behind while the pool is at or below its target size; beyond
    /// that the record is destroyed so the pool shrinks back down.
    pub async fn release(&self, worker: Worker) {
        let id = worker.id();
        worker.mark_released();

        let faulted = self
            .inner
            .workers
            .get(&id)
            .map(|r| r.state == WorkerState::Faulted)
            .unwrap_or(false);

        self.inner.set_state(id, WorkerState::Terminating);
        // Dropping the handle tears the context down and frees the slot.
        drop(worker);

        if faulted || self.inner.idle_count() >= self.inner.config.target_size {
            self.inner.remove(id);
        } else {
            if let Some(mut record) = self.inner.workers.get_mut(&id) {
                record.state = WorkerState::Idle;
                record.hosted_plugin = None;
            }
            tracing::trace!(worker = %id, "worker retained as idle capacity");
        }
    }

    /// Mark a worker faulted from outside its own request path, e.g. when
    /// the host observes a dead instance.
    pub fn fault(&self, id: Uuid, reason: impl Into<String>) {
        self.inner.mark_faulted(id, reason.into());
    }

    /// Record for one worker, if it is still tracked.
    pub fn worker_info(&self, id: Uuid) -> Option<WorkerInfo> {
        self.inner.workers.get(&id).map(|r| r.clone())
    }

    /// Usage snapshot for an acquired worker.
    pub fn usage_of(&self, worker: &Worker) -> ResourceUsage {
        worker.usage()
    }

    /// Point-in-time pool statistics.
    pub fn stats(&self) -> PoolStats {
        let mut idle = 0;
        let mut ready = 0;
        let mut executing = 0;
        let mut faulted = 0;
        for record in self.inner.workers.iter() {
            match record.state {
                WorkerState::Idle => idle += 1,
                WorkerState::Ready => ready += 1,
                WorkerState::Executing => executing += 1,
                WorkerState::Faulted => faulted += 1,
                _ => {}
            }
        }
        PoolStats {
            max_size: self.inner.config.max_size,
            target_size: self.inner.config.target_size,
            total: self.inner.workers.len(),
            idle,
            ready,
            executing,
            faulted,
            available_slots: self.inner.slots.available_permits(),
        }
    }
}
