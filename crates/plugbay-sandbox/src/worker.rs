//! Worker lifecycle and the handle the host drives a plugin through.
//!
//! A [`Worker`] couples one pool slot (a semaphore permit), one
//! [`SandboxContext`], and one hosted plugin.  The pool tracks each worker's
//! [`WorkerState`]; the handle enforces single in-flight execution, so a
//! plugin never sees two hooks running concurrently.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedSemaphorePermit};
use uuid::Uuid;

use crate::context::SandboxContext;
use crate::error::Result;
use crate::pool::PoolInner;
use crate::protocol::{HookOutcome, RequestKind};

/// Lifecycle state of a pool worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Slot held in reserve, no plugin assigned.
    Idle,
    /// Context created, plugin load in progress.
    Initializing,
    /// Plugin loaded, ready to execute hooks.
    Ready,
    /// A hook is currently running.
    Executing,
    /// Tear-down in progress.
    Terminating,
    /// The context faulted; the worker is unusable until reclaimed.
    Faulted,
    /// Removed from the pool.
    Destroyed,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Terminating => "terminating",
            Self::Faulted => "faulted",
            Self::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Resource consumption snapshot for one context.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ResourceUsage {
    /// Current guest linear memory size, in bytes.
    pub heap_bytes: u64,
    /// Cumulative fuel burned across hook invocations.
    pub fuel_consumed: u64,
    /// Milliseconds since the context thread started.
    pub age_ms: u64,
}

/// Pool-side record of one worker.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerInfo {
    pub id: Uuid,
    pub state: WorkerState,
    /// Name of the plugin this worker hosts, if any.
    pub hosted_plugin: Option<String>,
    pub spawned_at: DateTime<Utc>,
    /// The fault that took this worker down, if one did.
    pub last_error: Option<String>,
}

/// Handle to one acquired worker.
///
/// Holds the pool slot until released or dropped.  Dropping the handle
/// terminates the context and frees the slot; [`crate::pool::WorkerPool::release`]
/// does the same but may retain the record as idle capacity.
pub struct Worker {
    id: Uuid,
    plugin: String,
    ctx: SandboxContext,
    pool: Arc<PoolInner>,
    // Held for the worker's lifetime; dropping it frees the pool slot.
    _permit: OwnedSemaphorePermit,
    call_lock: Mutex<()>,
    released: AtomicBool,
}

impl Worker {
    pub(crate) fn new(
        id: Uuid,
        plugin: String,
        ctx: SandboxContext,
        pool: Arc<PoolInner>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            id,
            plugin,
            ctx,
            pool,
            _permit: permit,
            call_lock: Mutex::new(()),
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Name of the plugin this worker hosts.
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Dispatch one request to the hosted plugin.
    ///
    /// Calls are strictly serialized per worker.  A faulting error marks the
    /// worker [`WorkerState::Faulted`]; the caller is expected to release it
    /// and decide whether to retry elsewhere.
    pub async fn request(&self, kind: RequestKind) -> Result<HookOutcome> {
        let _serial = self.call_lock.lock().await;

        let loading = matches!(kind, RequestKind::Load);
        if !loading {
            self.pool.set_state(self.id, WorkerState::Executing);
        }

        let outcome = self.ctx.call(kind).await;

        match &outcome {
            Ok(_) => self.pool.set_state(self.id, WorkerState::Ready),
            Err(e) if e.faults_worker() => {
                tracing::warn!(
                    worker = %self.id,
                    plugin = %self.plugin,
                    error = %e,
                    "worker faulted"
                );
                self.pool.mark_faulted(self.id, e.to_string());
            }
            Err(e) => {
                tracing::debug!(worker = %self.id, plugin = %self.plugin, error = %e, "hook failed");
                self.pool.set_state(self.id, WorkerState::Ready);
            }
        }

        outcome
    }

    /// Latest resource-usage snapshot for the hosted context.
    pub fn usage(&self) -> ResourceUsage {
        self.ctx.usage()
    }

    pub(crate) fn mark_released(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Release already handled the record bookkeeping.
        if self.released.load(Ordering::SeqCst) {
            return;
        }
        self.pool.remove(self.id);
    }
}
