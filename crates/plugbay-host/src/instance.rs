//! Loaded plugin instances and per-instance delivery.
//!
//! Each live instance owns a delivery task that pulls events and jobs off a
//! bounded channel and drives them through the instance's worker one at a
//! time.  That gives the per-plugin FIFO guarantee: arrivals queue at the
//! router, never inside the sandbox, and a second arrival waits behind the
//! first.
//!
//! Unload is a cancellation point, not a drain: the stop signal is observed
//! ahead of the delivery queue, so everything still queued is discarded, the
//! unload hook runs, and the worker goes back to the pool.  The coordinator
//! hears about the reclaimed worker through a release message and holds any
//! re-load of the same name until then.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use plugbay_manifest::PluginManifest;
use plugbay_sandbox::{RequestKind, Worker, WorkerPool};

use crate::queue::LoadPriority;
use crate::scheduler::Command;

/// Coordinator-side record of one live instance.
pub(crate) struct InstanceRecord {
    pub manifest: Arc<PluginManifest>,
    pub worker_id: Uuid,
    pub tx: mpsc::Sender<RequestKind>,
    /// Cancels the delivery task; queued requests are discarded.
    pub stop: watch::Sender<bool>,
    pub loaded_at: DateTime<Utc>,
    pub priority: LoadPriority,
}

impl InstanceRecord {
    pub fn info(&self, name: &str) -> PluginInstanceInfo {
        PluginInstanceInfo {
            name: name.to_string(),
            version: self.manifest.version.clone(),
            worker_id: self.worker_id,
            loaded_at: self.loaded_at,
            priority: self.priority,
        }
    }
}

/// Externally visible description of a loaded plugin.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PluginInstanceInfo {
    pub name: String,
    pub version: String,
    pub worker_id: Uuid,
    pub loaded_at: DateTime<Utc>,
    /// Priority the instance was loaded at.
    pub priority: LoadPriority,
}

/// Serialize deliveries into the worker until stop, channel close, or a
/// fault.
///
/// The task owns the worker; whichever way the loop exits, the worker goes
/// back to the pool and [`Command::InstanceReleased`] follows.  The stop
/// signal wins over queued deliveries, so an unload abandons outstanding
/// requests instead of draining them.  A faulting error reports up to the
/// coordinator so the instance record is dropped, and skips the unload
/// hook.
pub(crate) async fn delivery_loop(
    name: String,
    worker: Worker,
    pool: WorkerPool,
    mut rx: mpsc::Receiver<RequestKind>,
    mut stop: watch::Receiver<bool>,
    cmd_tx: mpsc::Sender<Command>,
) {
    let mut faulted = false;
    loop {
        let kind = tokio::select! {
            biased;
            _ = stop.changed() => break,
            item = rx.recv() => match item {
                Some(kind) => kind,
                None => break,
            },
        };
        match worker.request(kind).await {
            Ok(_) => {}
            Err(e) if e.faults_worker() => {
                tracing::warn!(plugin = %name, error = %e, "instance faulted during delivery");
                faulted = true;
                let _ = cmd_tx
                    .send(Command::InstanceFaulted { name: name.clone() })
                    .await;
                break;
            }
            Err(e) => {
                tracing::debug!(plugin = %name, error = %e, "hook delivery failed");
            }
        }
    }

    if !faulted {
        if let Err(e) = worker.request(RequestKind::Unload).await {
            tracing::debug!(plugin = %name, error = %e, "unload hook failed");
        }
    }

    tracing::debug!(plugin = %name, worker = %worker.id(), "instance torn down");
    pool.release(worker).await;
    let _ = cmd_tx.send(Command::InstanceReleased { name }).await;
}
