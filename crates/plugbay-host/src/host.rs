//! The plugin host facade.
//!
//! [`PluginHost`] is the public entry point: validate and register plugin
//! descriptors, enqueue and unload plugins, route hardware events and jobs,
//! and observe metrics and lifecycle events.  The facade is a thin,
//! cheaply-clonable front over the coordinator task; every call becomes a
//! command message and the reply comes back over a oneshot channel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot};

use plugbay_manifest::{ManifestValidator, PluginManifest, resolve_entry};
use plugbay_sandbox::{UsbAction, WorkerPool};

use crate::config::HostConfig;
use crate::error::{HostError, Result};
use crate::events::{EventBus, HostEvent};
use crate::handle::LazyHandle;
use crate::instance::PluginInstanceInfo;
use crate::metrics::HostMetrics;
use crate::queue::LoadPriority;
use crate::scheduler::{Command, Coordinator, HostStatus};

/// Name of the descriptor file inside a plugin directory.
const MANIFEST_FILE: &str = "plugin.json";

/// Shared handle to a running plugin host.  Cheap to clone.
#[derive(Clone)]
pub struct PluginHost {
    cmd_tx: mpsc::Sender<Command>,
    events: EventBus,
    handles: Arc<DashMap<String, LazyHandle>>,
    validator: Arc<ManifestValidator>,
    load_timeout: Duration,
}

impl PluginHost {
    /// Start the host: build the worker pool and spawn the coordinator.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(config: HostConfig) -> Result<Self> {
        let pool = WorkerPool::new(config.pool.clone())?;
        let events = EventBus::new(config.event_capacity);
        let validator = Arc::new(ManifestValidator::new(config.ceilings.clone()));
        let load_timeout = Duration::from_millis(config.load_timeout_ms);

        let (cmd_tx, cmd_rx) = mpsc::channel(128);
        let coordinator = Coordinator::new(config, pool, events.clone(), cmd_tx.clone());
        tokio::spawn(coordinator.run(cmd_rx));

        Ok(Self {
            cmd_tx,
            events,
            handles: Arc::new(DashMap::new()),
            validator,
            load_timeout,
        })
    }

    /// Validate the descriptor in `plugin_dir` and register the plugin for
    /// lazy loading.  Nothing is loaded yet.
    pub async fn register_plugin(&self, plugin_dir: &Path) -> Result<LazyHandle> {
        let raw = tokio::fs::read_to_string(plugin_dir.join(MANIFEST_FILE)).await?;
        let manifest = self.validator.validate_str(&raw, plugin_dir)?;
        let entry_path = resolve_entry(&manifest.entry, plugin_dir)?;
        self.create_lazy_handle(manifest, entry_path).await
    }

    /// Register an already-validated manifest and get its lazy handle.
    ///
    /// Idempotent per plugin name: repeated calls return the cached handle.
    pub async fn create_lazy_handle(
        &self,
        manifest: PluginManifest,
        entry_path: PathBuf,
    ) -> Result<LazyHandle> {
        if let Some(existing) = self.handles.get(&manifest.name) {
            return Ok(existing.clone());
        }

        let name = manifest.name.clone();
        let manifest = Arc::new(manifest);
        self.cmd_tx
            .send(Command::Register {
                manifest: Arc::clone(&manifest),
                path: entry_path.clone(),
            })
            .await
            .map_err(|_| HostError::Shutdown)?;

        let handle = LazyHandle::new(
            manifest,
            entry_path,
            self.cmd_tx.clone(),
            self.load_timeout,
        );
        Ok(self
            .handles
            .entry(name)
            .or_insert(handle)
            .clone())
    }

    /// Queue a load, or re-prioritize the queued load of the same name.
    pub async fn enqueue(
        &self,
        manifest: PluginManifest,
        entry_path: PathBuf,
        priority: LoadPriority,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Enqueue {
            manifest: Arc::new(manifest),
            path: entry_path,
            priority,
            reply,
        })
        .await?;
        rx.await.map_err(|_| HostError::Shutdown)?
    }

    /// Enqueue and wait for the instance, bounded by the load timeout.
    ///
    /// A timeout aborts only this wait; the dispatched load either completes
    /// (and serves later callers) or fails and retries per policy.
    pub async fn load_now(
        &self,
        manifest: PluginManifest,
        entry_path: PathBuf,
        priority: LoadPriority,
    ) -> Result<PluginInstanceInfo> {
        let name = manifest.name.clone();
        self.enqueue(manifest, entry_path, priority).await?;
        resolve_with_timeout(&self.cmd_tx, name, self.load_timeout).await
    }

    /// Change the priority of a queued load.
    pub async fn set_priority(&self, name: &str, priority: LoadPriority) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetPriority {
            name: name.into(),
            priority,
            reply,
        })
        .await?;
        rx.await.map_err(|_| HostError::Shutdown)?
    }

    /// Unload a plugin: run its unload hook, reclaim its worker, and drop
    /// its lazy-handle cache entry.
    pub async fn unload(&self, name: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Unload {
            name: name.into(),
            reply,
        })
        .await?;
        let result = rx.await.map_err(|_| HostError::Shutdown)?;
        if result.is_ok() {
            self.handles.remove(name);
        }
        result
    }

    /// Route a hardware hotplug event to every plugin that handles it.
    pub async fn dispatch_usb_event(
        &self,
        action: UsbAction,
        device: serde_json::Value,
    ) -> Result<()> {
        self.send(Command::DispatchUsb { action, device }).await
    }

    /// Deliver a job payload to a loaded plugin.
    ///
    /// Fails with [`HostError::NotLoaded`] if no instance exists; callers
    /// are expected to have resolved a lazy handle first.
    pub async fn dispatch_job(&self, name: &str, payload: serde_json::Value) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::DispatchJob {
            name: name.into(),
            payload,
            reply,
        })
        .await?;
        rx.await.map_err(|_| HostError::Shutdown)?
    }

    /// Point-in-time view of loaded, queued, and loading plugins.
    pub async fn status(&self) -> Result<HostStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply }).await?;
        rx.await.map_err(|_| HostError::Shutdown)
    }

    /// Load-activity counters.
    pub async fn metrics(&self) -> Result<HostMetrics> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Metrics { reply }).await?;
        rx.await.map_err(|_| HostError::Shutdown)
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<HostEvent>> {
        self.events.subscribe()
    }

    /// Unload every instance and stop the coordinator.  Later calls on any
    /// clone of this facade fail with [`HostError::Shutdown`].
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply }).await?;
        rx.await.map_err(|_| HostError::Shutdown)
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx.send(cmd).await.map_err(|_| HostError::Shutdown)
    }
}

/// Wait for the named plugin to come up, bounded by `timeout`.
pub(crate) async fn resolve_with_timeout(
    cmd_tx: &mpsc::Sender<Command>,
    name: String,
    timeout: Duration,
) -> Result<PluginInstanceInfo> {
    let (reply, rx) = oneshot::channel();
    cmd_tx
        .send(Command::Resolve {
            name: name.clone(),
            reply,
        })
        .await
        .map_err(|_| HostError::Shutdown)?;

    match tokio::time::timeout(timeout, rx).await {
        Err(_) => Err(HostError::LoadTimeout {
            name,
            waited_ms: timeout.as_millis() as u64,
        }),
        Ok(Err(_)) => Err(HostError::Shutdown),
        Ok(Ok(result)) => result,
    }
}
