//! Load scheduler coordinator.
//!
//! All mutable host state -- the load queue, the loaded-instance registry,
//! the waiter lists -- is owned by one coordinator task and mutated only
//! from its command loop.  Everything else (the [`crate::host::PluginHost`]
//! facade, delivery tasks, spawned loads) talks to it through command
//! messages; cross-component reads leave as value snapshots.
//!
//! Dispatch runs whenever state changes: while fewer than
//! `max_concurrent_loads` loads are in flight, the most urgent queued task
//! is popped and its load spawned.  The spawned task may suspend waiting
//! for a pool slot; that suspends the slot, not this loop.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, watch};

use plugbay_manifest::PluginManifest;
use plugbay_sandbox::{RequestKind, UsbAction, Worker, WorkerPool};

use crate::config::HostConfig;
use crate::error::{HostError, Result};
use crate::events::{EventBus, HostEvent};
use crate::instance::{InstanceRecord, PluginInstanceInfo, delivery_loop};
use crate::metrics::{HostMetrics, MetricsState};
use crate::queue::{LoadPriority, LoadQueue, LoadTask, QueuedTaskInfo};

/// Point-in-time view of everything the host is doing.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HostStatus {
    pub loaded: Vec<PluginInstanceInfo>,
    pub queued: Vec<QueuedTaskInfo>,
    pub loading: Vec<String>,
    pub pool: plugbay_sandbox::PoolStats,
}

/// Messages into the coordinator.
pub(crate) enum Command {
    /// Make a plugin known to the host without loading it.
    Register {
        manifest: Arc<PluginManifest>,
        path: PathBuf,
    },
    Enqueue {
        manifest: Arc<PluginManifest>,
        path: PathBuf,
        priority: LoadPriority,
        reply: oneshot::Sender<Result<()>>,
    },
    SetPriority {
        name: String,
        priority: LoadPriority,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Wait until the named plugin is loaded, enqueueing it at Normal
    /// priority if it is neither queued nor loading.
    Resolve {
        name: String,
        reply: oneshot::Sender<Result<PluginInstanceInfo>>,
    },
    Unload {
        name: String,
        reply: oneshot::Sender<Result<()>>,
    },
    DispatchUsb {
        action: UsbAction,
        device: serde_json::Value,
    },
    DispatchJob {
        name: String,
        payload: serde_json::Value,
        reply: oneshot::Sender<Result<()>>,
    },
    Status {
        reply: oneshot::Sender<HostStatus>,
    },
    Metrics {
        reply: oneshot::Sender<HostMetrics>,
    },
    /// Internal: a spawned load finished, one way or the other.
    LoadFinished {
        task: LoadTask,
        started: Instant,
        result: Result<Worker>,
    },
    /// Internal: a delivery task saw its worker fault.
    InstanceFaulted { name: String },
    /// Internal: a delivery task finished tearing down and its worker is
    /// back in the pool.
    InstanceReleased { name: String },
    /// Tear every instance down and stop the coordinator.
    Shutdown { reply: oneshot::Sender<()> },
}

pub(crate) struct Coordinator {
    config: HostConfig,
    pool: WorkerPool,
    events: EventBus,
    /// Loop-back sender handed to spawned loads and delivery tasks.
    cmd_tx: mpsc::Sender<Command>,
    queue: LoadQueue,
    /// Every plugin the host has been told about, loaded or not.
    known: HashMap<String, (Arc<PluginManifest>, PathBuf)>,
    instances: HashMap<String, InstanceRecord>,
    loading: HashSet<String>,
    /// Callers suspended on a resolve, keyed by plugin name.
    waiters: HashMap<String, Vec<oneshot::Sender<Result<PluginInstanceInfo>>>>,
    /// Instances mid-teardown: the old worker is not yet back in the pool,
    /// so loads of the same name wait.  The flag says whether to announce
    /// the unload once the worker is reclaimed.
    terminating: HashMap<String, bool>,
    /// Loads popped while their name was still terminating; re-queued on
    /// release.
    parked: HashMap<String, LoadTask>,
    /// Single buffered hotplug event per not-yet-loaded plugin.  A newer
    /// event replaces the buffered one.
    buffered_usb: HashMap<String, (UsbAction, serde_json::Value)>,
    metrics: MetricsState,
}

impl Coordinator {
    pub fn new(
        config: HostConfig,
        pool: WorkerPool,
        events: EventBus,
        cmd_tx: mpsc::Sender<Command>,
    ) -> Self {
        Self {
            config,
            pool,
            events,
            cmd_tx,
            queue: LoadQueue::new(),
            known: HashMap::new(),
            instances: HashMap::new(),
            loading: HashSet::new(),
            waiters: HashMap::new(),
            terminating: HashMap::new(),
            parked: HashMap::new(),
            buffered_usb: HashMap::new(),
            metrics: MetricsState::default(),
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        tracing::info!("plugin host coordinator started");
        while let Some(cmd) = rx.recv().await {
            // The coordinator holds its own loop-back sender, so the
            // channel never closes on its own; shutdown is explicit.
            if let Command::Shutdown { reply } = cmd {
                self.shutdown_instances();
                let _ = reply.send(());
                break;
            }
            self.handle(cmd);
            self.pump();
        }
        tracing::info!("plugin host coordinator stopped");
    }

    fn shutdown_instances(&mut self) {
        for (name, record) in self.instances.drain() {
            tracing::debug!(plugin = %name, "shutting instance down");
            let _ = record.stop.send(true);
        }
        for (name, waiters) in self.waiters.drain() {
            tracing::debug!(plugin = %name, "dropping resolve waiters");
            drop(waiters);
        }
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Register { manifest, path } => {
                self.known.insert(manifest.name.clone(), (manifest, path));
            }
            Command::Enqueue {
                manifest,
                path,
                priority,
                reply,
            } => {
                let _ = reply.send(self.enqueue(manifest, path, priority));
            }
            Command::SetPriority {
                name,
                priority,
                reply,
            } => {
                let result = if self.queue.reprioritize(&name, priority) {
                    Ok(())
                } else if let Some(task) = self.parked.get_mut(&name) {
                    task.priority = priority;
                    Ok(())
                } else {
                    Err(HostError::NotFound { name })
                };
                let _ = reply.send(result);
            }
            Command::Resolve { name, reply } => self.resolve(name, reply),
            Command::Unload { name, reply } => {
                let _ = reply.send(self.unload(&name));
            }
            Command::DispatchUsb { action, device } => self.dispatch_usb(action, device),
            Command::DispatchJob {
                name,
                payload,
                reply,
            } => {
                let _ = reply.send(self.dispatch_job(&name, payload));
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Metrics { reply } => {
                let snapshot = self.metrics.snapshot(
                    self.instances.len(),
                    self.queue.len(),
                    self.loading.len(),
                );
                let _ = reply.send(snapshot);
            }
            Command::LoadFinished {
                task,
                started,
                result,
            } => self.load_finished(task, started, result),
            Command::InstanceFaulted { name } => {
                if self.instances.remove(&name).is_some() {
                    tracing::warn!(plugin = %name, "instance removed after worker fault");
                    self.terminating.insert(name, false);
                }
            }
            Command::InstanceReleased { name } => self.instance_released(name),
            // Handled in the run loop.
            Command::Shutdown { .. } => {}
        }
    }

    fn enqueue(
        &mut self,
        manifest: Arc<PluginManifest>,
        path: PathBuf,
        priority: LoadPriority,
    ) -> Result<()> {
        let name = manifest.name.clone();
        self.known.insert(name.clone(), (manifest.clone(), path.clone()));

        if self.instances.contains_key(&name) || self.loading.contains(&name) {
            return Ok(());
        }
        if let Some(parked) = self.parked.get_mut(&name) {
            if priority < parked.priority {
                parked.priority = priority;
            }
            return Ok(());
        }
        if !self.queue.contains(&name) && self.queue.len() >= self.config.queue_capacity {
            return Err(HostError::QueueFull { name });
        }
        tracing::debug!(plugin = %name, priority = %priority, "load enqueued");
        self.queue.push(manifest, path, priority);
        Ok(())
    }

    fn resolve(&mut self, name: String, reply: oneshot::Sender<Result<PluginInstanceInfo>>) {
        if let Some(record) = self.instances.get(&name) {
            let _ = reply.send(Ok(record.info(&name)));
            return;
        }
        if !self.queue.contains(&name)
            && !self.loading.contains(&name)
            && !self.parked.contains_key(&name)
        {
            let Some((manifest, path)) = self.known.get(&name).cloned() else {
                let _ = reply.send(Err(HostError::NotFound { name }));
                return;
            };
            if let Err(e) = self.enqueue(manifest, path, LoadPriority::Normal) {
                let _ = reply.send(Err(e));
                return;
            }
        }
        self.waiters.entry(name).or_default().push(reply);
    }

    fn unload(&mut self, name: &str) -> Result<()> {
        let Some(record) = self.instances.remove(name) else {
            return Err(HostError::NotLoaded { name: name.into() });
        };
        // Hard cancellation: queued deliveries are discarded, the delivery
        // task runs the unload hook and hands the worker back.  The
        // unloaded event fires once the worker is reclaimed, and a re-load
        // of the same name waits until then.
        self.terminating.insert(name.to_string(), true);
        let _ = record.stop.send(true);
        tracing::info!(plugin = %name, "plugin unloading");
        Ok(())
    }

    fn instance_released(&mut self, name: String) {
        if self.terminating.remove(&name) == Some(true) {
            tracing::info!(plugin = %name, "plugin unloaded");
            self.events.publish(HostEvent::PluginUnloaded { name: name.clone() });
        }
        if let Some(task) = self.parked.remove(&name) {
            let priority = task.priority;
            self.queue.requeue(task, priority);
        }
    }

    fn dispatch_usb(&mut self, action: UsbAction, device: serde_json::Value) {
        let kind = action.hook_kind();

        for (name, record) in &self.instances {
            if !record.manifest.hooks.declares(kind) {
                continue;
            }
            let delivery = RequestKind::UsbEvent {
                action,
                device: device.clone(),
            };
            if record.tx.try_send(delivery).is_err() {
                tracing::warn!(plugin = %name, "delivery queue full, hotplug event dropped");
            }
        }

        // Event-triggered lazy load: a known plugin that declares the hook
        // but has no instance yet gets loaded at High priority, with this
        // one event buffered until the load completes.
        let pending: Vec<(Arc<PluginManifest>, PathBuf)> = self
            .known
            .values()
            .filter(|(m, _)| m.hooks.declares(kind) && !self.instances.contains_key(&m.name))
            .cloned()
            .collect();
        for (manifest, path) in pending {
            let name = manifest.name.clone();
            self.buffered_usb
                .insert(name.clone(), (action, device.clone()));
            if !self.loading.contains(&name) {
                tracing::debug!(plugin = %name, "hotplug event triggers lazy load");
                let _ = self.enqueue(manifest, path, LoadPriority::High);
            }
        }
    }

    fn dispatch_job(&mut self, name: &str, payload: serde_json::Value) -> Result<()> {
        let Some(record) = self.instances.get(name) else {
            return Err(HostError::NotLoaded { name: name.into() });
        };
        record
            .tx
            .try_send(RequestKind::JobReceived { payload })
            .map_err(|_| HostError::QueueFull { name: name.into() })
    }

    fn status(&self) -> HostStatus {
        let mut loaded: Vec<_> = self
            .instances
            .iter()
            .map(|(name, record)| record.info(name))
            .collect();
        loaded.sort_by(|a, b| a.name.cmp(&b.name));
        let mut queued = self.queue.snapshot();
        queued.extend(self.parked.values().map(|t| QueuedTaskInfo {
            name: t.manifest.name.clone(),
            priority: t.priority,
            attempts: t.attempts,
        }));
        HostStatus {
            loaded,
            queued,
            loading: self.loading.iter().cloned().collect(),
            pool: self.pool.stats(),
        }
    }

    /// Dispatch queued loads up to the concurrency limit.
    fn pump(&mut self) {
        while self.loading.len() < self.config.max_concurrent_loads {
            let Some(task) = self.queue.pop() else {
                break;
            };
            let name = &task.manifest.name;
            if self.terminating.contains_key(name) {
                // The previous instance is still tearing down; hold this
                // load until its worker is back in the pool.
                tracing::debug!(plugin = %name, "load parked behind teardown");
                self.parked.insert(name.clone(), task);
                continue;
            }
            self.dispatch_load(task);
        }
    }

    fn dispatch_load(&mut self, task: LoadTask) {
        let name = task.manifest.name.clone();
        tracing::info!(
            plugin = %name,
            priority = %task.priority,
            attempt = task.attempts + 1,
            "dispatching load"
        );
        self.loading.insert(name);
        self.metrics.total_loads += 1;

        let pool = self.pool.clone();
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let result = run_load(&pool, &task).await;
            let _ = cmd_tx
                .send(Command::LoadFinished {
                    task,
                    started,
                    result,
                })
                .await;
        });
    }

    fn load_finished(&mut self, task: LoadTask, started: Instant, result: Result<Worker>) {
        let name = task.manifest.name.clone();
        self.loading.remove(&name);

        match result {
            Ok(worker) => {
                let load_time_ms = started.elapsed().as_millis() as u64;
                self.metrics.record_success(load_time_ms);

                let (tx, rx) = mpsc::channel(self.config.delivery_capacity);
                let (stop_tx, stop_rx) = watch::channel(false);
                let worker_id = worker.id();
                tokio::spawn(delivery_loop(
                    name.clone(),
                    worker,
                    self.pool.clone(),
                    rx,
                    stop_rx,
                    self.cmd_tx.clone(),
                ));
                let record = InstanceRecord {
                    manifest: task.manifest,
                    worker_id,
                    tx: tx.clone(),
                    stop: stop_tx,
                    loaded_at: chrono::Utc::now(),
                    priority: task.priority,
                };
                let info = record.info(&name);
                self.instances.insert(name.clone(), record);

                tracing::info!(plugin = %name, load_time_ms, "plugin loaded");
                self.events.publish(HostEvent::PluginLoaded {
                    name: name.clone(),
                    priority: task.priority,
                    load_time_ms,
                });
                for waiter in self.waiters.remove(&name).unwrap_or_default() {
                    let _ = waiter.send(Ok(info.clone()));
                }
                if let Some((action, device)) = self.buffered_usb.remove(&name) {
                    let _ = tx.try_send(RequestKind::UsbEvent { action, device });
                }
            }
            Err(error) => {
                let attempts = task.attempts + 1;
                if attempts < self.config.retry.max_attempts {
                    let priority = if self.config.retry.degrade_priority {
                        task.priority.degraded()
                    } else {
                        task.priority
                    };
                    tracing::warn!(
                        plugin = %name,
                        attempts,
                        error = %error,
                        retry_priority = %priority,
                        "load failed, retrying"
                    );
                    let mut task = task;
                    task.attempts = attempts;
                    self.queue.requeue(task, priority);
                } else {
                    self.metrics.failed_loads += 1;
                    self.buffered_usb.remove(&name);
                    tracing::error!(plugin = %name, attempts, error = %error, "load failed, giving up");
                    let reason = error.to_string();
                    self.events.publish(HostEvent::PluginLoadFailed {
                        name: name.clone(),
                        attempts,
                        error: reason.clone(),
                    });
                    for waiter in self.waiters.remove(&name).unwrap_or_default() {
                        let _ = waiter.send(Err(HostError::LoadFailed {
                            name: name.clone(),
                            attempts,
                            reason: reason.clone(),
                        }));
                    }
                }
            }
        }
    }
}

/// Read the entry module, acquire a worker, and run the load hook.
///
/// On a failed load hook, the worker goes straight back to the pool; the
/// coordinator only ever sees a worker that is ready to host the instance.
async fn run_load(pool: &WorkerPool, task: &LoadTask) -> Result<Worker> {
    let bytes = tokio::fs::read(&task.path).await?;
    let worker = pool.acquire(&task.manifest, bytes).await?;
    match worker.request(RequestKind::Load).await {
        Ok(_) => Ok(worker),
        Err(e) => {
            pool.release(worker).await;
            Err(e.into())
        }
    }
}
