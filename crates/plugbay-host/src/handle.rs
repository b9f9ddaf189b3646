//! Lazy plugin handles.
//!
//! A [`LazyHandle`] carries manifest metadata synchronously and defers the
//! actual load until the first [`LazyHandle::resolve`].  Resolving is
//! idempotent: once the instance exists, further resolves return
//! immediately, and concurrent resolves all wait on the same load.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use plugbay_manifest::PluginManifest;

use crate::error::Result;
use crate::host::resolve_with_timeout;
use crate::instance::PluginInstanceInfo;
use crate::scheduler::Command;

/// Deferred accessor for one plugin.  Cheap to clone.
#[derive(Clone)]
pub struct LazyHandle {
    manifest: Arc<PluginManifest>,
    entry_path: PathBuf,
    cmd_tx: mpsc::Sender<Command>,
    load_timeout: Duration,
}

impl LazyHandle {
    pub(crate) fn new(
        manifest: Arc<PluginManifest>,
        entry_path: PathBuf,
        cmd_tx: mpsc::Sender<Command>,
        load_timeout: Duration,
    ) -> Self {
        Self {
            manifest,
            entry_path,
            cmd_tx,
            load_timeout,
        }
    }

    /// Manifest metadata, available without loading anything.
    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    /// Resolved path of the plugin's entry module.
    pub fn entry_path(&self) -> &Path {
        &self.entry_path
    }

    /// Ensure the plugin is loaded, triggering a Normal-priority load on
    /// first use, and wait until its instance is available.
    ///
    /// Fails with [`crate::HostError::LoadTimeout`] if the wait outlives the
    /// configured load timeout; the load itself keeps going and a later
    /// resolve can still succeed.
    pub async fn resolve(&self) -> Result<PluginInstanceInfo> {
        resolve_with_timeout(
            &self.cmd_tx,
            self.manifest.name.clone(),
            self.load_timeout,
        )
        .await
    }
}

impl std::fmt::Debug for LazyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyHandle")
            .field("name", &self.manifest.name)
            .field("version", &self.manifest.version)
            .field("entry_path", &self.entry_path)
            .finish()
    }
}
