//! Manifest validation.
//!
//! [`ManifestValidator`] turns a raw JSON descriptor into a typed
//! [`PluginManifest`], or a [`ManifestError`] naming the offending field.
//! Validation has no side effects: nothing is read from disk and nothing is
//! registered anywhere.  The checks are:
//!
//! 1. Required fields (`name`, `version`, `entry`) are present and non-empty.
//! 2. The entry path stays inside the plugin's own directory -- absolute
//!    paths, `..` traversal, and percent-encoded traversal are all rejected.
//! 3. Permission fields are well-typed (enforced by the serde model).
//! 4. Resource limits are positive and within the host-configured
//!    [`HostCeilings`].

use std::path::{Component, Path, PathBuf};

use percent_encoding::percent_decode_str;

use crate::error::{ManifestError, Result};
use crate::types::PluginManifest;

/// Host-configured maxima that no manifest may exceed.
#[derive(Debug, Clone)]
pub struct HostCeilings {
    /// Upper bound for `maxHeapBytes`.
    ///
    /// Default: **256 MiB**.
    pub max_heap_bytes: u64,

    /// Upper bound for `maxCpuMs`.
    ///
    /// Default: **60 000 ms**.
    pub max_cpu_ms: u64,

    /// Upper bound for `timeoutMs`.
    ///
    /// Default: **120 000 ms**.
    pub max_timeout_ms: u64,
}

impl Default for HostCeilings {
    fn default() -> Self {
        Self {
            max_heap_bytes: 256 * 1024 * 1024,
            max_cpu_ms: 60_000,
            max_timeout_ms: 120_000,
        }
    }
}

impl HostCeilings {
    /// Create ceilings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the heap ceiling (in bytes).
    pub fn with_max_heap_bytes(mut self, bytes: u64) -> Self {
        self.max_heap_bytes = bytes;
        self
    }

    /// Set the CPU-time ceiling (in milliseconds).
    pub fn with_max_cpu_ms(mut self, ms: u64) -> Self {
        self.max_cpu_ms = ms;
        self
    }

    /// Set the wall-clock ceiling (in milliseconds).
    pub fn with_max_timeout_ms(mut self, ms: u64) -> Self {
        self.max_timeout_ms = ms;
        self
    }
}

/// Validates raw plugin descriptors against host policy.
#[derive(Debug, Clone, Default)]
pub struct ManifestValidator {
    ceilings: HostCeilings,
}

impl ManifestValidator {
    /// Create a validator with the given host ceilings.
    pub fn new(ceilings: HostCeilings) -> Self {
        Self { ceilings }
    }

    /// Validate a descriptor already parsed into a JSON value.
    ///
    /// `plugin_root` is the plugin's own directory; the entry path must
    /// resolve inside it.
    pub fn validate(&self, raw: &serde_json::Value, plugin_root: &Path) -> Result<PluginManifest> {
        let manifest: PluginManifest = serde_json::from_value(raw.clone())
            .map_err(|e| ManifestError::Malformed(e.to_string()))?;

        self.check(&manifest, plugin_root)?;
        Ok(manifest)
    }

    /// Validate a descriptor from raw JSON text.
    pub fn validate_str(&self, raw: &str, plugin_root: &Path) -> Result<PluginManifest> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| ManifestError::Malformed(e.to_string()))?;
        self.validate(&value, plugin_root)
    }

    fn check(&self, manifest: &PluginManifest, plugin_root: &Path) -> Result<()> {
        required(&manifest.name, "name")?;
        required(&manifest.version, "version")?;
        required(&manifest.entry, "entry")?;

        resolve_entry(&manifest.entry, plugin_root)?;

        for prefix in &manifest.permissions.fs {
            if prefix.is_empty() {
                return Err(ManifestError::InvalidField {
                    field: "permissions.fs",
                    reason: "allow-list entries must be non-empty".into(),
                });
            }
            if !Path::new(prefix).is_absolute() {
                return Err(ManifestError::InvalidField {
                    field: "permissions.fs",
                    reason: format!("allow-list entry `{prefix}` is not an absolute path"),
                });
            }
        }

        if manifest.permissions.spawn_processes {
            // Accepted for compatibility; the sandbox denies spawning anyway.
            tracing::warn!(
                plugin = %manifest.name,
                "manifest requests spawnProcesses; process spawning is never granted"
            );
        }

        limit(
            manifest.permissions.max_heap_bytes,
            self.ceilings.max_heap_bytes,
            "permissions.maxHeapBytes",
        )?;
        limit(
            manifest.permissions.max_cpu_ms,
            self.ceilings.max_cpu_ms,
            "permissions.maxCpuMs",
        )?;
        limit(
            manifest.permissions.timeout_ms,
            self.ceilings.max_timeout_ms,
            "permissions.timeoutMs",
        )?;

        tracing::debug!(plugin = %manifest.name, version = %manifest.version, "manifest validated");
        Ok(())
    }
}

/// Resolve a manifest entry path inside the plugin root.
///
/// Rejects absolute paths, any `..` component that would climb above the
/// root, and percent-encoded traversal sequences (`%2e%2e` and friends are
/// decoded before the traversal check so they cannot smuggle a `..`).
pub fn resolve_entry(entry: &str, plugin_root: &Path) -> Result<PathBuf> {
    let decoded = percent_decode_str(entry)
        .decode_utf8()
        .map_err(|e| ManifestError::InvalidField {
            field: "entry",
            reason: format!("entry is not valid UTF-8 after percent-decoding: {e}"),
        })?;

    let relative = Path::new(decoded.as_ref());
    if relative.is_absolute() {
        return Err(ManifestError::EntryOutsideRoot {
            entry: entry.to_string(),
        });
    }

    // Lexical normalization: track depth and refuse to climb above the root.
    let mut normalized = PathBuf::new();
    let mut depth: usize = 0;
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                normalized.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return Err(ManifestError::EntryOutsideRoot {
                        entry: entry.to_string(),
                    });
                }
                normalized.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ManifestError::EntryOutsideRoot {
                    entry: entry.to_string(),
                });
            }
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(ManifestError::MissingField { field: "entry" });
    }

    Ok(plugin_root.join(normalized))
}

fn required(value: &str, field: &'static str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ManifestError::MissingField { field });
    }
    Ok(())
}

fn limit(value: u64, max: u64, field: &'static str) -> Result<()> {
    if value == 0 || value > max {
        return Err(ManifestError::LimitOutOfRange { field, value, max });
    }
    Ok(())
}
