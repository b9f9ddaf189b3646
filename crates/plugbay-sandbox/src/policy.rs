//! Sandbox permission policy.
//!
//! A [`PermissionPolicy`] is derived from a manifest's permission block when
//! the context is created and stays immutable for the lifetime of the
//! context it governs.  Every capability the guest can reach -- filesystem,
//! network, process spawning, dynamic evaluation, sub-context creation, the
//! clock -- goes through this policy *before* any effect is observable.
//!
//! Filesystem checks canonicalize the requested path first (resolving `..`,
//! symlinks, and percent-encoded traversal sequences) and then match it
//! against the allow-list of path prefixes.  No match means deny, regardless
//! of the requested access mode.

use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use percent_encoding::percent_decode_str;
use plugbay_manifest::{NetworkAccess, PermissionSpec};

use crate::error::{Result, SandboxError};

/// Abstract instructions budgeted per millisecond of declared CPU time.
///
/// Fuel is wasmtime's deterministic CPU bound; the exact exchange rate only
/// needs to be consistent, not precise.
const FUEL_PER_MS: u64 = 10_000;

/// Guest-visible clock granularity, in milliseconds.
///
/// Coarsening the clock reduces the bandwidth of timing side channels
/// available to plugin code.
const CLOCK_GRANULARITY_MS: u64 = 10;

/// Immutable allow/deny rules and resource ceilings for one context.
#[derive(Debug, Clone)]
pub struct PermissionPolicy {
    /// Canonicalized filesystem prefixes the plugin may touch.
    fs_prefixes: Vec<PathBuf>,
    /// Outbound network policy.
    network: NetworkAccess,
    /// Linear memory ceiling, in bytes.
    max_heap_bytes: u64,
    /// CPU time ceiling per hook invocation, in milliseconds.
    max_cpu_ms: u64,
    /// Wall-clock deadline per hook invocation, in milliseconds.
    timeout_ms: u64,
    /// How many sub-contexts the plugin may create.  Fixed at zero.
    max_subcontexts: u32,
}

impl PermissionPolicy {
    /// Derive a policy from a validated manifest permission block.
    ///
    /// Allow-list prefixes are canonicalized here, once, so that runtime
    /// checks compare canonical forms on both sides.  A prefix that does not
    /// exist yet is normalized lexically instead.
    pub fn from_spec(spec: &PermissionSpec) -> Self {
        let fs_prefixes = spec
            .fs
            .iter()
            .map(|p| canonicalize_best_effort(Path::new(p)))
            .collect();

        Self {
            fs_prefixes,
            network: spec.network.clone(),
            max_heap_bytes: spec.max_heap_bytes,
            max_cpu_ms: spec.max_cpu_ms,
            timeout_ms: spec.timeout_ms,
            max_subcontexts: 0,
        }
    }

    /// Linear memory ceiling, in bytes.
    pub fn max_heap_bytes(&self) -> u64 {
        self.max_heap_bytes
    }

    /// Wall-clock deadline per hook invocation, in milliseconds.
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// Fuel budget for one hook invocation.
    pub fn fuel_budget(&self) -> u64 {
        self.max_cpu_ms.saturating_mul(FUEL_PER_MS)
    }

    /// Check a filesystem access request against the allow-list.
    ///
    /// The raw path is percent-decoded, canonicalized (following symlinks
    /// for the existing part of the path), and then prefix-matched.  Returns
    /// the canonical path on success so callers operate on the checked form,
    /// never the raw one.
    pub fn check_fs_access(&self, raw: &str) -> Result<PathBuf> {
        let decoded = percent_decode_str(raw).decode_utf8().map_err(|_| {
            SandboxError::PermissionViolation {
                operation: "fs".into(),
                detail: format!("path `{raw}` is not valid UTF-8 after percent-decoding"),
            }
        })?;

        let requested = Path::new(decoded.as_ref());
        if !requested.is_absolute() {
            return Err(SandboxError::PermissionViolation {
                operation: "fs".into(),
                detail: format!("relative path `{raw}` refused"),
            });
        }

        let canonical = canonicalize_best_effort(requested);

        if self
            .fs_prefixes
            .iter()
            .any(|prefix| canonical.starts_with(prefix))
        {
            Ok(canonical)
        } else {
            tracing::warn!(path = %canonical.display(), "filesystem access denied");
            Err(SandboxError::PermissionViolation {
                operation: "fs".into(),
                detail: format!("`{}` outside allow-list", canonical.display()),
            })
        }
    }

    /// Check an outbound connection attempt.
    pub fn check_network(&self, host: &str) -> Result<()> {
        if self.network.allows(host) {
            Ok(())
        } else {
            tracing::warn!(host = %host, "network access denied");
            Err(SandboxError::PermissionViolation {
                operation: "network".into(),
                detail: format!("outbound connection to `{host}` not in allow-list"),
            })
        }
    }

    /// Check a subprocess spawn attempt.  Always denied; no manifest
    /// permission can re-enable it.
    pub fn check_spawn(&self) -> Result<()> {
        tracing::warn!("subprocess spawn denied");
        Err(SandboxError::PermissionViolation {
            operation: "spawn".into(),
            detail: "process spawning is never granted".into(),
        })
    }

    /// Check a dynamic code evaluation attempt.  Always denied.
    pub fn check_eval(&self) -> Result<()> {
        tracing::warn!("dynamic code evaluation denied");
        Err(SandboxError::PermissionViolation {
            operation: "eval".into(),
            detail: "dynamic code evaluation is never granted".into(),
        })
    }

    /// Check whether the plugin may create another sub-context.
    ///
    /// The cap is fixed at zero, so every attempt is denied.
    pub fn check_subcontext(&self, current: u32) -> Result<()> {
        if current < self.max_subcontexts {
            Ok(())
        } else {
            Err(SandboxError::PermissionViolation {
                operation: "subcontext".into(),
                detail: format!("sub-context cap of {} reached", self.max_subcontexts),
            })
        }
    }

    /// Current wall-clock time, quantized for guest consumption.
    pub fn guest_now_ms(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.quantize_ms(now)
    }

    /// Quantize a millisecond timestamp to the guest clock granularity.
    pub fn quantize_ms(&self, t: u64) -> u64 {
        t - (t % CLOCK_GRANULARITY_MS)
    }
}

/// Canonicalize a path, tolerating components that do not exist yet.
///
/// `std::fs::canonicalize` fails on non-existent paths, so we canonicalize
/// the deepest existing ancestor (resolving its symlinks) and normalize the
/// remainder lexically.  The result never contains `.` or `..` components.
fn canonicalize_best_effort(path: &Path) -> PathBuf {
    // Fast path: the whole thing exists.
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }

    // Walk up until an ancestor canonicalizes, then re-append the rest.
    let mut ancestor = path;
    let mut tail = Vec::new();
    while let Some(parent) = ancestor.parent() {
        if let Some(name) = ancestor.file_name() {
            tail.push(name.to_os_string());
        }
        if let Ok(canonical_parent) = parent.canonicalize() {
            let mut out = canonical_parent;
            for name in tail.iter().rev() {
                out.push(name);
            }
            return normalize_lexical(&out);
        }
        ancestor = parent;
    }

    normalize_lexical(path)
}

/// Resolve `.` and `..` components without touching the filesystem.
fn normalize_lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}
