//! Host error types.
//!
//! Caller-input errors (bad manifests, unknown names) surface synchronously.
//! Runtime faults inside a context arrive as [`HostError::Sandbox`] and are
//! absorbed by the scheduler's retry policy; callers only see
//! [`HostError::LoadFailed`] after the attempts are exhausted.

use plugbay_manifest::ManifestError;
use plugbay_sandbox::SandboxError;

/// Unified error type for the plugin host.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// The plugin descriptor failed validation.
    #[error("invalid manifest: {0}")]
    ManifestInvalid(#[from] ManifestError),

    /// A caller's wait for a load expired.  The load itself keeps going.
    #[error("load of `{name}` timed out after {waited_ms}ms")]
    LoadTimeout { name: String, waited_ms: u64 },

    /// The operation targeted a plugin with no live instance.
    #[error("plugin `{name}` is not loaded")]
    NotLoaded { name: String },

    /// The named plugin is unknown to the host.
    #[error("plugin `{name}` not found")]
    NotFound { name: String },

    /// The load queue, or a plugin's delivery queue, is at capacity.
    #[error("queue full for `{name}`")]
    QueueFull { name: String },

    /// All load attempts for a plugin were exhausted.
    #[error("load of `{name}` failed after {attempts} attempts: {reason}")]
    LoadFailed {
        name: String,
        attempts: u32,
        reason: String,
    },

    /// A sandbox-level fault.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// The host coordinator is gone.
    #[error("plugin host is shut down")]
    Shutdown,

    /// An I/O error, typically while reading an entry module.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the host crate.
pub type Result<T> = std::result::Result<T, HostError>;
