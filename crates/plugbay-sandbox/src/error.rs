//! Sandbox error types.
//!
//! All sandbox subsystems surface errors through [`SandboxError`], which is
//! the single error type returned by every public API in this crate.  The
//! variants mirror the host-facing fault taxonomy: permission violations,
//! resource-ceiling breaches, crashes, and timeouts all fault the worker
//! that produced them (see [`SandboxError::faults_worker`]).

/// Unified error type for the plugin sandbox.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The policy engine denied an operation the plugin attempted.
    #[error("permission violation: {operation} denied ({detail})")]
    PermissionViolation {
        /// The operation that was attempted (e.g. `fs.read`, `spawn`).
        operation: String,
        /// What exactly was denied.
        detail: String,
    },

    /// A resource ceiling was breached and the operation was aborted.
    #[error("resource limit exceeded: {resource} (limit {limit})")]
    ResourceLimitExceeded {
        /// Which ceiling was breached (`heap`, `cpu`).
        resource: &'static str,
        /// The configured limit.
        limit: u64,
    },

    /// The context died, or stopped responding within its call timeout.
    #[error("sandbox crash: {reason}")]
    SandboxCrash {
        /// Human-readable description of what happened.
        reason: String,
    },

    /// Execution exceeded the configured wall-clock deadline.
    #[error("timeout: execution exceeded {limit_ms}ms")]
    Timeout {
        /// The configured deadline in milliseconds.
        limit_ms: u64,
    },

    /// Wasm module failed to compile (e.g. invalid bytecode).
    #[error("wasm compilation error: {0}")]
    Compilation(String),

    /// Wasm module could not be instantiated (e.g. missing imports).
    #[error("wasm instantiation error: {0}")]
    Instantiation(String),

    /// The guest hook ran but reported failure, or produced garbage output.
    #[error("hook execution error: {0}")]
    Execution(String),

    /// A Wasm trap was raised during execution.
    #[error("wasm trap: {0}")]
    Trap(String),

    /// The pool cannot hand out a worker.
    #[error("worker unavailable: {reason}")]
    WorkerUnavailable { reason: String },

    /// A worker was asked to do something its current state forbids.
    #[error("invalid worker state for {worker_id}: {reason}")]
    InvalidState {
        worker_id: uuid::Uuid,
        reason: String,
    },

    /// An I/O error occurred (e.g. reading the entry module from disk).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Whether this error must fault the worker that produced it.
    ///
    /// Faulting errors terminate the context; the pool reclaims the worker
    /// and the scheduler decides whether to retry.
    pub fn faults_worker(&self) -> bool {
        matches!(
            self,
            Self::PermissionViolation { .. }
                | Self::ResourceLimitExceeded { .. }
                | Self::SandboxCrash { .. }
                | Self::Timeout { .. }
                | Self::Trap(_)
        )
    }
}

/// Convenience alias used throughout the sandbox crate.
pub type Result<T> = std::result::Result<T, SandboxError>;
