//! Plugbay sandboxed plugin execution.
//!
//! This crate runs third-party Wasm plugins inside isolated, resource-limited
//! execution contexts and manages the pool of workers that host them.
//!
//! - **[`policy`]** -- [`PermissionPolicy`] gates every capability a plugin
//!   can reach: filesystem, network, spawn, eval, sub-contexts, the clock.
//! - **[`context`]** -- [`SandboxContext`] owns one wasmtime store on a
//!   dedicated thread and enforces heap, CPU, and wall-clock ceilings.
//! - **[`protocol`]** -- typed request/response frames between the host and
//!   a context, with [`HookOutcome`] distinguishing handled from undeclared.
//! - **[`worker`]** -- [`Worker`] couples a pool slot with a context and
//!   serializes hook execution; [`WorkerState`] tracks its lifecycle.
//! - **[`pool`]** -- [`WorkerPool`] caps concurrency with a semaphore and
//!   shrinks idle capacity back toward its target size.
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod context;
pub mod error;
pub mod policy;
pub mod pool;
pub mod protocol;
pub mod worker;

#[cfg(test)]
pub(crate) mod testmod;

// Re-export the most commonly used types at the crate root.
pub use context::SandboxContext;
pub use error::{Result, SandboxError};
pub use policy::PermissionPolicy;
pub use pool::{PoolConfig, PoolStats, WorkerPool};
pub use protocol::{ContextRequest, ContextResponse, HookOutcome, RequestKind, UsbAction};
pub use worker::{ResourceUsage, Worker, WorkerInfo, WorkerState};
