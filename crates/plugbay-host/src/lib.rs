//! Plugbay plugin host.
//!
//! This crate ties the manifest model and the sandbox together into a
//! running host: plugins are registered from validated descriptors, loaded
//! through a priority queue by a single coordinating task, and reached
//! afterwards through lazy handles and the event/job router.
//!
//! - **[`host`]** -- [`PluginHost`], the public facade.
//! - **[`scheduler`]** -- the single-writer coordinator owning the load
//!   queue and the instance registry.
//! - **[`queue`]** -- [`LoadPriority`] tiers and the FIFO-within-tier
//!   [`LoadQueue`].
//! - **[`handle`]** -- [`LazyHandle`], load-on-first-use plugin access.
//! - **[`instance`]** -- live instances and per-plugin FIFO delivery.
//! - **[`events`]** -- the [`HostEvent`] broadcast bus.
//! - **[`metrics`]** -- pollable [`HostMetrics`] snapshots.
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod config;
pub mod error;
pub mod events;
pub mod handle;
pub mod host;
pub mod instance;
pub mod metrics;
pub mod queue;
pub mod scheduler;

// Re-export the most commonly used types at the crate root.
pub use config::{HostConfig, RetryPolicy};
pub use error::{HostError, Result};
pub use events::{EventBus, HostEvent};
pub use handle::LazyHandle;
pub use host::PluginHost;
pub use instance::PluginInstanceInfo;
pub use metrics::HostMetrics;
pub use queue::{LoadPriority, LoadQueue, QueuedTaskInfo};
pub use scheduler::HostStatus;

// The router's event vocabulary comes from the sandbox protocol.
pub use plugbay_sandbox::UsbAction;
