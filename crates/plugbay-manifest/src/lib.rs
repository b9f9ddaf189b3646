//! Plugbay plugin manifest model and validation.
//!
//! This crate is the leaf of the Plugbay workspace: everything else consumes
//! the types defined here.
//!
//! - **[`types`]** -- [`PluginManifest`], [`PermissionSpec`],
//!   [`NetworkAccess`], and the closed [`HookKind`] / [`HookSet`] hook model.
//! - **[`validator`]** -- [`ManifestValidator`] checks descriptors against
//!   host-configured [`HostCeilings`] and entry-path containment.
//! - **[`error`]** -- [`ManifestError`] names the offending field for every
//!   rejection.
//!
//! All public types are `Send + Sync` and cheap to clone.

pub mod error;
pub mod types;
pub mod validator;

// Re-export the most commonly used types at the crate root.
pub use error::{ManifestError, Result};
pub use types::{HookKind, HookSet, NetworkAccess, PermissionSpec, PluginManifest};
pub use validator::{HostCeilings, ManifestValidator, resolve_entry};
