//! Manifest error types.
//!
//! All validation failures surface through [`ManifestError`].  Each variant
//! names the offending field so callers (and operators reading logs) can see
//! exactly which part of a descriptor was rejected without parsing strings.

/// Why a plugin descriptor was rejected.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// A required field is absent or empty.
    #[error("missing required field `{field}`")]
    MissingField {
        /// The manifest field that was absent.
        field: &'static str,
    },

    /// A field is present but carries a value of the wrong shape.
    #[error("invalid value for `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// The declared entry point escapes the plugin's own directory.
    #[error("entry path `{entry}` resolves outside the plugin root")]
    EntryOutsideRoot {
        /// The raw entry string from the descriptor.
        entry: String,
    },

    /// A resource limit is zero, or above the host-configured maximum.
    #[error("resource limit `{field}` out of range: {value} (host maximum {max})")]
    LimitOutOfRange {
        field: &'static str,
        value: u64,
        max: u64,
    },

    /// The raw descriptor could not be parsed at all.
    #[error("malformed manifest: {0}")]
    Malformed(String),
}

/// Convenience alias used throughout the manifest crate.
pub type Result<T> = std::result::Result<T, ManifestError>;
