//! Plugin descriptor types.
//!
//! A plugin ships a JSON descriptor naming its entry module, the permissions
//! it requests, its resource limits, and the lifecycle hooks it handles.
//! The descriptor is parsed into [`PluginManifest`], which is immutable once
//! it has passed validation (see [`crate::validator`]).
//!
//! Hooks form a **closed** set -- [`HookKind`] -- dispatched through the
//! sandbox message protocol.  A plugin that does not declare a hook simply
//! never receives it; there is no runtime name lookup that can fail.

use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A validated, immutable plugin descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Unique plugin name -- the registry key.
    pub name: String,

    /// Semantic version string (e.g. `"1.2.0"`).
    pub version: String,

    /// Entry module path, relative to the plugin's own directory.
    pub entry: String,

    /// Requested permissions and resource limits.
    #[serde(default)]
    pub permissions: PermissionSpec,

    /// Lifecycle hooks this plugin handles.
    #[serde(default)]
    pub hooks: HookSet,
}

impl PluginManifest {
    /// Content signature over the manifest plus its resolved path.
    ///
    /// Used for identity and audit trails, not as a security control.
    pub fn signature(&self, resolved_path: &Path) -> String {
        let mut hasher = blake3::Hasher::new();
        if let Ok(bytes) = serde_json::to_vec(self) {
            hasher.update(&bytes);
        }
        hasher.update(resolved_path.to_string_lossy().as_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

/// Permissions and resource limits a plugin requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionSpec {
    /// Filesystem allow-list: path prefixes the plugin may read and write.
    #[serde(default)]
    pub fs: Vec<String>,

    /// Outbound network policy.
    #[serde(default)]
    pub network: NetworkAccess,

    /// Whether the plugin may spawn subprocesses.
    ///
    /// Accepted for descriptor compatibility but never honoured -- process
    /// spawning is denied for every context regardless of this flag.
    #[serde(default, rename = "spawnProcesses")]
    pub spawn_processes: bool,

    /// Maximum linear memory the plugin may allocate, in bytes.
    #[serde(default, rename = "maxHeapBytes")]
    pub max_heap_bytes: u64,

    /// Maximum CPU time per hook invocation, in milliseconds.
    #[serde(default, rename = "maxCpuMs")]
    pub max_cpu_ms: u64,

    /// Wall-clock deadline per hook invocation, in milliseconds.
    #[serde(default, rename = "timeoutMs")]
    pub timeout_ms: u64,
}

impl Default for PermissionSpec {
    fn default() -> Self {
        Self {
            fs: Vec::new(),
            network: NetworkAccess::Denied,
            spawn_processes: false,
            max_heap_bytes: 0,
            max_cpu_ms: 0,
            timeout_ms: 0,
        }
    }
}

/// Outbound network policy for a plugin.
///
/// The descriptor encodes this as either a boolean (`true` = everything,
/// `false` = nothing) or an array of allowed host names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum NetworkAccess {
    /// No outbound connections at all.
    #[default]
    Denied,

    /// Any outbound connection is allowed.
    All,

    /// Only connections to the listed hosts are allowed.
    Hosts(Vec<String>),
}

impl NetworkAccess {
    /// Whether a connection to `host` is permitted under this policy.
    pub fn allows(&self, host: &str) -> bool {
        match self {
            Self::Denied => false,
            Self::All => true,
            Self::Hosts(hosts) => hosts.iter().any(|h| h == host),
        }
    }
}

impl Serialize for NetworkAccess {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Denied => serializer.serialize_bool(false),
            Self::All => serializer.serialize_bool(true),
            Self::Hosts(hosts) => hosts.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for NetworkAccess {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Hosts(Vec<String>),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Flag(true) => Self::All,
            Raw::Flag(false) => Self::Denied,
            Raw::Hosts(hosts) => Self::Hosts(hosts),
        })
    }
}

/// The closed set of lifecycle hooks a plugin may handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookKind {
    /// Plugin finished loading into its context.
    Load,
    /// Plugin is about to be torn down.
    Unload,
    /// A hardware device was attached.
    UsbAttach,
    /// A hardware device was detached.
    UsbDetach,
    /// A queued work item arrived for this plugin.
    JobReceived,
}

impl HookKind {
    /// All hook kinds, in declaration order.
    pub const ALL: [HookKind; 5] = [
        HookKind::Load,
        HookKind::Unload,
        HookKind::UsbAttach,
        HookKind::UsbDetach,
        HookKind::JobReceived,
    ];

    /// Wire discriminant passed to the guest's `handle_hook` export.
    pub fn discriminant(self) -> i32 {
        match self {
            Self::Load => 0,
            Self::Unload => 1,
            Self::UsbAttach => 2,
            Self::UsbDetach => 3,
            Self::JobReceived => 4,
        }
    }
}

/// Which lifecycle hooks a plugin declares, with the handler names from the
/// descriptor.
///
/// The handler names are kept for audit and display; dispatch always goes
/// through the fixed `handle_hook` guest export keyed by [`HookKind`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookSet {
    #[serde(default, rename = "onLoad", skip_serializing_if = "Option::is_none")]
    pub on_load: Option<String>,

    #[serde(default, rename = "onUnload", skip_serializing_if = "Option::is_none")]
    pub on_unload: Option<String>,

    #[serde(default, rename = "onUSBAttach", skip_serializing_if = "Option::is_none")]
    pub on_usb_attach: Option<String>,

    #[serde(default, rename = "onUSBDetach", skip_serializing_if = "Option::is_none")]
    pub on_usb_detach: Option<String>,

    #[serde(default, rename = "onJobReceived", skip_serializing_if = "Option::is_none")]
    pub on_job_received: Option<String>,
}

impl HookSet {
    /// Whether the plugin declares a handler for `kind`.
    pub fn declares(&self, kind: HookKind) -> bool {
        self.handler(kind).is_some()
    }

    /// The declared handler name for `kind`, if any.
    pub fn handler(&self, kind: HookKind) -> Option<&str> {
        match kind {
            HookKind::Load => self.on_load.as_deref(),
            HookKind::Unload => self.on_unload.as_deref(),
            HookKind::UsbAttach => self.on_usb_attach.as_deref(),
            HookKind::UsbDetach => self.on_usb_detach.as_deref(),
            HookKind::JobReceived => self.on_job_received.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sample_manifest() -> PluginManifest {
        PluginManifest {
            name: "badge-reader".into(),
            version: "1.0.0".into(),
            entry: "badge.wasm".into(),
            permissions: PermissionSpec {
                fs: vec!["/var/lib/badges".into()],
                network: NetworkAccess::Hosts(vec!["api.example.com".into()]),
                spawn_processes: false,
                max_heap_bytes: 16 * 1024 * 1024,
                max_cpu_ms: 1000,
                timeout_ms: 5000,
            },
            hooks: HookSet {
                on_usb_attach: Some("handleAttach".into()),
                ..HookSet::default()
            },
        }
    }

    #[test]
    fn network_access_from_bool() {
        let all: NetworkAccess = serde_json::from_str("true").unwrap();
        assert_eq!(all, NetworkAccess::All);

        let denied: NetworkAccess = serde_json::from_str("false").unwrap();
        assert_eq!(denied, NetworkAccess::Denied);
    }

    #[test]
    fn network_access_from_host_list() {
        let hosts: NetworkAccess = serde_json::from_str(r#"["a.example", "b.example"]"#).unwrap();
        assert!(hosts.allows("a.example"));
        assert!(hosts.allows("b.example"));
        assert!(!hosts.allows("c.example"));
    }

    #[test]
    fn network_access_default_is_denied() {
        let access = NetworkAccess::default();
        assert!(!access.allows("anything.example"));
    }

    #[test]
    fn network_access_serializes_back_to_wire_shape() {
        let json = serde_json::to_string(&NetworkAccess::All).unwrap();
        assert_eq!(json, "true");

        let json = serde_json::to_string(&NetworkAccess::Hosts(vec!["x".into()])).unwrap();
        assert_eq!(json, r#"["x"]"#);
    }

    #[test]
    fn hook_set_declares() {
        let hooks = HookSet {
            on_load: Some("init".into()),
            on_job_received: Some("work".into()),
            ..HookSet::default()
        };
        assert!(hooks.declares(HookKind::Load));
        assert!(hooks.declares(HookKind::JobReceived));
        assert!(!hooks.declares(HookKind::UsbAttach));
        assert_eq!(hooks.handler(HookKind::Load), Some("init"));
    }

    #[test]
    fn hook_kind_discriminants_are_stable() {
        let seen: Vec<i32> = HookKind::ALL.iter().map(|k| k.discriminant()).collect();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn manifest_roundtrip_with_camel_case_fields() {
        let raw = r#"{
            "name": "scanner",
            "version": "0.2.0",
            "entry": "scanner.wasm",
            "permissions": {
                "fs": ["/srv/scans"],
                "network": false,
                "maxHeapBytes": 8388608,
                "maxCpuMs": 500,
                "timeoutMs": 2000
            },
            "hooks": { "onJobReceived": "scan" }
        }"#;

        let manifest: PluginManifest = serde_json::from_str(raw).unwrap();
        assert_eq!(manifest.name, "scanner");
        assert_eq!(manifest.permissions.max_heap_bytes, 8_388_608);
        assert_eq!(manifest.permissions.network, NetworkAccess::Denied);
        assert!(manifest.hooks.declares(HookKind::JobReceived));
        assert!(!manifest.permissions.spawn_processes);
    }

    #[test]
    fn signature_is_deterministic_and_path_sensitive() {
        let manifest = sample_manifest();
        let a = manifest.signature(&PathBuf::from("/plugins/badge"));
        let b = manifest.signature(&PathBuf::from("/plugins/badge"));
        let c = manifest.signature(&PathBuf::from("/plugins/other"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64); // blake3 hex
    }
}
