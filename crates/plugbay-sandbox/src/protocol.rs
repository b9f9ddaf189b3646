//! Context message protocol.
//!
//! The coordinator talks to a context through typed request/response frames.
//! Every [`ContextRequest`] correlates to exactly one [`ContextResponse`]
//! carrying the same `id`; a request whose response does not arrive within
//! the context's call timeout is treated as a crash and faults the worker.

use serde::{Deserialize, Serialize};

use plugbay_manifest::HookKind;

use crate::error::SandboxError;

/// Hardware hotplug action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsbAction {
    Attach,
    Detach,
}

impl UsbAction {
    /// The hook kind that handles this action.
    pub fn hook_kind(self) -> HookKind {
        match self {
            Self::Attach => HookKind::UsbAttach,
            Self::Detach => HookKind::UsbDetach,
        }
    }
}

/// What a request asks the context to do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestKind {
    /// Compile and instantiate the plugin, then run its load hook.
    Load,
    /// Run the unload hook and tear the instance down.
    Unload,
    /// Deliver a hardware hotplug event.
    UsbEvent {
        action: UsbAction,
        device: serde_json::Value,
    },
    /// Deliver a queued work item.
    JobReceived { payload: serde_json::Value },
}

impl RequestKind {
    /// The hook this request dispatches to.
    pub fn hook_kind(&self) -> HookKind {
        match self {
            Self::Load => HookKind::Load,
            Self::Unload => HookKind::Unload,
            Self::UsbEvent { action, .. } => action.hook_kind(),
            Self::JobReceived { .. } => HookKind::JobReceived,
        }
    }

    /// JSON payload delivered to the guest for this request.
    pub fn payload(&self) -> serde_json::Value {
        match self {
            Self::Load | Self::Unload => serde_json::Value::Null,
            Self::UsbEvent { action, device } => serde_json::json!({
                "action": action,
                "device": device,
            }),
            Self::JobReceived { payload } => payload.clone(),
        }
    }
}

/// A request frame sent into a context.
#[derive(Debug)]
pub struct ContextRequest {
    /// Correlation id, unique per context.
    pub id: u64,
    pub kind: RequestKind,
}

/// What the guest did with a dispatched hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    /// The guest handled the hook and produced this result.
    Handled(serde_json::Value),
    /// The guest does not export a handler; nothing ran.
    NotHandled,
}

/// A response frame produced by a context.
#[derive(Debug)]
pub struct ContextResponse {
    /// Correlation id of the request this answers.
    pub id: u64,
    pub outcome: Result<HookOutcome, SandboxError>,
}
