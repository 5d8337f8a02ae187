//! Actions: pending server calls raised by directives.
//!
//! An [`Action`] is what the commit queue buffers; an [`Update`] is what goes
//! on the wire. Deferred model updates are a queue-side concept only and are
//! sent as plain `syncInput` updates.

use crate::dom::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What an action asks the server to do.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionKind {
    /// Call a public method on the component
    CallMethod {
        /// Method name
        method: String,
        /// Arguments
        params: Vec<Value>,
    },

    /// Set a data property (model binding)
    SyncInput {
        /// Dotted property path
        name: String,
        /// New value
        value: Value,
    },

    /// Set a data property on the next non-deferred flush
    DeferredSyncInput {
        /// Dotted property path
        name: String,
        /// New value
        value: Value,
    },

    /// Deliver an event to a listening component
    FireEvent {
        /// Event name
        event: String,
        /// Event arguments
        params: Vec<Value>,
    },
}

/// One pending server call, immutable once enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    /// What to do
    pub kind: ActionKind,
    /// Element that raised the action. Only used to resolve UI feedback
    /// targets; the handle goes stale when the element is removed.
    pub origin: Option<NodeId>,
    /// Ask the server not to run property watchers for this update
    pub skip_watcher: bool,
}

impl Action {
    const fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            origin: None,
            skip_watcher: false,
        }
    }

    /// `callMethod` action
    #[must_use]
    pub fn call_method(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self::new(ActionKind::CallMethod {
            method: method.into(),
            params,
        })
    }

    /// `syncInput` action
    #[must_use]
    pub fn sync_input(name: impl Into<String>, value: Value) -> Self {
        Self::new(ActionKind::SyncInput {
            name: name.into(),
            value,
        })
    }

    /// Deferred `syncInput` action
    #[must_use]
    pub fn deferred_sync_input(name: impl Into<String>, value: Value) -> Self {
        Self::new(ActionKind::DeferredSyncInput {
            name: name.into(),
            value,
        })
    }

    /// `fireEvent` action
    #[must_use]
    pub fn fire_event(event: impl Into<String>, params: Vec<Value>) -> Self {
        Self::new(ActionKind::FireEvent {
            event: event.into(),
            params,
        })
    }

    /// Tag the originating element
    #[must_use]
    pub fn from_element(mut self, node: NodeId) -> Self {
        self.origin = Some(node);
        self
    }

    /// Set the skip-watcher flag
    #[must_use]
    pub fn skipping_watcher(mut self) -> Self {
        self.skip_watcher = true;
        self
    }

    /// Whether this is a deferred model update
    #[must_use]
    pub const fn is_deferred(&self) -> bool {
        matches!(self.kind, ActionKind::DeferredSyncInput { .. })
    }

    /// Property path for model updates
    #[must_use]
    pub fn property(&self) -> Option<&str> {
        match &self.kind {
            ActionKind::SyncInput { name, .. } | ActionKind::DeferredSyncInput { name, .. } => {
                Some(name)
            },
            _ => None,
        }
    }

    /// Method name for method calls
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match &self.kind {
            ActionKind::CallMethod { method, .. } => Some(method),
            _ => None,
        }
    }

    /// Model value for model updates
    #[must_use]
    pub const fn model_value(&self) -> Option<&Value> {
        match &self.kind {
            ActionKind::SyncInput { value, .. } | ActionKind::DeferredSyncInput { value, .. } => {
                Some(value)
            },
            _ => None,
        }
    }

    /// Wire representation
    #[must_use]
    pub fn to_update(&self) -> Update {
        match &self.kind {
            ActionKind::CallMethod { method, params } => Update::CallMethod {
                method: method.clone(),
                params: params.clone(),
            },
            ActionKind::SyncInput { name, value }
            | ActionKind::DeferredSyncInput { name, value } => Update::SyncInput {
                name: name.clone(),
                value: value.clone(),
                skip_watcher: self.skip_watcher,
            },
            ActionKind::FireEvent { event, params } => Update::FireEvent {
                event: event.clone(),
                params: params.clone(),
            },
        }
    }
}

/// One entry of the request's `updates` array: `{type, payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Update {
    /// `{"type": "callMethod", "payload": {"method", "params"}}`
    CallMethod {
        /// Method name
        method: String,
        /// Arguments
        params: Vec<Value>,
    },

    /// `{"type": "syncInput", "payload": {"name", "value"}}`
    SyncInput {
        /// Dotted property path
        name: String,
        /// New value
        value: Value,
        /// Present (and true) only when watchers should be skipped
        #[serde(rename = "skipWatcher", default, skip_serializing_if = "std::ops::Not::not")]
        skip_watcher: bool,
    },

    /// `{"type": "fireEvent", "payload": {"event", "params"}}`
    FireEvent {
        /// Event name
        event: String,
        /// Event arguments
        params: Vec<Value>,
    },
}
