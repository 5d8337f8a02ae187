//! Request/response wire types and the in-flight message.

use crate::action::{Action, ActionKind, Update};
use crate::component::{Component, ComponentId, Fingerprint};
use crate::dom::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Monotonic per-page message number, for logs and correlation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg-{}", self.0)
    }
}

/// One batched round trip for one component.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Message number
    pub id: MessageId,
    /// Target component
    pub component: ComponentId,
    /// Actions in send order
    pub actions: Vec<Action>,
}

impl Message {
    /// Build the request body for `component`
    #[must_use]
    pub fn payload(&self, component: &Component) -> RequestPayload {
        RequestPayload {
            fingerprint: component.fingerprint().clone(),
            server_memo: component.request_memo(),
            updates: self.actions.iter().map(Action::to_update).collect(),
        }
    }

    /// Method names called by this message
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.actions.iter().filter_map(Action::method)
    }

    /// Property paths updated by this message
    pub fn properties(&self) -> impl Iterator<Item = &str> {
        self.actions.iter().filter_map(Action::property)
    }

    /// Whether any action was raised by `element`
    #[must_use]
    pub fn raised_by(&self, element: NodeId) -> bool {
        self.actions.iter().any(|action| action.origin == Some(element))
    }

    /// Whether any action calls `method` or updates `property` named `target`.
    ///
    /// A call target of `save` also matches `save(1)`-style targets written
    /// with parameters, which compare on the method name.
    #[must_use]
    pub fn concerns(&self, target: &str) -> bool {
        let name = target.split('(').next().unwrap_or(target).trim();
        self.actions.iter().any(|action| match &action.kind {
            ActionKind::CallMethod { method, .. } => method == name,
            ActionKind::SyncInput { name: prop, .. }
            | ActionKind::DeferredSyncInput { name: prop, .. } => {
                prop == name || prop.starts_with(&format!("{name}."))
            },
            ActionKind::FireEvent { .. } => false,
        })
    }
}

/// `POST {baseUrl}/raxm/update/{componentName}` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    /// Component fingerprint
    pub fingerprint: Fingerprint,
    /// Memo echoed back verbatim (with current data)
    pub server_memo: Map<String, Value>,
    /// Batched updates
    pub updates: Vec<Update>,
}

/// Successful response body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    /// Client-side effects to apply
    #[serde(default)]
    pub effects: ResponseEffects,
    /// Memo changes to merge
    #[serde(default)]
    pub server_memo: Map<String, Value>,
}

/// `effects` object of a successful response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseEffects {
    /// Freshly rendered component root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    /// Properties the server changed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dirty: Vec<String>,
    /// Events to re-dispatch to listening components
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emits: Vec<Emit>,
    /// Navigate away instead of patching
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
}

/// A server-emitted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Emit {
    /// Event name
    pub event: String,
    /// Event arguments
    #[serde(default)]
    pub params: Vec<Value>,
    /// Only deliver to components with this name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Only deliver to the emitting component
    #[serde(default, rename = "selfOnly", skip_serializing_if = "std::ops::Not::not")]
    pub self_only: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(actions: Vec<Action>) -> Message {
        Message {
            id: MessageId(1),
            component: ComponentId::new("c1"),
            actions,
        }
    }

    #[test]
    fn test_concerns_matches_methods_and_properties() {
        let msg = message(vec![
            Action::call_method("save", vec![json!(1)]),
            Action::sync_input("form.title", json!("x")),
        ]);
        assert!(msg.concerns("save"));
        assert!(msg.concerns("save(2)"));
        assert!(msg.concerns("form"));
        assert!(msg.concerns("form.title"));
        assert!(!msg.concerns("delete"));
        assert!(!msg.concerns("formal"));
        assert_eq!(msg.methods().collect::<Vec<_>>(), vec!["save"]);
        assert_eq!(msg.properties().collect::<Vec<_>>(), vec!["form.title"]);
    }

    #[test]
    fn test_raised_by_compares_origin() {
        let doc = crate::dom::Document::parse("<button></button><a></a>");
        let top = doc.children(doc.root());
        let msg = message(vec![
            Action::call_method("save", vec![]).from_element(top[0]),
            Action::call_method("load", vec![]),
        ]);
        assert!(msg.raised_by(top[0]));
        assert!(!msg.raised_by(top[1]));
    }

    #[test]
    fn test_response_defaults() {
        let parsed: ResponsePayload = serde_json::from_value(json!({
            "effects": {"html": "<div></div>", "emits": [{"event": "saved"}]},
            "serverMemo": {"checksum": "x"}
        }))
        .unwrap();
        assert_eq!(parsed.effects.html.as_deref(), Some("<div></div>"));
        assert_eq!(parsed.effects.emits[0].event, "saved");
        assert!(parsed.effects.emits[0].params.is_empty());
        assert!(parsed.effects.redirect.is_none());

        let empty: ResponsePayload = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, ResponsePayload::default());
    }
}
