//! Components: the client-side view of one server-side component instance.
//!
//! A component root is an element carrying `raxm:id` and, until the runtime
//! boots it, `raxm:initial-data`:
//!
//! ```html
//! <div raxm:id="c1" raxm:initial-data='{"fingerprint": {...}, "serverMemo": {"data": {...}}}'>
//! ```
//!
//! `data` is the last state confirmed by the server. The server memo is opaque
//! and echoed back on every request. Deferred values are model updates the user
//! made but that haven't been sent yet; the UI reads them first so the visible
//! state stays optimistic.

use crate::dom::{Document, NodeId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Attribute marking a component root
pub const ID_ATTRIBUTE: &str = "raxm:id";

/// Attribute carrying the bootstrap payload
pub const INITIAL_DATA_ATTRIBUTE: &str = "raxm:initial-data";

/// Errors building a component from its root element.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComponentError {
    /// Root element lacks `raxm:id`
    #[error("Element {element} has no raxm:id attribute")]
    MissingId {
        /// Opening tag of the element
        element: String,
    },

    /// Root element lacks `raxm:initial-data`
    #[error("Component {id} has no raxm:initial-data attribute")]
    MissingInitialData {
        /// Component id
        id: String,
    },

    /// `raxm:initial-data` is not valid JSON of the expected shape
    #[error("Component {id} has invalid initial data: {reason}")]
    InvalidInitialData {
        /// Component id
        id: String,
        /// Parser message
        reason: String,
    },
}

/// Server-assigned component id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentId(String);

impl ComponentId {
    /// Wrap an id string
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies the server-side component class instance a root belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Component id (mirrors `raxm:id`)
    #[serde(default)]
    pub id: String,
    /// Component name, used in the endpoint path
    pub name: String,
    /// Locale the component was rendered in
    #[serde(default)]
    pub locale: String,
    /// Path of the page that rendered it
    #[serde(default)]
    pub path: String,
    /// HTTP method of that page request
    #[serde(default)]
    pub method: String,
    /// Route parameters
    #[serde(default)]
    pub params: Value,
}

/// Shape of `raxm:initial-data`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitialData {
    fingerprint: Fingerprint,
    #[serde(default)]
    server_memo: Map<String, Value>,
    #[serde(default)]
    effects: InitialEffects,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct InitialEffects {
    #[serde(default)]
    listeners: Vec<String>,
}

/// Client-side component state.
#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    id: ComponentId,
    root: NodeId,
    fingerprint: Fingerprint,
    data: Map<String, Value>,
    server_memo: Map<String, Value>,
    listeners: Vec<String>,
    deferred: BTreeMap<String, Value>,
}

impl Component {
    /// Build a component from its root element.
    ///
    /// # Errors
    ///
    /// Returns a [`ComponentError`] when the root attributes are missing or
    /// the bootstrap payload doesn't parse.
    pub fn from_root(document: &Document, root: NodeId) -> Result<Self, ComponentError> {
        let id = document
            .attribute(root, ID_ATTRIBUTE)
            .ok_or_else(|| ComponentError::MissingId {
                element: document.describe(root),
            })?
            .to_string();
        let raw = document
            .attribute(root, INITIAL_DATA_ATTRIBUTE)
            .ok_or_else(|| ComponentError::MissingInitialData { id: id.clone() })?;
        let initial: InitialData =
            serde_json::from_str(raw).map_err(|e| ComponentError::InvalidInitialData {
                id: id.clone(),
                reason: e.to_string(),
            })?;

        let mut server_memo = initial.server_memo;
        let data = match server_memo.remove("data") {
            Some(Value::Object(data)) => data,
            _ => Map::new(),
        };

        Ok(Self {
            id: ComponentId::new(id),
            root,
            fingerprint: initial.fingerprint,
            data,
            server_memo,
            listeners: initial.effects.listeners,
            deferred: BTreeMap::new(),
        })
    }

    /// Component id
    #[must_use]
    pub const fn id(&self) -> &ComponentId {
        &self.id
    }

    /// Root element handle
    #[must_use]
    pub const fn root(&self) -> NodeId {
        self.root
    }

    /// Component name from the fingerprint
    #[must_use]
    pub fn name(&self) -> &str {
        &self.fingerprint.name
    }

    /// Fingerprint
    #[must_use]
    pub const fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Last server-confirmed data
    #[must_use]
    pub const fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    /// Opaque memo (without `data`)
    #[must_use]
    pub const fn server_memo(&self) -> &Map<String, Value> {
        &self.server_memo
    }

    /// Events this component listens for
    #[must_use]
    pub fn listeners(&self) -> &[String] {
        &self.listeners
    }

    /// Whether the component listens for `event`
    #[must_use]
    pub fn listens_to(&self, event: &str) -> bool {
        self.listeners.iter().any(|l| l == event)
    }

    /// Server-confirmed value at a dotted path (`items.0.title`)
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.data.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Deferred value if one is pending, else the server value
    #[must_use]
    pub fn current_value(&self, path: &str) -> Option<&Value> {
        self.deferred.get(path).or_else(|| self.get(path))
    }

    /// Record a deferred (not yet sent) value
    pub fn set_deferred(&mut self, path: impl Into<String>, value: Value) {
        self.deferred.insert(path.into(), value);
    }

    /// Forget a deferred value once it has been sent
    pub fn clear_deferred(&mut self, path: &str) -> Option<Value> {
        self.deferred.remove(path)
    }

    /// Pending deferred values by path
    #[must_use]
    pub const fn deferred(&self) -> &BTreeMap<String, Value> {
        &self.deferred
    }

    /// New value for a checkbox bound to `path`.
    ///
    /// Array-valued properties get the checkbox's value added or removed;
    /// anything else is a plain boolean.
    #[must_use]
    pub fn checkbox_value(&self, path: &str, element_value: &str, checked: bool) -> Value {
        match self.current_value(path) {
            Some(Value::Array(items)) => {
                let mut items = items.clone();
                let present = items.iter().any(|i| value_matches(i, element_value));
                if checked && !present {
                    items.push(Value::String(element_value.to_string()));
                } else if !checked {
                    items.retain(|i| !value_matches(i, element_value));
                }
                Value::Array(items)
            },
            _ => Value::Bool(checked),
        }
    }

    /// Merge a response memo: keys replace, `data` merges key-wise.
    pub fn merge_server_memo(&mut self, mut memo: Map<String, Value>) {
        if let Some(Value::Object(data)) = memo.remove("data") {
            for (key, value) in data {
                self.data.insert(key, value);
            }
        }
        for (key, value) in memo {
            self.server_memo.insert(key, value);
        }
    }

    /// Memo to send with the next request (`data` folded back in)
    #[must_use]
    pub fn request_memo(&self) -> Map<String, Value> {
        let mut memo = self.server_memo.clone();
        memo.insert("data".to_string(), Value::Object(self.data.clone()));
        memo
    }
}

/// Loose equality between a data value and a DOM string value.
#[must_use]
pub fn value_matches(value: &Value, text: &str) -> bool {
    match value {
        Value::String(s) => s == text,
        Value::Number(n) => n.to_string() == text,
        Value::Bool(b) => b.to_string() == text,
        Value::Null => text.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn component(data: &Value) -> Component {
        let payload = json!({
            "fingerprint": {"id": "c1", "name": "todo-list", "locale": "en", "path": "/", "method": "GET"},
            "serverMemo": {"checksum": "abc", "data": data},
            "effects": {"listeners": ["saved"]}
        });
        let mut doc = Document::new();
        let root = doc.create_element("div");
        doc.set_attribute(root, ID_ATTRIBUTE, "c1").unwrap();
        doc.set_attribute(root, INITIAL_DATA_ATTRIBUTE, &payload.to_string())
            .unwrap();
        Component::from_root(&doc, root).unwrap()
    }

    #[test]
    fn test_from_root_splits_data_from_memo() {
        let c = component(&json!({"title": "x"}));
        assert_eq!(c.id().as_str(), "c1");
        assert_eq!(c.name(), "todo-list");
        assert_eq!(c.get("title"), Some(&json!("x")));
        assert!(c.server_memo().get("data").is_none());
        assert_eq!(c.server_memo().get("checksum"), Some(&json!("abc")));
        assert!(c.listens_to("saved"));
    }

    #[test]
    fn test_missing_and_invalid_initial_data() {
        let mut doc = Document::new();
        let root = doc.create_element("div");
        assert!(matches!(
            Component::from_root(&doc, root),
            Err(ComponentError::MissingId { .. })
        ));
        doc.set_attribute(root, ID_ATTRIBUTE, "c9").unwrap();
        assert_eq!(
            Component::from_root(&doc, root),
            Err(ComponentError::MissingInitialData { id: "c9".into() })
        );
        doc.set_attribute(root, INITIAL_DATA_ATTRIBUTE, "{nope").unwrap();
        assert!(matches!(
            Component::from_root(&doc, root),
            Err(ComponentError::InvalidInitialData { .. })
        ));
    }

    #[test]
    fn test_dotted_paths() {
        let c = component(&json!({"items": [{"title": "a"}], "user": {"name": "n"}}));
        assert_eq!(c.get("items.0.title"), Some(&json!("a")));
        assert_eq!(c.get("user.name"), Some(&json!("n")));
        assert_eq!(c.get("items.7"), None);
        assert_eq!(c.get("user.name.first"), None);
    }

    #[test]
    fn test_deferred_values_shadow_data() {
        let mut c = component(&json!({"title": "server"}));
        c.set_deferred("title", json!("draft"));
        assert_eq!(c.current_value("title"), Some(&json!("draft")));
        assert_eq!(c.clear_deferred("title"), Some(json!("draft")));
        assert_eq!(c.current_value("title"), Some(&json!("server")));
    }

    #[test]
    fn test_checkbox_array_merge() {
        let mut c = component(&json!({"tags": ["a"], "agree": false}));
        assert_eq!(c.checkbox_value("tags", "b", true), json!(["a", "b"]));
        assert_eq!(c.checkbox_value("tags", "a", true), json!(["a"]));
        assert_eq!(c.checkbox_value("tags", "a", false), json!([]));
        assert_eq!(c.checkbox_value("agree", "on", true), json!(true));

        // Merges build on the optimistic (deferred) value.
        c.set_deferred("tags", json!(["a", "b"]));
        assert_eq!(c.checkbox_value("tags", "c", true), json!(["a", "b", "c"]));
    }

    #[test]
    fn test_memo_merge_and_request_memo() {
        let mut c = component(&json!({"title": "x", "count": 1}));
        let mut memo = Map::new();
        memo.insert("checksum".into(), json!("def"));
        memo.insert("data".into(), json!({"count": 2}));
        c.merge_server_memo(memo);
        assert_eq!(c.get("count"), Some(&json!(2)));
        assert_eq!(c.get("title"), Some(&json!("x")));
        let sent = c.request_memo();
        assert_eq!(sent["checksum"], json!("def"));
        assert_eq!(sent["data"], json!({"title": "x", "count": 2}));
    }

    #[test]
    fn test_value_matches() {
        assert!(value_matches(&json!(3), "3"));
        assert!(value_matches(&json!("a"), "a"));
        assert!(!value_matches(&json!([1]), "1"));
    }
}
