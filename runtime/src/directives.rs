//! Built-in directive behaviors.
//!
//! Everything here is synchronous and works on one element at a time: what a
//! DOM event means for a `raxm:model` or `raxm:{event}` element, and how
//! `raxm:loading` / `raxm:dirty` elements show their state. The page reducer
//! decides when to call these.

use crate::queue::Timing;
use raxm_core::action::Action;
use raxm_core::component::{Component, value_matches};
use raxm_core::directive::{Directive, DirectiveKind, Directives};
use raxm_core::dom::{Document, DomError, NodeId};
use raxm_core::message::Message;
use serde_json::Value;
use std::time::Duration;

/// Attribute toggled by visibility-style loading/dirty directives
pub const HIDDEN: &str = "hidden";

/// Prompt shown by a bare `raxm:confirm`
pub const DEFAULT_CONFIRM: &str = "Are you sure?";

/// Modifiers that never name a key
const NON_KEY_MODIFIERS: &[&str] = &["prevent", "stop", "self", "debounce", "lazy", "defer", "once", "window"];

/// A DOM event as the host reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomEvent {
    /// Event type (`click`, `input`, ...)
    pub name: String,
    /// Key for keyboard events (`Enter`, `a`)
    pub key: Option<String>,
    /// Control value after the event, for `input`/`change`
    pub value: Option<String>,
    /// Checked state after the event, for checkboxes and radios
    pub checked: Option<bool>,
}

impl DomEvent {
    /// An event with no payload
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: None,
            value: None,
            checked: None,
        }
    }

    /// `click`
    #[must_use]
    pub fn click() -> Self {
        Self::new("click")
    }

    /// `submit`
    #[must_use]
    pub fn submit() -> Self {
        Self::new("submit")
    }

    /// `input` after the user typed `value`
    #[must_use]
    pub fn input(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            ..Self::new("input")
        }
    }

    /// `change` of a text control or select to `value`
    #[must_use]
    pub fn change(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            ..Self::new("change")
        }
    }

    /// `change` of a checkbox or radio
    #[must_use]
    pub fn change_checked(checked: bool) -> Self {
        Self {
            checked: Some(checked),
            ..Self::new("change")
        }
    }

    /// `keydown` of `key`
    #[must_use]
    pub fn keydown(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::new("keydown")
        }
    }

    /// `keyup` of `key`
    #[must_use]
    pub fn keyup(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::new("keyup")
        }
    }

    /// `focus`
    #[must_use]
    pub fn focus() -> Self {
        Self::new("focus")
    }

    /// `blur`
    #[must_use]
    pub fn blur() -> Self {
        Self::new("blur")
    }
}

/// What an event directive asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    /// Queue an action on the owning component
    Action(Action, Timing),
    /// Deliver an event to listening components (`$emit`)
    Emit {
        /// Event name
        event: String,
        /// Event arguments
        params: Vec<Value>,
    },
}

/// Value a model-bound control currently represents.
///
/// Checkboxes yield a boolean, or the merged array when the property is an
/// array. An unchecked radio yields nothing.
#[must_use]
pub fn model_value(document: &Document, node: NodeId, component: &Component, path: &str) -> Option<Value> {
    let element = document.element(node)?;
    match element.input_type().as_deref() {
        Some("checkbox") => {
            let value = element.attribute("value").unwrap_or("on");
            Some(component.checkbox_value(path, value, document.checked(node)))
        },
        Some("radio") => document
            .checked(node)
            .then(|| document.value(node).map(Value::String))
            .flatten(),
        _ => document.value(node).map(Value::String),
    }
}

/// Write the component's value for `path` into a `raxm:model` control.
///
/// Checkboxes are checked when the value is `true` or, for array
/// properties, contains the checkbox's value. Radios are checked when the
/// value equals theirs. Other controls take the value as text. A missing
/// property, or one that cannot be shown as text, leaves the control alone.
///
/// # Errors
///
/// Returns [`DomError`] if `node` is no longer an element.
pub fn sync_model_control(document: &mut Document, node: NodeId, component: &Component, path: &str) -> Result<bool, DomError> {
    let Some(current) = component.current_value(path) else {
        return Ok(false);
    };
    let Some(element) = document.element(node) else {
        return Err(if document.contains(node) {
            DomError::NotAnElement(node)
        } else {
            DomError::Stale(node)
        });
    };
    let own_value = element.attribute("value").map(str::to_string);
    match element.input_type().as_deref() {
        Some("checkbox") => {
            let checked = match current {
                Value::Array(items) => {
                    let own = own_value.as_deref().unwrap_or("on");
                    items.iter().any(|i| value_matches(i, own))
                },
                Value::Bool(b) => *b,
                _ => return Ok(false),
            };
            document.set_checked(node, checked)
        },
        Some("radio") => {
            let checked = value_matches(current, own_value.as_deref().unwrap_or("on"));
            document.set_checked(node, checked)
        },
        _ => {
            let text = match current {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                Value::Array(_) | Value::Object(_) => return Ok(false),
            };
            document.set_value(node, &text)
        },
    }
}

/// The model update `event` raises on a `raxm:model` control, if any.
///
/// Checkboxes, radios, selects and `.lazy` bindings update on `change`
/// immediately. Text controls update on `input`, debounced by the
/// directive's duration modifier or `default_debounce`. `.defer` holds the
/// update for the component's next flush.
#[must_use]
pub fn model_update(
    document: &Document,
    node: NodeId,
    directive: &Directive,
    component: &Component,
    event: &DomEvent,
    default_debounce: Duration,
) -> Option<(Action, Timing)> {
    let element = document.element(node)?;
    let checkable = matches!(element.input_type().as_deref(), Some("checkbox" | "radio"));
    let on_change = checkable || element.tag() == "select" || directive.has_modifier("lazy");
    let trigger = if on_change { "change" } else { "input" };
    if event.name != trigger {
        return None;
    }

    let path = directive.value.as_str();
    let value = model_value(document, node, component, path)?;
    if directive.has_modifier("defer") {
        let action = Action::deferred_sync_input(path, value).from_element(node);
        return Some((action, Timing::Defer));
    }
    let timing = if on_change {
        Timing::Immediate
    } else {
        Timing::Debounce(directive.duration_modifier().unwrap_or(default_debounce))
    };
    Some((Action::sync_input(path, value).from_element(node), timing))
}

/// What an event directive on `origin` does, including the magic
/// `$set`, `$toggle` and `$emit` methods.
#[must_use]
pub fn event_invocation(
    directive: &Directive,
    component: &Component,
    origin: NodeId,
    default_debounce: Duration,
) -> Option<Invocation> {
    let params = &directive.params;
    let action = match directive.value.as_str() {
        "" => return None,
        "$set" => {
            let name = params.first()?.as_str()?;
            Action::sync_input(name, params.get(1).cloned().unwrap_or(Value::Null))
        },
        "$toggle" => {
            let name = params.first()?.as_str()?;
            let current = component.current_value(name).and_then(Value::as_bool).unwrap_or(false);
            Action::sync_input(name, Value::Bool(!current))
        },
        "$emit" => {
            let event = params.first()?.as_str()?.to_string();
            return Some(Invocation::Emit {
                event,
                params: params.iter().skip(1).cloned().collect(),
            });
        },
        method => Action::call_method(method, params.clone()),
    };
    let timing = if directive.has_modifier("debounce") {
        Timing::Debounce(directive.duration_modifier().unwrap_or(default_debounce))
    } else {
        Timing::Immediate
    };
    Some(Invocation::Action(action.from_element(origin), timing))
}

fn normalize_key(key: &str) -> String {
    match key {
        " " => "space".to_string(),
        "Esc" => "escape".to_string(),
        other => other.replace('-', "").to_ascii_lowercase(),
    }
}

/// Whether a keyboard event passes the directive's key modifiers.
///
/// `raxm:keydown.enter` matches `Enter`; `raxm:keyup.page-down` matches
/// `PageDown`. Without key modifiers every key matches.
#[must_use]
pub fn key_matches(directive: &Directive, key: Option<&str>) -> bool {
    let wanted: Vec<String> = directive
        .modifiers
        .iter()
        .filter(|m| !NON_KEY_MODIFIERS.contains(&m.as_str()))
        .filter(|m| raxm_core::directive::parse_duration(m).is_none())
        .map(|m| normalize_key(m))
        .collect();
    if wanted.is_empty() {
        return true;
    }
    key.map(normalize_key).is_some_and(|pressed| wanted.contains(&pressed))
}

/// Targets listed by `raxm:target`, comma separated
#[must_use]
pub fn targets(directives: &Directives) -> Vec<String> {
    directives
        .get(DirectiveKind::Target)
        .map(|t| {
            t.value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Show or hide a state directive's effect on its element.
///
/// - `.class`: add the listed classes while active (`.class.remove`: remove them)
/// - `.attr`: set the named attribute while active (`.attr.remove`: remove it)
/// - otherwise visible only while active (`.remove`: hidden while active)
fn toggle(document: &mut Document, node: NodeId, directive: &Directive, active: bool) -> Result<bool, DomError> {
    let inverted = directive.has_modifier("remove");
    let on = active != inverted;
    if directive.has_modifier("class") {
        if on {
            document.add_class(node, &directive.value)
        } else {
            document.remove_class(node, &directive.value)
        }
    } else if directive.has_modifier("attr") {
        if on {
            document.set_attribute(node, &directive.value, "")
        } else {
            document.remove_attribute(node, &directive.value)
        }
    } else if on {
        document.remove_attribute(node, HIDDEN)
    } else {
        document.set_attribute(node, HIDDEN, "")
    }
}

/// Apply `raxm:loading` on `node` for the component's message in flight.
///
/// `.self` only reacts to actions the element raised itself.
///
/// # Errors
///
/// Returns [`DomError`] if `node` is no longer an element.
pub fn apply_loading(
    document: &mut Document,
    node: NodeId,
    directives: &Directives,
    in_flight: Option<&Message>,
) -> Result<bool, DomError> {
    let Some(loading) = directives.get(DirectiveKind::Loading) else {
        return Ok(false);
    };
    let targets = targets(directives);
    let active = in_flight.is_some_and(|m| {
        if loading.has_modifier("self") {
            m.raised_by(node)
        } else {
            targets.is_empty() || targets.iter().any(|t| m.concerns(t))
        }
    });
    toggle(document, node, loading, active)
}

/// Properties a `raxm:dirty` element watches: its targets, else its own model
#[must_use]
pub fn dirty_properties(directives: &Directives) -> Vec<String> {
    let listed = targets(directives);
    if !listed.is_empty() {
        return listed;
    }
    directives
        .get(DirectiveKind::Model)
        .map(|m| vec![m.value.clone()])
        .unwrap_or_default()
}

/// Whether a control's value matches the server's
#[must_use]
pub fn same_value(local: &Value, server: Option<&Value>) -> bool {
    match (local, server) {
        (Value::String(text), Some(server)) => value_matches(server, text),
        (Value::String(text), None) => text.is_empty(),
        (local, Some(server)) => local == server,
        (_, None) => false,
    }
}

/// Apply `raxm:dirty` on `node`
///
/// # Errors
///
/// Returns [`DomError`] if `node` is no longer an element.
pub fn apply_dirty(document: &mut Document, node: NodeId, directives: &Directives, dirty: bool) -> Result<bool, DomError> {
    match directives.get(DirectiveKind::Dirty) {
        Some(directive) => toggle(document, node, directive, dirty),
        None => Ok(false),
    }
}
