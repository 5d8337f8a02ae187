//! `raxm:*` directive parsing and the directive registry.
//!
//! A directive is an attribute of the form `raxm:{name}{.modifier}*="expression"`:
//!
//! ```text
//! raxm:model.debounce.500ms="search"
//! raxm:click="addTodo('buy milk', 2)"
//! raxm:loading.class="opacity-50"
//! ```
//!
//! The registry maps directive names to a [`DirectiveKind`] once, at scan
//! time. Handlers match on the kind; nothing downstream compares attribute
//! strings again. Names the registry doesn't know are skipped so newer
//! templates keep rendering against an older runtime.

use crate::dom::{Document, NodeId};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Attribute prefix shared by all directives
pub const PREFIX: &str = "raxm:";

/// DOM event names bound through `raxm:{event}` directives
pub const EVENT_NAMES: &[&str] = &[
    "click", "submit", "change", "input", "keydown", "keyup", "blur", "focus",
];

/// Errors parsing a directive expression.
///
/// These are never fatal: the offending directive is skipped with a warning
/// and the rest of the element keeps working.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectiveParseError {
    /// Parentheses don't balance
    #[error("Unbalanced parentheses in expression `{expression}`")]
    Unbalanced {
        /// The raw expression
        expression: String,
    },

    /// A string literal is never closed
    #[error("Unterminated string literal in expression `{expression}`")]
    UnterminatedString {
        /// The raw expression
        expression: String,
    },

    /// `(args)` with nothing in front of it
    #[error("Missing method name in expression `{expression}`")]
    EmptyMethod {
        /// The raw expression
        expression: String,
    },

    /// Input remains after the closing parenthesis
    #[error("Unexpected input after call in expression `{expression}`")]
    TrailingInput {
        /// The raw expression
        expression: String,
    },
}

/// What a directive does; resolved once per scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirectiveKind {
    /// Two-way binding of a form control to a data property
    Model,
    /// Method called once when the component initializes
    Init,
    /// Visual state while a request is in flight
    Loading,
    /// Restricts `loading`/`dirty` to specific actions or properties
    Target,
    /// Asks the user before running the element's action
    Confirm,
    /// Visual state while bound values differ from server data
    Dirty,
    /// Client-side navigation with a page snapshot
    Navigate,
    /// Subtree (or, with `.self`, the element) excluded from patching
    Ignore,
    /// Identity for keyed list reconciliation
    Key,
    /// Component root marker
    Id,
    /// Component bootstrap payload
    InitialData,
    /// DOM event listener (`click`, `submit`, ...)
    Event,
}

impl DirectiveKind {
    /// Whether the expression is a method call (`save(1)`)
    #[must_use]
    pub const fn is_call(self) -> bool {
        matches!(self, Self::Event | Self::Init)
    }
}

/// One parsed directive on one element.
#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    /// Resolved kind
    pub kind: DirectiveKind,
    /// Directive name without prefix or modifiers (`model`, `click`)
    pub name: String,
    /// Method or property name the directive refers to
    pub value: String,
    /// Raw attribute value
    pub expression: String,
    /// Dot-suffixes in source order (`["debounce", "500ms"]`)
    pub modifiers: Vec<String>,
    /// Call arguments, for call expressions
    pub params: Vec<Value>,
}

impl Directive {
    /// Parse one attribute. `Ok(None)` when the attribute isn't a directive
    /// or the name isn't registered.
    ///
    /// # Errors
    ///
    /// Returns a [`DirectiveParseError`] for malformed call expressions.
    pub fn parse(
        registry: &DirectiveRegistry,
        attribute: &str,
        expression: &str,
    ) -> Result<Option<Self>, DirectiveParseError> {
        let Some(rest) = attribute.strip_prefix(PREFIX) else {
            return Ok(None);
        };
        let mut parts = rest.split('.');
        let name = parts.next().unwrap_or_default();
        let Some(kind) = registry.kind(name) else {
            tracing::trace!(directive = name, "Ignoring unregistered directive");
            return Ok(None);
        };
        let modifiers = parts.map(str::to_string).collect();

        let (value, params) = if kind.is_call() {
            let call = parse_call_expression(expression)?;
            (call.method, call.params)
        } else {
            (expression.trim().to_string(), Vec::new())
        };

        Ok(Some(Self {
            kind,
            name: name.to_string(),
            value,
            expression: expression.to_string(),
            modifiers,
            params,
        }))
    }

    /// Whether modifier `name` is present
    #[must_use]
    pub fn has_modifier(&self, name: &str) -> bool {
        self.modifiers.iter().any(|m| m == name)
    }

    /// The modifier following `name` (`debounce.500ms` → `500ms`)
    #[must_use]
    pub fn modifier_after(&self, name: &str) -> Option<&str> {
        let index = self.modifiers.iter().position(|m| m == name)?;
        self.modifiers.get(index + 1).map(String::as_str)
    }

    /// First modifier that reads as a duration (`500ms`, `2s`, `750`)
    #[must_use]
    pub fn duration_modifier(&self) -> Option<Duration> {
        self.modifiers.iter().find_map(|m| parse_duration(m))
    }

    /// The full attribute name this directive was parsed from
    #[must_use]
    pub fn attribute_name(&self) -> String {
        let mut name = format!("{PREFIX}{}", self.name);
        for modifier in &self.modifiers {
            name.push('.');
            name.push_str(modifier);
        }
        name
    }
}

/// Parse `500ms`, `2s` or a bare millisecond count.
#[must_use]
pub fn parse_duration(text: &str) -> Option<Duration> {
    if let Some(ms) = text.strip_suffix("ms") {
        return ms.parse().ok().map(Duration::from_millis);
    }
    if let Some(secs) = text.strip_suffix('s') {
        return secs.parse().ok().map(Duration::from_secs);
    }
    if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) {
        return text.parse().ok().map(Duration::from_millis);
    }
    None
}

/// All directives found on one element, in attribute order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Directives(Vec<Directive>);

impl Directives {
    /// First directive of `kind`
    #[must_use]
    pub fn get(&self, kind: DirectiveKind) -> Option<&Directive> {
        self.0.iter().find(|d| d.kind == kind)
    }

    /// Whether any directive of `kind` is present
    #[must_use]
    pub fn has(&self, kind: DirectiveKind) -> bool {
        self.get(kind).is_some()
    }

    /// Event directive for `event`
    #[must_use]
    pub fn event(&self, event: &str) -> Option<&Directive> {
        self.0
            .iter()
            .find(|d| d.kind == DirectiveKind::Event && d.name == event)
    }

    /// Iterate in attribute order
    pub fn iter(&self) -> std::slice::Iter<'_, Directive> {
        self.0.iter()
    }

    /// Number of directives
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the element carries no directives
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a Directives {
    type Item = &'a Directive;
    type IntoIter = std::slice::Iter<'a, Directive>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Maps directive names to kinds.
#[derive(Debug, Clone, Default)]
pub struct DirectiveRegistry {
    kinds: HashMap<String, DirectiveKind>,
}

impl DirectiveRegistry {
    /// An empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in directive
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for (name, kind) in [
            ("model", DirectiveKind::Model),
            ("init", DirectiveKind::Init),
            ("loading", DirectiveKind::Loading),
            ("target", DirectiveKind::Target),
            ("confirm", DirectiveKind::Confirm),
            ("dirty", DirectiveKind::Dirty),
            ("navigate", DirectiveKind::Navigate),
            ("ignore", DirectiveKind::Ignore),
            ("key", DirectiveKind::Key),
            ("id", DirectiveKind::Id),
            ("initial-data", DirectiveKind::InitialData),
        ] {
            registry.register(name, kind);
        }
        for event in EVENT_NAMES {
            registry.register(*event, DirectiveKind::Event);
        }
        registry
    }

    /// Register `name`; returns the kind it previously mapped to
    pub fn register(&mut self, name: impl Into<String>, kind: DirectiveKind) -> Option<DirectiveKind> {
        self.kinds.insert(name.into(), kind)
    }

    /// Kind registered for `name`
    #[must_use]
    pub fn kind(&self, name: &str) -> Option<DirectiveKind> {
        self.kinds.get(name).copied()
    }

    /// Parse every directive on `node`.
    ///
    /// Malformed expressions are logged and skipped; the remaining
    /// directives are still returned.
    #[must_use]
    pub fn resolve(&self, document: &Document, node: NodeId) -> Directives {
        let mut found = Vec::new();
        for attr in document.attributes(node) {
            match Directive::parse(self, &attr.name, &attr.value) {
                Ok(Some(directive)) => found.push(directive),
                Ok(None) => {},
                Err(error) => {
                    tracing::warn!(
                        element = %document.describe(node),
                        attribute = %attr.name,
                        %error,
                        "Skipping malformed directive"
                    );
                },
            }
        }
        Directives(found)
    }
}

/// A parsed `method(arg, ...)` expression
#[derive(Debug, Clone, PartialEq)]
pub struct CallExpression {
    /// Method name
    pub method: String,
    /// Arguments as JSON values
    pub params: Vec<Value>,
}

/// Parse `method(args)` by locating balanced parentheses.
///
/// Arguments are JSON literals where possible; single-quoted strings become
/// strings; anything else (`$event`, bare identifiers) is kept as raw text.
///
/// # Errors
///
/// See [`DirectiveParseError`].
pub fn parse_call_expression(expression: &str) -> Result<CallExpression, DirectiveParseError> {
    let trimmed = expression.trim();
    let Some(open) = trimmed.find('(') else {
        if trimmed.contains(')') {
            return Err(DirectiveParseError::Unbalanced {
                expression: expression.to_string(),
            });
        }
        return Ok(CallExpression {
            method: trimmed.to_string(),
            params: Vec::new(),
        });
    };

    let method = trimmed[..open].trim();
    if method.is_empty() {
        return Err(DirectiveParseError::EmptyMethod {
            expression: expression.to_string(),
        });
    }

    let close = find_matching_paren(trimmed, open, expression)?;
    if !trimmed[close + 1..].trim().is_empty() {
        return Err(DirectiveParseError::TrailingInput {
            expression: expression.to_string(),
        });
    }

    let params = split_top_level(&trimmed[open + 1..close])
        .into_iter()
        .map(str::trim)
        .filter(|arg| !arg.is_empty())
        .map(parse_argument)
        .collect();

    Ok(CallExpression {
        method: method.to_string(),
        params,
    })
}

fn find_matching_paren(
    text: &str,
    open: usize,
    expression: &str,
) -> Result<usize, DirectiveParseError> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in text.char_indices().skip_while(|&(i, _)| i < open) {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(i);
                }
            },
            _ => {},
        }
    }
    if quote.is_some() {
        return Err(DirectiveParseError::UnterminatedString {
            expression: expression.to_string(),
        });
    }
    Err(DirectiveParseError::Unbalanced {
        expression: expression.to_string(),
    })
}

fn split_top_level(args: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in args.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&args[start..i]);
                start = i + 1;
            },
            _ => {},
        }
    }
    parts.push(&args[start..]);
    parts
}

fn parse_argument(arg: &str) -> Value {
    if let Some(inner) = arg
        .strip_prefix('\'')
        .and_then(|a| a.strip_suffix('\''))
    {
        return Value::String(inner.replace("\\'", "'"));
    }
    serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.to_string()))
}
