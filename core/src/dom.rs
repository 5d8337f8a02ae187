//! Arena-backed DOM model.
//!
//! Nodes live in a [`SlotMap`] and are addressed by generational [`NodeId`]
//! handles. Removing a node frees its slot, so every handle that pointed at it
//! stops resolving. The runtime relies on that for its "weak" references:
//! an action remembers the element that raised it, and a late response checks
//! whether its component root still exists before touching anything.
//!
//! Every effective change (structure, attribute, text, live value) bumps
//! [`Document::mutation_count`]. Writes that would leave the node unchanged are
//! skipped and do not count, which is what makes repeated patches cheap to
//! verify.

use slotmap::{SlotMap, new_key_type};
use thiserror::Error;

new_key_type! {
    /// Generational handle to a node in a [`Document`].
    pub struct NodeId;
}

/// Errors raised by structural DOM operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomError {
    /// The handle no longer resolves (node removed)
    #[error("Node {0:?} no longer exists")]
    Stale(NodeId),

    /// Operation requires an element node
    #[error("Node {0:?} is not an element")]
    NotAnElement(NodeId),

    /// Insertion would create a cycle or attach under a leaf node
    #[error("Cannot insert {child:?} under {parent:?}")]
    HierarchyRequest {
        /// Intended parent
        parent: NodeId,
        /// Node being inserted
        child: NodeId,
    },

    /// An element carrying directives has no enclosing component root
    #[error("Element {element} is not inside a component root (missing raxm:id ancestor)")]
    MissingComponent {
        /// Opening tag of the offending element
        element: String,
    },
}

/// A single `name="value"` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Attribute name, as written (case preserved for `raxm:` directives)
    pub name: String,
    /// Attribute value (empty for boolean attributes)
    pub value: String,
}

/// Element payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    tag: String,
    attributes: Vec<Attribute>,
    value: Option<String>,
    checked: Option<bool>,
}

impl Element {
    fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            attributes: Vec::new(),
            value: None,
            checked: None,
        }
    }

    /// Lowercase tag name
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Attributes in document order
    #[must_use]
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Attribute lookup by exact name
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    /// Whether this is a form control whose value the user edits
    #[must_use]
    pub fn is_form_control(&self) -> bool {
        matches!(self.tag.as_str(), "input" | "textarea" | "select")
    }

    /// The `type` of an `<input>`, lowercased (`text` when absent)
    #[must_use]
    pub fn input_type(&self) -> Option<String> {
        (self.tag == "input").then(|| {
            self.attribute("type")
                .unwrap_or("text")
                .to_ascii_lowercase()
        })
    }
}

/// Node payload variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// The document root
    Document,
    /// An element
    Element(Element),
    /// A text node
    Text(String),
    /// A comment node
    Comment(String),
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl Node {
    const fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            parent: None,
            children: Vec::new(),
        }
    }
}

/// A document: one root node plus any number of detached nodes.
#[derive(Debug, Clone)]
pub struct Document {
    nodes: SlotMap<NodeId, Node>,
    root: NodeId,
    focused: Option<NodeId>,
    mutations: u64,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// Create an empty document
    #[must_use]
    pub fn new() -> Self {
        let mut nodes = SlotMap::with_key();
        let root = nodes.insert(Node::new(NodeKind::Document));
        Self {
            nodes,
            root,
            focused: None,
            mutations: 0,
        }
    }

    /// The document root
    #[must_use]
    pub const fn root(&self) -> NodeId {
        self.root
    }

    /// Number of effective mutations applied so far
    #[must_use]
    pub const fn mutation_count(&self) -> u64 {
        self.mutations
    }

    /// Number of live nodes in the arena (attached or not)
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    // ── creation ────────────────────────────────────────────────────────

    /// Create a detached element
    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.nodes
            .insert(Node::new(NodeKind::Element(Element::new(tag))))
    }

    /// Create a detached text node
    pub fn create_text(&mut self, text: impl Into<String>) -> NodeId {
        self.nodes.insert(Node::new(NodeKind::Text(text.into())))
    }

    /// Create a detached comment node
    pub fn create_comment(&mut self, text: impl Into<String>) -> NodeId {
        self.nodes.insert(Node::new(NodeKind::Comment(text.into())))
    }

    /// Deep-copy `node` from `other` into this document, detached.
    ///
    /// Returns `None` when `node` does not resolve in `other`. Copying a
    /// document root yields an element-less copy of its children wrapped in
    /// nothing, so callers import element/text/comment nodes only.
    pub fn import(&mut self, other: &Self, node: NodeId) -> Option<NodeId> {
        let source = other.nodes.get(node)?;
        let kind = match &source.kind {
            NodeKind::Document => return None,
            kind => kind.clone(),
        };
        let copy = self.nodes.insert(Node::new(kind));
        for &child in &source.children {
            if let Some(child_copy) = self.import(other, child) {
                if let Some(n) = self.nodes.get_mut(child_copy) {
                    n.parent = Some(copy);
                }
                if let Some(n) = self.nodes.get_mut(copy) {
                    n.children.push(child_copy);
                }
            }
        }
        Some(copy)
    }

    /// Tree building for the parser: no validation, no mutation accounting.
    pub(crate) fn attach_raw(&mut self, parent: NodeId, child: NodeId) {
        if let Some(node) = self.nodes.get_mut(child) {
            node.parent = Some(parent);
        }
        if let Some(node) = self.nodes.get_mut(parent) {
            node.children.push(child);
        }
    }

    /// Attribute building for the parser. Duplicate names keep the first value.
    pub(crate) fn push_attribute_raw(&mut self, id: NodeId, name: String, value: String) {
        if let Some(Node {
            kind: NodeKind::Element(el),
            ..
        }) = self.nodes.get_mut(id)
        {
            if el.attribute(&name).is_none() {
                el.attributes.push(Attribute { name, value });
            }
        }
    }

    // ── lookup ──────────────────────────────────────────────────────────

    /// Whether the handle still resolves
    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Node payload
    #[must_use]
    pub fn kind(&self, id: NodeId) -> Option<&NodeKind> {
        self.nodes.get(id).map(|n| &n.kind)
    }

    /// Element payload, if `id` is an element
    #[must_use]
    pub fn element(&self, id: NodeId) -> Option<&Element> {
        match self.kind(id)? {
            NodeKind::Element(el) => Some(el),
            _ => None,
        }
    }

    fn element_mut(&mut self, id: NodeId) -> Result<&mut Element, DomError> {
        match &mut self.nodes.get_mut(id).ok_or(DomError::Stale(id))?.kind {
            NodeKind::Element(el) => Ok(el),
            _ => Err(DomError::NotAnElement(id)),
        }
    }

    /// Whether `id` is an element
    #[must_use]
    pub fn is_element(&self, id: NodeId) -> bool {
        self.element(id).is_some()
    }

    /// Tag name of an element
    #[must_use]
    pub fn tag(&self, id: NodeId) -> Option<&str> {
        self.element(id).map(Element::tag)
    }

    /// Text of a text or comment node
    #[must_use]
    pub fn text(&self, id: NodeId) -> Option<&str> {
        match self.kind(id)? {
            NodeKind::Text(t) | NodeKind::Comment(t) => Some(t),
            _ => None,
        }
    }

    /// Concatenated text of all descendant text nodes
    #[must_use]
    pub fn text_content(&self, id: NodeId) -> String {
        let mut out = String::new();
        for node in self.subtree(id) {
            if let Some(NodeKind::Text(t)) = self.kind(node) {
                out.push_str(t);
            }
        }
        out
    }

    /// Parent of `id`
    #[must_use]
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id)?.parent
    }

    /// Children of `id` (empty when stale)
    #[must_use]
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.nodes.get(id).map_or(&[], |n| n.children.as_slice())
    }

    /// Element children of `id`
    #[must_use]
    pub fn element_children(&self, id: NodeId) -> Vec<NodeId> {
        self.children(id)
            .iter()
            .copied()
            .filter(|&c| self.is_element(c))
            .collect()
    }

    /// Whether `id` is reachable from the document root
    #[must_use]
    pub fn is_connected(&self, id: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(node) = current {
            if node == self.root {
                return true;
            }
            current = self.parent(node);
        }
        false
    }

    /// Whether `ancestor` is `node` or one of its ancestors
    #[must_use]
    pub fn is_inclusive_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(n) = current {
            if n == ancestor {
                return true;
            }
            current = self.parent(n);
        }
        false
    }

    /// Nearest inclusive ancestor element matching `predicate`
    pub fn closest<F>(&self, id: NodeId, mut predicate: F) -> Option<NodeId>
    where
        F: FnMut(NodeId, &Element) -> bool,
    {
        let mut current = Some(id);
        while let Some(node) = current {
            if let Some(el) = self.element(node) {
                if predicate(node, el) {
                    return Some(node);
                }
            }
            current = self.parent(node);
        }
        None
    }

    /// `id` followed by all its descendants, in document order
    #[must_use]
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        if !self.contains(id) {
            return out;
        }
        let mut stack = vec![id];
        while let Some(node) = stack.pop() {
            out.push(node);
            for &child in self.children(node).iter().rev() {
                stack.push(child);
            }
        }
        out
    }

    /// All descendants of `id` (excluding `id`), in document order
    #[must_use]
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut all = self.subtree(id);
        if !all.is_empty() {
            all.remove(0);
        }
        all
    }

    /// Elements in the subtree of `id` (inclusive) carrying attribute `name`
    #[must_use]
    pub fn find_by_attribute(&self, id: NodeId, name: &str) -> Vec<NodeId> {
        self.subtree(id)
            .into_iter()
            .filter(|&n| self.attribute(n, name).is_some())
            .collect()
    }

    /// Short human-readable description: the element's opening tag
    #[must_use]
    pub fn describe(&self, id: NodeId) -> String {
        match self.kind(id) {
            Some(NodeKind::Element(el)) => {
                let mut out = format!("<{}", el.tag);
                for attr in &el.attributes {
                    if attr.value.is_empty() {
                        out.push_str(&format!(" {}", attr.name));
                    } else {
                        out.push_str(&format!(" {}=\"{}\"", attr.name, attr.value));
                    }
                }
                out.push('>');
                out
            },
            Some(NodeKind::Text(t)) => format!("#text({t:?})"),
            Some(NodeKind::Comment(t)) => format!("<!--{t}-->"),
            Some(NodeKind::Document) => "#document".to_string(),
            None => format!("<stale {id:?}>"),
        }
    }

    // ── structure ───────────────────────────────────────────────────────

    /// Append `child` as the last child of `parent`
    ///
    /// # Errors
    ///
    /// See [`Document::insert_before`].
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), DomError> {
        self.insert_before(parent, child, None)
    }

    /// Insert `child` under `parent` before `reference` (or last when `None`).
    ///
    /// Moves `child` if it is already attached elsewhere. Inserting a node at
    /// the position it already occupies is a no-op.
    ///
    /// # Errors
    ///
    /// - [`DomError::Stale`] when any handle no longer resolves
    /// - [`DomError::HierarchyRequest`] when `parent` cannot hold children,
    ///   `child` is an ancestor of `parent`, or `reference` is not a child of `parent`
    pub fn insert_before(
        &mut self,
        parent: NodeId,
        child: NodeId,
        reference: Option<NodeId>,
    ) -> Result<(), DomError> {
        let parent_node = self.nodes.get(parent).ok_or(DomError::Stale(parent))?;
        if matches!(parent_node.kind, NodeKind::Text(_) | NodeKind::Comment(_)) {
            return Err(DomError::HierarchyRequest { parent, child });
        }
        if !self.contains(child) {
            return Err(DomError::Stale(child));
        }
        if child == self.root || self.is_inclusive_ancestor(child, parent) {
            return Err(DomError::HierarchyRequest { parent, child });
        }
        if let Some(reference) = reference {
            if reference == child {
                return Ok(());
            }
            if self.parent(reference) != Some(parent) {
                return Err(DomError::HierarchyRequest {
                    parent,
                    child: reference,
                });
            }
        }

        // Already in place?
        if self.parent(child) == Some(parent) {
            let siblings = self.children(parent);
            let pos = siblings.iter().position(|&c| c == child);
            let next = pos.and_then(|p| siblings.get(p + 1)).copied();
            if next == reference {
                return Ok(());
            }
        }

        self.unlink(child);
        let siblings = &mut self
            .nodes
            .get_mut(parent)
            .ok_or(DomError::Stale(parent))?
            .children;
        let index = reference
            .and_then(|r| siblings.iter().position(|&c| c == r))
            .unwrap_or(siblings.len());
        siblings.insert(index, child);
        if let Some(node) = self.nodes.get_mut(child) {
            node.parent = Some(parent);
        }
        self.mutations += 1;
        Ok(())
    }

    fn unlink(&mut self, child: NodeId) {
        let Some(old_parent) = self.parent(child) else {
            return;
        };
        if let Some(node) = self.nodes.get_mut(old_parent) {
            node.children.retain(|&c| c != child);
        }
        if let Some(node) = self.nodes.get_mut(child) {
            node.parent = None;
        }
    }

    /// Detach `id` from its parent without freeing it
    ///
    /// # Errors
    ///
    /// Returns [`DomError::Stale`] when `id` no longer resolves.
    pub fn detach(&mut self, id: NodeId) -> Result<(), DomError> {
        if !self.contains(id) {
            return Err(DomError::Stale(id));
        }
        if self.parent(id).is_some() {
            self.unlink(id);
            self.mutations += 1;
        }
        Ok(())
    }

    /// Detach and free `id` and its whole subtree.
    ///
    /// Returns the freed handles in document order. Focus is cleared when the
    /// focused node was part of the subtree.
    ///
    /// # Errors
    ///
    /// Returns [`DomError::Stale`] when `id` no longer resolves, or
    /// [`DomError::HierarchyRequest`] when asked to remove the document root.
    pub fn remove(&mut self, id: NodeId) -> Result<Vec<NodeId>, DomError> {
        if id == self.root {
            return Err(DomError::HierarchyRequest {
                parent: id,
                child: id,
            });
        }
        if !self.contains(id) {
            return Err(DomError::Stale(id));
        }
        let removed = self.subtree(id);
        let was_attached = self.parent(id).is_some();
        self.unlink(id);
        for &node in &removed {
            self.nodes.remove(node);
        }
        if self.focused.is_some_and(|f| !self.contains(f)) {
            self.focused = None;
        }
        if was_attached {
            self.mutations += 1;
        }
        Ok(removed)
    }

    /// Remove all children of `id`
    ///
    /// # Errors
    ///
    /// Returns [`DomError::Stale`] when `id` no longer resolves.
    pub fn clear_children(&mut self, id: NodeId) -> Result<Vec<NodeId>, DomError> {
        let children = self
            .nodes
            .get(id)
            .ok_or(DomError::Stale(id))?
            .children
            .clone();
        let mut removed = Vec::new();
        for child in children {
            removed.extend(self.remove(child)?);
        }
        Ok(removed)
    }

    /// Replace `old` by `new` at the same position; `old` is freed.
    ///
    /// # Errors
    ///
    /// Returns [`DomError::Stale`] for stale handles or
    /// [`DomError::HierarchyRequest`] when `old` is detached.
    pub fn replace(&mut self, old: NodeId, new: NodeId) -> Result<Vec<NodeId>, DomError> {
        let parent = self
            .parent(old)
            .ok_or(DomError::HierarchyRequest {
                parent: old,
                child: new,
            })?;
        self.insert_before(parent, new, Some(old))?;
        self.remove(old)
    }

    /// Replace the text of a text or comment node
    ///
    /// # Errors
    ///
    /// Returns [`DomError::Stale`] or [`DomError::NotAnElement`] (for
    /// element/document nodes, which carry no text of their own).
    pub fn set_text(&mut self, id: NodeId, text: &str) -> Result<bool, DomError> {
        let node = self.nodes.get_mut(id).ok_or(DomError::Stale(id))?;
        match &mut node.kind {
            NodeKind::Text(t) | NodeKind::Comment(t) => {
                if t == text {
                    return Ok(false);
                }
                text.clone_into(t);
                self.mutations += 1;
                Ok(true)
            },
            _ => Err(DomError::NotAnElement(id)),
        }
    }

    // ── attributes ──────────────────────────────────────────────────────

    /// Attribute value of an element
    #[must_use]
    pub fn attribute(&self, id: NodeId, name: &str) -> Option<&str> {
        self.element(id)?.attribute(name)
    }

    /// Whether the element carries attribute `name`
    #[must_use]
    pub fn has_attribute(&self, id: NodeId, name: &str) -> bool {
        self.attribute(id, name).is_some()
    }

    /// All attributes of an element (empty for non-elements)
    #[must_use]
    pub fn attributes(&self, id: NodeId) -> &[Attribute] {
        self.element(id).map_or(&[], Element::attributes)
    }

    /// Set an attribute; returns whether anything changed
    ///
    /// # Errors
    ///
    /// Returns [`DomError::Stale`] or [`DomError::NotAnElement`].
    pub fn set_attribute(&mut self, id: NodeId, name: &str, value: &str) -> Result<bool, DomError> {
        let el = self.element_mut(id)?;
        if let Some(attr) = el.attributes.iter_mut().find(|a| a.name == name) {
            if attr.value == value {
                return Ok(false);
            }
            value.clone_into(&mut attr.value);
        } else {
            el.attributes.push(Attribute {
                name: name.to_string(),
                value: value.to_string(),
            });
        }
        self.mutations += 1;
        Ok(true)
    }

    /// Remove an attribute; returns whether it was present
    ///
    /// # Errors
    ///
    /// Returns [`DomError::Stale`] or [`DomError::NotAnElement`].
    pub fn remove_attribute(&mut self, id: NodeId, name: &str) -> Result<bool, DomError> {
        let el = self.element_mut(id)?;
        let before = el.attributes.len();
        el.attributes.retain(|a| a.name != name);
        let changed = el.attributes.len() != before;
        if changed {
            self.mutations += 1;
        }
        Ok(changed)
    }

    /// Whether the element's `class` list contains `class`
    #[must_use]
    pub fn has_class(&self, id: NodeId, class: &str) -> bool {
        self.attribute(id, "class")
            .is_some_and(|c| c.split_whitespace().any(|t| t == class))
    }

    /// Add class tokens (whitespace separated)
    ///
    /// # Errors
    ///
    /// Returns [`DomError::Stale`] or [`DomError::NotAnElement`].
    pub fn add_class(&mut self, id: NodeId, classes: &str) -> Result<bool, DomError> {
        let current = self.attribute(id, "class").unwrap_or_default().to_string();
        let mut tokens: Vec<&str> = current.split_whitespace().collect();
        for class in classes.split_whitespace() {
            if !tokens.contains(&class) {
                tokens.push(class);
            }
        }
        let next = tokens.join(" ");
        if next == current {
            self.element_mut(id)?;
            return Ok(false);
        }
        self.set_attribute(id, "class", &next)
    }

    /// Remove class tokens (whitespace separated)
    ///
    /// # Errors
    ///
    /// Returns [`DomError::Stale`] or [`DomError::NotAnElement`].
    pub fn remove_class(&mut self, id: NodeId, classes: &str) -> Result<bool, DomError> {
        let Some(current) = self.attribute(id, "class").map(str::to_string) else {
            self.element_mut(id)?;
            return Ok(false);
        };
        let remove: Vec<&str> = classes.split_whitespace().collect();
        let next = current
            .split_whitespace()
            .filter(|t| !remove.contains(t))
            .collect::<Vec<_>>()
            .join(" ");
        if next == current {
            return Ok(false);
        }
        self.set_attribute(id, "class", &next)
    }

    // ── form state ──────────────────────────────────────────────────────

    /// Current value of a form control.
    ///
    /// The live property wins; otherwise the `value` attribute (inputs), the
    /// text content (textareas) or the selected option (selects).
    #[must_use]
    pub fn value(&self, id: NodeId) -> Option<String> {
        let el = self.element(id)?;
        if let Some(value) = &el.value {
            return Some(value.clone());
        }
        match el.tag.as_str() {
            "textarea" => Some(self.text_content(id)),
            "select" => {
                let options: Vec<NodeId> = self
                    .descendants(id)
                    .into_iter()
                    .filter(|&n| self.tag(n) == Some("option"))
                    .collect();
                let selected = options
                    .iter()
                    .copied()
                    .find(|&o| self.has_attribute(o, "selected"))
                    .or_else(|| options.first().copied())?;
                Some(
                    self.attribute(selected, "value")
                        .map_or_else(|| self.text_content(selected), str::to_string),
                )
            },
            _ => Some(el.attribute("value").unwrap_or_default().to_string()),
        }
    }

    /// Set the live value of a form control
    ///
    /// # Errors
    ///
    /// Returns [`DomError::Stale`] or [`DomError::NotAnElement`].
    pub fn set_value(&mut self, id: NodeId, value: &str) -> Result<bool, DomError> {
        if self.value(id).as_deref() == Some(value) {
            // Pin the live value so later attribute changes don't leak through.
            let el = self.element_mut(id)?;
            if el.value.is_none() {
                el.value = Some(value.to_string());
            }
            return Ok(false);
        }
        self.element_mut(id)?.value = Some(value.to_string());
        self.mutations += 1;
        Ok(true)
    }

    /// Checked state of a checkbox/radio (live property, else attribute)
    #[must_use]
    pub fn checked(&self, id: NodeId) -> bool {
        self.element(id)
            .is_some_and(|el| el.checked.unwrap_or_else(|| el.attribute("checked").is_some()))
    }

    /// Set the live checked state
    ///
    /// # Errors
    ///
    /// Returns [`DomError::Stale`] or [`DomError::NotAnElement`].
    pub fn set_checked(&mut self, id: NodeId, checked: bool) -> Result<bool, DomError> {
        let current = self.checked(id);
        let el = self.element_mut(id)?;
        el.checked = Some(checked);
        if current == checked {
            return Ok(false);
        }
        self.mutations += 1;
        Ok(true)
    }

    // ── focus ───────────────────────────────────────────────────────────

    /// Focus an element
    ///
    /// # Errors
    ///
    /// Returns [`DomError::Stale`] or [`DomError::NotAnElement`].
    pub fn focus(&mut self, id: NodeId) -> Result<(), DomError> {
        self.element_mut(id)?;
        self.focused = Some(id);
        Ok(())
    }

    /// Drop focus
    pub fn blur(&mut self) {
        self.focused = None;
    }

    /// Currently focused element, if it still exists
    #[must_use]
    pub fn focused(&self) -> Option<NodeId> {
        self.focused.filter(|&f| self.contains(f))
    }
}
