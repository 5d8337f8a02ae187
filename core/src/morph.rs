//! DOM morphing: reconcile a live component subtree against fresh HTML.
//!
//! The new markup is parsed into a scratch [`Document`] first and validated
//! (exactly one root element, same tag as the live root). Nothing in the live
//! document is touched until validation passes, so a bad response can never
//! leave a half-applied patch behind.
//!
//! Reconciliation rules:
//!
//! - `raxm:ignore` on a live element leaves it and its subtree alone;
//!   `raxm:ignore.self` protects its attributes but still morphs its children.
//! - Children carrying `raxm:key` (or failing that, `id`) are matched by key,
//!   so keyed nodes keep their identity across reorders. Unkeyed children are
//!   matched in order against the next compatible unkeyed live node.
//! - Form controls that are focused, or listed in
//!   [`MorphOptions::preserve_values`], keep their live value/checked state.
//! - Writes that change nothing are skipped, so morphing a subtree against its
//!   own serialization performs zero mutations.

use crate::dom::{Document, DomError, Element, NodeId, NodeKind};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

const IGNORE: &str = "raxm:ignore";
const IGNORE_SELF: &str = "raxm:ignore.self";
const KEY: &str = "raxm:key";

/// Errors raised before any mutation is applied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MorphError {
    /// The new markup contains no element
    #[error("Rendered HTML has no root element")]
    NoRootElement,

    /// The new markup has more than one top-level element
    #[error("Rendered HTML has {0} root elements, expected exactly one")]
    MultipleRoots(usize),

    /// The new root's tag differs from the live root's
    #[error("Rendered root <{found}> does not match live root <{expected}>")]
    RootMismatch {
        /// Live root tag
        expected: String,
        /// Rendered root tag
        found: String,
    },

    /// The live root is not usable
    #[error(transparent)]
    Dom(#[from] DomError),
}

/// Knobs for a single morph.
#[derive(Debug, Clone, Default)]
pub struct MorphOptions {
    /// Controls whose live value must survive the patch (pending model updates)
    pub preserve_values: HashSet<NodeId>,
}

/// What a morph changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MorphReport {
    /// Newly created nodes (every node of every inserted subtree, pre-order)
    pub inserted: Vec<NodeId>,
    /// Freed handles
    pub removed: Vec<NodeId>,
    /// Kept elements whose attributes changed
    pub updated: Vec<NodeId>,
    /// Effective DOM mutations performed
    pub mutations: u64,
}

impl MorphReport {
    /// Whether nothing changed
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.mutations == 0
    }
}

/// Morph `root` in `document` so it matches `html`.
///
/// # Errors
///
/// Returns [`MorphError`] when the markup cannot patch `root`; the document is
/// left untouched in that case.
pub fn morph(
    document: &mut Document,
    root: NodeId,
    html: &str,
    options: &MorphOptions,
) -> Result<MorphReport, MorphError> {
    let expected = match document.element(root) {
        Some(el) => el.tag().to_string(),
        None if document.contains(root) => return Err(DomError::NotAnElement(root).into()),
        None => return Err(DomError::Stale(root).into()),
    };

    let template = Document::parse(html);
    let roots = template.element_children(template.root());
    let template_root = match roots.as_slice() {
        [] => return Err(MorphError::NoRootElement),
        [single] => *single,
        many => return Err(MorphError::MultipleRoots(many.len())),
    };
    let found = template.tag(template_root).unwrap_or_default();
    if found != expected {
        return Err(MorphError::RootMismatch {
            expected,
            found: found.to_string(),
        });
    }

    let start = document.mutation_count();
    let mut morpher = Morpher {
        doc: document,
        template: &template,
        options,
        report: MorphReport::default(),
    };
    morpher.element(root, template_root)?;
    let mut report = morpher.report;
    report.mutations = document.mutation_count() - start;
    tracing::trace!(
        inserted = report.inserted.len(),
        removed = report.removed.len(),
        mutations = report.mutations,
        "Morph complete"
    );
    Ok(report)
}

fn key_of(doc: &Document, node: NodeId) -> Option<&str> {
    doc.attribute(node, KEY).or_else(|| doc.attribute(node, "id"))
}

fn compatible(live: &Document, a: NodeId, template: &Document, b: NodeId) -> bool {
    match (live.kind(a), template.kind(b)) {
        (Some(NodeKind::Element(x)), Some(NodeKind::Element(y))) => x.tag() == y.tag(),
        (Some(NodeKind::Text(_)), Some(NodeKind::Text(_)))
        | (Some(NodeKind::Comment(_)), Some(NodeKind::Comment(_))) => true,
        _ => false,
    }
}

struct Morpher<'a> {
    doc: &'a mut Document,
    template: &'a Document,
    options: &'a MorphOptions,
    report: MorphReport,
}

impl Morpher<'_> {
    fn node(&mut self, live: NodeId, target: NodeId) -> Result<(), DomError> {
        let template = self.template;
        match template.kind(target) {
            Some(NodeKind::Element(_)) => self.element(live, target),
            Some(NodeKind::Text(text) | NodeKind::Comment(text)) => {
                self.doc.set_text(live, text)?;
                Ok(())
            },
            _ => Ok(()),
        }
    }

    fn element(&mut self, live: NodeId, target: NodeId) -> Result<(), DomError> {
        if self.doc.has_attribute(live, IGNORE) {
            return Ok(());
        }

        let preserve = self.doc.focused() == Some(live) || self.options.preserve_values.contains(&live);
        let tag = self.doc.tag(live).unwrap_or_default().to_string();
        let input_type = self.doc.element(live).and_then(Element::input_type);
        let checkable = matches!(input_type.as_deref(), Some("checkbox" | "radio"));

        if preserve {
            // Pin live state before attributes change underneath it.
            if checkable {
                let checked = self.doc.checked(live);
                self.doc.set_checked(live, checked)?;
            } else if let Some(value) = self.doc.value(live) {
                self.doc.set_value(live, &value)?;
            }
        }

        if !self.doc.has_attribute(live, IGNORE_SELF) {
            self.attributes(live, target)?;
        }

        if tag == "textarea" && preserve {
            return Ok(());
        }
        self.children(live, target)?;

        if preserve {
            return Ok(());
        }
        match tag.as_str() {
            "input" if checkable => {
                let checked = self.template.has_attribute(target, "checked");
                self.doc.set_checked(live, checked)?;
            },
            "input" | "textarea" | "select" => {
                let value = self.template.value(target).unwrap_or_default();
                self.doc.set_value(live, &value)?;
            },
            _ => {},
        }
        Ok(())
    }

    fn attributes(&mut self, live: NodeId, target: NodeId) -> Result<(), DomError> {
        let template = self.template;
        let mut changed = false;
        for attr in template.attributes(target) {
            changed |= self.doc.set_attribute(live, &attr.name, &attr.value)?;
        }
        let stale: Vec<String> = self
            .doc
            .attributes(live)
            .iter()
            .filter(|a| !template.has_attribute(target, &a.name))
            .map(|a| a.name.clone())
            .collect();
        for name in stale {
            changed |= self.doc.remove_attribute(live, &name)?;
        }
        if changed {
            self.report.updated.push(live);
        }
        Ok(())
    }

    fn children(&mut self, parent: NodeId, target: NodeId) -> Result<(), DomError> {
        let template = self.template;
        let live_children = self.doc.children(parent).to_vec();
        let mut keyed: HashMap<String, Vec<NodeId>> = HashMap::new();
        for &child in &live_children {
            if let Some(key) = key_of(self.doc, child) {
                keyed.entry(key.to_string()).or_default().push(child);
            }
        }

        let mut used: HashSet<NodeId> = HashSet::new();
        let mut cursor = 0;
        let mut previous: Option<NodeId> = None;

        for &wanted in template.children(target) {
            let matched = if let Some(key) = key_of(template, wanted) {
                keyed.get(key).and_then(|candidates| {
                    candidates
                        .iter()
                        .copied()
                        .find(|c| !used.contains(c) && compatible(self.doc, *c, template, wanted))
                })
            } else {
                let found = live_children
                    .iter()
                    .enumerate()
                    .skip(cursor)
                    .find(|&(_, &c)| {
                        !used.contains(&c)
                            && key_of(self.doc, c).is_none()
                            && compatible(self.doc, c, template, wanted)
                    })
                    .map(|(i, &c)| (i, c));
                found.map(|(i, c)| {
                    cursor = i + 1;
                    c
                })
            };

            let reference = match previous {
                None => self.doc.children(parent).first().copied(),
                Some(prev) => {
                    let siblings = self.doc.children(parent);
                    siblings
                        .iter()
                        .position(|&c| c == prev)
                        .and_then(|p| siblings.get(p + 1))
                        .copied()
                },
            };

            let placed = if let Some(node) = matched {
                used.insert(node);
                self.node(node, wanted)?;
                self.doc.insert_before(parent, node, reference)?;
                node
            } else {
                let Some(node) = self.doc.import(template, wanted) else {
                    continue;
                };
                self.doc.insert_before(parent, node, reference)?;
                self.report.inserted.extend(self.doc.subtree(node));
                node
            };
            previous = Some(placed);
        }

        for child in live_children {
            if !used.contains(&child) && self.doc.contains(child) {
                self.report.removed.extend(self.doc.remove(child)?);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn boot(html: &str) -> (Document, NodeId) {
        let doc = Document::parse(html);
        let root = doc.element_children(doc.root())[0];
        (doc, root)
    }

    fn by_key(doc: &Document, root: NodeId, key: &str) -> NodeId {
        doc.subtree(root)
            .into_iter()
            .find(|&n| key_of(doc, n) == Some(key))
            .unwrap()
    }

    /// Serialization with attributes sorted, so attribute order doesn't matter.
    fn canonical(doc: &Document, node: NodeId) -> String {
        match doc.kind(node) {
            Some(NodeKind::Element(el)) => {
                let mut attrs: Vec<String> = el
                    .attributes()
                    .iter()
                    .map(|a| format!("{}={:?}", a.name, a.value))
                    .collect();
                attrs.sort();
                let children: String = doc
                    .children(node)
                    .iter()
                    .map(|&c| canonical(doc, c))
                    .collect();
                format!("<{} {}>{children}</{}>", el.tag(), attrs.join(" "), el.tag())
            },
            Some(NodeKind::Text(t)) => format!("T({t})"),
            Some(NodeKind::Comment(t)) => format!("C({t})"),
            _ => String::new(),
        }
    }

    #[test]
    fn test_identical_html_is_a_noop() {
        let html = r#"<div raxm:id="a"><p class="x">Hi <b>there</b></p><input value="v"><!-- c --></div>"#;
        let (mut doc, root) = boot(html);
        let report = morph(&mut doc, root, html, &MorphOptions::default()).unwrap();
        assert!(report.is_noop());
        assert!(report.inserted.is_empty() && report.removed.is_empty());
    }

    #[test]
    fn test_text_and_attributes_are_updated_in_place() {
        let (mut doc, root) = boot(r#"<div><p class="a" title="t">old</p></div>"#);
        let p = doc.element_children(root)[0];
        let report = morph(&mut doc, root, r#"<div><p class="b">new</p></div>"#, &MorphOptions::default()).unwrap();
        assert!(doc.contains(p));
        assert_eq!(doc.outer_html(root), r#"<div><p class="b">new</p></div>"#);
        assert_eq!(report.updated, vec![p]);
    }

    #[test]
    fn test_keyed_children_keep_identity_across_reorder() {
        let (mut doc, root) = boot(
            r#"<ul><li raxm:key="1">one</li><li raxm:key="2">two</li><li raxm:key="3">three</li></ul>"#,
        );
        let one = by_key(&doc, root, "1");
        let three = by_key(&doc, root, "3");
        let report = morph(
            &mut doc,
            root,
            r#"<ul><li raxm:key="3">three</li><li raxm:key="1">one!</li><li raxm:key="4">four</li></ul>"#,
            &MorphOptions::default(),
        )
        .unwrap();
        assert_eq!(doc.element_children(root), vec![three, one, report.inserted[0]]);
        assert_eq!(doc.text_content(one), "one!");
        assert_eq!(report.removed.len(), 2); // li 2 and its text
        assert_eq!(doc.text_content(root), "threeone!four");
    }

    #[test]
    fn test_id_attribute_acts_as_key() {
        let (mut doc, root) = boot(r#"<div><span id="a">A</span><span id="b">B</span></div>"#);
        let b = by_key(&doc, root, "b");
        morph(&mut doc, root, r#"<div><span id="b">B</span></div>"#, &MorphOptions::default()).unwrap();
        assert_eq!(doc.element_children(root), vec![b]);
    }

    #[test]
    fn test_ignore_leaves_subtree_untouched() {
        let (mut doc, root) = boot(r#"<div><section raxm:ignore class="a"><p>mine</p></section></div>"#);
        let before = doc.outer_html(root);
        let report = morph(
            &mut doc,
            root,
            r#"<div><section raxm:ignore class="b"><p>theirs</p></section></div>"#,
            &MorphOptions::default(),
        )
        .unwrap();
        assert!(report.is_noop());
        assert_eq!(doc.outer_html(root), before);
    }

    #[test]
    fn test_ignore_self_morphs_children_only() {
        let (mut doc, root) = boot(r#"<div><section raxm:ignore.self class="a"><p>old</p></section></div>"#);
        morph(
            &mut doc,
            root,
            r#"<div><section raxm:ignore.self class="b"><p>new</p></section></div>"#,
            &MorphOptions::default(),
        )
        .unwrap();
        assert_eq!(
            doc.outer_html(root),
            r#"<div><section raxm:ignore.self class="a"><p>new</p></section></div>"#
        );
    }

    #[test]
    fn test_focused_input_keeps_live_value() {
        let (mut doc, root) = boot(r#"<form><input name="q" value="server"></form>"#);
        let input = doc.element_children(root)[0];
        doc.set_value(input, "typing").unwrap();
        doc.focus(input).unwrap();
        morph(&mut doc, root, r#"<form><input name="q" value="stale"></form>"#, &MorphOptions::default()).unwrap();
        assert_eq!(doc.value(input).as_deref(), Some("typing"));
        assert_eq!(doc.attribute(input, "value"), Some("stale"));

        doc.blur();
        morph(&mut doc, root, r#"<form><input name="q" value="fresh"></form>"#, &MorphOptions::default()).unwrap();
        assert_eq!(doc.value(input).as_deref(), Some("fresh"));
    }

    #[test]
    fn test_pending_controls_keep_live_state() {
        let (mut doc, root) = boot(r#"<div><input type="checkbox" checked><textarea>old</textarea></div>"#);
        let kids = doc.element_children(root);
        let (checkbox, textarea) = (kids[0], kids[1]);
        doc.set_checked(checkbox, false).unwrap();
        doc.set_value(textarea, "draft").unwrap();
        let options = MorphOptions {
            preserve_values: [checkbox, textarea].into_iter().collect(),
        };
        morph(&mut doc, root, r#"<div><input type="checkbox" checked><textarea>server</textarea></div>"#, &options).unwrap();
        assert!(!doc.checked(checkbox));
        assert_eq!(doc.value(textarea).as_deref(), Some("draft"));

        morph(&mut doc, root, r#"<div><input type="checkbox" checked><textarea>server</textarea></div>"#, &MorphOptions::default()).unwrap();
        assert!(doc.checked(checkbox));
        assert_eq!(doc.value(textarea).as_deref(), Some("server"));
    }

    #[test]
    fn test_invalid_markup_leaves_document_untouched() {
        let (mut doc, root) = boot(r#"<div><p>x</p></div>"#);
        let before = (doc.mutation_count(), doc.outer_html(root));
        let opts = MorphOptions::default();

        assert_eq!(morph(&mut doc, root, "just text", &opts), Err(MorphError::NoRootElement));
        assert_eq!(morph(&mut doc, root, "<div></div><div></div>", &opts), Err(MorphError::MultipleRoots(2)));
        assert_eq!(
            morph(&mut doc, root, "<span></span>", &opts),
            Err(MorphError::RootMismatch {
                expected: "div".into(),
                found: "span".into()
            })
        );
        assert_eq!((doc.mutation_count(), doc.outer_html(root)), before);

        let removed = doc.remove(root).unwrap();
        assert_eq!(
            morph(&mut doc, removed[0], "<div></div>", &opts),
            Err(MorphError::Dom(DomError::Stale(root)))
        );
    }

    #[test]
    fn test_surrounding_whitespace_and_comments_are_accepted() {
        let (mut doc, root) = boot("<div>a</div>");
        morph(&mut doc, root, "\n  <!-- rendered -->\n<div>b</div>\n", &MorphOptions::default()).unwrap();
        assert_eq!(doc.text_content(root), "b");
    }

    // ── properties ──────────────────────────────────────────────────────

    fn arb_node() -> impl Strategy<Value = String> {
        let leaf = prop_oneof![
            "[a-zéÇ…東]{1,4}",
            Just("<br>".to_string()),
            Just("<!--c-->".to_string()),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            (
                prop::sample::select(vec!["div", "p", "span", "li"]),
                prop::option::of(prop::sample::select(vec!["a", "b"])),
                prop::option::of(prop::sample::select(vec!["k1", "k2", "k3"])),
                prop::collection::vec(inner, 0..4),
            )
                .prop_map(|(tag, class, key, children)| {
                    let mut attrs = String::new();
                    if let Some(class) = class {
                        attrs.push_str(&format!(r#" class="{class}""#));
                    }
                    if let Some(key) = key {
                        attrs.push_str(&format!(r#" raxm:key="{key}""#));
                    }
                    format!("<{tag}{attrs}>{}</{tag}>", children.concat())
                })
        })
    }

    fn arb_component() -> impl Strategy<Value = String> {
        prop::collection::vec(arb_node(), 0..5)
            .prop_map(|children| format!(r#"<div raxm:id="c">{}</div>"#, children.concat()))
    }

    proptest! {
        #[test]
        fn prop_morph_against_itself_is_noop(html in arb_component()) {
            let (mut doc, root) = boot(&html);
            let report = morph(&mut doc, root, &html, &MorphOptions::default()).unwrap();
            prop_assert_eq!(report.mutations, 0);
        }

        #[test]
        fn prop_morph_converges_to_target(from in arb_component(), to in arb_component()) {
            let (mut doc, root) = boot(&from);
            morph(&mut doc, root, &to, &MorphOptions::default()).unwrap();
            let (expected, expected_root) = boot(&to);
            prop_assert_eq!(canonical(&doc, root), canonical(&expected, expected_root));

            let again = morph(&mut doc, root, &to, &MorphOptions::default()).unwrap();
            prop_assert_eq!(again.mutations, 0);
        }
    }
}
