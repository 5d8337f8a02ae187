//! HTML parsing and serialization for the DOM arena.
//!
//! The parser is deliberately forgiving: server-rendered component markup is
//! trusted, so the goal is to never fail, not to implement the full HTML5
//! tree-construction algorithm. Stray end tags are dropped, unclosed elements
//! are closed at end of input, `script`/`style`/`textarea` content is raw text.

use crate::dom::{Document, NodeId, NodeKind};

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style", "textarea"];

/// Whether `tag` never has children or an end tag
#[must_use]
pub fn is_void_element(tag: &str) -> bool {
    VOID_ELEMENTS.contains(&tag)
}

impl Document {
    /// Parse a full document. Top-level nodes become children of the root.
    ///
    /// The returned document starts with a mutation count of zero.
    #[must_use]
    pub fn parse(html: &str) -> Self {
        let mut doc = Self::new();
        let root = doc.root();
        for node in doc.parse_fragment(html) {
            doc.attach_raw(root, node);
        }
        doc
    }

    /// Parse `html` into detached nodes owned by this document.
    ///
    /// Returns the top-level nodes in source order.
    pub fn parse_fragment(&mut self, html: &str) -> Vec<NodeId> {
        Parser::new(self, html).run()
    }

    /// Serialize `id` including its own tag
    #[must_use]
    pub fn outer_html(&self, id: NodeId) -> String {
        let mut out = String::new();
        write_node(self, id, &mut out);
        out
    }

    /// Serialize the children of `id`
    #[must_use]
    pub fn inner_html(&self, id: NodeId) -> String {
        let mut out = String::new();
        for &child in self.children(id) {
            write_node(self, child, &mut out);
        }
        out
    }
}

struct Parser<'d, 'h> {
    doc: &'d mut Document,
    input: &'h str,
    pos: usize,
    stack: Vec<(NodeId, String)>,
    roots: Vec<NodeId>,
}

impl<'d, 'h> Parser<'d, 'h> {
    fn new(doc: &'d mut Document, input: &'h str) -> Self {
        Self {
            doc,
            input,
            pos: 0,
            stack: Vec::new(),
            roots: Vec::new(),
        }
    }

    fn rest(&self) -> &'h str {
        &self.input[self.pos..]
    }

    fn attach(&mut self, node: NodeId) {
        match self.stack.last() {
            Some(&(parent, _)) => self.doc.attach_raw(parent, node),
            None => self.roots.push(node),
        }
    }

    fn run(mut self) -> Vec<NodeId> {
        while self.pos < self.input.len() {
            let rest = self.rest();
            if rest.starts_with("<!--") {
                self.comment();
            } else if rest.starts_with("<!") || rest.starts_with("<?") {
                self.skip_past('>');
            } else if rest.starts_with("</") {
                self.end_tag();
            } else if rest.starts_with('<')
                && rest[1..].chars().next().is_some_and(|c| c.is_ascii_alphabetic())
            {
                self.start_tag();
            } else {
                self.text();
            }
        }
        self.roots
    }

    fn skip_past(&mut self, needle: char) {
        match self.rest().find(needle) {
            Some(i) => self.pos += i + needle.len_utf8(),
            None => self.pos = self.input.len(),
        }
    }

    fn comment(&mut self) {
        let body_start = self.pos + 4;
        let (body, next) = match self.input[body_start..].find("-->") {
            Some(i) => (&self.input[body_start..body_start + i], body_start + i + 3),
            None => (&self.input[body_start..], self.input.len()),
        };
        let node = self.doc.create_comment(body);
        self.attach(node);
        self.pos = next;
    }

    fn text(&mut self) {
        let rest = self.rest();
        // A lone '<' that didn't open a tag is plain text.
        let first = rest.chars().next().map_or(0, char::len_utf8);
        let end = rest[first..].find('<').map_or(rest.len(), |i| i + first);
        let raw = &rest[..end];
        self.pos += end;
        let node = self.doc.create_text(decode_entities(raw));
        self.attach(node);
    }

    fn read_name(&mut self) -> String {
        let rest = self.rest();
        let end = rest
            .find(|c: char| c.is_whitespace() || c == '>' || c == '/' || c == '=')
            .unwrap_or(rest.len());
        self.pos += end;
        rest[..end].to_ascii_lowercase()
    }

    fn skip_whitespace(&mut self) {
        let rest = self.rest();
        let trimmed = rest.trim_start();
        self.pos += rest.len() - trimmed.len();
    }

    fn end_tag(&mut self) {
        self.pos += 2;
        let name = self.read_name();
        self.skip_past('>');
        if let Some(depth) = self.stack.iter().rposition(|(_, tag)| *tag == name) {
            self.stack.truncate(depth);
        }
    }

    fn start_tag(&mut self) {
        self.pos += 1;
        let tag = self.read_name();
        let element = self.doc.create_element(&tag);
        let mut self_closing = false;

        loop {
            self.skip_whitespace();
            let rest = self.rest();
            if rest.is_empty() {
                break;
            }
            if rest.starts_with('>') {
                self.pos += 1;
                break;
            }
            if rest.starts_with("/>") {
                self.pos += 2;
                self_closing = true;
                break;
            }
            if rest.starts_with('/') || rest.starts_with('=') {
                self.pos += 1;
                continue;
            }
            let name = self.read_name();
            self.skip_whitespace();
            let value = if self.rest().starts_with('=') {
                self.pos += 1;
                self.skip_whitespace();
                self.attribute_value()
            } else {
                String::new()
            };
            self.doc.push_attribute_raw(element, name, value);
        }

        self.attach(element);
        if self_closing || is_void_element(&tag) {
            return;
        }
        if RAW_TEXT_ELEMENTS.contains(&tag.as_str()) {
            self.raw_text(element, &tag);
            return;
        }
        self.stack.push((element, tag));
    }

    fn attribute_value(&mut self) -> String {
        let rest = self.rest();
        let mut chars = rest.chars();
        match chars.next() {
            Some(quote @ ('"' | '\'')) => {
                let body = &rest[1..];
                let end = body.find(quote).unwrap_or(body.len());
                self.pos += 1 + end + usize::from(end < body.len());
                decode_entities(&body[..end])
            },
            _ => {
                let end = rest
                    .find(|c: char| c.is_whitespace() || c == '>')
                    .unwrap_or(rest.len());
                self.pos += end;
                decode_entities(&rest[..end])
            },
        }
    }

    fn raw_text(&mut self, element: NodeId, tag: &str) {
        let rest = self.rest();
        let closing = format!("</{tag}");
        let end = find_ascii_case_insensitive(rest, &closing).unwrap_or(rest.len());
        let body = &rest[..end];
        if !body.is_empty() {
            let text = if tag == "textarea" {
                decode_entities(body)
            } else {
                body.to_string()
            };
            let node = self.doc.create_text(text);
            self.doc.attach_raw(element, node);
        }
        self.pos += end;
        if self.pos < self.input.len() {
            self.skip_past('>');
        }
    }
}

fn find_ascii_case_insensitive(haystack: &str, needle: &str) -> Option<usize> {
    let hay = haystack.as_bytes();
    let needle = needle.as_bytes();
    if needle.len() > hay.len() {
        return None;
    }
    (0..=hay.len() - needle.len()).find(|&i| hay[i..i + needle.len()].eq_ignore_ascii_case(needle))
}

/// Decode the handful of character references server templates emit.
#[must_use]
pub fn decode_entities(input: &str) -> String {
    if !input.contains('&') {
        return input.to_string();
    }
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let Some(semi) = rest.find(';').filter(|&s| s <= 10) else {
            out.push('&');
            rest = &rest[1..];
            continue;
        };
        let entity = &rest[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some('\u{a0}'),
            _ => entity.strip_prefix('#').and_then(|num| {
                let code = match num.strip_prefix(['x', 'X']) {
                    Some(hex) => u32::from_str_radix(hex, 16).ok(),
                    None => num.parse().ok(),
                };
                code.and_then(char::from_u32)
            }),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &rest[semi + 1..];
            },
            None => {
                out.push('&');
                rest = &rest[1..];
            },
        }
    }
    out.push_str(rest);
    out
}

fn escape_text(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
}

fn escape_attribute(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
}

fn write_node(doc: &Document, id: NodeId, out: &mut String) {
    match doc.kind(id) {
        Some(NodeKind::Document) => {
            for &child in doc.children(id) {
                write_node(doc, child, out);
            }
        },
        Some(NodeKind::Element(el)) => {
            out.push('<');
            out.push_str(el.tag());
            for attr in el.attributes() {
                out.push(' ');
                out.push_str(&attr.name);
                if !attr.value.is_empty() {
                    out.push_str("=\"");
                    escape_attribute(&attr.value, out);
                    out.push('"');
                }
            }
            out.push('>');
            if is_void_element(el.tag()) {
                return;
            }
            for &child in doc.children(id) {
                write_node(doc, child, out);
            }
            out.push_str("</");
            out.push_str(el.tag());
            out.push('>');
        },
        Some(NodeKind::Text(text)) => {
            let raw_parent = doc
                .parent(id)
                .and_then(|p| doc.tag(p))
                .is_some_and(|t| t == "script" || t == "style");
            if raw_parent {
                out.push_str(text);
            } else {
                escape_text(text, out);
            }
        },
        Some(NodeKind::Comment(text)) => {
            out.push_str("<!--");
            out.push_str(text);
            out.push_str("-->");
        },
        None => {},
    }
}
