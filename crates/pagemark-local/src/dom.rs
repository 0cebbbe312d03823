//! Arena document model.
//!
//! Pages are parsed with `scraper` and copied into a flat arena so the highlighter can
//! split, wrap and unwrap text nodes. A `NodeId` stays valid as an index forever, but a
//! node that has been detached is no longer reachable from the root; callers must treat
//! handles from an earlier scan as stale once the tree has been mutated.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Root,
    Element {
        name: String,
        attrs: Vec<(String, String)>,
    },
    Text(String),
    Comment(String),
}

#[derive(Debug, Clone)]
struct Node {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    kind: NodeKind,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
    #[error("stale node handle {0:?}")]
    StaleHandle(NodeId),
    #[error("node {0:?} is detached from the document")]
    Detached(NodeId),
    #[error("node {0:?} is not a text node")]
    NotText(NodeId),
    #[error("range {start}..{end} is outside a text of {len} chars")]
    OutOfRange { start: usize, end: usize, len: usize },
    #[error("live text does not match the located span")]
    RangeMismatch,
    #[error("<{0}> does not accept markup")]
    DisallowedContainer(String),
    #[error("node {0:?} is already inside a highlight mark")]
    InsideMark(NodeId),
    #[error("matched text not found in live node")]
    NotFound,
}

impl From<MutationError> for pagemark_core::Error {
    fn from(e: MutationError) -> Self {
        pagemark_core::Error::Mutation(e.to_string())
    }
}

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

/// Elements whose text html5ever parses verbatim (scripting enabled), so it must be
/// written back unescaped.
pub const RAW_TEXT_ELEMENTS: &[&str] = &[
    "style", "script", "xmp", "iframe", "noembed", "noframes", "plaintext", "noscript",
];

/// A text node absorbed by [`Document::normalize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextMerge {
    pub from: NodeId,
    pub into: NodeId,
    /// Char offset in `into` where the text of `from` now starts.
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Node>,
    root: NodeId,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                parent: None,
                children: Vec::new(),
                kind: NodeKind::Root,
            }],
            root: NodeId(0),
        }
    }

    /// Parse a full HTML document (html5ever error recovery applies).
    pub fn parse_html(html: &str) -> Self {
        let parsed = html_scraper::Html::parse_document(html);
        let mut doc = Self::new();
        let root = doc.root;
        doc.import_element(parsed.root_element(), root);
        doc
    }

    fn import_element(&mut self, el: html_scraper::ElementRef<'_>, parent: NodeId) {
        let attrs = el
            .value()
            .attrs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let id = self.create_element(el.value().name(), attrs);
        self.push_child(parent, id);
        for child in el.children() {
            match child.value() {
                html_scraper::Node::Text(t) => {
                    let tid = self.create_text(t);
                    self.push_child(id, tid);
                }
                html_scraper::Node::Comment(c) => {
                    let cid = self.push_node(NodeKind::Comment(c.to_string()));
                    self.push_child(id, cid);
                }
                html_scraper::Node::Element(_) => {
                    if let Some(child_el) = html_scraper::ElementRef::wrap(child) {
                        self.import_element(child_el, id);
                    }
                }
                _ => {}
            }
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Allocated node slots. Detached nodes keep theirs, so this never shrinks.
    pub fn arena_len(&self) -> usize {
        self.nodes.len()
    }

    /// True when nothing is attached under the root.
    pub fn is_empty(&self) -> bool {
        self.nodes[self.root.0].children.is_empty()
    }

    /// First `<body>` element, if the document has one.
    pub fn body(&self) -> Option<NodeId> {
        self.descendants(self.root)
            .find(|id| self.tag_name(*id) == Some("body"))
    }

    fn node(&self, id: NodeId) -> Result<&Node, MutationError> {
        self.nodes.get(id.0).ok_or(MutationError::StaleHandle(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, MutationError> {
        self.nodes.get_mut(id.0).ok_or(MutationError::StaleHandle(id))
    }

    pub fn kind(&self, id: NodeId) -> Option<&NodeKind> {
        self.nodes.get(id.0).map(|n| &n.kind)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id.0).and_then(|n| n.parent)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.nodes
            .get(id.0)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn tag_name(&self, id: NodeId) -> Option<&str> {
        match self.kind(id)? {
            NodeKind::Element { name, .. } => Some(name.as_str()),
            _ => None,
        }
    }

    /// Content of a text node.
    pub fn text(&self, id: NodeId) -> Option<&str> {
        match self.kind(id)? {
            NodeKind::Text(t) => Some(t.as_str()),
            _ => None,
        }
    }

    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        match self.kind(id)? {
            NodeKind::Element { attrs, .. } => attrs
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }

    pub fn set_attr(&mut self, id: NodeId, name: &str, value: &str) {
        if let Some(Node {
            kind: NodeKind::Element { attrs, .. },
            ..
        }) = self.nodes.get_mut(id.0)
        {
            match attrs.iter_mut().find(|(k, _)| k == name) {
                Some(slot) => slot.1 = value.to_string(),
                None => attrs.push((name.to_string(), value.to_string())),
            }
        }
    }

    pub fn remove_attr(&mut self, id: NodeId, name: &str) {
        if let Some(Node {
            kind: NodeKind::Element { attrs, .. },
            ..
        }) = self.nodes.get_mut(id.0)
        {
            attrs.retain(|(k, _)| k != name);
        }
    }

    pub fn has_class(&self, id: NodeId, class: &str) -> bool {
        self.attr(id, "class")
            .map(|c| c.split_whitespace().any(|x| x == class))
            .unwrap_or(false)
    }

    pub fn add_class(&mut self, id: NodeId, class: &str) {
        if self.tag_name(id).is_none() || self.has_class(id, class) {
            return;
        }
        let next = match self.attr(id, "class") {
            Some(c) if !c.trim().is_empty() => format!("{} {class}", c.trim()),
            _ => class.to_string(),
        };
        self.set_attr(id, "class", &next);
    }

    pub fn remove_class(&mut self, id: NodeId, class: &str) {
        let Some(c) = self.attr(id, "class") else {
            return;
        };
        let next = c
            .split_whitespace()
            .filter(|x| *x != class)
            .collect::<Vec<_>>()
            .join(" ");
        if next.is_empty() {
            self.remove_attr(id, "class");
        } else {
            self.set_attr(id, "class", &next);
        }
    }

    /// True when `id` is reachable from the document root.
    pub fn is_attached(&self, id: NodeId) -> bool {
        let mut cur = id;
        loop {
            if cur == self.root {
                return true;
            }
            match self.parent(cur) {
                Some(p) => cur = p,
                None => return false,
            }
        }
    }

    /// Pre-order descendants of `id` (excluding `id`).
    pub fn descendants(&self, id: NodeId) -> Descendants<'_> {
        let mut stack = self.children(id).to_vec();
        stack.reverse();
        Descendants { doc: self, stack }
    }

    pub fn nearest_element_ancestor(&self, id: NodeId) -> Option<NodeId> {
        let mut cur = self.parent(id)?;
        loop {
            if self.tag_name(cur).is_some() {
                return Some(cur);
            }
            cur = self.parent(cur)?;
        }
    }

    /// Concatenated text of all descendant text nodes.
    pub fn text_content(&self, id: NodeId) -> String {
        if let Some(t) = self.text(id) {
            return t.to_string();
        }
        let mut out = String::new();
        for d in self.descendants(id) {
            if let Some(t) = self.text(d) {
                out.push_str(t);
            }
        }
        out
    }

    fn push_node(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            parent: None,
            children: Vec::new(),
            kind,
        });
        id
    }

    fn push_child(&mut self, parent: NodeId, child: NodeId) {
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.push(child);
    }

    /// New detached element.
    pub fn create_element(&mut self, name: &str, attrs: Vec<(String, String)>) -> NodeId {
        self.push_node(NodeKind::Element {
            name: name.to_ascii_lowercase(),
            attrs,
        })
    }

    /// New detached text node.
    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.push_node(NodeKind::Text(text.to_string()))
    }

    pub fn set_text(&mut self, id: NodeId, text: &str) -> Result<(), MutationError> {
        match &mut self.node_mut(id)?.kind {
            NodeKind::Text(t) => {
                *t = text.to_string();
                Ok(())
            }
            _ => Err(MutationError::NotText(id)),
        }
    }

    /// Remove `id` from its parent (no-op when already detached).
    pub fn detach(&mut self, id: NodeId) {
        let Some(parent) = self.parent(id) else {
            return;
        };
        self.nodes[parent.0].children.retain(|c| *c != id);
        self.nodes[id.0].parent = None;
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), MutationError> {
        self.node(parent)?;
        self.node(child)?;
        self.detach(child);
        self.push_child(parent, child);
        Ok(())
    }

    fn insert_at_offset(
        &mut self,
        reference: NodeId,
        new: NodeId,
        after: bool,
    ) -> Result<(), MutationError> {
        self.node(new)?;
        let parent = self.node(reference)?.parent.ok_or(MutationError::Detached(reference))?;
        self.detach(new);
        let siblings = &mut self.nodes[parent.0].children;
        let pos = siblings
            .iter()
            .position(|c| *c == reference)
            .ok_or(MutationError::Detached(reference))?;
        siblings.insert(if after { pos + 1 } else { pos }, new);
        self.nodes[new.0].parent = Some(parent);
        Ok(())
    }

    pub fn insert_before(&mut self, reference: NodeId, new: NodeId) -> Result<(), MutationError> {
        self.insert_at_offset(reference, new, false)
    }

    pub fn insert_after(&mut self, reference: NodeId, new: NodeId) -> Result<(), MutationError> {
        self.insert_at_offset(reference, new, true)
    }

    /// Replace `old` with `replacements` (in order) under the same parent.
    pub fn replace_with(
        &mut self,
        old: NodeId,
        replacements: &[NodeId],
    ) -> Result<(), MutationError> {
        let parent = self.node(old)?.parent.ok_or(MutationError::Detached(old))?;
        for r in replacements {
            self.node(*r)?;
            self.detach(*r);
        }
        let pos = self.nodes[parent.0]
            .children
            .iter()
            .position(|c| *c == old)
            .ok_or(MutationError::Detached(old))?;
        let siblings = &mut self.nodes[parent.0].children;
        siblings.remove(pos);
        for (i, r) in replacements.iter().enumerate() {
            siblings.insert(pos + i, *r);
        }
        for r in replacements {
            self.nodes[r.0].parent = Some(parent);
        }
        self.nodes[old.0].parent = None;
        Ok(())
    }

    /// Split a text node at a char offset.
    ///
    /// `id` keeps the prefix; the returned node holds the suffix and is inserted right after
    /// `id` when `id` is attached.
    pub fn split_text(&mut self, id: NodeId, at_char: usize) -> Result<NodeId, MutationError> {
        let text = self.text(id).ok_or(MutationError::NotText(id))?.to_string();
        let len = text.chars().count();
        if at_char > len {
            return Err(MutationError::OutOfRange {
                start: at_char,
                end: at_char,
                len,
            });
        }
        let byte = char_to_byte(&text, at_char);
        let (head, tail) = text.split_at(byte);
        let tail_id = self.create_text(tail);
        self.set_text(id, head)?;
        if self.parent(id).is_some() {
            self.insert_after(id, tail_id)?;
        }
        Ok(tail_id)
    }

    /// Merge adjacent text children of `id` and drop empty text children.
    ///
    /// Merged text is appended to the earlier node, so existing offsets into it stay
    /// valid; each absorbed node is reported with the char offset it landed at.
    pub fn normalize(&mut self, id: NodeId) -> Vec<TextMerge> {
        let children = self.children(id).to_vec();
        let mut kept: Vec<NodeId> = Vec::with_capacity(children.len());
        let mut merges = Vec::new();
        for c in children {
            let Some(t) = self.text(c).map(str::to_string) else {
                kept.push(c);
                continue;
            };
            if t.is_empty() {
                self.nodes[c.0].parent = None;
                continue;
            }
            match kept.last().copied() {
                Some(prev) if self.text(prev).is_some() => {
                    if let NodeKind::Text(p) = &mut self.nodes[prev.0].kind {
                        merges.push(TextMerge {
                            from: c,
                            into: prev,
                            offset: p.chars().count(),
                        });
                        p.push_str(&t);
                    }
                    self.nodes[c.0].parent = None;
                }
                _ => kept.push(c),
            }
        }
        self.nodes[id.0].children = kept;
        merges
    }

    /// Serialize the whole document.
    pub fn to_html(&self) -> String {
        let mut out = String::from("<!DOCTYPE html>");
        for c in self.children(self.root) {
            self.write_node(*c, &mut out);
        }
        out
    }

    fn write_node(&self, id: NodeId, out: &mut String) {
        let Some(kind) = self.kind(id) else {
            return;
        };
        match kind {
            NodeKind::Root => {
                for c in self.children(id) {
                    self.write_node(*c, out);
                }
            }
            NodeKind::Element { name, attrs } => {
                out.push('<');
                out.push_str(name);
                for (k, v) in attrs {
                    out.push(' ');
                    out.push_str(k);
                    out.push_str("=\"");
                    escape_into(v, true, out);
                    out.push('"');
                }
                out.push('>');
                if VOID_ELEMENTS.contains(&name.as_str()) {
                    return;
                }
                for c in self.children(id) {
                    self.write_node(*c, out);
                }
                out.push_str("</");
                out.push_str(name);
                out.push('>');
            }
            NodeKind::Text(t) => {
                let raw = self
                    .parent(id)
                    .and_then(|p| self.tag_name(p))
                    .map(|n| RAW_TEXT_ELEMENTS.contains(&n))
                    .unwrap_or(false);
                if raw {
                    out.push_str(t);
                } else {
                    escape_into(t, false, out);
                }
            }
            NodeKind::Comment(c) => {
                out.push_str("<!--");
                out.push_str(c);
                out.push_str("-->");
            }
        }
    }
}

pub struct Descendants<'a> {
    doc: &'a Document,
    stack: Vec<NodeId>,
}

impl Iterator for Descendants<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.stack.pop()?;
        self.stack
            .extend(self.doc.children(id).iter().rev().copied());
        Some(id)
    }
}

fn escape_into(s: &str, attr: bool, out: &mut String) {
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' if !attr => out.push_str("&lt;"),
            '>' if !attr => out.push_str("&gt;"),
            '"' if attr => out.push_str("&quot;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            _ => out.push(ch),
        }
    }
}

/// Byte index of the `char_idx`-th char (or `s.len()` past the end).
pub fn char_to_byte(s: &str, char_idx: usize) -> usize {
    s.char_indices()
        .nth(char_idx)
        .map(|(b, _)| b)
        .unwrap_or(s.len())
}

/// Substring by char offsets; out-of-range bounds are clamped.
pub fn slice_chars(s: &str, start: usize, end: usize) -> &str {
    let end = end.max(start);
    let a = char_to_byte(s, start);
    let b = char_to_byte(s, end);
    &s[a..b]
}
