//! Highlight mutator: wraps located spans in `<mark>` elements and reverts them.
//!
//! A pass always starts by unwrapping every mark of the previous pass, so a document
//! never carries more than one generation of marks. Within a pass, each target must be
//! located against a fresh scan (see [`HighlightPass::document`]).

use crate::dom::{slice_chars, Document, MutationError, NodeId, RAW_TEXT_ELEMENTS};
use crate::locator::Candidate;
use crate::textprep::{find_folded, fold};
use serde::Serialize;
use std::collections::HashMap;

pub const MARK_TAG: &str = "mark";
pub const MARK_CLASS: &str = "pagemark-highlight";
/// Attribute carrying the pass generation; also how stray marks are recognized.
pub const MARK_ATTR: &str = "data-pagemark";
pub const EMPHASIS_CLASS: &str = "pagemark-pulse";
pub const DEFAULT_PER_TERM_CAP: usize = 3;

/// Parents that must not receive element children, besides the raw-text elements.
const NO_MARKUP_CONTAINERS: &[&str] = &["textarea", "title", "option"];

/// True when `node` already sits inside a highlight mark.
pub fn inside_mark(doc: &Document, node: NodeId) -> bool {
    let mut cur = doc.parent(node);
    while let Some(p) = cur {
        if doc.attr(p, MARK_ATTR).is_some() {
            return true;
        }
        cur = doc.parent(p);
    }
    false
}

/// Where text of nodes detached by [`Highlighter::clear`] now lives.
#[derive(Debug, Default)]
struct Relocations(HashMap<NodeId, (NodeId, usize)>);

impl Relocations {
    fn record(&mut self, from: NodeId, into: NodeId, offset: usize) {
        self.0.insert(from, (into, offset));
    }

    /// Follow `node` through every unwrap and merge. Merges only append, so offsets add up.
    fn resolve(&self, c: &Candidate) -> Candidate {
        let (mut node, mut offset) = (c.node, c.offset);
        for _ in 0..=self.0.len() {
            match self.0.get(&node) {
                Some(&(into, shift)) => {
                    node = into;
                    offset += shift;
                }
                None => break,
            }
        }
        Candidate {
            node,
            offset,
            ..c.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WrapPath {
    Direct,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HighlightMark {
    pub node: NodeId,
    pub generation: u64,
    pub path: WrapPath,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyOutcome {
    pub matches_applied: usize,
    pub anchor: Option<HighlightMark>,
}

impl ApplyOutcome {
    pub fn success(&self) -> bool {
        self.matches_applied > 0
    }
}

/// Exclusive owner of the document's active marks.
#[derive(Debug, Default)]
pub struct Highlighter {
    marks: Vec<HighlightMark>,
    generation: u64,
    focus: Option<NodeId>,
    emphasized: Option<(NodeId, u64)>,
}

impl Highlighter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn marks(&self) -> &[HighlightMark] {
        &self.marks
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Node currently centered in the viewport.
    pub fn focus(&self) -> Option<NodeId> {
        self.focus
    }

    /// Unwrap every mark back into plain text. Returns how many marks were removed.
    pub fn clear(&mut self, doc: &mut Document) -> usize {
        self.unwrap_all(doc).0
    }

    fn unwrap_all(&mut self, doc: &mut Document) -> (usize, Relocations) {
        let mut moved = Relocations::default();
        let mut targets: Vec<NodeId> = self.marks.iter().map(|m| m.node).collect();
        targets.extend(
            doc.descendants(doc.root())
                .filter(|id| doc.attr(*id, MARK_ATTR).is_some()),
        );
        targets.sort();
        targets.dedup();

        let mut removed = 0usize;
        for mark in targets {
            if !doc.is_attached(mark) {
                continue;
            }
            let Some(parent) = doc.parent(mark) else {
                continue;
            };
            let mut inner = Vec::new();
            let mut at = 0usize;
            for d in doc.descendants(mark) {
                if let Some(t) = doc.text(d) {
                    inner.push((d, at));
                    at += t.chars().count();
                }
            }
            let text = doc.text_content(mark);
            let plain = doc.create_text(&text);
            match doc.replace_with(mark, &[plain]) {
                Ok(()) => {
                    for (d, at) in inner {
                        moved.record(d, plain, at);
                    }
                    for m in doc.normalize(parent) {
                        moved.record(m.from, m.into, m.offset);
                    }
                    removed += 1;
                }
                Err(e) => tracing::warn!(error = %e, "failed to unwrap highlight mark"),
            }
        }
        self.marks.clear();
        self.focus = None;
        self.emphasized = None;
        if removed > 0 {
            tracing::debug!(removed, "cleared highlight marks");
        }
        (removed, moved)
    }

    /// Clear the previous generation and start a new pass.
    ///
    /// Candidates located before this call still resolve: handles to text that the clear
    /// merged away are redirected to the surviving node.
    pub fn begin<'a>(&'a mut self, doc: &'a mut Document) -> HighlightPass<'a> {
        let (_, moved) = self.unwrap_all(doc);
        self.generation += 1;
        HighlightPass {
            hl: self,
            doc,
            moved,
            applied: 0,
            anchor: None,
        }
    }

    /// Single-target pass: clear, realize up to `per_term_cap` candidates, emphasize.
    /// `candidates` may come from a scan taken before the previous marks were cleared.
    pub fn apply(
        &mut self,
        doc: &mut Document,
        candidates: &[Candidate],
        per_term_cap: usize,
    ) -> ApplyOutcome {
        let mut pass = self.begin(doc);
        pass.apply(candidates, per_term_cap);
        pass.finish()
    }

    /// Drop the transient emphasis of `generation`; stale generations are ignored.
    pub fn revert_emphasis(&mut self, doc: &mut Document, generation: u64) -> bool {
        match self.emphasized {
            Some((node, g)) if g == generation => {
                doc.remove_class(node, EMPHASIS_CLASS);
                self.emphasized = None;
                true
            }
            _ => false,
        }
    }
}

pub struct HighlightPass<'a> {
    hl: &'a mut Highlighter,
    doc: &'a mut Document,
    moved: Relocations,
    applied: usize,
    anchor: Option<HighlightMark>,
}

impl HighlightPass<'_> {
    /// Current document state; scan this before locating the next target.
    pub fn document(&self) -> &Document {
        self.doc
    }

    pub fn generation(&self) -> u64 {
        self.hl.generation
    }

    /// Realize at most `cap` of one target's candidates (best first). Returns how many
    /// were realized; failures are logged and skipped.
    pub fn apply(&mut self, candidates: &[Candidate], cap: usize) -> usize {
        let resolved: Vec<Candidate> = candidates
            .iter()
            .take(cap)
            .map(|c| self.moved.resolve(c))
            .collect();
        let mut order: Vec<(usize, &Candidate)> = resolved.iter().enumerate().collect();
        // Later offsets first within a node: splitting keeps the prefix in the original
        // node, so pending offsets stay valid.
        order.sort_by(|a, b| {
            a.1.node
                .cmp(&b.1.node)
                .then_with(|| b.1.offset.cmp(&a.1.offset))
        });

        let mut realized: Vec<(usize, HighlightMark)> = Vec::new();
        for (rank, c) in order {
            match self.realize(c) {
                Ok(mark) => realized.push((rank, mark)),
                Err(e) => tracing::warn!(
                    error = %e,
                    matched = c.matched.as_str(),
                    "skipping candidate that could not be highlighted"
                ),
            }
        }
        realized.sort_by_key(|(rank, _)| *rank);
        if self.anchor.is_none() {
            self.anchor = realized.first().map(|(_, m)| *m);
        }
        let n = realized.len();
        self.applied += n;
        self.hl.marks.extend(realized.into_iter().map(|(_, m)| m));
        n
    }

    /// Emphasize and focus the anchor mark, and report the pass.
    pub fn finish(self) -> ApplyOutcome {
        let generation = self.hl.generation;
        if let Some(anchor) = self.anchor {
            self.doc.add_class(anchor.node, EMPHASIS_CLASS);
            self.hl.focus = Some(anchor.node);
            self.hl.emphasized = Some((anchor.node, generation));
        }
        tracing::debug!(
            generation,
            matches_applied = self.applied,
            "highlight pass finished"
        );
        ApplyOutcome {
            matches_applied: self.applied,
            anchor: self.anchor,
        }
    }

    fn realize(&mut self, c: &Candidate) -> Result<HighlightMark, MutationError> {
        let generation = self.hl.generation;
        match self.wrap_direct(c) {
            Ok(node) => Ok(HighlightMark {
                node,
                generation,
                path: WrapPath::Direct,
            }),
            Err(direct) => {
                tracing::debug!(error = %direct, "direct wrap not possible, splitting text node");
                let node = self.wrap_fallback(c)?;
                Ok(HighlightMark {
                    node,
                    generation,
                    path: WrapPath::Fallback,
                })
            }
        }
    }

    fn create_mark(&mut self) -> NodeId {
        let generation = self.hl.generation.to_string();
        self.doc.create_element(
            MARK_TAG,
            vec![
                ("class".to_string(), MARK_CLASS.to_string()),
                (MARK_ATTR.to_string(), generation),
            ],
        )
    }

    fn check_container(&self, node: NodeId) -> Result<(), MutationError> {
        if self.doc.kind(node).is_none() {
            return Err(MutationError::StaleHandle(node));
        }
        if self.doc.text(node).is_none() {
            return Err(MutationError::NotText(node));
        }
        let parent = self.doc.parent(node).ok_or(MutationError::Detached(node))?;
        if !self.doc.is_attached(node) {
            return Err(MutationError::Detached(node));
        }
        if inside_mark(self.doc, node) {
            return Err(MutationError::InsideMark(node));
        }
        match self.doc.tag_name(parent) {
            Some(tag)
                if NO_MARKUP_CONTAINERS.contains(&tag) || RAW_TEXT_ELEMENTS.contains(&tag) =>
            {
                Err(MutationError::DisallowedContainer(tag.to_string()))
            }
            Some(_) => Ok(()),
            None => Err(MutationError::DisallowedContainer("#document".to_string())),
        }
    }

    /// Wrap exactly `offset..offset + length` of the live node.
    fn wrap_direct(&mut self, c: &Candidate) -> Result<NodeId, MutationError> {
        self.check_container(c.node)?;
        let text = self.doc.text(c.node).ok_or(MutationError::NotText(c.node))?;
        let len = text.chars().count();
        let (start, end) = (c.offset, c.offset + c.length);
        if c.length == 0 || end > len {
            return Err(MutationError::OutOfRange { start, end, len });
        }
        if fold(slice_chars(text, start, end)) != fold(&c.matched) {
            return Err(MutationError::RangeMismatch);
        }

        let tail = self.doc.split_text(c.node, end)?;
        if self.doc.text(tail) == Some("") {
            self.doc.detach(tail);
        }
        let middle = self.doc.split_text(c.node, start)?;
        let mark = self.create_mark();
        self.doc.insert_before(middle, mark)?;
        self.doc.append_child(mark, middle)?;
        Ok(mark)
    }

    /// Re-anchor the matched text inside the live node and splice in before/mark/after.
    fn wrap_fallback(&mut self, c: &Candidate) -> Result<NodeId, MutationError> {
        self.check_container(c.node)?;
        let text = self
            .doc
            .text(c.node)
            .ok_or(MutationError::NotText(c.node))?
            .to_string();
        let needle = fold(&c.matched);
        let start = find_folded(&fold(&text), &needle).ok_or(MutationError::NotFound)?;
        let end = start + needle.len();
        let len = text.chars().count();

        let before = slice_chars(&text, 0, start).to_string();
        let middle = slice_chars(&text, start, end).to_string();
        let after = slice_chars(&text, end, len).to_string();

        let mark = self.create_mark();
        let inner = self.doc.create_text(&middle);
        self.doc.append_child(mark, inner)?;
        self.doc.set_text(c.node, &before)?;
        self.doc.insert_after(c.node, mark)?;
        if !after.is_empty() {
            let tail = self.doc.create_text(&after);
            self.doc.insert_after(mark, tail)?;
        }
        Ok(mark)
    }
}
