//! Text corpus scanner: the searchable text units of a document.

use crate::dom::{Document, NodeId, RAW_TEXT_ELEMENTS};
use serde::Serialize;

/// Containers whose text is never rendered as page content. Raw-text elements are
/// skipped as well.
const EXCLUDED_CONTAINERS: &[&str] = &["template", "head", "title", "meta", "link", "object"];

/// Minimum trimmed length (exclusive) for a text node to be searchable.
const MIN_UNIT_CHARS: usize = 3;

#[derive(Debug, Clone, Serialize)]
pub struct TextUnit {
    /// Handle valid only until the next mutation of the document.
    pub node: NodeId,
    pub content: String,
    /// Tag of the nearest element ancestor.
    pub container: String,
}

/// Scan `doc` for text units in document order.
///
/// Pure: re-running on an unmutated document yields the same units.
pub fn scan(doc: &Document) -> Vec<TextUnit> {
    let mut out = Vec::new();
    for id in doc.descendants(doc.root()) {
        let Some(text) = doc.text(id) else {
            continue;
        };
        if text.trim().chars().count() <= MIN_UNIT_CHARS {
            continue;
        }
        let container = doc
            .nearest_element_ancestor(id)
            .and_then(|p| doc.tag_name(p))
            .unwrap_or("")
            .to_string();
        if EXCLUDED_CONTAINERS.contains(&container.as_str())
            || RAW_TEXT_ELEMENTS.contains(&container.as_str())
        {
            continue;
        }
        out.push(TextUnit {
            node: id,
            content: text.to_string(),
            container,
        });
    }
    tracing::debug!(units = out.len(), "scanned document");
    out
}

/// Visible page text: units joined by newlines.
pub fn page_text(doc: &Document) -> String {
    scan(doc)
        .iter()
        .map(|u| u.content.trim())
        .collect::<Vec<_>>()
        .join("\n")
}
