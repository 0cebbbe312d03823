//! Retrieval-side helpers: highlight positions, snippets, and page privacy checks.

use crate::dom::slice_chars;
use crate::textprep::{find_all_folded, fold, norm_ws};
use pagemark_core::{HighlightPosition, RetrievalResult};

const SNIPPET_BEFORE: usize = 100;
const SNIPPET_AFTER: usize = 150;
const SNIPPET_HEAD: usize = 200;
const ELLIPSIS: &str = "...";

const TERM_PUNCT: &[char] = &[
    ',', '.', '?', '!', ':', ';', '\'', '"', '-', '(', ')', '[', ']', '{', '}',
];

/// Host/path fragments of pages whose text must never leave the page.
const CONFIDENTIAL_MARKERS: &[&str] = &[
    "mail.google.com",
    "web.whatsapp.com",
    "drive.google.com",
    "docs.google.com",
    "sheets.google.com",
    "calendar.google.com",
    "meet.google.com",
    "outlook.live.com",
    "outlook.office.com",
    "web.telegram.org",
    "app.slack.com",
    "discord.com",
    "teams.microsoft.com",
    "banking",
    "account",
    "signin",
    "login",
    "paypal.com",
    "myaccount",
    "checkout",
];

const BOILERPLATE: &[&str] = &["skip to content", "navigation", "search", "menu"];

/// Query words worth highlighting: lowercased, edge punctuation stripped, longer than 2.
pub fn query_terms(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split_whitespace()
        .map(|t| t.trim_matches(TERM_PUNCT))
        .filter(|t| t.chars().count() > 2)
        .map(str::to_string)
        .collect()
}

/// Every case-insensitive occurrence of each term, ordered by start (char offsets).
pub fn find_highlight_positions(content: &str, terms: &[String]) -> Vec<HighlightPosition> {
    let hay = fold(content);
    let mut out = Vec::new();
    for term in terms {
        let needle = fold(term);
        for start in find_all_folded(&hay, &needle) {
            out.push(HighlightPosition {
                term: term.clone(),
                start: Some(start),
                end: Some(start + needle.len()),
            });
        }
    }
    out.sort_by_key(|p| p.start);
    out
}

/// Context window around the first position, or the head of the content.
pub fn make_snippet(content: &str, positions: &[HighlightPosition]) -> String {
    let len = content.chars().count();
    match positions.first().and_then(|p| p.start) {
        Some(first) => {
            let start = first.saturating_sub(SNIPPET_BEFORE);
            let end = (first + SNIPPET_AFTER).min(len);
            let mut s = String::new();
            if start > 0 {
                s.push_str(ELLIPSIS);
            }
            s.push_str(slice_chars(content, start, end));
            if end < len {
                s.push_str(ELLIPSIS);
            }
            s
        }
        None => {
            let mut s = slice_chars(content, 0, SNIPPET_HEAD).to_string();
            if len > SNIPPET_HEAD {
                s.push_str(ELLIPSIS);
            }
            s
        }
    }
}

/// Rank by score and attach positions and snippets for the query.
pub fn prepare_results(query: &str, mut results: Vec<RetrievalResult>) -> Vec<RetrievalResult> {
    let terms = query_terms(query);
    results.sort_by(|a, b| {
        b.score
            .unwrap_or(0.0)
            .total_cmp(&a.score.unwrap_or(0.0))
    });
    for r in &mut results {
        let positions = find_highlight_positions(&r.content, &terms);
        r.snippet = Some(make_snippet(&r.content, &positions));
        r.highlight_positions = Some(positions);
    }
    results
}

/// Unparsable URLs count as confidential.
pub fn is_confidential_url(url: &str) -> bool {
    let Ok(parsed) = url::Url::parse(url.trim()) else {
        tracing::warn!(url, "treating unparsable url as confidential");
        return true;
    };
    let host = parsed.host_str().unwrap_or("").to_lowercase();
    let path = parsed.path().to_lowercase();
    CONFIDENTIAL_MARKERS
        .iter()
        .any(|m| host.contains(m) || path.contains(m))
}

/// Collapse whitespace and drop navigation boilerplate words.
pub fn clean_content(text: &str) -> String {
    let mut folded = fold(text);
    let mut out: Vec<char> = text.chars().collect();
    for word in BOILERPLATE {
        let needle: Vec<char> = word.chars().collect();
        for start in find_all_folded(&folded, &needle) {
            let end = start + needle.len();
            out[start..end].fill(' ');
            folded[start..end].fill(' ');
        }
    }
    norm_ws(&out.into_iter().collect::<String>())
}
