//! Term extraction: a few good search targets from a long retrieved fragment.

use crate::textprep::{norm_ws, strip_ellipses};

pub const DEFAULT_MAX_TERMS: usize = 5;

const MIN_TEXT_CHARS: usize = 5;
const SENTENCE_MIN: usize = 30;
const SENTENCE_MAX: usize = 80;
const SENTENCE_TERMS: usize = 2;
const WINDOW_WORDS: usize = 5;
const WINDOW_MIN: usize = 20;
const WINDOW_MAX: usize = 60;
const DISTINCTIVE_MIN: usize = 7;
const DISTINCTIVE_TERMS: usize = 3;
const PREFIX_CHARS: usize = 80;

/// Derive up to `max_terms` targets from `raw`, most self-contained first.
///
/// Sentences in a readable length range win; otherwise fixed 5-word windows, then
/// distinctive tokens, then a raw prefix.
pub fn extract_terms(raw: &str, max_terms: usize) -> Vec<String> {
    let text = norm_ws(strip_ellipses(raw));
    if max_terms == 0 || text.chars().count() < MIN_TEXT_CHARS {
        return Vec::new();
    }

    let mut terms = sentences(&text);
    if terms.is_empty() {
        terms = word_windows(&text, max_terms);
    }
    if terms.is_empty() {
        terms = distinctive_tokens(&text);
    }
    if terms.is_empty() {
        terms.push(text.chars().take(PREFIX_CHARS).collect());
    }
    terms.truncate(max_terms);
    tracing::debug!(terms = terms.len(), "extracted terms");
    terms
}

fn sentences(text: &str) -> Vec<String> {
    text.split(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| (SENTENCE_MIN..=SENTENCE_MAX).contains(&s.chars().count()))
        .take(SENTENCE_TERMS)
        .map(str::to_string)
        .collect()
}

fn word_windows(text: &str, budget: usize) -> Vec<String> {
    let words: Vec<&str> = text.split(' ').collect();
    let mut out = Vec::new();
    for chunk in words.chunks(WINDOW_WORDS) {
        if out.len() >= budget {
            break;
        }
        let window = chunk.join(" ");
        if (WINDOW_MIN..=WINDOW_MAX).contains(&window.chars().count()) {
            out.push(window);
        }
    }
    out
}

fn is_distinctive(token: &str) -> bool {
    if token.chars().count() < DISTINCTIVE_MIN {
        return false;
    }
    let upper = token.chars().any(char::is_uppercase);
    let lower = token.chars().any(char::is_lowercase);
    let digit = token.chars().any(|c| c.is_ascii_digit());
    let punct = token.chars().any(|c| c.is_ascii_punctuation());
    (upper && lower) || digit || punct
}

fn distinctive_tokens(text: &str) -> Vec<String> {
    text.split(' ')
        .filter(|t| is_distinctive(t))
        .take(DISTINCTIVE_TERMS)
        .map(str::to_string)
        .collect()
}
