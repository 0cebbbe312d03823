//! Minimal, deterministic text normalization helpers.
//!
//! Matching is case-insensitive but must report offsets into the original text, so
//! folding is strictly char-for-char: every char maps to exactly one folded char.

/// Lowercase one char, keeping only the first char of multi-char lowercase forms.
pub fn fold_char(c: char) -> char {
    c.to_lowercase().next().unwrap_or(c)
}

/// Char-aligned lowercase copy of `s`.
pub fn fold(s: &str) -> Vec<char> {
    s.chars().map(fold_char).collect()
}

/// Collapse all whitespace runs to single spaces and trim.
pub fn norm_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Char offset of the first case-insensitive occurrence of `needle` in `haystack`.
pub fn find_folded(haystack: &[char], needle: &[char]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// All non-overlapping case-insensitive occurrences, as char offsets.
pub fn find_all_folded(haystack: &[char], needle: &[char]) -> Vec<usize> {
    let mut out = Vec::new();
    if needle.is_empty() {
        return out;
    }
    let mut from = 0usize;
    while from + needle.len() <= haystack.len() {
        match find_folded(&haystack[from..], needle) {
            Some(rel) => {
                out.push(from + rel);
                from += rel + needle.len();
            }
            None => break,
        }
    }
    out
}

/// Leading/trailing ellipsis markers added by snippet generation.
pub fn strip_ellipses(s: &str) -> &str {
    let mut t = s.trim();
    loop {
        let before = t.len();
        t = t
            .trim_start_matches("...")
            .trim_start_matches('…')
            .trim_end_matches("...")
            .trim_end_matches('…')
            .trim();
        if t.len() == before {
            return t;
        }
    }
}
