//! Tiered fuzzy locator.
//!
//! Strategies run from most to least precise: exact substring, keyword, 3-word phrase,
//! character shingle. A tier runs only when every earlier tier came back empty, so the
//! result list never mixes tiers.

use crate::dom::{slice_chars, NodeId};
use crate::scanner::TextUnit;
use crate::textprep::{find_folded, fold};
use pagemark_core::{Target, Tier};
use serde::Serialize;
use std::collections::BTreeSet;

pub const MAX_CANDIDATES: usize = 5;

const EXACT_BOOST: usize = 3;
const KEYWORD_MIN_CHARS: usize = 4;
const PHRASE_MIN_TARGET_CHARS: usize = 16;
const PHRASE_MIN_CHUNK_CHARS: usize = 15;
const PHRASE_WORDS: usize = 3;
const PHRASE_MIN_WINDOW_CHARS: usize = 12;
const SHINGLE_MIN_TARGET_CHARS: usize = 21;
const SHINGLE_ANCHOR_CHARS: usize = 20;
const SHINGLE_MAX_WINDOW_CHARS: usize = 15;
const SHINGLE_STEP: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    /// Index into the scan that produced this candidate.
    pub unit: usize,
    pub node: NodeId,
    /// Char offset into the unit content.
    pub offset: usize,
    /// Length in chars.
    pub length: usize,
    /// The unit's own text at `offset..offset + length` (original casing).
    pub matched: String,
    pub tier: Tier,
    pub score: usize,
}

/// Case-folded view over one scan's text units.
pub struct Corpus<'a> {
    units: &'a [TextUnit],
    folded: Vec<Vec<char>>,
}

impl<'a> Corpus<'a> {
    pub fn new(units: &'a [TextUnit]) -> Self {
        Self {
            units,
            folded: units.iter().map(|u| fold(&u.content)).collect(),
        }
    }

    fn candidate(
        &self,
        unit: usize,
        offset: usize,
        length: usize,
        tier: Tier,
        score: usize,
    ) -> Candidate {
        let u = &self.units[unit];
        Candidate {
            unit,
            node: u.node,
            offset,
            length,
            matched: slice_chars(&u.content, offset, offset + length).to_string(),
            tier,
            score,
        }
    }

    /// Run a single strategy.
    pub fn run(&self, tier: Tier, target: &Target) -> Vec<Candidate> {
        match tier {
            Tier::Exact => self.exact(target),
            Tier::Keyword => self.keywords(target),
            Tier::Phrase => self.phrases(target),
            Tier::Shingle => self.shingles(target),
        }
    }

    /// Tier 1: the whole target, case-insensitively.
    pub fn exact(&self, target: &Target) -> Vec<Candidate> {
        let needle = fold(target.as_str());
        let len = needle.len();
        self.folded
            .iter()
            .enumerate()
            .filter_map(|(i, hay)| {
                let off = find_folded(hay, &needle)?;
                Some(self.candidate(i, off, len, Tier::Exact, len * EXACT_BOOST))
            })
            .collect()
    }

    /// Tier 2: individual keywords (tokens longer than 3 chars, else the whole target).
    pub fn keywords(&self, target: &Target) -> Vec<Candidate> {
        let mut seen = BTreeSet::new();
        let mut tokens: Vec<Vec<char>> = target
            .as_str()
            .split_whitespace()
            .filter(|t| t.chars().count() >= KEYWORD_MIN_CHARS)
            .map(fold)
            .filter(|t| seen.insert(t.clone()))
            .collect();
        if tokens.is_empty() {
            tokens.push(fold(target.as_str()));
        }

        let mut out = Vec::new();
        for (i, hay) in self.folded.iter().enumerate() {
            for tok in &tokens {
                if let Some(off) = find_folded(hay, tok) {
                    out.push(self.candidate(i, off, tok.len(), Tier::Keyword, tok.len()));
                }
            }
        }
        out
    }

    /// Tier 3: 3-word windows from sentence-sized chunks; first hit per unit wins.
    pub fn phrases(&self, target: &Target) -> Vec<Candidate> {
        if target.char_len() < PHRASE_MIN_TARGET_CHARS {
            return Vec::new();
        }
        let mut windows: Vec<Vec<char>> = Vec::new();
        for chunk in target.as_str().split(['.', '!', '?']) {
            let chunk = chunk.trim();
            if chunk.chars().count() < PHRASE_MIN_CHUNK_CHARS {
                continue;
            }
            let words: Vec<&str> = chunk.split_whitespace().collect();
            for w in words.windows(PHRASE_WORDS) {
                let phrase = w.join(" ");
                if phrase.chars().count() < PHRASE_MIN_WINDOW_CHARS {
                    continue;
                }
                windows.push(fold(&phrase));
            }
        }

        let mut out = Vec::new();
        for (i, hay) in self.folded.iter().enumerate() {
            for w in &windows {
                if let Some(off) = find_folded(hay, w) {
                    out.push(self.candidate(i, off, w.len(), Tier::Phrase, w.len()));
                    break;
                }
            }
        }
        out
    }

    /// Tier 4: fixed-length character windows from three anchors of the target.
    pub fn shingles(&self, target: &Target) -> Vec<Candidate> {
        let chars = fold(target.as_str());
        let len = chars.len();
        if len < SHINGLE_MIN_TARGET_CHARS {
            return Vec::new();
        }
        let min_len = SHINGLE_MAX_WINDOW_CHARS.min(len * 3 / 10);
        if min_len == 0 {
            return Vec::new();
        }

        let center = (len / 2).saturating_sub(SHINGLE_ANCHOR_CHARS / 2);
        let anchors = [
            (0, SHINGLE_ANCHOR_CHARS.min(len)),
            (center, (center + SHINGLE_ANCHOR_CHARS).min(len)),
            (len.saturating_sub(SHINGLE_ANCHOR_CHARS), len),
        ];

        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for (a_start, a_end) in anchors {
            let anchor = &chars[a_start..a_end];
            let mut i = 0usize;
            while i + min_len <= anchor.len() {
                let window = &anchor[i..i + min_len];
                i += SHINGLE_STEP;
                if window.iter().all(|c| c.is_whitespace()) {
                    continue;
                }
                for (u, hay) in self.folded.iter().enumerate() {
                    if let Some(off) = find_folded(hay, window) {
                        if seen.insert((u, off, min_len)) {
                            out.push(self.candidate(u, off, min_len, Tier::Shingle, min_len));
                        }
                    }
                }
            }
        }
        out
    }
}

/// Tier ascending, then score descending, then document order.
pub fn rank_candidates(cands: &mut [Candidate]) {
    cands.sort_by(|a, b| {
        a.tier
            .cmp(&b.tier)
            .then_with(|| b.score.cmp(&a.score))
            .then_with(|| a.unit.cmp(&b.unit))
            .then_with(|| a.offset.cmp(&b.offset))
    });
}

/// Best occurrences of `target` in `units`, best first, at most [`MAX_CANDIDATES`].
///
/// Invalid targets (shorter than 3 chars after trimming) yield an empty list.
pub fn locate(target: &str, units: &[TextUnit]) -> Vec<Candidate> {
    let Some(target) = Target::parse(target) else {
        return Vec::new();
    };
    if units.is_empty() {
        return Vec::new();
    }
    let corpus = Corpus::new(units);
    for tier in [Tier::Exact, Tier::Keyword, Tier::Phrase, Tier::Shingle] {
        let mut found = corpus.run(tier, &target);
        if found.is_empty() {
            continue;
        }
        rank_candidates(&mut found);
        found.truncate(MAX_CANDIDATES);
        tracing::debug!(
            target = target.as_str(),
            tier = ?found[0].tier,
            candidates = found.len(),
            "located target"
        );
        return found;
    }
    tracing::debug!(target = target.as_str(), "no tier matched");
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::Document;
    use crate::scanner::scan;
    use proptest::prelude::*;

    fn units_of(texts: &[&str]) -> Vec<TextUnit> {
        let html = texts
            .iter()
            .map(|t| format!("<p>{t}</p>"))
            .collect::<String>();
        scan(&Document::parse_html(&html))
    }

    #[test]
    fn exact_match_scenario_brown_fox() {
        let units = units_of(&["The quick brown fox jumps over the lazy dog"]);
        let c = locate("brown fox", &units);
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].tier, Tier::Exact);
        assert_eq!(c[0].matched, "brown fox");
        assert_eq!(c[0].offset, 10);
        assert_eq!(c[0].length, 9);
        assert_eq!(c[0].score, 27);
    }

    #[test]
    fn exact_match_is_case_insensitive_and_keeps_original_casing() {
        let units = units_of(&["Rust Ownership Rules explained"]);
        let c = locate("ownership rules", &units);
        assert_eq!(c[0].tier, Tier::Exact);
        assert_eq!(c[0].matched, "Ownership Rules");
    }

    #[test]
    fn short_or_empty_target_is_empty() {
        let units = units_of(&["abc abc abc"]);
        assert!(locate("ab", &units).is_empty());
        assert!(locate("   a  ", &units).is_empty());
        assert!(locate("", &units).is_empty());
        assert!(locate("abc", &[]).is_empty());
    }

    #[test]
    fn keyword_tier_scores_by_token_length() {
        let units = units_of(&["Compilers translate programs", "An interpreter runs them"]);
        let c = locate("compilers and interpreter differences", &units);
        assert!(c.iter().all(|x| x.tier == Tier::Keyword));
        assert_eq!(c[0].matched, "interpreter");
        assert_eq!(c[0].score, 11);
        assert_eq!(c[1].matched, "Compilers");
    }

    #[test]
    fn keyword_tier_falls_back_to_whole_short_target() {
        let units = units_of(&["the cat sat on a mat"]);
        let c = Corpus::new(&units).keywords(&Target::parse("cat").unwrap());
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].matched, "cat");
    }

    #[test]
    fn phrase_tier_hits_when_exact_and_keywords_miss() {
        // Keywords glued to sentence terminators never match alone; the middle chunk does.
        let target = "Preamble words never appear anywhere in this corpus.rivers run deeper.Closing remarks are absent too";
        assert!(target.chars().count() > 90);
        let units = units_of(&["The rivers run deeper than you think"]);
        let corpus = Corpus::new(&units);
        let t = Target::parse(target).unwrap();
        assert!(corpus.exact(&t).is_empty());
        assert!(corpus.keywords(&t).is_empty());

        let c = locate(target, &units);
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].tier, Tier::Phrase);
        assert_eq!(c[0].matched, "rivers run deeper");
        assert_eq!(c[0].offset, 4);
        assert_eq!(c[0].score, 17);
    }

    #[test]
    fn phrase_tier_stops_at_first_hit_per_unit() {
        let units = units_of(&["alpha beta gamma delta epsilon zeta"]);
        let c = Corpus::new(&units).phrases(&Target::parse("alpha beta gamma delta epsilon").unwrap());
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].matched, "alpha beta gamma");
    }

    #[test]
    fn phrase_tier_requires_long_target() {
        let units = units_of(&["one two three"]);
        assert!(Corpus::new(&units)
            .phrases(&Target::parse("one two three").unwrap())
            .is_empty());
    }

    #[test]
    fn shingle_tier_recovers_single_long_token() {
        let units = units_of(&["Support for internationalization was added"]);
        let c = locate("xxinternationalizationyy", &units);
        assert!(!c.is_empty());
        assert!(c.iter().all(|x| x.tier == Tier::Shingle));
        // min window = min(15, 30% of 24) = 7
        assert!(c.iter().all(|x| x.length == 7 && x.score == 7));
        assert!(c.len() <= MAX_CANDIDATES);
    }

    #[test]
    fn absent_target_runs_every_tier_and_returns_empty() {
        let target = "zzzqqq not present anywhere";
        let units = units_of(&["The quick brown fox jumps over the lazy dog", "Lorem ipsum dolor sit amet"]);
        let corpus = Corpus::new(&units);
        let t = Target::parse(target).unwrap();
        assert!(corpus.exact(&t).is_empty());
        assert!(corpus.keywords(&t).is_empty());
        assert!(corpus.phrases(&t).is_empty());
        assert!(corpus.shingles(&t).is_empty());
        assert!(locate(target, &units).is_empty());
    }

    #[test]
    fn results_are_capped_at_five() {
        let texts = vec!["the answer is here"; 8];
        let units = units_of(&texts);
        let c = locate("answer", &units);
        assert_eq!(c.len(), MAX_CANDIDATES);
        assert_eq!(c.iter().map(|x| x.unit).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn exact_tier_outranks_higher_scores_in_lower_tiers() {
        let n = Document::new().root();
        let mk = |tier, score| Candidate {
            unit: 0,
            node: n,
            offset: 0,
            length: 1,
            matched: "x".to_string(),
            tier,
            score,
        };
        let mut v = vec![mk(Tier::Shingle, 1000), mk(Tier::Exact, 9), mk(Tier::Keyword, 50), mk(Tier::Exact, 30)];
        rank_candidates(&mut v);
        let order: Vec<(Tier, usize)> = v.iter().map(|c| (c.tier, c.score)).collect();
        assert_eq!(
            order,
            vec![(Tier::Exact, 30), (Tier::Exact, 9), (Tier::Keyword, 50), (Tier::Shingle, 1000)]
        );
    }

    proptest! {
        #[test]
        fn short_targets_never_match(t in "\\s{0,3}[a-z]{0,2}\\s{0,3}") {
            let units = units_of(&["aa bb cc dd ee ff gg"]);
            prop_assert!(locate(&t, &units).is_empty());
        }

        #[test]
        fn embedded_target_ranks_exact_first(
            pre in "[a-z ]{0,20}",
            target in "[a-z]{3,12}",
            post in "[a-z ]{0,20}",
        ) {
            let content = format!("start {pre} {target} {post} end");
            let units = units_of(&[content.as_str(), "unrelated filler text"]);
            let c = locate(&target, &units);
            prop_assert!(!c.is_empty());
            prop_assert_eq!(c[0].tier, Tier::Exact);
            prop_assert_eq!(c[0].score, 3 * target.len());
            prop_assert_eq!(c[0].matched.to_lowercase(), target.clone());
        }

        #[test]
        fn results_never_mix_tiers(target in "[a-z ]{0,40}") {
            let units = units_of(&["some words about rivers and mountains", "another line of text here"]);
            let c = locate(&target, &units);
            prop_assert!(c.len() <= MAX_CANDIDATES);
            if let Some(first) = c.first() {
                prop_assert!(c.iter().all(|x| x.tier == first.tier));
            }
        }
    }
}
