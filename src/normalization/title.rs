use std::sync::OnceLock;

use regex::Regex;
use strsim::levenshtein;
use unicode_normalization::UnicodeNormalization;

use super::translation::DEFAULT_SUBSTRING_MIN_CHARS;
use crate::database_ops::models::UnifiedWork;

/// Default minimum score for `best_match` to accept a candidate.
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.75;

/// Score assigned when one normalized title contains the other.
pub const DEFAULT_CONTAINMENT_SCORE: f64 = 0.9;

/// Minimum score for linking a work to an existing unified work. Strictly
/// above the lookup threshold: a link is permanent.
pub const DEFAULT_RESOLVE_THRESHOLD: f64 = 0.8;

fn trailing_annotation() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s*[\[【(（][^\]】)）\[【(（]*[\]】)）]\s*$").ok())
        .as_ref()
}

/// Removes trailing bracketed annotations such as `(vol 3)` or `【完結】`,
/// repeatedly, unless that would leave nothing.
pub fn strip_annotations(title: &str) -> String {
    let mut current = title.trim().to_string();
    while let Some(re) = trailing_annotation() {
        let stripped = re.replace(&current, "").trim().to_string();
        if stripped.is_empty() || stripped == current {
            break;
        }
        current = stripped;
    }
    current
}

/// Canonical comparison form of a title.
///
/// Steps, in order:
/// - NFKC (full-width ASCII and the ideographic space fold to their plain forms)
/// - `strip_annotations`
/// - collapse runs of whitespace to one space and trim
/// - lowercase
pub fn normalize(title: &str) -> String {
    let folded: String = title.nfkc().collect();
    strip_annotations(&folded)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Knobs for similarity scoring.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchConfig {
    pub threshold: f64,
    pub containment_score: f64,
    /// Both normalized titles need at least this many characters before
    /// containment counts; shorter pairs fall through to the edit-distance ratio.
    pub containment_min_chars: usize,
    /// Titles whose digit runs differ ("作品 2" / "作品 3") score 0.
    pub numbers_must_agree: bool,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
            containment_score: DEFAULT_CONTAINMENT_SCORE,
            containment_min_chars: 1,
            numbers_must_agree: false,
        }
    }
}

impl MatchConfig {
    /// Settings for linking works to unified works. The containment floor
    /// matches the mapping substring stage.
    pub fn resolution() -> Self {
        Self {
            threshold: DEFAULT_RESOLVE_THRESHOLD,
            containment_score: DEFAULT_CONTAINMENT_SCORE,
            containment_min_chars: DEFAULT_SUBSTRING_MIN_CHARS,
            numbers_must_agree: true,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn similarity(&self, a: &str, b: &str) -> f64 {
        similarity_normalized(&normalize(a), &normalize(b), self)
    }

    /// Highest-scoring string field across all candidates, if it clears the
    /// threshold. Ties keep the earlier candidate.
    pub fn best_match<'a, T: TitleFields>(
        &self,
        query: &str,
        candidates: &'a [T],
    ) -> Option<(&'a T, f64)> {
        let q = normalize(query);
        if q.is_empty() {
            return None;
        }
        let mut best: Option<(&'a T, f64)> = None;
        for candidate in candidates {
            for field in candidate.title_fields() {
                let score = similarity_normalized(&q, &normalize(field), self);
                if best.map_or(true, |(_, s)| score > s) {
                    best = Some((candidate, score));
                }
            }
        }
        best.filter(|(_, score)| *score >= self.threshold)
    }
}

fn similarity_normalized(a: &str, b: &str, cfg: &MatchConfig) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    if cfg.numbers_must_agree && !numbers_agree(a, b) {
        return 0.0;
    }
    let (la, lb) = (a.chars().count(), b.chars().count());
    if la.min(lb) >= cfg.containment_min_chars && (a.contains(b) || b.contains(a)) {
        return cfg.containment_score;
    }
    let longest = la.max(lb) as f64;
    1.0 - levenshtein(a, b) as f64 / longest
}

/// Digit runs of both titles, leading zeros ignored, compared in order.
fn numbers_agree(a: &str, b: &str) -> bool {
    fn runs(s: &str) -> Vec<&str> {
        s.split(|c: char| !c.is_ascii_digit())
            .filter(|r| !r.is_empty())
            .map(|r| r.trim_start_matches('0'))
            .collect()
    }
    runs(a) == runs(b)
}

/// Similarity in `[0, 1]` with the default configuration.
pub fn similarity(a: &str, b: &str) -> f64 {
    MatchConfig::default().similarity(a, b)
}

/// `best_match` with the default containment settings and an explicit threshold.
pub fn best_match<'a, T: TitleFields>(
    query: &str,
    candidates: &'a [T],
    threshold: f64,
) -> Option<(&'a T, f64)> {
    MatchConfig::default()
        .with_threshold(threshold)
        .best_match(query, candidates)
}

/// Exposes the string fields a candidate can be matched on.
pub trait TitleFields {
    fn title_fields(&self) -> Vec<&str>;
}

impl TitleFields for String {
    fn title_fields(&self) -> Vec<&str> {
        vec![self.as_str()]
    }
}

impl TitleFields for &str {
    fn title_fields(&self) -> Vec<&str> {
        vec![*self]
    }
}

/// Every top-level string field of an object (or the string itself).
impl TitleFields for serde_json::Value {
    fn title_fields(&self) -> Vec<&str> {
        match self {
            serde_json::Value::String(s) => vec![s.as_str()],
            serde_json::Value::Object(map) => map.values().filter_map(|v| v.as_str()).collect(),
            _ => Vec::new(),
        }
    }
}

impl TitleFields for UnifiedWork {
    fn title_fields(&self) -> Vec<&str> {
        vec![
            self.title_translated.as_str(),
            self.fields.title_canonical.as_str(),
        ]
    }
}
