//! Ethics gate (§4.4): harmful-content and deception detection, uncertainty
//! scoring, rollback-plan extraction, and the addendum enforcement that
//! appends an uncertainty/rollback sentence to proposals that omit one.
//! Grounded directly on `EthicsGuard`.

use once_cell::sync::Lazy;
use regex::Regex;

static HARMFUL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)\b(hate|violence|harm)\b").unwrap(),
        Regex::new(r"(?i)\b(scam|fraud|deceive)\b").unwrap(),
        Regex::new(r"(?i)\b(illegal|criminal)\b").unwrap(),
    ]
});

static DECEPTION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)\bguaranteed\b").unwrap(),
        Regex::new(r"(?i)\b100%\s*(success|profit|return)\b").unwrap(),
        Regex::new(r"(?i)\bno\s+risk\b").unwrap(),
        Regex::new(r"(?i)\bsecret\s+(method|formula|system)\b").unwrap(),
    ]
});

const UNCERTAINTY_KEYWORDS: [&str; 10] = [
    "might", "could", "may", "uncertain", "unclear", "possibly", "likely", "estimate", "approximately", "tentative",
];

const ROLLBACK_KEYWORDS: [&str; 8] = [
    "rollback",
    "revert",
    "undo",
    "if this fails",
    "if it doesn't work",
    "fallback",
    "pull back",
    "pause and reassess",
];

const RECEIPT_CONSTRUCTIVE_KEYWORDS: [&str; 8] =
    ["try", "pilot", "test", "fix", "rollback", "next step", "cta", "call to action"];

/// Verdict from `validate_text` (§4.4 Ethics gate).
#[derive(Debug, Clone)]
pub struct EthicsResult {
    pub approved: bool,
    pub reasons: Vec<String>,
    pub uncertainty_score: f64,
    pub rollback_plan: Option<String>,
}

/// True if `text` contains a bare `https?://` URL (§4.4 receipts gate).
pub fn has_receipt(text: &str) -> bool {
    static RECEIPT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://\S+").unwrap());
    RECEIPT_RE.is_match(text)
}

/// True if `text` names a concrete next step (§4.4 "constructive step or receipts").
pub fn has_constructive_step(text: &str) -> bool {
    let lower = text.to_lowercase();
    RECEIPT_CONSTRUCTIVE_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

fn contains_deception(text: &str) -> bool {
    DECEPTION_PATTERNS.iter().any(|re| re.is_match(text))
}

fn calculate_uncertainty_score(text: &str) -> f64 {
    let lower = text.to_lowercase();
    let hits = UNCERTAINTY_KEYWORDS.iter().filter(|kw| lower.contains(*kw)).count();
    (hits as f64 / 5.0).min(1.0)
}

fn extract_rollback_plan(text: &str) -> Option<String> {
    for sentence in text.split(['.', '!', '?']) {
        let lower = sentence.to_lowercase();
        if ROLLBACK_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            return Some(sentence.trim().to_string());
        }
    }
    None
}

/// Full ethics validation: rejects harmful content and deceptive guarantees,
/// otherwise reports uncertainty score and any rollback plan found.
pub fn validate_text(text: &str) -> EthicsResult {
    let mut reasons = Vec::new();

    for pattern in HARMFUL_PATTERNS.iter() {
        if pattern.is_match(text) {
            reasons.push(format!("harmful_pattern_matched: {}", pattern.as_str()));
        }
    }
    if contains_deception(text) {
        reasons.push("deceptive_guarantee_detected".to_string());
    }

    EthicsResult {
        approved: reasons.is_empty(),
        reasons,
        uncertainty_score: calculate_uncertainty_score(text),
        rollback_plan: extract_rollback_plan(text),
    }
}

/// For proposals only: appends an uncertainty/rollback sentence when the
/// draft doesn't already carry one of its own (§4.4 addendum enforcement).
pub fn enforce_addendum(text: &str, content_type: &str) -> String {
    if content_type != "proposal" {
        return text.to_string();
    }
    let lower = text.to_lowercase();
    let has_uncertainty = UNCERTAINTY_KEYWORDS.iter().any(|kw| lower.contains(kw));
    let has_rollback = ROLLBACK_KEYWORDS.iter().any(|kw| lower.contains(kw));

    let mut out = text.trim_end().to_string();
    if !has_uncertainty {
        out.push_str(" Results are estimates and may shift as the pilot runs.");
    }
    if !has_rollback {
        out.push_str(" If this fails to hit its KPIs we roll back within the pilot window.");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approves_neutral_text() {
        let result = validate_text("We propose a 30-day pilot to measure engagement improvements.");
        assert!(result.approved);
        assert!(result.reasons.is_empty());
    }

    #[test]
    fn rejects_harmful_keywords() {
        let result = validate_text("This plan promotes violence against a group.");
        assert!(!result.approved);
    }

    #[test]
    fn rejects_deceptive_guarantees() {
        let result = validate_text("Guaranteed 100% success with no risk whatsoever.");
        assert!(!result.approved);
        assert!(result.reasons.iter().any(|r| r.contains("deceptive")));
    }

    #[test]
    fn addendum_adds_missing_uncertainty_and_rollback_once() {
        let base = "We will launch a new pilot program for three teams.";
        let out = enforce_addendum(base, "proposal");
        assert!(out.to_lowercase().contains("estimate") || out.to_lowercase().contains("may"));
        assert!(out.to_lowercase().contains("roll back"));
    }

    #[test]
    fn addendum_is_noop_outside_proposals() {
        let base = "A short reply.";
        assert_eq!(enforce_addendum(base, "reply"), base);
    }

    #[test]
    fn has_receipt_detects_bare_url() {
        assert!(has_receipt("See https://example.gov/report for details."));
        assert!(!has_receipt("No link here."));
    }
}
