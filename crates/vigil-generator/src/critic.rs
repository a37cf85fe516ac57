//! Completeness and cadence gate (§4.4), grounded on `Critic`: the
//! Problem/Mechanism/Pilot/KPI/Risk/CTA element checklist for proposals, a
//! 0-100 quality heuristic, and the short/short/long sentence-count cadence
//! rule applied to replies.

use once_cell::sync::Lazy;
use regex::Regex;

struct ElementSpec {
    name: &'static str,
    patterns: &'static [&'static str],
}

static PROPOSAL_ELEMENTS: &[ElementSpec] = &[
    ElementSpec { name: "problem", patterns: &[r"\bproblem\b", r"\bissue\b", r"\bchallenge\b", r"\bgap\b", r"\bfailing\b"] },
    ElementSpec { name: "mechanism", patterns: &[r"\bmechanism\b", r"\bsolution\b", r"\bapproach\b", r"\bframework\b", r"\bsystem\b", r"\bmethod\b"] },
    ElementSpec { name: "pilot", patterns: &[r"\bpilot\b", r"\btest\b", r"\btrial\b", r"\bexperiment\b", r"\b30.day\b", r"\b90.day\b"] },
    ElementSpec { name: "kpis", patterns: &[r"\bkpi\b", r"\bkpis\b", r"\bmetric\b", r"\bmeasure\b", r"\bindicator\b", r"\bsuccess\b", r"\btrack\b"] },
    ElementSpec { name: "risks", patterns: &[r"\brisk\b", r"\brisks\b", r"\bdanger\b", r"\bconcern\b", r"\blimitation\b", r"\bfail\b", r"\bchallenge\b"] },
    ElementSpec { name: "cta", patterns: &[r"\bjoin\b", r"\bsign.up\b", r"\blearn.more\b", r"\bcontact\b", r"\bapply\b", r"\bparticipate\b", r"\blink\b"] },
];

static COMPILED_ELEMENTS: Lazy<Vec<(&'static str, Vec<Regex>)>> = Lazy::new(|| {
    PROPOSAL_ELEMENTS
        .iter()
        .map(|spec| (spec.name, spec.patterns.iter().map(|p| Regex::new(&format!("(?i){p}")).unwrap()).collect()))
        .collect()
});

/// §4.4 P→M→P→K→R→CTA completeness check; non-proposals are always complete.
pub fn check_completeness(text: &str, content_type: &str) -> (bool, Vec<String>) {
    if content_type != "proposal" {
        return (true, vec![]);
    }
    let missing: Vec<String> = COMPILED_ELEMENTS
        .iter()
        .filter(|(_, patterns)| !patterns.iter().any(|re| re.is_match(text)))
        .map(|(name, _)| name.to_string())
        .collect();
    (missing.is_empty(), missing)
}

fn split_sentences(text: &str) -> Vec<String> {
    // Rust's `regex` crate has no lookbehind; split manually on sentence terminators instead.
    let mut sentences = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            let trimmed = current.trim().to_string();
            if !trimmed.is_empty() {
                sentences.push(trimmed);
            }
            current.clear();
        }
    }
    let tail = current.trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

/// §4.4 cadence rule: text satisfies the reply cadence when it has no more
/// than `max_sentences` sentences (default 2 for low-intensity replies).
pub fn has_periodic_cadence(text: &str, max_sentences: usize) -> bool {
    let sentences = split_sentences(text);
    !sentences.is_empty() && sentences.len() <= max_sentences
}

pub fn sentences(text: &str) -> Vec<String> {
    split_sentences(text)
}

/// 0-100 heuristic quality score (§4.4 Critic): length, specific numbers,
/// concrete actions, measurable outcomes, time bounds, stakeholder mentions.
pub fn quality_score(text: &str) -> f64 {
    static SPECIFIC_NUMBERS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b\d+\s*(days?|weeks?|months?|%|dollars?|\$)").unwrap());
    static CONCRETE_ACTIONS: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)\b(implement|deploy|create|build|establish|launch|start)\b").unwrap());
    static MEASURABLE_OUTCOMES: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)(>\s*\d+%|\b(increase|decrease|improve|reduce|achieve|reach)\s+(by\s+)?\d+)").unwrap());
    static TIME_BOUNDS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(within|in|by)\s+\d+\s*(days?|weeks?|months?)").unwrap());
    static STAKEHOLDERS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(users?|customers?|teams?|organizations?|communities?)\b").unwrap());

    let mut score = 0.0;
    if text.len() > 100 {
        score += 15.0;
    } else if text.len() > 50 {
        score += 10.0;
    } else {
        score += 5.0;
    }

    if SPECIFIC_NUMBERS.is_match(text) {
        score += 20.0;
    }
    if CONCRETE_ACTIONS.is_match(text) {
        score += 15.0;
    }
    if MEASURABLE_OUTCOMES.is_match(text) {
        score += 20.0;
    }
    if TIME_BOUNDS.is_match(text) {
        score += 15.0;
    }
    if STAKEHOLDERS.is_match(text) {
        score += 10.0;
    }
    if text.contains('?') {
        score += 5.0;
    }
    let lower = text.to_lowercase();
    if lower.contains("kpi") {
        score += 10.0;
    }
    if lower.contains("risk") {
        score += 5.0;
    }

    score.min(100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_elements_are_reported_for_proposals() {
        let (is_complete, missing) = check_completeness("We should make things better somehow.", "proposal");
        assert!(!is_complete);
        assert!(missing.contains(&"cta".to_string()));
    }

    #[test]
    fn full_proposal_has_no_missing_elements() {
        let text = "The problem is low retention. Our mechanism is a referral system. \
                     We will pilot it for 30 days, tracking KPIs weekly. The key risk is fatigue. \
                     Join the waitlist to participate.";
        let (is_complete, missing) = check_completeness(text, "proposal");
        assert!(is_complete, "missing: {missing:?}");
    }

    #[test]
    fn cadence_rejects_more_than_two_sentences_by_default() {
        assert!(!has_periodic_cadence("One. Two. Three.", 2));
        assert!(has_periodic_cadence("One. Two.", 2));
    }

    #[test]
    fn quality_score_rewards_specifics() {
        let vague = "Maybe this could work somehow.";
        let specific = "We will implement this within 30 days and expect to increase retention by 10% for our users, tracking KPIs and risk weekly.";
        assert!(quality_score(specific) > quality_score(vague));
    }
}
