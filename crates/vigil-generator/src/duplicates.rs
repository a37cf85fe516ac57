//! Duplicate-resistance (P4, §4.4): Levenshtein-ratio similarity against
//! recent posts, plus the fallback word-substitution mutation used when the
//! LLM mutation call itself fails. Grounded on `levenshtein_distance` /
//! `_check_for_duplicates` / `_mutate_content`.

/// Levenshtein edit distance between `a` and `b`.
pub fn levenshtein_distance(a: &str, b: &str) -> usize {
    if a == b {
        return 0;
    }
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut previous_row: Vec<usize> = (0..=b.len()).collect();
    let mut current_row = vec![0usize; b.len() + 1];

    for (i, char_a) in a.iter().enumerate() {
        current_row[0] = i + 1;
        for (j, char_b) in b.iter().enumerate() {
            let insert_cost = current_row[j] + 1;
            let delete_cost = previous_row[j + 1] + 1;
            let replace_cost = previous_row[j] + usize::from(char_a != char_b);
            current_row[j + 1] = insert_cost.min(delete_cost).min(replace_cost);
        }
        std::mem::swap(&mut previous_row, &mut current_row);
    }

    previous_row[b.len()]
}

/// 1 - normalized edit distance; 1.0 means identical.
pub fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein_distance(a, b) as f64 / max_len as f64)
}

/// Finds the first candidate in `recent` too similar to `content` (P4: ratio
/// > `threshold` triggers a mutation retry). Exact hash collisions always count.
pub fn find_duplicate<'a>(content: &str, recent: &'a [String], threshold: f64) -> Option<&'a str> {
    recent.iter().map(|s| s.as_str()).find(|existing| *existing == content || similarity(content, existing) > threshold)
}

/// Deterministic fallback mutation used when the LLM rephrasing call fails:
/// simple synonym substitution that preserves structure and meaning.
pub fn fallback_mutate(content: &str) -> String {
    content.replace("implement", "deploy").replace("mechanism", "system").replace("solution", "approach")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_strings_have_zero_distance() {
        assert_eq!(levenshtein_distance("same", "same"), 0);
    }

    #[test]
    fn similarity_detects_near_duplicate() {
        let a = "We propose a 30-day pilot to track retention KPIs.";
        let b = "We propose a 30 day pilot to track retention KPIs!";
        assert!(similarity(a, b) > 0.8);
    }

    #[test]
    fn find_duplicate_flags_above_threshold() {
        let recent = vec!["hello world this is a test".to_string()];
        let found = find_duplicate("hello world this is a test!", &recent, 0.8);
        assert!(found.is_some());
    }

    #[test]
    fn find_duplicate_ignores_dissimilar_content() {
        let recent = vec!["an entirely unrelated sentence about gardening".to_string()];
        assert!(find_duplicate("a proposal about referral programs", &recent, 0.8).is_none());
    }

    #[test]
    fn fallback_mutate_changes_wording() {
        let out = fallback_mutate("We will implement this mechanism as a solution.");
        assert!(!out.contains("implement"));
    }
}
