//! Stack-name pattern matching.
//!
//! Patterns only understand `*`, which matches any run of characters
//! (including none). Comparison is case-insensitive. There is no `?`,
//! no character classes and no escaping: stack names routinely contain
//! `.`, `-` and `_`, all of which are literal here.

/// Returns true if `text` matches `pattern`.
#[must_use]
pub fn matches(text: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    let text = text.to_lowercase();
    let pattern = pattern.to_lowercase();

    if !pattern.contains('*') {
        return text == pattern;
    }

    let segments: Vec<&str> = pattern.split('*').collect();
    let first = segments[0];
    let last = segments[segments.len() - 1];

    if !text.starts_with(first) {
        return false;
    }

    let mut pos = first.len();
    let middle = &segments[1..segments.len() - 1];
    for segment in middle.iter().filter(|s| !s.is_empty()) {
        match text[pos..].find(segment) {
            Some(idx) => pos += idx + segment.len(),
            None => return false,
        }
    }

    // The suffix must not overlap anything already consumed.
    text.len() >= pos + last.len() && text.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_star_matches_everything() {
        assert!(matches("", "*"));
        assert!(matches("anything", "*"));
        assert!(matches("Prod.Web", "*"));
    }

    #[test]
    fn test_literal_is_case_insensitive_equality() {
        assert!(matches("test-stack", "test-stack"));
        assert!(matches("Test-Stack", "test-STACK"));
        assert!(!matches("test-stack-2", "test-stack"));
        assert!(!matches("", "test"));
    }

    #[test]
    fn test_prefix_and_suffix() {
        assert!(matches("prod-web", "prod-*"));
        assert!(matches("prod-", "prod-*"));
        assert!(!matches("dev-web", "prod-*"));
        assert!(matches("web-prod", "*-prod"));
        assert!(!matches("web-dev", "*-prod"));
    }

    #[test]
    fn test_multiple_wildcards() {
        assert!(matches("prod-web-us-east", "prod-*-us-*"));
        assert!(!matches("dev-web-us-east", "prod-*-us-*"));
        assert!(matches("a-b-c", "*-b-*"));
        assert!(matches("abc", "a**c"));
    }

    #[test]
    fn test_segments_do_not_overlap() {
        assert!(!matches("ab", "ab*b"));
        assert!(matches("abb", "ab*b"));
        assert!(!matches("aXa", "a*Xa*aXa"));
    }

    #[test]
    fn test_no_special_meaning_for_other_characters() {
        assert!(matches("app.v1", "app.*"));
        assert!(!matches("appXv1", "app.v1"));
        assert!(!matches("a", "?"));
    }
}
