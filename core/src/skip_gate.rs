//! The skip-gate: a pure, language-independent predicate that short-circuits the pipeline for
//! trivial messages (§4.6). No I/O, no configuration beyond the fixed lexicon/patterns below —
//! `shouldSkip` is a pure function of the raw text (§8, "Skip determinism").

use regex::Regex;
use std::sync::OnceLock;

const VERB_LEXICON: &[&str] = &[
    "fix", "run", "show", "find", "search", "list", "get", "set", "add", "remove", "delete",
    "update", "create", "explain", "describe",
];

const ACK_PATTERNS: &[&str] = &[
    "ok", "yes", "no", "sure", "thanks", "ty", "k", "got it", "done", "np", "yep", "nope", "lol",
    "haha",
];

fn verb_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let alternation = VERB_LEXICON.join("|");
        Regex::new(&format!(r"(?i)\b(?:{alternation})\b")).expect("static verb regex is valid")
    })
}

fn heartbeat_or_system_or_media(trimmed_lower: &str) -> bool {
    trimmed_lower.starts_with("heartbeat")
        || trimmed_lower.starts_with("system:")
        || (trimmed_lower.starts_with("[media attached:") && trimmed_lower.ends_with(']'))
}

/// An acknowledgment "matches" either as the whole (trimmed, lowercased) string, or as a leading
/// word followed by more words (`"thanks so much"` matches `"thanks"`). The latter is this
/// implementation's resolution of §9's first Open Question: pattern-matching dominates length
/// even when the pattern is only a prefix of a longer message. See DESIGN.md.
fn matches_ack_pattern(trimmed_lower: &str) -> bool {
    ACK_PATTERNS.iter().any(|pattern| {
        trimmed_lower == *pattern || trimmed_lower.starts_with(&format!("{pattern} "))
    })
}

/// `shouldSkip(text)` (§4.6). Pattern-matching dominates length: a message longer than 15 chars
/// that still matches an acknowledgment pattern is skipped (§9, first Open Question).
pub fn should_skip(text: &str) -> bool {
    let trimmed = text.trim();
    let lower = trimmed.to_lowercase();

    if matches_ack_pattern(&lower) || heartbeat_or_system_or_media(&lower) {
        return true;
    }

    let char_count = trimmed.chars().count();
    if char_count <= 15 && !verb_regex().is_match(trimmed) {
        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_ack_is_skipped() {
        assert!(should_skip("ok"));
        assert!(should_skip("  Thanks  "));
        assert!(should_skip("NOPE"));
    }

    #[test]
    fn short_imperative_is_not_skipped() {
        assert!(!should_skip("fix it"));
    }

    #[test]
    fn long_message_without_verb_is_not_skipped() {
        assert!(!should_skip(
            "the weather today is quite unusually warm for this time of year"
        ));
    }

    #[test]
    fn message_matching_ack_prefix_is_skipped_even_with_trailing_words() {
        assert!(should_skip("thanks so much for the quick turnaround today"));
    }

    #[test]
    fn exact_ack_pattern_regardless_of_length_rule_is_skipped() {
        assert!(should_skip("got it"));
    }

    #[test]
    fn heartbeat_and_system_and_media_prefixes_are_skipped() {
        assert!(should_skip("HEARTBEAT 2024-01-01T00:00:00Z"));
        assert!(should_skip("System: context refreshed"));
        assert!(should_skip("[media attached: photo.png]"));
    }

    #[test]
    fn word_boundary_prevents_substring_verb_match() {
        // "get" should not match inside "budget" or "forgetting".
        assert!(should_skip("budgetary"));
    }
}
