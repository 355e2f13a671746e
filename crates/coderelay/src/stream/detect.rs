//! Inline prompt detection over trailing assistant text.
//!
//! The backends sometimes end a turn with a plain-text question instead of a
//! structured one. These heuristics (regex over the trailing lines) decide
//! whether to offer numbered-option or yes/no quick-reply buttons. They are
//! intentionally approximate; boundary behavior is pinned by the tests
//! below rather than silently adjusted.

use std::sync::LazyLock;

use regex::Regex;

/// Numbered options offered as buttons are capped at this many.
pub const MAX_DETECTED_OPTIONS: usize = 10;

/// How much trailing text the heuristics look at.
const TAIL_WINDOW: usize = 1200;

static NUMBERED_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d{1,2})[.)]\s+(.+)$").expect("static regex"));

static YES_NO_HINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(would you like|do you want|should i|shall i|want me to|proceed|continue|is (that|this) (ok|okay|correct))\b",
    )
    .expect("static regex")
});

/// Extract a trailing numbered list (`1.` / `1)` items) from the text.
///
/// Returns the item labels in order when at least two items are present,
/// capped at [`MAX_DETECTED_OPTIONS`].
pub fn detect_numbered_options(text: &str) -> Vec<String> {
    let tail = tail(text);

    let mut items: Vec<(u32, String)> = Vec::new();
    for line in tail.lines() {
        if let Some(caps) = NUMBERED_ITEM.captures(line) {
            let number: u32 = caps[1].parse().unwrap_or(0);
            let label = caps[2].trim().to_string();
            // A restart of the numbering replaces the earlier list: only the
            // trailing run counts.
            if items.last().is_none_or(|(prev, _)| number != prev + 1) {
                items.clear();
            }
            items.push((number, label));
        }
    }

    if items.len() < 2 || items.first().is_none_or(|(n, _)| *n != 1) {
        return Vec::new();
    }

    items
        .into_iter()
        .take(MAX_DETECTED_OPTIONS)
        .map(|(_, label)| label)
        .collect()
}

/// Whether the trailing text reads like a yes/no question.
pub fn detect_yes_no(text: &str) -> bool {
    let tail = tail(text);
    let Some(last) = tail
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
    else {
        return false;
    };

    last.ends_with('?') && YES_NO_HINT.is_match(last)
}

fn tail(text: &str) -> &str {
    if text.len() <= TAIL_WINDOW {
        return text;
    }
    let mut idx = text.len() - TAIL_WINDOW;
    while idx < text.len() && !text.is_char_boundary(idx) {
        idx += 1;
    }
    &text[idx..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_or_more_numbered_items_are_detected() {
        let text = "Here are the options:\n1. Refactor the parser\n2. Patch the lexer\n3) Leave as is\n";
        assert_eq!(
            detect_numbered_options(text),
            vec!["Refactor the parser", "Patch the lexer", "Leave as is"]
        );
    }

    #[test]
    fn single_item_is_not_a_list() {
        assert!(detect_numbered_options("1. only one choice").is_empty());
    }

    #[test]
    fn list_must_start_at_one() {
        let text = "3. third\n4. fourth\n";
        assert!(detect_numbered_options(text).is_empty());
    }

    #[test]
    fn non_consecutive_numbering_keeps_trailing_run() {
        let text = "1. stale\n2. stale too\nSome prose.\n1. fresh\n2. fresher\n";
        assert_eq!(detect_numbered_options(text), vec!["fresh", "fresher"]);
    }

    #[test]
    fn options_are_capped() {
        let mut text = String::new();
        for i in 1..=15 {
            text.push_str(&format!("{i}. option {i}\n"));
        }
        assert_eq!(detect_numbered_options(&text).len(), MAX_DETECTED_OPTIONS);
    }

    #[test]
    fn version_numbers_are_not_list_items() {
        // "1.5 released" has no whitespace after the dot-number prefix pattern.
        let text = "We shipped 1.5 today.\nUpgrade path:\nv2 notes follow.";
        assert!(detect_numbered_options(text).is_empty());
    }

    #[test]
    fn yes_no_detection_positive_cases() {
        assert!(detect_yes_no("All tests pass. Should I push the branch?"));
        assert!(detect_yes_no("Done reviewing.\nWould you like me to apply the fix?"));
        assert!(detect_yes_no("Ready.\n\nProceed with the migration?"));
    }

    #[test]
    fn yes_no_requires_question_mark() {
        assert!(!detect_yes_no("I will proceed with the migration."));
    }

    #[test]
    fn plain_questions_without_hint_words_are_not_yes_no() {
        assert!(!detect_yes_no("What port does the server listen on?"));
    }

    #[test]
    fn empty_text_detects_nothing() {
        assert!(detect_numbered_options("").is_empty());
        assert!(!detect_yes_no(""));
    }
}
