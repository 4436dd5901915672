//! Answer normalization: raw model text -> typed answer, plus the comparison
//! rules applied against ground truth.
//!
//! Parsing is deliberately strict. A model that answers "Yes." or "12 items"
//! did not follow the prompt contract, and silently coercing that into a
//! scored answer would inflate accuracy. Strict failures surface as parse
//! failures, which are excluded from the accuracy denominator but retained
//! for failure-rate reporting.

use crate::evaluation::{ParsedAnswer, QuestionKind, QuestionSpec};

const BINARY_TRUE: &[&str] = &["yes", "y", "true", "t", "1"];
const BINARY_FALSE: &[&str] = &["no", "n", "false", "f", "0"];

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("empty model output")]
    EmptyOutput,

    #[error("not a yes/no answer: {0:?}")]
    UnrecognizedBinary(String),

    #[error("not one of the configured options: {0:?}")]
    UnknownOption(String),

    #[error("not an integer: {0:?}")]
    NotAnInteger(String),
}

/// Parses the final step's raw output into a typed answer. Whitespace is
/// trimmed; nothing else is stripped, so "Yes." is a parse failure.
pub fn parse_answer(question: &QuestionSpec, raw: &str) -> Result<ParsedAnswer, ParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ParseError::EmptyOutput);
    }

    match question.kind {
        QuestionKind::Binary => parse_binary_token(trimmed)
            .map(ParsedAnswer::Binary)
            .ok_or_else(|| ParseError::UnrecognizedBinary(snippet(trimmed))),
        QuestionKind::MultipleChoice => {
            let lowered = trimmed.to_lowercase();
            question
                .options
                .iter()
                .find(|opt| opt.to_lowercase() == lowered)
                // Canonicalize to the configured option's own casing.
                .map(|opt| ParsedAnswer::Choice(opt.clone()))
                .ok_or_else(|| ParseError::UnknownOption(snippet(trimmed)))
        }
        QuestionKind::Text => Ok(ParsedAnswer::Text(trimmed.to_string())),
        QuestionKind::Count => trimmed
            .parse::<i64>()
            .map(ParsedAnswer::Count)
            .map_err(|_| ParseError::NotAnInteger(snippet(trimmed))),
    }
}

/// Compares a typed answer against the dataset's ground truth string.
/// Returns None when the ground truth itself is unusable for the question
/// kind (the prediction is then excluded, not marked incorrect).
pub fn compare(question: &QuestionSpec, answer: &ParsedAnswer, ground_truth: &str) -> Option<bool> {
    let gt = ground_truth.trim();
    if gt.is_empty() {
        return None;
    }

    match (question.kind, answer) {
        (QuestionKind::Binary, ParsedAnswer::Binary(b)) => {
            parse_binary_token(gt).map(|truth| truth == *b)
        }
        (QuestionKind::MultipleChoice, ParsedAnswer::Choice(c)) => {
            Some(c.to_lowercase() == gt.to_lowercase())
        }
        (QuestionKind::Text, ParsedAnswer::Text(t)) => Some(t.to_lowercase() == gt.to_lowercase()),
        (QuestionKind::Count, ParsedAnswer::Count(n)) => {
            gt.parse::<i64>().ok().map(|truth| truth == *n)
        }
        // Answer kind drifted from the question kind; treat as unusable.
        _ => None,
    }
}

/// Binary token parse shared by answer parsing, ground-truth parsing, and
/// the confusion-matrix tally.
pub fn parse_binary_token(s: &str) -> Option<bool> {
    let lowered = s.trim().to_lowercase();
    if BINARY_TRUE.contains(&lowered.as_str()) {
        Some(true)
    } else if BINARY_FALSE.contains(&lowered.as_str()) {
        Some(false)
    } else {
        None
    }
}

/// Bounded echo of the offending text for error messages.
fn snippet(s: &str) -> String {
    const MAX: usize = 120;
    if s.len() <= MAX {
        return s.to_string();
    }
    let cut = s
        .char_indices()
        .take_while(|(i, _)| *i < MAX)
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    format!("{}...", &s[..cut])
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn binary() -> QuestionSpec {
        QuestionSpec {
            kind: QuestionKind::Binary,
            options: vec![],
        }
    }

    fn choice(options: &[&str]) -> QuestionSpec {
        QuestionSpec {
            kind: QuestionKind::MultipleChoice,
            options: options.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn text() -> QuestionSpec {
        QuestionSpec {
            kind: QuestionKind::Text,
            options: vec![],
        }
    }

    fn count() -> QuestionSpec {
        QuestionSpec {
            kind: QuestionKind::Count,
            options: vec![],
        }
    }

    #[test]
    fn binary_accepts_the_documented_token_sets() {
        for raw in ["yes", "YES", "y", "true", "T", "1", "  yes \n"] {
            assert_eq!(
                parse_answer(&binary(), raw).unwrap(),
                ParsedAnswer::Binary(true),
                "raw: {raw:?}"
            );
        }
        for raw in ["no", "No", "n", "FALSE", "f", "0"] {
            assert_eq!(
                parse_answer(&binary(), raw).unwrap(),
                ParsedAnswer::Binary(false),
                "raw: {raw:?}"
            );
        }
    }

    #[test]
    fn binary_rejects_punctuated_and_free_text() {
        // Trailing punctuation is not stripped: "Yes." is a refusal to follow
        // the answer format, not a yes.
        assert!(matches!(
            parse_answer(&binary(), "Yes."),
            Err(ParseError::UnrecognizedBinary(_))
        ));
        assert!(matches!(
            parse_answer(&binary(), "probably"),
            Err(ParseError::UnrecognizedBinary(_))
        ));
        assert!(matches!(
            parse_answer(&binary(), "   "),
            Err(ParseError::EmptyOutput)
        ));
    }

    #[test]
    fn choice_matches_case_insensitively_and_canonicalizes() {
        let q = choice(&["red", "green", "blue"]);
        assert_eq!(
            parse_answer(&q, "GREEN").unwrap(),
            ParsedAnswer::Choice("green".to_string())
        );
        assert!(matches!(
            parse_answer(&q, "purple"),
            Err(ParseError::UnknownOption(_))
        ));
    }

    #[test]
    fn count_requires_an_integer_only_answer() {
        assert_eq!(parse_answer(&count(), " 12 ").unwrap(), ParsedAnswer::Count(12));
        assert_eq!(parse_answer(&count(), "-3").unwrap(), ParsedAnswer::Count(-3));
        // Pinned: a count answer with trailing prose is a parse failure, not
        // a leading-integer extraction.
        assert!(matches!(
            parse_answer(&count(), "12 items"),
            Err(ParseError::NotAnInteger(_))
        ));
    }

    #[test]
    fn text_is_trimmed_but_case_preserved() {
        assert_eq!(
            parse_answer(&text(), "  Warsaw ").unwrap(),
            ParsedAnswer::Text("Warsaw".to_string())
        );
    }

    #[test]
    fn compare_binary_accepts_token_ground_truths() {
        let answer = ParsedAnswer::Binary(true);
        assert_eq!(compare(&binary(), &answer, "yes"), Some(true));
        assert_eq!(compare(&binary(), &answer, "NO"), Some(false));
        // Unusable ground truth excludes the prediction instead of failing it.
        assert_eq!(compare(&binary(), &answer, "unsure"), None);
        assert_eq!(compare(&binary(), &answer, ""), None);
    }

    #[test]
    fn compare_text_is_case_insensitive_exact() {
        let answer = ParsedAnswer::Text("Warsaw".to_string());
        assert_eq!(compare(&text(), &answer, "WARSAW"), Some(true));
        assert_eq!(compare(&text(), &answer, "Warszawa"), Some(false));
    }

    #[test]
    fn compare_count_is_exact_numeric_equality() {
        let answer = ParsedAnswer::Count(12);
        assert_eq!(compare(&count(), &answer, "12"), Some(true));
        assert_eq!(compare(&count(), &answer, "13"), Some(false));
        assert_eq!(compare(&count(), &answer, "a dozen"), None);
    }

    #[test]
    fn mismatched_answer_kind_is_excluded() {
        let answer = ParsedAnswer::Text("yes".to_string());
        assert_eq!(compare(&binary(), &answer, "yes"), None);
    }

    #[test]
    fn snippet_truncates_long_output() {
        let long = "x".repeat(500);
        let s = snippet(&long);
        assert!(s.len() < 200);
        assert!(s.ends_with("..."));
    }
}
