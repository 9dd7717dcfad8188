//! Completion-promise extraction.
//!
//! Grammar: the first well-formed `<promise>…</promise>` span in the text.
//! The inner text has its whitespace collapsed to single spaces and is
//! compared case-sensitively with the configured token.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::PromiseOutcome;

static PROMISE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<promise>(.*?)</promise>").expect("promise regex"));

/// Return the collapsed inner text of the first promise span, if any.
pub fn extract_promise(text: &str) -> Option<String> {
    let caps = PROMISE_RE.captures(text)?;
    let inner = caps.get(1)?.as_str();
    Some(collapse_whitespace(inner))
}

/// Compare the final role output against the expected token.
pub fn check_promise(expected: &str, final_output: Option<&str>) -> PromiseOutcome {
    let expected = collapse_whitespace(expected);
    let text = final_output.and_then(extract_promise);
    let matched = !expected.is_empty() && text.as_deref() == Some(expected.as_str());
    PromiseOutcome {
        expected,
        text,
        matched,
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_first_span_and_collapses_whitespace() {
        let text = "work done\n<promise>\n  ALL   DONE \n</promise> then <promise>LATER</promise>";
        assert_eq!(extract_promise(text).as_deref(), Some("ALL DONE"));
    }

    #[test]
    fn unterminated_tag_is_not_a_promise() {
        assert_eq!(extract_promise("<promise>DONE"), None);
        assert_eq!(extract_promise("no tags here"), None);
    }

    #[test]
    fn match_is_case_sensitive() {
        let outcome = check_promise("DONE", Some("<promise>done</promise>"));
        assert!(!outcome.matched);
        assert_eq!(outcome.text.as_deref(), Some("done"));

        let outcome = check_promise("DONE", Some("<promise>DONE</promise>"));
        assert!(outcome.matched);
    }

    #[test]
    fn missing_output_never_matches() {
        let outcome = check_promise("DONE", None);
        assert!(!outcome.matched);
        assert_eq!(outcome.text, None);
        assert_eq!(outcome.expected, "DONE");
    }
}
