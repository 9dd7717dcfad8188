//! Deterministic content signatures for progress detection.
//!
//! Both signatures are sha256 hex digests. An empty string means "nothing to
//! fingerprint" and never counts as a repeat.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

static FAILURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:error|errors|fail|failed|failure|failures|panicked|assertion|exception|traceback)\b|\b[A-Z]{1,3}\d{3,5}\b",
    )
    .expect("failure regex")
});

static ZERO_FAILURES_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:0 failed|0 failures|0 errors?|no errors?)\b").expect("zero failures regex")
});

static LINE_COL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":\d+:\d+").expect("line col regex"));
static PATH_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\.\w+):\d+\b").expect("path line regex"));
static LINE_WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bline \d+").expect("line word regex"));
static COLUMN_WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bcol(?:umn)? \d+").expect("column word regex"));
static DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+(?:\.\d+)?(?:ms|s)\b").expect("duration regex"));

/// sha256 of `bytes` as lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Signature over `(relative path, content hash)` pairs.
///
/// Order-independent: entries are sorted before hashing.
pub fn code_signature(entries: &[(String, String)]) -> String {
    if entries.is_empty() {
        return String::new();
    }
    let mut sorted: Vec<&(String, String)> = entries.iter().collect();
    sorted.sort();
    let mut hasher = Sha256::new();
    for (path, hash) in sorted {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(hash.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Failure lines from test output, normalized, sorted and de-duplicated.
pub fn failure_lines(output: &str) -> Vec<String> {
    let mut lines: Vec<String> = output
        .lines()
        .filter(|line| FAILURE_RE.is_match(&ZERO_FAILURES_RE.replace_all(line, "")))
        .map(normalize_failure_line)
        .filter(|line| !line.is_empty())
        .collect();
    lines.sort();
    lines.dedup();
    lines
}

/// Replace positional noise so the same assertion at a shifted offset matches.
pub fn normalize_failure_line(line: &str) -> String {
    let line = LINE_COL_RE.replace_all(line, ":<line>:<col>");
    let line = PATH_LINE_RE.replace_all(&line, "$1:<line>");
    let line = LINE_WORD_RE.replace_all(&line, "line <n>");
    let line = COLUMN_WORD_RE.replace_all(&line, "column <n>");
    let line = DURATION_RE.replace_all(&line, "<dur>");
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Signature over normalized failure lines; empty when no failures are present.
pub fn test_signature(output: &str) -> String {
    let lines = failure_lines(output);
    if lines.is_empty() {
        return String::new();
    }
    sha256_hex(lines.join("\n").as_bytes())
}
