//! Rate-limit marker detection for role output lines.
//!
//! Recognizes HTTP 429 responses, vendor usage-limit JSON shapes and provider
//! error text. Detection is line-local so it can run on a streaming reader.

use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Structured metadata for a rate-limit pause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    /// When the provider says the limit resets, if it said.
    pub reset_at: Option<DateTime<Utc>>,
    /// Human-readable explanation.
    pub message: String,
    /// The output line that triggered detection.
    pub matched_line: String,
}

const MAX_MESSAGE_CHARS: usize = 240;

static MARKERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // Claude CLI: `Claude AI usage limit reached|1700000000`
        r"(?i)usage limit reached\|\d{9,12}",
        r#""type"\s*:\s*"(?:rate_limit_error|rate_limit_exceeded|usage_limit_reached|insufficient_quota)""#,
        r#"(?i)"(?:status|status_code|code)"\s*:\s*"?429\b"#,
        r"(?i)\bHTTP/\d(?:\.\d)?\s+429\b",
        r"(?i)\b429\b.{0,40}too many requests",
        r"(?i)\b(?:status|error|code)[\s:=]+429\b",
        r"(?i)\brate[ _-]?limit(?:ed)?[ _-]?exceeded\b",
        r"(?i)\bresource_exhausted\b",
        r"(?i)\bquota exceeded\b",
        r"(?i)you'?ve hit your usage limit",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("rate limit marker regex"))
    .collect()
});

static RESET_EPOCH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:usage limit reached\||"resets?_at"\s*:\s*)(\d{9,12})"#)
        .expect("reset epoch regex")
});

static RESET_AFTER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)"(?:resets_in_seconds|reset_after_seconds|retry_after)"\s*:\s*(\d+)"#)
        .expect("reset after regex")
});

static JSON_MESSAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""message"\s*:\s*"((?:[^"\\]|\\.)*)""#).expect("json message regex")
});

/// Return rate-limit metadata when `line` carries a known marker.
pub fn detect(line: &str, now: DateTime<Utc>) -> Option<RateLimitInfo> {
    if !MARKERS.iter().any(|re| re.is_match(line)) {
        return None;
    }

    let trimmed = line.trim();
    let reset_at = reset_time(trimmed, now);
    let message = JSON_MESSAGE_RE
        .captures(trimmed)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().replace("\\\"", "\""))
        .unwrap_or_else(|| trimmed.to_string());

    Some(RateLimitInfo {
        reset_at,
        message: truncate_chars(&message, MAX_MESSAGE_CHARS),
        matched_line: truncate_chars(trimmed, MAX_MESSAGE_CHARS),
    })
}

fn reset_time(line: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some(epoch) = RESET_EPOCH_RE
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<i64>().ok())
    {
        return DateTime::from_timestamp(epoch, 0);
    }
    RESET_AFTER_RE
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<i64>().ok())
        .and_then(Duration::try_seconds)
        .map(|after| now + after)
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push('…');
    out
}
