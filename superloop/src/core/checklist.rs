//! Markdown checklist scanning.
//!
//! Counts incomplete `[ ]` items in list lines, ignoring anything inside
//! fenced code blocks (``` or ~~~).

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static UNCHECKED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*+]|\d+[.)])\s+\[ \]\s*(.*)$").expect("checklist regex")
});

/// One incomplete checklist item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncheckedItem {
    /// 1-indexed line number.
    pub line: usize,
    pub text: String,
}

/// Return every incomplete item outside fenced code blocks.
pub fn scan_unchecked(contents: &str) -> Vec<UncheckedItem> {
    let mut items = Vec::new();
    let mut fence: Option<(char, usize)> = None;

    for (idx, line) in contents.lines().enumerate() {
        if let Some(marker) = fence_marker(line) {
            match fence {
                None => fence = Some((marker.ch, marker.len)),
                Some((ch, len)) if marker.bare && marker.ch == ch && marker.len >= len => {
                    fence = None
                }
                Some(_) => {}
            }
            continue;
        }
        if fence.is_some() {
            continue;
        }
        if let Some(caps) = UNCHECKED_RE.captures(line) {
            items.push(UncheckedItem {
                line: idx + 1,
                text: caps
                    .get(1)
                    .map(|m| m.as_str().trim().to_string())
                    .unwrap_or_default(),
            });
        }
    }

    items
}

struct FenceMarker {
    ch: char,
    len: usize,
    /// Nothing but the fence run; only a bare marker can close a block.
    bare: bool,
}

fn fence_marker(line: &str) -> Option<FenceMarker> {
    let trimmed = line.trim_start();
    let ch = trimmed.chars().next()?;
    if ch != '`' && ch != '~' {
        return None;
    }
    let len = trimmed.chars().take_while(|c| *c == ch).count();
    let bare = trimmed[len * ch.len_utf8()..].trim().is_empty();
    (len >= 3).then_some(FenceMarker { ch, len, bare })
}
