//! Pure archive decisions, kept free of file I/O so the token and threshold
//! rules can be tested without touching a session directory.

use std::fmt;

pub const UNKNOWN_PREDECESSOR: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveReason {
    SessionRollover,
    LengthThreshold,
}

impl ArchiveReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveReason::SessionRollover => "session-rollover",
            ArchiveReason::LengthThreshold => "length-threshold",
        }
    }
}

impl fmt::Display for ArchiveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Startup rule: a stored token that differs from the current one marks the
/// logs as belonging to a previous session; logs with no stored token at all
/// belong to an unknown predecessor. Returns the token the archive should be
/// stamped with, or `None` when the live logs stay.
pub fn rollover_decision(stored: Option<&str>, current: &str, has_entries: bool) -> Option<String> {
    match stored {
        Some(token) if token != current => Some(token.to_string()),
        Some(_) => None,
        None if has_entries => Some(UNKNOWN_PREDECESSOR.to_string()),
        None => None,
    }
}

/// Append-time rule: archive once the entry count reaches the cap or the
/// combined file size reaches the byte cap. Empty sessions never archive.
pub fn threshold_decision(
    entry_count: usize,
    total_bytes: u64,
    max_entries: usize,
    max_bytes: u64,
) -> bool {
    entry_count > 0 && (entry_count >= max_entries || total_bytes >= max_bytes)
}

/// Directory-name slug for an archived session token.
pub fn token_slug(token: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = false;
    for ch in token.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash && !slug.is_empty() {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "session".to_string()
    } else {
        slug
    }
}
