//! Rule pattern matching
//!
//! Plugins select traffic with a small text pattern language applied either
//! to a bare hostname or to a full URL:
//!
//! - `*` matches everything
//! - exact match: `example.com`
//! - wildcard: `*.example.com` (each `*` matches any run of characters)
//! - substring: `example` matches `sub.example.com`
//!
//! Patterns that start with a scheme (`http://`, `https://`, `ws://`,
//! `wss://`) or contain a `/` are matched against the full request URL;
//! everything else is matched against the hostname.

use regex::Regex;

/// Check whether `input` (a hostname or full URL) matches `pattern`.
pub fn is_match(input: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if input == pattern {
        return true;
    }
    if pattern.contains('*') {
        let anchored = format!("^{}$", regex::escape(pattern).replace("\\*", ".*"));
        if let Ok(re) = Regex::new(&anchored) {
            if re.is_match(input) {
                return true;
            }
        }
    }
    // Bare substring containment is deliberate: the pattern `example`
    // matches `sub.example.com`.
    input.contains(pattern)
}

/// Whether a pattern should be tested against the full URL rather than the
/// bare hostname.
pub fn is_url_pattern(pattern: &str) -> bool {
    pattern.starts_with("http://")
        || pattern.starts_with("https://")
        || pattern.starts_with("ws://")
        || pattern.starts_with("wss://")
        || pattern.contains('/')
}
