//! Canonical security identifiers
//!
//! Tickers arrive from three uncontrolled sources (the curated worksheet, the
//! spot snapshot and the forecast snapshot) in slightly different shapes:
//! `"600519.SH"`, `"2156"`, `" 002156 "`. All of them are folded into one
//! fixed-width six character code so the datasets share a key space.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Width of an A-share security code
pub const IDENTIFIER_WIDTH: usize = 6;

/// Normalized six character security code
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Normalize a raw ticker or code into a canonical identifier.
///
/// Takes the first six characters of the trimmed input and left-pads with
/// `'0'`. Never fails: garbage in produces a best-effort key that simply
/// won't match anything.
pub fn normalize(raw: &str) -> Identifier {
    let head: String = raw.trim().chars().take(IDENTIFIER_WIDTH).collect();
    // "12345 6" would otherwise keep a trailing blank and re-normalize differently
    let head = head.trim_end();
    let padding = IDENTIFIER_WIDTH - head.chars().count();
    let mut code = String::with_capacity(IDENTIFIER_WIDTH);
    code.extend(std::iter::repeat('0').take(padding));
    code.push_str(head);
    Identifier(code)
}
