//! Routing-key matching.
//!
//! Routing keys are dot-separated words (e.g. `"orders.eu.created"`).
//! A [`RoutePattern`] uses topic-exchange wildcards:
//! - `*` matches exactly one word
//! - `#` matches zero or more words, anywhere in the pattern
//!
//! Matching is case-sensitive and performs no normalization. `#` may appear
//! more than once; consecutive `#` words are redundant but accepted.
//!
//! ```
//! use warren_core::{RoutePattern, match_patterns};
//!
//! let patterns = [
//!     RoutePattern::new("a.*.c").unwrap(),
//!     RoutePattern::new("a.#").unwrap(),
//!     RoutePattern::new("x.y").unwrap(),
//! ];
//! let matched: Vec<_> = match_patterns("a.b.c", &patterns)
//!     .into_iter()
//!     .map(RoutePattern::as_str)
//!     .collect();
//! assert_eq!(matched, ["a.*.c", "a.#"]);
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PatternError;

/// Separator between routing-key words.
pub const WORD_SEPARATOR: char = '.';
/// Wildcard matching exactly one word.
pub const WILDCARD_SINGLE: &str = "*";
/// Wildcard matching zero or more words.
pub const WILDCARD_MULTI: &str = "#";

/// One word of a parsed [`RoutePattern`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PatternSegment {
    /// Matches this exact word.
    Literal(String),
    /// `*`
    Single,
    /// `#`
    Multi,
}

/// An immutable, parsed route pattern.
///
/// Equality, ordering and hashing follow the original pattern text, so two
/// patterns are "the same" exactly when they were written the same way.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoutePattern {
    original: String,
    segments: Vec<PatternSegment>,
}

impl RoutePattern {
    /// Parses a route pattern.
    ///
    /// # Errors
    ///
    /// Returns [`PatternError::Empty`] for the empty string.
    pub fn new(pattern: impl Into<String>) -> Result<Self, PatternError> {
        let original = pattern.into();
        if original.is_empty() {
            return Err(PatternError::Empty);
        }

        let segments = original
            .split(WORD_SEPARATOR)
            .map(|word| match word {
                WILDCARD_SINGLE => PatternSegment::Single,
                WILDCARD_MULTI => PatternSegment::Multi,
                literal => PatternSegment::Literal(literal.to_string()),
            })
            .collect();

        Ok(Self { original, segments })
    }

    /// Returns the pattern text as written.
    pub fn as_str(&self) -> &str {
        &self.original
    }

    /// Returns the parsed segments.
    pub fn segments(&self) -> &[PatternSegment] {
        &self.segments
    }

    /// Returns `true` if the pattern contains `*` or `#`.
    pub fn has_wildcards(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, PatternSegment::Single | PatternSegment::Multi))
    }

    /// Checks whether `routing_key` matches this pattern.
    pub fn matches(&self, routing_key: &str) -> bool {
        let words = split_key(routing_key);
        matches_words(&self.segments, &words)
    }
}

/// Splits a routing key into words. The empty key has no words.
fn split_key(routing_key: &str) -> Vec<&str> {
    if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split(WORD_SEPARATOR).collect()
    }
}

/// Topic matching over word positions.
///
/// `row[j]` holds whether `segments[i..]` matches `words[j..]`; rows are
/// filled from the last segment backwards, so `#` can try every split of the
/// remaining words without recursion.
fn matches_words(segments: &[PatternSegment], words: &[&str]) -> bool {
    let m = words.len();
    let mut next = vec![false; m + 1];
    next[m] = true;

    for segment in segments.iter().rev() {
        let mut row = vec![false; m + 1];
        match segment {
            PatternSegment::Literal(lit) => {
                for j in 0..m {
                    row[j] = words[j] == lit && next[j + 1];
                }
            }
            PatternSegment::Single => {
                for j in 0..m {
                    row[j] = next[j + 1];
                }
            }
            PatternSegment::Multi => {
                row[m] = next[m];
                for j in (0..m).rev() {
                    row[j] = next[j] || row[j + 1];
                }
            }
        }
        next = row;
    }

    next[0]
}

/// Returns every pattern in `patterns` that matches `routing_key`, in input order.
pub fn match_patterns<'a, I>(routing_key: &str, patterns: I) -> Vec<&'a RoutePattern>
where
    I: IntoIterator<Item = &'a RoutePattern>,
{
    let words = split_key(routing_key);
    patterns
        .into_iter()
        .filter(|p| matches_words(&p.segments, &words))
        .collect()
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

impl fmt::Debug for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoutePattern({:?})", self.original)
    }
}

impl PartialEq for RoutePattern {
    fn eq(&self, other: &Self) -> bool {
        self.original == other.original
    }
}

impl Eq for RoutePattern {}

impl std::hash::Hash for RoutePattern {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.original.hash(state);
    }
}

impl PartialOrd for RoutePattern {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RoutePattern {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.original.cmp(&other.original)
    }
}

impl AsRef<str> for RoutePattern {
    fn as_ref(&self) -> &str {
        &self.original
    }
}

impl FromStr for RoutePattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for RoutePattern {
    type Error = PatternError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for RoutePattern {
    type Error = PatternError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RoutePattern> for String {
    fn from(pattern: RoutePattern) -> Self {
        pattern.original
    }
}
