// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document revisions.
//!
//! A revision is written as `"<height>-<hash>"`:
//!
//! ```text
//! 3-9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08
//! │ └─ sha256 over the canonical JSON of the content (without _rev/_meta)
//! └─── write count of this document on this instance
//! ```
//!
//! Every write produces `height + 1`. The hash is computed over a canonical
//! encoding (object keys sorted at every level) so two processes that write
//! identical content produce identical revisions.
//!
//! # Ordering
//!
//! Height is compared first, the hash breaks ties. The order is total and
//! deterministic, which is all the protocol needs: it never treats a higher
//! revision as "newer" across instances, only as a marker of a specific state.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a revision string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RevisionParseError {
    #[error("revision is missing the '-' separator: {0}")]
    MissingSeparator(String),
    #[error("revision height is not a number: {0}")]
    InvalidHeight(String),
    #[error("revision height must be at least 1: {0}")]
    ZeroHeight(String),
    #[error("revision hash is empty: {0}")]
    EmptyHash(String),
}

/// A parsed document revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision {
    height: u64,
    hash: String,
}

impl Revision {
    /// Build a revision from its parts.
    pub fn new(height: u64, hash: impl Into<String>) -> Self {
        Self {
            height,
            hash: hash.into(),
        }
    }

    /// Revision following `previous` for the given content.
    ///
    /// `content` must not contain `_rev` or `_meta`; use
    /// [`DocumentState::content`](crate::document::DocumentState::content).
    pub fn next(previous: Option<&Revision>, content: &Value) -> Self {
        let height = previous.map(|r| r.height).unwrap_or(0) + 1;
        Self {
            height,
            hash: content_hash(content),
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }
}

impl Ord for Revision {
    fn cmp(&self, other: &Self) -> Ordering {
        self.height
            .cmp(&other.height)
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.height, self.hash)
    }
}

impl FromStr for Revision {
    type Err = RevisionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (height, hash) = s
            .split_once('-')
            .ok_or_else(|| RevisionParseError::MissingSeparator(s.to_string()))?;
        let height: u64 = height
            .parse()
            .map_err(|_| RevisionParseError::InvalidHeight(s.to_string()))?;
        if height == 0 {
            return Err(RevisionParseError::ZeroHeight(s.to_string()));
        }
        if hash.is_empty() {
            return Err(RevisionParseError::EmptyHash(s.to_string()));
        }
        Ok(Self::new(height, hash))
    }
}

impl Serialize for Revision {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Revision {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Parse only the height of a revision string.
pub fn parse_height(rev: &str) -> Result<u64, RevisionParseError> {
    rev.parse::<Revision>().map(|r| r.height)
}

/// Hex sha256 of the canonical JSON encoding of `content`.
pub fn content_hash(content: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(content, &mut canonical);
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// JSON encoding with object keys sorted at every level.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => write_canonical_object(map, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        // Scalars have a single encoding in serde_json
        other => out.push_str(&other.to_string()),
    }
}

fn write_canonical_object(map: &Map<String, Value>, out: &mut String) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    out.push('{');
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&Value::String(key.clone()).to_string());
        out.push(':');
        write_canonical(&map[key], out);
    }
    out.push('}');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_next_from_none_is_height_one() {
        let rev = Revision::next(None, &json!({"id": "a", "v": 1}));
        assert_eq!(rev.height(), 1);
        assert_eq!(rev.hash().len(), 64);
    }

    #[test]
    fn test_next_increments_height() {
        let first = Revision::next(None, &json!({"v": 1}));
        let second = Revision::next(Some(&first), &json!({"v": 2}));
        assert_eq!(second.height(), 2);
        assert!(second > first);
    }

    #[test]
    fn test_hash_ignores_key_order() {
        let a = content_hash(&json!({"a": 1, "b": {"x": true, "y": [1, 2]}}));
        let b = content_hash(&json!({"b": {"y": [1, 2], "x": true}, "a": 1}));
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_differs_for_different_content() {
        assert_ne!(content_hash(&json!({"v": 1})), content_hash(&json!({"v": 2})));
        assert_ne!(content_hash(&json!([1, 2])), content_hash(&json!([2, 1])));
    }

    #[test]
    fn test_display_and_parse() {
        let rev: Revision = "12-abcdef".parse().unwrap();
        assert_eq!(rev.height(), 12);
        assert_eq!(rev.hash(), "abcdef");
        assert_eq!(rev.to_string(), "12-abcdef");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            "abc".parse::<Revision>(),
            Err(RevisionParseError::MissingSeparator(_))
        ));
        assert!(matches!(
            "x-abc".parse::<Revision>(),
            Err(RevisionParseError::InvalidHeight(_))
        ));
        assert!(matches!(
            "0-abc".parse::<Revision>(),
            Err(RevisionParseError::ZeroHeight(_))
        ));
        assert!(matches!(
            "3-".parse::<Revision>(),
            Err(RevisionParseError::EmptyHash(_))
        ));
    }

    #[test]
    fn test_parse_height() {
        assert_eq!(parse_height("7-ff").unwrap(), 7);
        assert!(parse_height("nope").is_err());
    }

    #[test]
    fn test_ordering_height_first_then_hash() {
        let low = Revision::new(2, "zzz");
        let high = Revision::new(3, "aaa");
        assert!(low < high);

        let a = Revision::new(3, "aaa");
        let b = Revision::new(3, "bbb");
        assert!(a < b);
    }

    #[test]
    fn test_serde_as_string() {
        let rev = Revision::new(4, "beef");
        let json = serde_json::to_string(&rev).unwrap();
        assert_eq!(json, "\"4-beef\"");
        let back: Revision = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rev);
        assert!(serde_json::from_str::<Revision>("\"bad\"").is_err());
    }
}
