//! Materialized read model of a replica.
//!
//! The log is the source of truth; a [`ContentTree`] is a throwaway
//! projection of it. Runs of characters sharing the same attributes coalesce
//! into spans, which is the shape editors and tests want to look at.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Attribute set of one styled run, e.g. `{"bold": true}`.
pub type Attrs = BTreeMap<String, Value>;

/// A maximal run of consecutive characters with identical attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub text: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: Attrs,
}

/// The visible document: spans in order, tombstones already filtered out.
///
/// Rebuilt on every materialize; equality between two trees is exactly the
/// convergence check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentTree {
    pub spans: Vec<Span>,
}

impl ContentTree {
    /// Coalesce a stream of styled characters into maximal spans.
    pub fn from_chars<I>(chars: I) -> Self
    where
        I: IntoIterator<Item = (char, Attrs)>,
    {
        let mut spans: Vec<Span> = Vec::new();
        for (ch, attrs) in chars {
            match spans.last_mut() {
                Some(last) if last.attrs == attrs => last.text.push(ch),
                _ => spans.push(Span {
                    text: ch.to_string(),
                    attrs,
                }),
            }
        }
        ContentTree { spans }
    }

    /// Plain text without styling.
    pub fn text(&self) -> String {
        self.spans.iter().map(|s| s.text.as_str()).collect()
    }

    /// Number of visible characters (chars, not bytes).
    pub fn char_len(&self) -> usize {
        self.spans.iter().map(|s| s.text.chars().count()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

impl fmt::Display for ContentTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text())
    }
}
