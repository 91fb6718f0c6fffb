//! Entries, selectors and list options

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tuplekv_common::{Error, Result};

use crate::codec::Key;

/// A stored key with its decoded value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry<T = Value> {
    pub key: Key,
    pub value: T,
}

/// Result of a point read. `value` is `None` when the key is absent.
///
/// A stored JSON `null` also reads back as `None`; the two cases are not
/// distinguishable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMaybe<T = Value> {
    pub key: Key,
    pub value: Option<T>,
}

impl<T> EntryMaybe<T> {
    #[must_use]
    pub fn absent(key: Key) -> Self {
        Self { key, value: None }
    }

    #[must_use]
    pub fn is_present(&self) -> bool {
        self.value.is_some()
    }

    pub fn into_value(self) -> Option<T> {
        self.value
    }
}

impl<T> From<Entry<T>> for EntryMaybe<T> {
    fn from(entry: Entry<T>) -> Self {
        Self {
            key: entry.key,
            value: Some(entry.value),
        }
    }
}

/// Which keys a scan visits
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Every key strictly nested under the prefix
    Prefix(Key),
    /// Keys in `[start, end)` by serialized order
    Range { start: Key, end: Key },
}

impl Selector {
    pub fn prefix(prefix: impl Into<Key>) -> Self {
        Selector::Prefix(prefix.into())
    }

    pub fn range(start: impl Into<Key>, end: impl Into<Key>) -> Self {
        Selector::Range {
            start: start.into(),
            end: end.into(),
        }
    }
}

/// Loosely shaped selector input, e.g. from a request body or the CLI.
/// A prefix wins over a range when both are given.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<Key>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<Key>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<Key>,
}

impl TryFrom<SelectorSpec> for Selector {
    type Error = Error;

    fn try_from(spec: SelectorSpec) -> Result<Self> {
        match spec {
            SelectorSpec {
                prefix: Some(prefix),
                ..
            } => Ok(Selector::Prefix(prefix)),
            SelectorSpec {
                start: Some(start),
                end: Some(end),
                ..
            } => Ok(Selector::Range { start, end }),
            _ => Err(Error::incomplete_selector()),
        }
    }
}

impl From<Selector> for SelectorSpec {
    fn from(selector: Selector) -> Self {
        match selector {
            Selector::Prefix(prefix) => Self {
                prefix: Some(prefix),
                ..Self::default()
            },
            Selector::Range { start, end } => Self {
                prefix: None,
                start: Some(start),
                end: Some(end),
            },
        }
    }
}

/// Scan options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListOptions {
    /// Maximum number of entries; `Some(0)` yields nothing
    pub limit: Option<usize>,
    /// Descending key order
    pub reverse: bool,
}

impl ListOptions {
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn reverse(mut self) -> Self {
        self.reverse = true;
        self
    }
}
