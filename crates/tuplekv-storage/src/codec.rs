//! Key codec
//!
//! Keys are tuples of primitive segments. On disk a key is the text form of
//! each segment joined by the ASCII Unit Separator, so plain byte-wise string
//! comparison orders serialized keys the way the tuples are meant to sort,
//! as long as segment text stays above the separator byte.
//!
//! Numeric segments are written as decimal text and therefore sort
//! lexicographically (`"10"` sorts before `"9"`).

use std::fmt;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use tuplekv_common::error::KeyError;

/// Segment separator (ASCII 0x1F)
pub const SEPARATOR: char = '\u{1f}';

/// First character above the separator; upper bound of a prefix scan
const SEPARATOR_SUCCESSOR: char = '\u{20}';

/// Escape character used in LIKE patterns
pub const LIKE_ESCAPE: char = '\\';

/// A single key segment
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
    String(String),
    Integer(i64),
    Bool(bool),
}

impl KeyPart {
    /// Try to get as string
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            KeyPart::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::String(s) => f.write_str(s),
            KeyPart::Integer(n) => write!(f, "{n}"),
            KeyPart::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for KeyPart {
    fn from(v: &str) -> Self {
        KeyPart::String(v.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(v: String) -> Self {
        KeyPart::String(v)
    }
}

impl From<&String> for KeyPart {
    fn from(v: &String) -> Self {
        KeyPart::String(v.clone())
    }
}

impl From<i64> for KeyPart {
    fn from(v: i64) -> Self {
        KeyPart::Integer(v)
    }
}

impl From<i32> for KeyPart {
    fn from(v: i32) -> Self {
        KeyPart::Integer(i64::from(v))
    }
}

impl From<u32> for KeyPart {
    fn from(v: u32) -> Self {
        KeyPart::Integer(i64::from(v))
    }
}

impl From<bool> for KeyPart {
    fn from(v: bool) -> Self {
        KeyPart::Bool(v)
    }
}

/// An ordered tuple of segments identifying one entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(Vec<KeyPart>);

impl Key {
    #[must_use]
    pub fn new(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }

    /// The empty key. Only storable when root keys are enabled.
    #[must_use]
    pub fn root() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, KeyPart> {
        self.0.iter()
    }

    /// Append a segment
    pub fn push(&mut self, part: impl Into<KeyPart>) {
        self.0.push(part.into());
    }

    /// A new key one level below this one
    #[must_use]
    pub fn child(&self, part: impl Into<KeyPart>) -> Self {
        let mut key = self.clone();
        key.push(part);
        key
    }

    /// Last segment, if any
    #[must_use]
    pub fn last(&self) -> Option<&KeyPart> {
        self.0.last()
    }

    /// Whether `prefix` is a proper prefix of this key
    #[must_use]
    pub fn starts_with(&self, prefix: &Key) -> bool {
        self.0.len() > prefix.0.len() && self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_char('[')?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match part {
                KeyPart::String(s) => write!(f, "{s:?}")?,
                other => write!(f, "{other}")?,
            }
        }
        f.write_char(']')
    }
}

impl std::ops::Index<usize> for Key {
    type Output = KeyPart;

    fn index(&self, index: usize) -> &KeyPart {
        &self.0[index]
    }
}

impl From<Vec<KeyPart>> for Key {
    fn from(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }
}

impl<T: Into<KeyPart>, const N: usize> From<[T; N]> for Key {
    fn from(parts: [T; N]) -> Self {
        Self(parts.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<KeyPart>> FromIterator<T> for Key {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl<'a> IntoIterator for &'a Key {
    type Item = &'a KeyPart;
    type IntoIter = std::slice::Iter<'a, KeyPart>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Build a [`Key`] from heterogeneous segments.
///
/// ```rust
/// use tuplekv_storage::{key, KeyPart};
///
/// let k = key!["users", 42, true];
/// assert_eq!(k.parts()[1], KeyPart::Integer(42));
/// ```
#[macro_export]
macro_rules! key {
    () => {
        $crate::Key::root()
    };
    ($($part:expr),+ $(,)?) => {
        $crate::Key::new(vec![$($crate::KeyPart::from($part)),+])
    };
}

/// Converts keys to and from their sortable text form
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyCodec {
    allow_root: bool,
}

impl KeyCodec {
    #[must_use]
    pub fn new(allow_root: bool) -> Self {
        Self { allow_root }
    }

    #[must_use]
    pub fn allows_root(&self) -> bool {
        self.allow_root
    }

    /// Join segments with the separator
    pub fn serialize(&self, key: &Key) -> Result<String, KeyError> {
        if key.is_empty() {
            return if self.allow_root {
                Ok(String::new())
            } else {
                Err(KeyError::Empty)
            };
        }
        if self.allow_root && key.len() == 1 && key[0].as_str() == Some("") {
            return Err(KeyError::RootCollision);
        }

        let mut out = String::new();
        for (i, part) in key.iter().enumerate() {
            if i > 0 {
                out.push(SEPARATOR);
            }
            match part {
                KeyPart::String(s) => {
                    if s.contains(SEPARATOR) {
                        return Err(KeyError::ContainsSeparator { segment: s.clone() });
                    }
                    out.push_str(s);
                }
                KeyPart::Integer(n) => {
                    let _ = write!(out, "{n}");
                }
                KeyPart::Bool(b) => {
                    let _ = write!(out, "{b}");
                }
            }
        }
        Ok(out)
    }

    /// Split on the separator. Segment types are not stored, so every
    /// segment comes back as a string.
    #[must_use]
    pub fn deserialize(&self, raw: &str) -> Key {
        if raw.is_empty() && self.allow_root {
            return Key::root();
        }
        raw.split(SEPARATOR).collect()
    }

    /// LIKE pattern matching every key nested under `prefix`, for use with
    /// `ESCAPE '\'`
    pub fn prefix_pattern(&self, prefix: &Key) -> Result<String, KeyError> {
        let serialized = self.serialize(prefix)?;
        let mut pattern = escape_like(&serialized);
        pattern.push(SEPARATOR);
        pattern.push('%');
        Ok(pattern)
    }

    /// Half-open byte range `[lower, upper)` covering exactly the keys
    /// nested under `prefix`
    pub fn prefix_bounds(&self, prefix: &Key) -> Result<(String, String), KeyError> {
        let serialized = self.serialize(prefix)?;
        let mut lower = serialized.clone();
        lower.push(SEPARATOR);
        let mut upper = serialized;
        upper.push(SEPARATOR_SUCCESSOR);
        Ok((lower, upper))
    }

    /// Bounds of a `[start, end)` scan
    pub fn range_bounds(&self, start: &Key, end: &Key) -> Result<(String, String), KeyError> {
        Ok((self.serialize(start)?, self.serialize(end)?))
    }
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | LIKE_ESCAPE) {
            out.push(LIKE_ESCAPE);
        }
        out.push(c);
    }
    out
}
