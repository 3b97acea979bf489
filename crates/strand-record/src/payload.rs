//! Record payloads: an opaque blob, or a group of named sub-payloads.

use bytes::Bytes;
use std::collections::BTreeMap;

/// A payload group: multiple named sub-payloads delivered as one record.
///
/// Keys are ordered so the encoded form is deterministic.
pub type PayloadGroup = BTreeMap<String, Bytes>;

/// The user-visible body of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// A single opaque blob.
    Flat(Bytes),
    /// Multiple named sub-payloads.
    Group(PayloadGroup),
}

impl Payload {
    pub fn flat(bytes: impl Into<Bytes>) -> Self {
        Payload::Flat(bytes.into())
    }

    pub fn group<I, K>(parts: I) -> Self
    where
        I: IntoIterator<Item = (K, Bytes)>,
        K: Into<String>,
    {
        Payload::Group(parts.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn empty() -> Self {
        Payload::Flat(Bytes::new())
    }

    /// Aggregate size in bytes, counting group keys.
    pub fn size(&self) -> usize {
        match self {
            Payload::Flat(b) => b.len(),
            Payload::Group(g) => g.iter().map(|(k, v)| k.len() + v.len()).sum(),
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Payload::Group(_))
    }

    /// The flat blob, if this is not a group.
    pub fn as_flat(&self) -> Option<&Bytes> {
        match self {
            Payload::Flat(b) => Some(b),
            Payload::Group(_) => None,
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload::empty()
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        Payload::Flat(b)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(v: Vec<u8>) -> Self {
        Payload::Flat(Bytes::from(v))
    }
}

impl From<&'static [u8]> for Payload {
    fn from(s: &'static [u8]) -> Self {
        Payload::Flat(Bytes::from_static(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_size() {
        assert_eq!(Payload::flat(vec![1u8, 2, 3]).size(), 3);
        assert_eq!(Payload::empty().size(), 0);
    }

    #[test]
    fn group_size_counts_keys() {
        let p = Payload::group(vec![
            ("a", Bytes::from_static(b"xy")),
            ("bb", Bytes::from_static(b"z")),
        ]);
        assert_eq!(p.size(), 1 + 2 + 2 + 1);
        assert!(p.is_group());
        assert!(p.as_flat().is_none());
    }
}
