//! The decoded representation of a bencode document.
use std::collections::BTreeMap;

/// Dictionary keys are raw byte strings ordered lexicographically, which is
/// exactly the order bencode requires on the wire.
pub type Dict = BTreeMap<Vec<u8>, Value>;

/// A bencode value.
///
/// Byte strings are raw bytes; no character encoding is assumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(Dict),
}

impl Value {
    /// A byte-string value from anything byte-like.
    #[must_use]
    pub fn bytes(bytes: impl AsRef<[u8]>) -> Self {
        Self::Bytes(bytes.as_ref().to_vec())
    }

    /// A dictionary value from `(key, value)` pairs. Keys are sorted by the
    /// underlying map regardless of the order given here.
    #[must_use]
    pub fn dict_from<'a>(entries: impl IntoIterator<Item = (&'a [u8], Value)>) -> Self {
        Self::Dict(
            entries
                .into_iter()
                .map(|(key, value)| (key.to_vec(), value))
                .collect(),
        )
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// The byte string as UTF-8, if it is one.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Self::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    /// Looks up `key` when `self` is a dictionary.
    #[must_use]
    pub fn dict_get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict().and_then(|entries| entries.get(key))
    }
}
