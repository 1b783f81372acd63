//! Ordered call metadata with wire-rule validation.
//!
//! Keys are case-normalized to lowercase and must match `[0-9a-z_.-]+`.
//! Keys ending in `-bin` carry opaque byte values; all other keys carry
//! ASCII string values. Mixing the two is rejected at construction.
//! Metadata is immutable once handed to a call.

use bytes::Bytes;

use crate::error::UsageError;

/// Suffix marking a key whose value is raw bytes.
pub const BINARY_KEY_SUFFIX: &str = "-bin";

/// A single metadata value: ASCII text or raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    /// ASCII string value for ordinary keys.
    Ascii(String),
    /// Opaque byte value for `-bin` keys.
    Binary(Bytes),
}

impl MetadataValue {
    /// Returns the string value, if this is an ASCII entry.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Ascii(s) => Some(s),
            MetadataValue::Binary(_) => None,
        }
    }

    /// Returns the byte value, if this is a binary entry.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            MetadataValue::Ascii(_) => None,
            MetadataValue::Binary(b) => Some(b),
        }
    }
}

/// An ordered sequence of `(key, value)` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, MetadataValue)>,
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'_' | b'.' | b'-'))
}

impl Metadata {
    /// Creates empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an ASCII entry. The key is lowercased before validation.
    ///
    /// Rejects keys outside `[0-9a-z_.-]+` and keys carrying the `-bin`
    /// suffix, which require a binary value.
    pub fn add_ascii(
        &mut self,
        key: impl AsRef<str>,
        value: impl Into<String>,
    ) -> std::result::Result<(), UsageError> {
        let key = key.as_ref().to_ascii_lowercase();
        if !is_valid_key(&key) {
            return Err(UsageError::InvalidMetadataKey(key));
        }
        if key.ends_with(BINARY_KEY_SUFFIX) {
            return Err(UsageError::AsciiValueForBinaryKey(key));
        }
        self.entries.push((key, MetadataValue::Ascii(value.into())));
        Ok(())
    }

    /// Appends a binary entry. The key must end in `-bin`.
    pub fn add_binary(
        &mut self,
        key: impl AsRef<str>,
        value: impl Into<Bytes>,
    ) -> std::result::Result<(), UsageError> {
        let key = key.as_ref().to_ascii_lowercase();
        if !is_valid_key(&key) {
            return Err(UsageError::InvalidMetadataKey(key));
        }
        if !key.ends_with(BINARY_KEY_SUFFIX) {
            return Err(UsageError::BinaryValueForAsciiKey(key));
        }
        self.entries
            .push((key, MetadataValue::Binary(value.into())));
        Ok(())
    }

    /// Returns the first value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends every entry of `other`, preserving order.
    pub fn extend(&mut self, other: &Metadata) {
        self.entries.extend(other.entries.iter().cloned());
    }
}
