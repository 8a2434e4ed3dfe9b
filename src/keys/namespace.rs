//! Namespace Splitting
//!
//! External keys address a table and a key inside it: `users:alice` lives
//! in table `users` under `alice`. Keys without a table prefix share the
//! default table.
//!
//! | external key   | table       | inner key |
//! |----------------|-------------|-----------|
//! | `foo`          | `__default` | `foo`     |
//! | `users:alice`  | `users`     | `alice`   |
//! | `users:`       | `users`     | `\0`      |
//! | `:foo`         | `__default` | `foo`     |
//! | `a:b:c`        | `a`         | `b:c`     |
//!
//! Several spellings can reach the same record (`foo`, `:foo` and
//! `__default:foo`). [`Namespaced::canonical`] gives the one spelling used
//! wherever a record is identified by its external key.

use bytes::{BufMut, Bytes, BytesMut};
use std::borrow::Cow;

/// Table that receives keys without a table prefix.
pub const DEFAULT_TABLE: &str = "__default";

/// Inner key substituted for an empty one.
pub const EMPTY_INNER_KEY: &[u8] = b"\0";

/// Table/key separator.
pub const SEPARATOR: u8 = b':';

/// An external key split into table and inner key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Namespaced<'a> {
    table: &'a [u8],
    inner: &'a [u8],
}

impl<'a> Namespaced<'a> {
    /// Raw table segment.
    pub fn table_bytes(&self) -> &'a [u8] {
        self.table
    }

    /// Table name used to route the key.
    pub fn table(&self) -> Cow<'a, str> {
        String::from_utf8_lossy(self.table)
    }

    /// Key inside the table; never empty.
    pub fn inner(&self) -> &'a [u8] {
        self.inner
    }

    /// `<table>:<inner>`; equal for every spelling of the same record.
    pub fn canonical(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.table.len() + 1 + self.inner.len());
        buf.put_slice(self.table);
        buf.put_u8(SEPARATOR);
        buf.put_slice(self.inner);
        buf.freeze()
    }
}

/// Canonical spelling of an external key.
pub fn canonical(key: &[u8]) -> Bytes {
    split(key).canonical()
}

/// Splits an external key at its first `:`.
pub fn split(key: &[u8]) -> Namespaced<'_> {
    let (table, inner) = match key.iter().position(|&b| b == SEPARATOR) {
        Some(0) => (DEFAULT_TABLE.as_bytes(), &key[1..]),
        Some(pos) => (&key[..pos], &key[pos + 1..]),
        None => (DEFAULT_TABLE.as_bytes(), key),
    };
    let inner = if inner.is_empty() {
        EMPTY_INNER_KEY
    } else {
        inner
    };
    Namespaced { table, inner }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_key_uses_default_table() {
        let ns = split(b"foo");
        assert_eq!(ns.table(), DEFAULT_TABLE);
        assert_eq!(ns.inner(), b"foo");
    }

    #[test]
    fn test_prefixed_key() {
        let ns = split(b"users:alice");
        assert_eq!(ns.table(), "users");
        assert_eq!(ns.table_bytes(), b"users");
        assert_eq!(ns.inner(), b"alice");
    }

    #[test]
    fn test_empty_inner_key_becomes_nul() {
        let ns = split(b"users:");
        assert_eq!(ns.table(), "users");
        assert_eq!(ns.inner(), EMPTY_INNER_KEY);
    }

    #[test]
    fn test_leading_separator() {
        let ns = split(b":foo");
        assert_eq!(ns.table(), DEFAULT_TABLE);
        assert_eq!(ns.inner(), b"foo");

        let ns = split(b":");
        assert_eq!(ns.table(), DEFAULT_TABLE);
        assert_eq!(ns.inner(), EMPTY_INNER_KEY);
    }

    #[test]
    fn test_only_first_separator_splits() {
        let ns = split(b"a:b:c");
        assert_eq!(ns.table(), "a");
        assert_eq!(ns.inner(), b"b:c");
    }

    #[test]
    fn test_canonical_spelling() {
        assert_eq!(&canonical(b"foo")[..], b"__default:foo");
        assert_eq!(canonical(b":foo"), canonical(b"foo"));
        assert_eq!(canonical(b"__default:foo"), canonical(b"foo"));
        assert_eq!(canonical(b"users:"), canonical(b"users:\0"));
        assert_eq!(&canonical(b"a:b:c")[..], b"a:b:c");
        assert_ne!(canonical(b"users:alice"), canonical(b"alice"));
    }

    #[test]
    fn test_canonical_splits_back_to_same_record() {
        for key in [&b"foo"[..], b":x:y", b"users:", b"t:k", b""] {
            let ns = split(key);
            let canonical = ns.canonical();
            let again = split(&canonical);
            assert_eq!(again.table(), ns.table());
            assert_eq!(again.inner(), ns.inner());
        }
    }

    #[test]
    fn test_empty_key() {
        let ns = split(b"");
        assert_eq!(ns.table(), DEFAULT_TABLE);
        assert_eq!(ns.inner(), EMPTY_INNER_KEY);
    }
}
