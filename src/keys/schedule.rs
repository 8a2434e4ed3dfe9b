//! Expiry Schedule Keys
//!
//! Every TTL registration writes one schedule entry keyed by
//! `(expire_at, sequence, originator)`. The schedule table is ordered so the
//! earliest-expiring entry is always first:
//!
//! ```text
//! ┌──────────────────┬──────────────┬────────────────┐
//! │ expire_at  i64LE │ sequence u32 │ originator u32 │   16 bytes
//! └──────────────────┴──────────────┴────────────────┘
//! ```
//!
//! `expire_at` is in seconds since the Unix epoch. Ties are broken by
//! `sequence` then `originator`, so two writers never collide as long as each
//! originator hands out increasing sequence numbers.

use crate::error::KeyError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::cmp::Ordering;
use std::fmt;
use tracing::error;

/// Composite key of a schedule entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScheduleKey {
    /// Absolute expiry time (seconds since the Unix epoch)
    pub expire_at: i64,
    /// Per-originator sequence number
    pub sequence: u32,
    /// Identifies the writer that registered the TTL
    pub originator: u32,
}

impl ScheduleKey {
    /// Encoded width in bytes.
    pub const LEN: usize = 16;

    pub fn new(expire_at: i64, sequence: u32, originator: u32) -> Self {
        Self {
            expire_at,
            sequence,
            originator,
        }
    }

    /// True once `now` has reached the expiry time.
    #[inline]
    pub fn is_due(&self, now: i64) -> bool {
        self.expire_at <= now
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_i64_le(self.expire_at);
        buf.put_u32_le(self.sequence);
        buf.put_u32_le(self.originator);
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, KeyError> {
        if buf.len() != Self::LEN {
            return Err(KeyError::ScheduleKeyLength {
                len: buf.len(),
                expected: Self::LEN,
            });
        }
        Ok(Self {
            expire_at: buf.get_i64_le(),
            sequence: buf.get_u32_le(),
            originator: buf.get_u32_le(),
        })
    }
}

impl fmt::Display for ScheduleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.expire_at, self.sequence, self.originator)
    }
}

/// Ordering function for the schedule table.
pub fn compare(a: &[u8], b: &[u8]) -> Ordering {
    match (ScheduleKey::decode(a), ScheduleKey::decode(b)) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        (Err(e), _) | (_, Err(e)) => {
            error!(
                op = "compare|expire",
                code = "MALFORMED_KEY",
                error = %e,
                "Malformed schedule key, falling back to byte order"
            );
            a.cmp(b)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(expire_at: i64, sequence: u32, originator: u32) -> Bytes {
        ScheduleKey::new(expire_at, sequence, originator).encode()
    }

    #[test]
    fn test_layout() {
        let key = enc(1, 2, 3);
        assert_eq!(key.len(), ScheduleKey::LEN);
        assert_eq!(&key[..8], &1i64.to_le_bytes());
        assert_eq!(&key[8..12], &2u32.to_le_bytes());
        assert_eq!(&key[12..], &3u32.to_le_bytes());
        assert_eq!(ScheduleKey::decode(&key).unwrap(), ScheduleKey::new(1, 2, 3));
    }

    #[test]
    fn test_expire_at_dominates() {
        assert_eq!(compare(&enc(10, 99, 99), &enc(20, 0, 0)), Ordering::Less);
        assert_eq!(compare(&enc(20, 0, 0), &enc(10, 99, 99)), Ordering::Greater);
    }

    #[test]
    fn test_ties_broken_by_sequence_then_originator() {
        assert_eq!(compare(&enc(10, 1, 9), &enc(10, 2, 0)), Ordering::Less);
        assert_eq!(compare(&enc(10, 2, 1), &enc(10, 2, 2)), Ordering::Less);
        assert_eq!(compare(&enc(10, 2, 2), &enc(10, 2, 2)), Ordering::Equal);
    }

    #[test]
    fn test_numeric_not_bytewise() {
        // 256 encodes as [0, 1, ..] little-endian, which is bytewise smaller than 1
        assert_eq!(compare(&enc(1, 0, 0), &enc(256, 0, 0)), Ordering::Less);
        assert_eq!(compare(&enc(-5, 0, 0), &enc(3, 0, 0)), Ordering::Less);
        assert_eq!(compare(&enc(5, 1, 0), &enc(5, 256, 0)), Ordering::Less);
    }

    #[test]
    fn test_due() {
        let key = ScheduleKey::new(100, 0, 0);
        assert!(!key.is_due(99));
        assert!(key.is_due(100));
        assert!(key.is_due(101));
    }

    #[test]
    fn test_wrong_width() {
        assert_eq!(
            ScheduleKey::decode(&[0u8; 12]),
            Err(KeyError::ScheduleKeyLength { len: 12, expected: 16 })
        );
        assert_eq!(compare(&[1u8], &[2u8]), Ordering::Less);
    }
}
