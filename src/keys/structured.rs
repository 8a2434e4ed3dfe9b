//! Structured Key Ordering
//!
//! Tables that hold structured keys store them as self-describing
//! MessagePack values: integers, strings and (nested) arrays. The storage
//! engine orders those tables with [`compare`], which walks both keys
//! element by element without allocating.
//!
//! ## Order
//!
//! ```text
//! Integer  <  String  <  Array              (different element types)
//! -3 < 0 < 7 < 300                          (integers, any encoded width)
//! "a" < "ab" < "b"                          (bytes up to the first NUL)
//! [1, "a"] < [1, "b"] < [2]                 (first difference decides)
//! ["x"] < ["x", "y"]                        (shorter prefix is less)
//! ```
//!
//! ## Malformed keys
//!
//! A key that ends mid-element, carries an unsupported tag or a string
//! longer than [`MAX_STRING_LEN`] cannot be ordered. The engine still needs
//! an answer, so [`compare`] logs the decode error and falls back to plain
//! byte order. [`try_compare`] exposes the error instead.

use crate::error::KeyError;
use bytes::{Buf, Bytes};
use rmp::Marker;
use std::cmp::Ordering;
use tracing::{error, trace};

/// Largest string element the comparator decodes.
pub const MAX_STRING_LEN: usize = 511;

/// Maximum array nesting depth (prevent stack overflow)
pub const MAX_NESTING_DEPTH: usize = 32;

/// A structured key value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructuredKey {
    Int(i64),
    Str(String),
    Array(Vec<StructuredKey>),
}

impl StructuredKey {
    /// Encodes the key using the smallest MessagePack representation.
    pub fn encode(&self) -> Result<Bytes, KeyError> {
        let mut buf = Vec::new();
        self.write_to(&mut buf, 0)?;
        Ok(Bytes::from(buf))
    }

    fn write_to(&self, buf: &mut Vec<u8>, depth: usize) -> Result<(), KeyError> {
        if depth > MAX_NESTING_DEPTH {
            return Err(KeyError::TooDeep(MAX_NESTING_DEPTH));
        }
        match self {
            StructuredKey::Int(n) => {
                rmp::encode::write_sint(buf, *n).map_err(|e| KeyError::Encode(e.to_string()))?;
            }
            StructuredKey::Str(s) => {
                if s.len() > MAX_STRING_LEN {
                    return Err(KeyError::StringTooLong {
                        len: s.len(),
                        max: MAX_STRING_LEN,
                    });
                }
                rmp::encode::write_str(buf, s).map_err(|e| KeyError::Encode(e.to_string()))?;
            }
            StructuredKey::Array(items) => {
                let len = u32::try_from(items.len())
                    .map_err(|_| KeyError::Encode(format!("array of {} items", items.len())))?;
                rmp::encode::write_array_len(buf, len)
                    .map_err(|e| KeyError::Encode(e.to_string()))?;
                for item in items {
                    item.write_to(buf, depth + 1)?;
                }
            }
        }
        Ok(())
    }

    /// Decodes the first element of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, KeyError> {
        let mut reader = KeyReader::new(buf);
        Self::read_from(&mut reader, 0)
    }

    fn read_from(reader: &mut KeyReader<'_>, depth: usize) -> Result<Self, KeyError> {
        if depth > MAX_NESTING_DEPTH {
            return Err(KeyError::TooDeep(MAX_NESTING_DEPTH));
        }
        match reader.next_element()? {
            Element::Int(n) => i64::try_from(n)
                .map(StructuredKey::Int)
                .map_err(|_| KeyError::Encode(format!("integer {} out of i64 range", n))),
            Element::Str(s) => Ok(StructuredKey::Str(String::from_utf8_lossy(s).into_owned())),
            Element::Array(len) => {
                let mut items = Vec::with_capacity((len as usize).min(64));
                for _ in 0..len {
                    items.push(Self::read_from(reader, depth + 1)?);
                }
                Ok(StructuredKey::Array(items))
            }
        }
    }
}

impl From<i64> for StructuredKey {
    fn from(n: i64) -> Self {
        StructuredKey::Int(n)
    }
}

impl From<&str> for StructuredKey {
    fn from(s: &str) -> Self {
        StructuredKey::Str(s.to_string())
    }
}

impl From<String> for StructuredKey {
    fn from(s: String) -> Self {
        StructuredKey::Str(s)
    }
}

impl From<Vec<StructuredKey>> for StructuredKey {
    fn from(items: Vec<StructuredKey>) -> Self {
        StructuredKey::Array(items)
    }
}

/// One decoded element header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Element<'a> {
    Int(i128),
    Str(&'a [u8]),
    /// Array header; the items follow in the stream
    Array(u32),
}

impl Element<'_> {
    /// Fixed rank used when two elements have different types.
    fn rank(&self) -> u8 {
        match self {
            Element::Int(_) => 0,
            Element::Str(_) => 1,
            Element::Array(_) => 2,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Element::Int(_) => "int",
            Element::Str(_) => "str",
            Element::Array(_) => "array",
        }
    }
}

/// Streaming decoder over a borrowed key.
struct KeyReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> KeyReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], KeyError> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.buf.len());
        match end {
            Some(end) => {
                let slice = &self.buf[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(KeyError::Truncated {
                offset: self.pos,
                needed: n,
            }),
        }
    }

    fn str_of(&mut self, len: usize) -> Result<Element<'a>, KeyError> {
        if len > MAX_STRING_LEN {
            return Err(KeyError::StringTooLong {
                len,
                max: MAX_STRING_LEN,
            });
        }
        self.take(len).map(Element::Str)
    }

    fn next_element(&mut self) -> Result<Element<'a>, KeyError> {
        let tag = self.take(1)?[0];
        let element = match Marker::from_u8(tag) {
            Marker::FixPos(n) => Element::Int(i128::from(n)),
            Marker::FixNeg(n) => Element::Int(i128::from(n)),
            Marker::U8 => Element::Int(i128::from(self.take(1)?.get_u8())),
            Marker::U16 => Element::Int(i128::from(self.take(2)?.get_u16())),
            Marker::U32 => Element::Int(i128::from(self.take(4)?.get_u32())),
            Marker::U64 => Element::Int(i128::from(self.take(8)?.get_u64())),
            Marker::I8 => Element::Int(i128::from(self.take(1)?.get_i8())),
            Marker::I16 => Element::Int(i128::from(self.take(2)?.get_i16())),
            Marker::I32 => Element::Int(i128::from(self.take(4)?.get_i32())),
            Marker::I64 => Element::Int(i128::from(self.take(8)?.get_i64())),
            Marker::FixStr(len) => self.str_of(usize::from(len))?,
            Marker::Str8 => {
                let len = self.take(1)?.get_u8();
                self.str_of(usize::from(len))?
            }
            Marker::Str16 => {
                let len = self.take(2)?.get_u16();
                self.str_of(usize::from(len))?
            }
            Marker::Str32 => {
                let len = self.take(4)?.get_u32();
                self.str_of(len as usize)?
            }
            Marker::FixArray(len) => Element::Array(u32::from(len)),
            Marker::Array16 => Element::Array(u32::from(self.take(2)?.get_u16())),
            Marker::Array32 => Element::Array(self.take(4)?.get_u32()),
            _ => return Err(KeyError::UnsupportedTag(tag)),
        };
        Ok(element)
    }
}

/// String bytes up to (not including) the first NUL.
fn nul_terminated(s: &[u8]) -> &[u8] {
    match s.iter().position(|&b| b == 0) {
        Some(end) => &s[..end],
        None => s,
    }
}

fn compare_element(
    a: &mut KeyReader<'_>,
    b: &mut KeyReader<'_>,
    depth: usize,
) -> Result<Ordering, KeyError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(KeyError::TooDeep(MAX_NESTING_DEPTH));
    }

    match (a.next_element()?, b.next_element()?) {
        (Element::Int(x), Element::Int(y)) => Ok(x.cmp(&y)),
        (Element::Str(x), Element::Str(y)) => Ok(nul_terminated(x).cmp(nul_terminated(y))),
        (Element::Array(n), Element::Array(m)) => {
            for _ in 0..n.min(m) {
                let ord = compare_element(a, b, depth + 1)?;
                if ord != Ordering::Equal {
                    return Ok(ord);
                }
            }
            Ok(n.cmp(&m))
        }
        (x, y) => {
            trace!(
                left = x.type_name(),
                right = y.type_name(),
                "Comparing structured key elements of different types"
            );
            Ok(x.rank().cmp(&y.rank()))
        }
    }
}

/// Orders two structured keys, reporting decode failures.
pub fn try_compare(a: &[u8], b: &[u8]) -> Result<Ordering, KeyError> {
    let mut left = KeyReader::new(a);
    let mut right = KeyReader::new(b);
    compare_element(&mut left, &mut right, 0)
}

/// Ordering function for tables holding structured keys.
///
/// Never fails: malformed input is logged and ordered bytewise.
pub fn compare(a: &[u8], b: &[u8]) -> Ordering {
    match try_compare(a, b) {
        Ok(ord) => ord,
        Err(e) => {
            error!(
                op = "compare|structured",
                code = "MALFORMED_KEY",
                error = %e,
                "Malformed structured key, falling back to byte order"
            );
            a.cmp(b)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(value: StructuredKey) -> Bytes {
        value.encode().unwrap()
    }

    fn int(n: i64) -> StructuredKey {
        StructuredKey::Int(n)
    }

    fn arr(items: Vec<StructuredKey>) -> StructuredKey {
        StructuredKey::Array(items)
    }

    #[test]
    fn test_encoding_is_msgpack() {
        assert_eq!(&key(int(1))[..], &[0x01]);
        assert_eq!(&key(int(-1))[..], &[0xff]);
        assert_eq!(&key("ab".into())[..], &[0xa2, b'a', b'b']);
        assert_eq!(
            &key(arr(vec![int(1), "b".into()]))[..],
            &[0x92, 0x01, 0xa1, b'b']
        );
    }

    #[test]
    fn test_decode_nested() {
        let value = arr(vec![
            int(7),
            arr(vec!["users".into(), int(-300)]),
            "tail".into(),
        ]);
        assert_eq!(StructuredKey::decode(&key(value.clone())).unwrap(), value);
    }

    #[test]
    fn test_equal_keys() {
        let a = key(arr(vec![int(1), "a".into()]));
        assert_eq!(compare(&a, &a), Ordering::Equal);
    }

    #[test]
    fn test_array_first_difference_decides() {
        let a = key(arr(vec![int(1), "b".into()]));
        let b = key(arr(vec![int(1), "a".into()]));
        assert_eq!(compare(&a, &b), Ordering::Greater);
        assert_eq!(compare(&b, &a), Ordering::Less);

        let c = key(arr(vec![int(2)]));
        assert_eq!(compare(&a, &c), Ordering::Less);
    }

    #[test]
    fn test_shorter_array_is_less() {
        let short = key(arr(vec!["x".into()]));
        let long = key(arr(vec!["x".into(), "y".into()]));
        assert_eq!(compare(&short, &long), Ordering::Less);
        assert_eq!(compare(&long, &short), Ordering::Greater);

        let empty = key(arr(vec![]));
        assert_eq!(compare(&empty, &short), Ordering::Less);
    }

    #[test]
    fn test_integers_compare_across_widths() {
        // fixint, u16, i8, i64 encodings of the same number line
        let values: [i64; 6] = [i64::MIN, -129, -1, 0, 127, 70_000];
        for pair in values.windows(2) {
            let lo = key(pair[0].into());
            let hi = key(pair[1].into());
            assert_eq!(compare(&lo, &hi), Ordering::Less, "{} < {}", pair[0], pair[1]);
        }

        // u64 beyond i64 range still sorts above every i64
        let huge = [0xcf, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff];
        assert_eq!(compare(&huge, &key(i64::MAX.into())), Ordering::Greater);
    }

    #[test]
    fn test_strings_are_nul_terminated() {
        let a = [0xa3, b'a', 0x00, b'b'];
        let b = [0xa3, b'a', 0x00, b'c'];
        assert_eq!(compare(&a, &b), Ordering::Equal);

        let ab = key("ab".into());
        let b_only = key("b".into());
        assert_eq!(compare(&ab, &b_only), Ordering::Less);
        assert_eq!(compare(&key("a".into()), &ab), Ordering::Less);
    }

    #[test]
    fn test_mixed_types_use_type_rank() {
        let integer = key(int(5));
        let string = key("5".into());
        let array = key(arr(vec![int(5)]));
        assert_eq!(compare(&integer, &string), Ordering::Less);
        assert_eq!(compare(&string, &array), Ordering::Less);
        assert_eq!(compare(&array, &integer), Ordering::Greater);
    }

    #[test]
    fn test_total_order_on_sample() {
        let samples: Vec<Bytes> = vec![
            key(int(0)),
            key(int(-5)),
            key(int(1000)),
            key("".into()),
            key("alpha".into()),
            key("beta".into()),
            key(arr(vec![])),
            key(arr(vec![int(1)])),
            key(arr(vec![int(1), "a".into()])),
            key(arr(vec![int(1), "b".into()])),
            key(arr(vec![arr(vec![int(2)]), "z".into()])),
        ];

        for a in &samples {
            assert_eq!(compare(a, a), Ordering::Equal);
            for b in &samples {
                assert_eq!(compare(a, b), compare(b, a).reverse());
                for c in &samples {
                    if compare(a, b) == Ordering::Less && compare(b, c) == Ordering::Less {
                        assert_eq!(compare(a, c), Ordering::Less);
                    }
                }
            }
        }
    }

    #[test]
    fn test_truncated_key_is_an_error() {
        let good = key("abc".into());
        let truncated = [0xa3, b'a'];
        assert!(matches!(
            try_compare(&good, &truncated),
            Err(KeyError::Truncated { offset: 1, needed: 3 })
        ));
        // Still produces an answer: byte order
        assert_eq!(compare(&good, &truncated), good[..].cmp(&truncated[..]));
    }

    #[test]
    fn test_oversized_string_is_rejected() {
        let mut long = vec![0xda, 0x02, 0x00]; // str16, 512 bytes
        long.extend(std::iter::repeat(b'x').take(512));
        let short = key("x".into());
        assert_eq!(
            try_compare(&long, &short),
            Err(KeyError::StringTooLong { len: 512, max: MAX_STRING_LEN })
        );

        let too_long = StructuredKey::Str("x".repeat(512));
        assert!(matches!(too_long.encode(), Err(KeyError::StringTooLong { .. })));
    }

    #[test]
    fn test_unsupported_tag() {
        let nil = [0xc0];
        assert_eq!(try_compare(&nil, &nil), Err(KeyError::UnsupportedTag(0xc0)));
        assert!(StructuredKey::decode(&[0xcb]).is_err());
    }

    #[test]
    fn test_empty_input_is_truncated() {
        assert!(matches!(
            try_compare(&[], &[0x01]),
            Err(KeyError::Truncated { offset: 0, needed: 1 })
        ));
    }
}
