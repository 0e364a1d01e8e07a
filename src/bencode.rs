//! Bencode decoding and encoding
//!
//! A small cursor-based parser that keeps access to raw byte offsets, which
//! the metainfo decoder needs to hash the info dictionary exactly as it
//! appears on disk. serde_bencode cannot provide that slice.
//!
//! Format reminder:
//! - Integers: `i<number>e`
//! - Strings:  `<length>:<data>`
//! - Lists:    `l<items>e`
//! - Dicts:    `d<pairs>e`, keys are byte strings

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{EngineError, ProtocolErrorKind, Result};

/// Upper bound on a single bencode string, guarding against hostile
/// length prefixes.
const MAX_STRING_LEN: usize = 64 * 1024 * 1024;

/// Maximum nesting depth of lists/dicts.
const MAX_DEPTH: usize = 32;

/// A decoded bencode value.
#[derive(Clone, PartialEq, Eq)]
pub enum BencodeValue {
    Integer(i64),
    /// Byte string, not necessarily UTF-8
    Bytes(Vec<u8>),
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl fmt::Debug for BencodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(n) => write!(f, "Integer({})", n),
            Self::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) if s.len() <= 40 => write!(f, "Bytes({:?})", s),
                _ => write!(f, "Bytes([{} bytes])", b.len()),
            },
            Self::List(l) => f.debug_tuple("List").field(l).finish(),
            Self::Dict(d) => {
                let readable: BTreeMap<String, &BencodeValue> = d
                    .iter()
                    .map(|(k, v)| (String::from_utf8_lossy(k).into_owned(), v))
                    .collect();
                f.debug_tuple("Dict").field(&readable).finish()
            }
        }
    }
}

/// Decode a complete bencode document; trailing bytes are an error.
pub fn decode(data: &[u8]) -> Result<BencodeValue> {
    let mut parser = Parser::new(data);
    let value = parser.value()?;
    if parser.pos != data.len() {
        return Err(parse_err(format!(
            "trailing data: {} bytes",
            data.len() - parser.pos
        )));
    }
    Ok(value)
}

/// Decode a value from the front of `data`, returning it together with the
/// number of bytes consumed.
pub fn decode_prefix(data: &[u8]) -> Result<(BencodeValue, usize)> {
    let mut parser = Parser::new(data);
    let value = parser.value()?;
    Ok((value, parser.pos))
}

/// Locate the raw bytes of the top-level `info` dictionary.
///
/// The returned slice is exactly what must be SHA-1 hashed to produce the
/// info-hash.
pub fn raw_info_slice(data: &[u8]) -> Result<&[u8]> {
    let mut parser = Parser::new(data);
    parser.expect(b'd')?;
    while parser.peek()? != b'e' {
        let key = parser.byte_string()?;
        let start = parser.pos;
        parser.skip_value()?;
        if key == b"info" {
            return Ok(&data[start..parser.pos]);
        }
    }
    Err(parse_err("no 'info' key in torrent dictionary"))
}

fn parse_err(message: impl Into<String>) -> EngineError {
    EngineError::protocol(ProtocolErrorKind::BencodeParse, message)
}

struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            depth: 0,
        }
    }

    fn peek(&self) -> Result<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| parse_err("unexpected end of input"))
    }

    fn expect(&mut self, marker: u8) -> Result<()> {
        if self.peek()? != marker {
            return Err(parse_err(format!(
                "expected {:?} at offset {}",
                marker as char, self.pos
            )));
        }
        self.pos += 1;
        Ok(())
    }

    fn value(&mut self) -> Result<BencodeValue> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(parse_err("nesting too deep"));
        }

        let value = match self.peek()? {
            b'i' => BencodeValue::Integer(self.integer()?),
            b'0'..=b'9' => BencodeValue::Bytes(self.byte_string()?.to_vec()),
            b'l' => {
                self.pos += 1;
                let mut items = Vec::new();
                while self.peek()? != b'e' {
                    items.push(self.value()?);
                }
                self.pos += 1;
                BencodeValue::List(items)
            }
            b'd' => {
                self.pos += 1;
                let mut map = BTreeMap::new();
                while self.peek()? != b'e' {
                    let key = self.byte_string()?.to_vec();
                    let value = self.value()?;
                    if map.insert(key, value).is_some() {
                        return Err(parse_err("duplicate dictionary key"));
                    }
                }
                self.pos += 1;
                BencodeValue::Dict(map)
            }
            c => return Err(parse_err(format!("invalid type marker {:?}", c as char))),
        };

        self.depth -= 1;
        Ok(value)
    }

    /// Skip one value without materializing it.
    fn skip_value(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(parse_err("nesting too deep"));
        }

        match self.peek()? {
            b'i' => {
                self.integer()?;
            }
            b'0'..=b'9' => {
                self.byte_string()?;
            }
            b'l' => {
                self.pos += 1;
                while self.peek()? != b'e' {
                    self.skip_value()?;
                }
                self.pos += 1;
            }
            b'd' => {
                self.pos += 1;
                while self.peek()? != b'e' {
                    self.byte_string()?;
                    self.skip_value()?;
                }
                self.pos += 1;
            }
            c => return Err(parse_err(format!("invalid type marker {:?}", c as char))),
        }

        self.depth -= 1;
        Ok(())
    }

    fn integer(&mut self) -> Result<i64> {
        self.expect(b'i')?;
        let start = self.pos;
        while self.peek()? != b'e' {
            self.pos += 1;
        }
        let digits = std::str::from_utf8(&self.data[start..self.pos])
            .map_err(|_| parse_err("non-ascii integer"))?;
        self.pos += 1;

        // i-0e and leading zeros are malformed per BEP 3
        if digits == "-0"
            || (digits.len() > 1 && digits.starts_with('0'))
            || (digits.len() > 2 && digits.starts_with("-0"))
        {
            return Err(parse_err(format!("malformed integer {:?}", digits)));
        }

        digits
            .parse::<i64>()
            .map_err(|_| parse_err(format!("integer out of range: {:?}", digits)))
    }

    fn byte_string(&mut self) -> Result<&'a [u8]> {
        let start = self.pos;
        while self.peek()? != b':' {
            if !self.data[self.pos].is_ascii_digit() {
                return Err(parse_err("invalid string length"));
            }
            self.pos += 1;
        }
        let len: usize = std::str::from_utf8(&self.data[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| parse_err("invalid string length"))?;
        if len > MAX_STRING_LEN {
            return Err(parse_err(format!("string length {} too large", len)));
        }
        self.pos += 1;

        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| parse_err("string extends past end of input"))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }
}

impl BencodeValue {
    /// Encode to bencode bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_to(&mut buf);
        buf
    }

    fn encode_to(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Integer(n) => {
                buf.push(b'i');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.push(b'e');
            }
            Self::Bytes(b) => {
                buf.extend_from_slice(b.len().to_string().as_bytes());
                buf.push(b':');
                buf.extend_from_slice(b);
            }
            Self::List(l) => {
                buf.push(b'l');
                for item in l {
                    item.encode_to(buf);
                }
                buf.push(b'e');
            }
            Self::Dict(d) => {
                buf.push(b'd');
                for (k, v) in d {
                    buf.extend_from_slice(k.len().to_string().as_bytes());
                    buf.push(b':');
                    buf.extend_from_slice(k);
                    v.encode_to(buf);
                }
                buf.push(b'e');
            }
        }
    }

    /// Get as UTF-8 string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Get as signed integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as non-negative integer.
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Self::Integer(n) if *n >= 0 => Some(*n as u64),
            _ => None,
        }
    }

    /// Get as raw bytes.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get as list.
    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    /// Get as dictionary.
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            Self::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Look up a dictionary entry.
    pub fn get(&self, key: &str) -> Option<&BencodeValue> {
        match self {
            Self::Dict(d) => d.get(key.as_bytes()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integers() {
        assert_eq!(decode(b"i42e").unwrap(), BencodeValue::Integer(42));
        assert_eq!(decode(b"i-42e").unwrap(), BencodeValue::Integer(-42));
        assert_eq!(decode(b"i0e").unwrap(), BencodeValue::Integer(0));

        assert!(decode(b"i03e").is_err());
        assert!(decode(b"i-0e").is_err());
        assert!(decode(b"i12").is_err());
    }

    #[test]
    fn test_strings() {
        assert_eq!(
            decode(b"4:spam").unwrap(),
            BencodeValue::Bytes(b"spam".to_vec())
        );
        assert_eq!(decode(b"0:").unwrap(), BencodeValue::Bytes(vec![]));
        assert_eq!(
            decode(b"3:\x00\x01\x02").unwrap(),
            BencodeValue::Bytes(vec![0, 1, 2])
        );

        assert!(decode(b"5:spam").is_err());
        assert!(decode(b"4spam").is_err());
    }

    #[test]
    fn test_lists_and_dicts() {
        let value = decode(b"l4:spami42ee").unwrap();
        let list = value.as_list().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].as_str(), Some("spam"));
        assert_eq!(list[1].as_int(), Some(42));

        let value = decode(b"d3:cow3:moo4:spam4:eggse").unwrap();
        assert_eq!(value.get("cow").and_then(|v| v.as_str()), Some("moo"));
        assert_eq!(value.get("spam").and_then(|v| v.as_str()), Some("eggs"));
        assert!(value.get("missing").is_none());

        assert_eq!(decode(b"le").unwrap(), BencodeValue::List(vec![]));
        assert!(decode(b"l4:spam").is_err());
        assert!(decode(b"d3:cow3:moo3:cow3:mooe").is_err());
    }

    #[test]
    fn test_trailing_data_rejected() {
        assert!(decode(b"i42ei43e").is_err());
        let (value, used) = decode_prefix(b"i42ei43e").unwrap();
        assert_eq!(value, BencodeValue::Integer(42));
        assert_eq!(used, 4);
    }

    #[test]
    fn test_depth_limit() {
        let mut evil = Vec::new();
        evil.extend(std::iter::repeat_n(b'l', 100));
        evil.extend(std::iter::repeat_n(b'e', 100));
        assert!(decode(&evil).is_err());
    }

    #[test]
    fn test_encode_round_trip() {
        let original = b"d5:itemsli1ei2ei3ee4:name4:test5:valuei42ee";
        let value = decode(original).unwrap();
        assert_eq!(value.encode(), original.to_vec());
    }

    #[test]
    fn test_raw_info_slice() {
        let data = b"d8:announce3:url4:infod4:name4:test6:lengthi10eee";
        // Keys above are deliberately unsorted; the slice must still be exact.
        let slice = raw_info_slice(data).unwrap();
        assert_eq!(slice, b"d4:name4:test6:lengthi10ee".as_slice());

        assert!(raw_info_slice(b"d8:announce3:urle").is_err());
        assert!(raw_info_slice(b"i42e").is_err());
    }
}
