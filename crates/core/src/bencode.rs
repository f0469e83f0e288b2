//! Canonical bencode codec.
//!
//! Everything that crosses the wire or the nodedb disk boundary is a
//! bencoded value: integers (`i..e`), length-prefixed byte strings, lists
//! (`l..e`), and dictionaries (`d..e`) whose keys are byte strings in
//! strictly ascending order. Dictionaries are backed by a `BTreeMap` so
//! encoding is canonical by construction; the decoder rejects out-of-order
//! or duplicate keys so every value has exactly one byte representation.

use std::collections::BTreeMap;

use crate::{Result, VeilnetError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn bytes(b: impl Into<Vec<u8>>) -> Value {
        Value::Bytes(b.into())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Serialize into `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Int(i) => {
                out.push(b'i');
                out.extend_from_slice(i.to_string().as_bytes());
                out.push(b'e');
            }
            Value::Bytes(b) => {
                out.extend_from_slice(b.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(b);
            }
            Value::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Value::Dict(map) => {
                out.push(b'd');
                for (k, v) in map {
                    Value::Bytes(k.clone()).encode_into(out);
                    v.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    /// Decode exactly one value; trailing bytes are an error.
    pub fn decode(input: &[u8]) -> Result<Value> {
        let (value, used) = Self::decode_prefix(input)?;
        if used != input.len() {
            return Err(VeilnetError::InvalidMessage(format!(
                "{} trailing bytes after bencoded value",
                input.len() - used
            )));
        }
        Ok(value)
    }

    /// Decode one value from the front of `input`, returning it together
    /// with the number of bytes consumed. Used by fixed-size frame bodies
    /// where padding follows the value.
    pub fn decode_prefix(input: &[u8]) -> Result<(Value, usize)> {
        let mut dec = Decoder { input, pos: 0 };
        let value = dec.value()?;
        Ok((value, dec.pos))
    }
}

struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn peek(&self) -> Result<u8> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or_else(|| VeilnetError::InvalidMessage("truncated bencode".into()))
    }

    fn take(&mut self) -> Result<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn value(&mut self) -> Result<Value> {
        match self.peek()? {
            b'i' => self.int(),
            b'l' => self.list(),
            b'd' => self.dict(),
            b'0'..=b'9' => Ok(Value::Bytes(self.byte_string()?)),
            other => Err(VeilnetError::InvalidMessage(format!(
                "unexpected bencode byte {other:#04x}"
            ))),
        }
    }

    fn int(&mut self) -> Result<Value> {
        self.take()?; // 'i'
        let start = self.pos;
        while self.peek()? != b'e' {
            self.pos += 1;
        }
        let digits = &self.input[start..self.pos];
        self.take()?; // 'e'
        let text = std::str::from_utf8(digits)
            .map_err(|_| VeilnetError::InvalidMessage("non-ascii integer".into()))?;
        if text.is_empty()
            || text == "-"
            || (text.starts_with('0') && text != "0")
            || text.starts_with("-0")
        {
            return Err(VeilnetError::InvalidMessage(format!(
                "malformed bencode integer {text:?}"
            )));
        }
        let n = text
            .parse::<i64>()
            .map_err(|_| VeilnetError::InvalidMessage(format!("integer out of range {text:?}")))?;
        Ok(Value::Int(n))
    }

    fn byte_string(&mut self) -> Result<Vec<u8>> {
        let start = self.pos;
        while self.peek()? != b':' {
            if !self.peek()?.is_ascii_digit() {
                return Err(VeilnetError::InvalidMessage(
                    "malformed string length".into(),
                ));
            }
            self.pos += 1;
        }
        let len_text = std::str::from_utf8(&self.input[start..self.pos])
            .map_err(|_| VeilnetError::InvalidMessage("non-ascii string length".into()))?;
        if len_text.is_empty() || (len_text.starts_with('0') && len_text != "0") {
            return Err(VeilnetError::InvalidMessage(
                "malformed string length".into(),
            ));
        }
        let len: usize = len_text
            .parse()
            .map_err(|_| VeilnetError::InvalidMessage("string length out of range".into()))?;
        self.take()?; // ':'
        if self.input.len() - self.pos < len {
            return Err(VeilnetError::InvalidMessage("truncated byte string".into()));
        }
        let bytes = self.input[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(bytes)
    }

    fn list(&mut self) -> Result<Value> {
        self.take()?; // 'l'
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value()?);
        }
        self.take()?; // 'e'
        Ok(Value::List(items))
    }

    fn dict(&mut self) -> Result<Value> {
        self.take()?; // 'd'
        let mut map = BTreeMap::new();
        let mut last_key: Option<Vec<u8>> = None;
        while self.peek()? != b'e' {
            let key = self.byte_string()?;
            if let Some(prev) = &last_key {
                if *prev >= key {
                    return Err(VeilnetError::InvalidMessage(
                        "dictionary keys not in ascending order".into(),
                    ));
                }
            }
            let value = self.value()?;
            last_key = Some(key.clone());
            map.insert(key, value);
        }
        self.take()?; // 'e'
        Ok(Value::Dict(map))
    }
}

/// Builder for bencoded dictionaries; key order is irrelevant at the call
/// site, the map keeps it canonical.
#[derive(Default)]
pub struct DictBuilder {
    map: BTreeMap<Vec<u8>, Value>,
}

impl DictBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(mut self, key: &str, value: Value) -> Self {
        self.map.insert(key.as_bytes().to_vec(), value);
        self
    }

    pub fn insert_bytes(self, key: &str, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(key, Value::Bytes(bytes.into()))
    }

    pub fn insert_int(self, key: &str, n: i64) -> Self {
        self.insert(key, Value::Int(n))
    }

    pub fn build(self) -> Value {
        Value::Dict(self.map)
    }
}

/// Accessor over a decoded dictionary with typed lookups; every miss maps
/// to `InvalidMessage` so message parsers can use `?` throughout.
pub struct DictReader<'a> {
    map: &'a BTreeMap<Vec<u8>, Value>,
}

impl<'a> DictReader<'a> {
    pub fn new(value: &'a Value) -> Result<Self> {
        value
            .as_dict()
            .map(|map| DictReader { map })
            .ok_or_else(|| VeilnetError::InvalidMessage("expected dictionary".into()))
    }

    pub fn get(&self, key: &str) -> Option<&'a Value> {
        self.map.get(key.as_bytes())
    }

    pub fn require(&self, key: &str) -> Result<&'a Value> {
        self.get(key)
            .ok_or_else(|| VeilnetError::InvalidMessage(format!("missing key {key:?}")))
    }

    pub fn require_bytes(&self, key: &str) -> Result<&'a [u8]> {
        self.require(key)?
            .as_bytes()
            .ok_or_else(|| VeilnetError::InvalidMessage(format!("key {key:?} is not bytes")))
    }

    pub fn require_int(&self, key: &str) -> Result<i64> {
        self.require(key)?
            .as_int()
            .ok_or_else(|| VeilnetError::InvalidMessage(format!("key {key:?} is not an integer")))
    }

    pub fn require_array<const N: usize>(&self, key: &str) -> Result<[u8; N]> {
        let bytes = self.require_bytes(key)?;
        bytes.try_into().map_err(|_| {
            VeilnetError::InvalidMessage(format!(
                "key {key:?} has length {} instead of {N}",
                bytes.len()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_roundtrip() {
        for n in [0i64, 1, -1, 42, i64::MAX, i64::MIN] {
            let enc = Value::Int(n).encode();
            assert_eq!(Value::decode(&enc).unwrap(), Value::Int(n));
        }
    }

    #[test]
    fn test_bytes_roundtrip() {
        let v = Value::bytes(b"veilnet".to_vec());
        assert_eq!(v.encode(), b"7:veilnet");
        assert_eq!(Value::decode(b"7:veilnet").unwrap(), v);
    }

    #[test]
    fn test_empty_bytes() {
        let v = Value::bytes(Vec::new());
        assert_eq!(v.encode(), b"0:");
        assert_eq!(Value::decode(b"0:").unwrap(), v);
    }

    #[test]
    fn test_dict_keys_sorted_on_encode() {
        let v = DictBuilder::new()
            .insert_int("z", 1)
            .insert_int("a", 2)
            .insert_bytes("m", b"x".to_vec())
            .build();
        assert_eq!(v.encode(), b"d1:ai2e1:m1:x1:zi1ee");
    }

    #[test]
    fn test_dict_rejects_out_of_order_keys() {
        // "b" before "a"
        let raw = b"d1:bi1e1:ai2ee";
        assert!(Value::decode(raw).is_err());
    }

    #[test]
    fn test_dict_rejects_duplicate_keys() {
        let raw = b"d1:ai1e1:ai2ee";
        assert!(Value::decode(raw).is_err());
    }

    #[test]
    fn test_list_roundtrip() {
        let v = Value::List(vec![Value::Int(1), Value::bytes(b"ab".to_vec())]);
        let enc = v.encode();
        assert_eq!(enc, b"li1e2:abe");
        assert_eq!(Value::decode(&enc).unwrap(), v);
    }

    #[test]
    fn test_nested_roundtrip() {
        let inner = DictBuilder::new().insert_int("n", 9).build();
        let v = DictBuilder::new()
            .insert("l", Value::List(vec![inner.clone(), inner]))
            .build();
        let enc = v.encode();
        assert_eq!(Value::decode(&enc).unwrap(), v);
    }

    #[test]
    fn test_rejects_leading_zero_int() {
        assert!(Value::decode(b"i03e").is_err());
        assert!(Value::decode(b"i-0e").is_err());
    }

    #[test]
    fn test_rejects_truncation() {
        assert!(Value::decode(b"5:abc").is_err());
        assert!(Value::decode(b"i42").is_err());
        assert!(Value::decode(b"d1:a").is_err());
    }

    #[test]
    fn test_rejects_trailing_garbage() {
        assert!(Value::decode(b"i1egarbage").is_err());
    }

    #[test]
    fn test_decode_prefix_tolerates_padding() {
        let mut raw = Value::Int(7).encode();
        let value_len = raw.len();
        raw.extend_from_slice(&[0u8; 16]);
        let (value, used) = Value::decode_prefix(&raw).unwrap();
        assert_eq!(value, Value::Int(7));
        assert_eq!(used, value_len);
    }

    #[test]
    fn test_dict_reader_typed_lookups() {
        let v = DictBuilder::new()
            .insert_int("n", 5)
            .insert_bytes("k", vec![7u8; 32])
            .build();
        let r = DictReader::new(&v).unwrap();
        assert_eq!(r.require_int("n").unwrap(), 5);
        let arr: [u8; 32] = r.require_array("k").unwrap();
        assert_eq!(arr, [7u8; 32]);
        assert!(r.require_int("missing").is_err());
        assert!(r.require_array::<16>("k").is_err());
    }
}
