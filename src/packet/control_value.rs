use std::collections::BTreeMap;

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::util::buf::{BufExt, BufMutExt};

/// Self-describing value used for control payloads, most importantly the handshake maps. Every
///  value is prefixed with a one-byte ASCII type tag:
///
/// ```ascii
/// N  null
/// Z  boolean (u8, 0 or 1)
/// I  i32
/// J  i64
/// S  string: varint length, UTF-8 bytes
/// L  list: varint count, values
/// M  map: varint count, (string key, value) pairs
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum ControlValue {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    String(String),
    List(Vec<ControlValue>),
    Map(BTreeMap<String, ControlValue>),
}

const TAG_NULL: u8 = b'N';
const TAG_BOOL: u8 = b'Z';
const TAG_INT: u8 = b'I';
const TAG_LONG: u8 = b'J';
const TAG_STRING: u8 = b'S';
const TAG_LIST: u8 = b'L';
const TAG_MAP: u8 = b'M';

/// guards against stack exhaustion from hostile payloads
const MAX_NESTING_DEPTH: usize = 16;

impl ControlValue {
    pub fn ser(&self, buf: &mut impl BufMut) {
        match self {
            ControlValue::Null => buf.put_u8(TAG_NULL),
            ControlValue::Bool(b) => {
                buf.put_u8(TAG_BOOL);
                buf.put_u8(if *b { 1 } else { 0 });
            }
            ControlValue::Int(i) => {
                buf.put_u8(TAG_INT);
                buf.put_i32(*i);
            }
            ControlValue::Long(l) => {
                buf.put_u8(TAG_LONG);
                buf.put_i64(*l);
            }
            ControlValue::String(s) => {
                buf.put_u8(TAG_STRING);
                buf.put_string(s);
            }
            ControlValue::List(values) => {
                buf.put_u8(TAG_LIST);
                buf.put_usize_varint(values.len());
                for v in values {
                    v.ser(buf);
                }
            }
            ControlValue::Map(map) => {
                buf.put_u8(TAG_MAP);
                buf.put_usize_varint(map.len());
                for (k, v) in map {
                    buf.put_string(k);
                    v.ser(buf);
                }
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ControlValue> {
        Self::deser_nested(buf, 0)
    }

    fn deser_nested(buf: &mut impl Buf, depth: usize) -> anyhow::Result<ControlValue> {
        if depth > MAX_NESTING_DEPTH {
            bail!("control value nesting exceeds {} levels", MAX_NESTING_DEPTH);
        }

        match buf.try_read_u8()? {
            TAG_NULL => Ok(ControlValue::Null),
            TAG_BOOL => match buf.try_read_u8()? {
                0 => Ok(ControlValue::Bool(false)),
                1 => Ok(ControlValue::Bool(true)),
                b => Err(anyhow!("invalid value for a boolean: {}", b)),
            },
            TAG_INT => Ok(ControlValue::Int(buf.try_read_i32()?)),
            TAG_LONG => Ok(ControlValue::Long(buf.try_read_i64()?)),
            TAG_STRING => Ok(ControlValue::String(buf.try_read_string()?)),
            TAG_LIST => {
                let len = buf.try_get_usize_varint()?;
                // every element takes at least one byte, so this bounds the allocation
                if len > buf.remaining() {
                    bail!("list of {} elements exceeds remaining buffer", len);
                }
                let mut values = Vec::with_capacity(len);
                for _ in 0..len {
                    values.push(Self::deser_nested(buf, depth + 1)?);
                }
                Ok(ControlValue::List(values))
            }
            TAG_MAP => {
                let len = buf.try_get_usize_varint()?;
                let mut map = BTreeMap::new();
                for _ in 0..len {
                    let key = buf.try_read_string()?;
                    let value = Self::deser_nested(buf, depth + 1)?;
                    map.insert(key, value);
                }
                Ok(ControlValue::Map(map))
            }
            tag => Err(anyhow!("invalid control value tag {:#04x}", tag)),
        }
    }

    /// convenience for the common case of a control payload that is a map at the top level
    pub fn encode_map(map: &BTreeMap<String, ControlValue>) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(TAG_MAP);
        buf.put_usize_varint(map.len());
        for (k, v) in map {
            buf.put_string(k);
            v.ser(&mut buf);
        }
        buf.freeze()
    }

    pub fn decode_map(mut buf: &[u8]) -> anyhow::Result<BTreeMap<String, ControlValue>> {
        match Self::deser(&mut buf)? {
            ControlValue::Map(map) => {
                if !buf.is_empty() {
                    bail!("{} trailing bytes after control map", buf.len());
                }
                Ok(map)
            }
            other => Err(anyhow!("expected a control map, was {:?}", other)),
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            ControlValue::Int(i) => Some(*i),
            ControlValue::Long(l) => i32::try_from(*l).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ControlValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ControlValue]> {
        match self {
            ControlValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, ControlValue>> {
        match self {
            ControlValue::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl From<&str> for ControlValue {
    fn from(value: &str) -> Self {
        ControlValue::String(value.to_string())
    }
}

impl From<i32> for ControlValue {
    fn from(value: i32) -> Self {
        ControlValue::Int(value)
    }
}
