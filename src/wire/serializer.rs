use uuid::Uuid;

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::variant::{Point, Variant, VariantArray, VariantString};
use crate::payload::value::PayloadValue;

// Variant type tags on the wire.
const TAG_NULL: u64 = 0;
const TAG_INT: u64 = 1;
const TAG_INT64: u64 = 2;
const TAG_DOUBLE: u64 = 3;
const TAG_STRING: u64 = 4;
const TAG_BOOL: u64 = 5;
const TAG_TUPLE: u64 = 6;
const TAG_COMPOSITE: u64 = 7;
const TAG_UUID: u64 = 8;
const TAG_POINT: u64 = 9;

/// Write-side wire buffer. Unsigned scalars are variable-byte encoded
/// (7 bits per byte, continuation bit), signed ones zigzag first;
/// strings are length-prefixed UTF-8.
#[derive(Debug, Default)]
pub struct WrSerializer {
    buf: Vec<u8>,
}

impl WrSerializer {
    pub fn new() -> Self {
        WrSerializer { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        WrSerializer { buf: Vec::with_capacity(cap) }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.buf.capacity()
    }

    pub fn slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_varuint(&mut self, mut v: u64) {
        while v >= 128 {
            self.buf.push((v & 127) as u8 | 128);
            v >>= 7;
        }
        self.buf.push(v as u8);
    }

    pub fn put_varint(&mut self, v: i64) {
        // zigzag
        self.put_varuint(((v << 1) ^ (v >> 63)) as u64);
    }

    pub fn put_double(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_vstring(&mut self, s: &str) {
        self.put_varuint(s.len() as u64);
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn put_vbytes(&mut self, b: &[u8]) {
        self.put_varuint(b.len() as u64);
        self.buf.extend_from_slice(b);
    }

    pub fn write(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    pub fn put_uuid(&mut self, u: &Uuid) {
        self.buf.extend_from_slice(u.as_bytes());
    }

    pub fn put_variant(&mut self, v: &Variant) {
        match v {
            Variant::Null => self.put_varuint(TAG_NULL),
            Variant::Int(i) => {
                self.put_varuint(TAG_INT);
                self.put_varint(*i as i64);
            }
            Variant::Int64(i) => {
                self.put_varuint(TAG_INT64);
                self.put_varint(*i);
            }
            Variant::Double(d) => {
                self.put_varuint(TAG_DOUBLE);
                self.put_double(*d);
            }
            Variant::String(s) => {
                self.put_varuint(TAG_STRING);
                self.put_vstring(s.as_str());
            }
            Variant::Bool(b) => {
                self.put_varuint(TAG_BOOL);
                self.put_varuint(*b as u64);
            }
            Variant::Tuple(items) => {
                self.put_varuint(TAG_TUPLE);
                self.put_varuint(items.len() as u64);
                for item in items {
                    self.put_variant(item);
                }
            }
            Variant::Composite(pv) => {
                self.put_varuint(TAG_COMPOSITE);
                self.put_vbytes(pv.bytes());
            }
            Variant::Uuid(u) => {
                self.put_varuint(TAG_UUID);
                self.put_uuid(u);
            }
            Variant::Point(p) => {
                self.put_varuint(TAG_POINT);
                self.put_double(p.x);
                self.put_double(p.y);
            }
        }
    }
}

/// Read-side cursor over a wire buffer. All reads fail with `ParseBin`
/// on underflow instead of panicking.
#[derive(Debug)]
pub struct Serializer<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Serializer<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Serializer { buf, pos: 0 }
    }

    pub fn eof(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn set_pos(&mut self, pos: usize) {
        self.pos = pos;
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::new(
                ErrorKind::ParseBin,
                format!("buffer underflow at pos {} (need {} bytes)", self.pos, n),
            ));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn get_varuint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.take(1)?[0];
            value |= ((byte & 127) as u64) << shift;
            if byte & 128 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 63 {
                return Err(Error::new(ErrorKind::ParseBin, "varint overflow"));
            }
        }
    }

    pub fn get_varint(&mut self) -> Result<i64> {
        let v = self.get_varuint()?;
        Ok(((v >> 1) as i64) ^ -((v & 1) as i64))
    }

    pub fn get_double(&mut self) -> Result<f64> {
        let b = self.take(8)?;
        Ok(f64::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn get_vstring(&mut self) -> Result<&'a str> {
        let len = self.get_varuint()? as usize;
        let b = self.take(len)?;
        Ok(std::str::from_utf8(b)?)
    }

    pub fn get_vbytes(&mut self) -> Result<&'a [u8]> {
        let len = self.get_varuint()? as usize;
        self.take(len)
    }

    pub fn get_uuid(&mut self) -> Result<Uuid> {
        let b = self.take(16)?;
        Ok(Uuid::from_bytes(b.try_into().unwrap()))
    }

    pub fn get_variant(&mut self) -> Result<Variant> {
        let tag = self.get_varuint()?;
        Ok(match tag {
            TAG_NULL => Variant::Null,
            TAG_INT => Variant::Int(self.get_varint()? as i32),
            TAG_INT64 => Variant::Int64(self.get_varint()?),
            TAG_DOUBLE => Variant::Double(self.get_double()?),
            TAG_STRING => Variant::String(VariantString::Owned(self.get_vstring()?.to_string())),
            TAG_BOOL => Variant::Bool(self.get_varuint()? != 0),
            TAG_TUPLE => {
                let cnt = self.get_varuint()? as usize;
                let mut items = Vec::with_capacity(cnt);
                for _ in 0..cnt {
                    items.push(self.get_variant()?);
                }
                Variant::Tuple(items)
            }
            TAG_COMPOSITE => {
                let b = self.get_vbytes()?;
                Variant::Composite(PayloadValue::new(b.len(), Some(b), 0))
            }
            TAG_UUID => Variant::Uuid(self.get_uuid()?),
            TAG_POINT => Variant::Point(Point::new(self.get_double()?, self.get_double()?)),
            other => {
                return Err(Error::new(
                    ErrorKind::ParseBin,
                    format!("unknown variant type tag {}", other),
                ))
            }
        })
    }

    pub fn get_variant_array(&mut self, count: usize) -> Result<VariantArray> {
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.get_variant()?.ensure_hold());
        }
        Ok(VariantArray::from_values(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varuint_round_trip() {
        let mut ser = WrSerializer::new();
        for v in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            ser.put_varuint(v);
        }
        let mut rd = Serializer::new(ser.slice());
        for v in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            assert_eq!(rd.get_varuint().unwrap(), v);
        }
        assert!(rd.eof());
    }

    #[test]
    fn varint_zigzag_round_trip() {
        let mut ser = WrSerializer::new();
        for v in [0i64, -1, 1, -300, i64::MIN, i64::MAX] {
            ser.put_varint(v);
        }
        let mut rd = Serializer::new(ser.slice());
        for v in [0i64, -1, 1, -300, i64::MIN, i64::MAX] {
            assert_eq!(rd.get_varint().unwrap(), v);
        }
    }

    #[test]
    fn variant_round_trip() {
        let values = vec![
            Variant::Null,
            Variant::Int(-5),
            Variant::Int64(1 << 40),
            Variant::Double(3.25),
            Variant::str("кот"),
            Variant::Bool(true),
            Variant::Tuple(vec![Variant::Int(1), Variant::str("x")]),
            Variant::Uuid(Uuid::from_u128(0xDEAD_BEEF)),
            Variant::Point(Point::new(1.5, -2.5)),
        ];
        let mut ser = WrSerializer::new();
        for v in &values {
            ser.put_variant(v);
        }
        let mut rd = Serializer::new(ser.slice());
        for v in &values {
            assert_eq!(&rd.get_variant().unwrap(), v);
        }
    }

    #[test]
    fn underflow_is_parse_bin() {
        let mut rd = Serializer::new(&[0x84]); // continuation bit set, no tail
        let err = rd.get_varuint().unwrap_err();
        assert_eq!(err.kind, crate::core::error::ErrorKind::ParseBin);
    }
}
