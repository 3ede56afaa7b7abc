use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::error::{Error, ErrorKind, Result};
use crate::payload::value::PayloadValue;

/// Value type tag shared by variants, payload fields and the wire codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyValueType {
    Null,
    Int,
    Int64,
    Double,
    String,
    Bool,
    Tuple,
    Composite,
    Uuid,
    Point,
    Undefined,
}

impl KeyValueType {
    pub fn name(self) -> &'static str {
        match self {
            KeyValueType::Null => "null",
            KeyValueType::Int => "int",
            KeyValueType::Int64 => "int64",
            KeyValueType::Double => "double",
            KeyValueType::String => "string",
            KeyValueType::Bool => "bool",
            KeyValueType::Tuple => "tuple",
            KeyValueType::Composite => "composite",
            KeyValueType::Uuid => "uuid",
            KeyValueType::Point => "point",
            KeyValueType::Undefined => "undefined",
        }
    }
}

/// 2D point used by the DWithin condition and the point payload field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Point { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// String payload of a variant: either owned bytes or a region of a
/// PayloadValue. The referencing form holds a refcount on its source, so
/// it can never dangle; `ensure_hold` materializes an owned copy before
/// the variant crosses an ownership boundary.
#[derive(Clone)]
pub enum VariantString {
    Owned(String),
    Payload { value: PayloadValue, offset: usize, len: usize },
}

impl VariantString {
    pub fn as_str(&self) -> &str {
        match self {
            VariantString::Owned(s) => s,
            VariantString::Payload { value, offset, len } => {
                std::str::from_utf8(&value.bytes()[*offset..*offset + *len])
                    .expect("payload string region is not valid UTF-8")
            }
        }
    }
}

/// Tagged value: scalar, tuple or nested composite payload.
#[derive(Clone)]
pub enum Variant {
    Null,
    Int(i32),
    Int64(i64),
    Double(f64),
    Bool(bool),
    String(VariantString),
    Tuple(Vec<Variant>),
    Composite(PayloadValue),
    Uuid(Uuid),
    Point(Point),
}

impl Variant {
    pub fn str(s: impl Into<String>) -> Self {
        Variant::String(VariantString::Owned(s.into()))
    }

    pub fn key_type(&self) -> KeyValueType {
        match self {
            Variant::Null => KeyValueType::Null,
            Variant::Int(_) => KeyValueType::Int,
            Variant::Int64(_) => KeyValueType::Int64,
            Variant::Double(_) => KeyValueType::Double,
            Variant::Bool(_) => KeyValueType::Bool,
            Variant::String(_) => KeyValueType::String,
            Variant::Tuple(_) => KeyValueType::Tuple,
            Variant::Composite(_) => KeyValueType::Composite,
            Variant::Uuid(_) => KeyValueType::Uuid,
            Variant::Point(_) => KeyValueType::Point,
        }
    }

    /// Detach the variant from any payload region it references.
    pub fn ensure_hold(mut self) -> Self {
        if let Variant::String(vs @ VariantString::Payload { .. }) = &mut self {
            *vs = VariantString::Owned(vs.as_str().to_string());
        } else if let Variant::Tuple(items) = self {
            return Variant::Tuple(items.into_iter().map(Variant::ensure_hold).collect());
        }
        self
    }

    pub fn as_double(&self) -> Result<f64> {
        match self {
            Variant::Int(v) => Ok(*v as f64),
            Variant::Int64(v) => Ok(*v as f64),
            Variant::Double(v) => Ok(*v),
            Variant::Bool(v) => Ok(*v as i64 as f64),
            other => Err(Error::new(
                ErrorKind::Logic,
                format!("can not convert '{}' to double", other.key_type().name()),
            )),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Variant::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Numeric-aware ordering used by condition checks: Int/Int64/Double
    /// compare by value, strings lexicographically. `None` for
    /// incomparable type pairs.
    pub fn compare(&self, other: &Variant) -> Option<Ordering> {
        use Variant::*;
        match (self, other) {
            (Null, Null) => Some(Ordering::Equal),
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            (String(a), String(b)) => Some(a.as_str().cmp(b.as_str())),
            (Uuid(a), Uuid(b)) => Some(a.cmp(b)),
            (Point(a), Point(b)) => {
                if a == b { Some(Ordering::Equal) } else { None }
            }
            (Tuple(a), Tuple(b)) => {
                if a.len() != b.len() {
                    return Some(a.len().cmp(&b.len()));
                }
                for (x, y) in a.iter().zip(b) {
                    match x.compare(y)? {
                        Ordering::Equal => continue,
                        ord => return Some(ord),
                    }
                }
                Some(Ordering::Equal)
            }
            (Composite(a), Composite(b)) => {
                if a == b { Some(Ordering::Equal) } else { None }
            }
            (a, b) => {
                let an = a.as_double().ok()?;
                let bn = b.as_double().ok()?;
                an.partial_cmp(&bn)
            }
        }
    }

    /// Relaxed comparison with string coercion: "10" compares equal to 10.
    /// Used for forced-sort-order equality, where the wire is allowed to
    /// re-type values.
    pub fn relax_compare_with_string(&self, other: &Variant) -> Ordering {
        if let Some(ord) = self.compare(other) {
            return ord;
        }
        let coerce = |v: &Variant| -> Option<f64> {
            match v {
                Variant::String(s) => s.as_str().parse::<f64>().ok(),
                other => other.as_double().ok(),
            }
        };
        match (coerce(self), coerce(other)) {
            (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
            _ => self.dump().cmp(&other.dump()),
        }
    }

    pub fn dump(&self) -> String {
        match self {
            Variant::Null => "null".to_string(),
            Variant::Int(v) => v.to_string(),
            Variant::Int64(v) => v.to_string(),
            Variant::Double(v) => v.to_string(),
            Variant::Bool(v) => v.to_string(),
            Variant::String(s) => format!("'{}'", s.as_str()),
            Variant::Tuple(items) => {
                let inner: Vec<String> = items.iter().map(Variant::dump).collect();
                format!("({})", inner.join(","))
            }
            Variant::Composite(_) => "<composite>".to_string(),
            Variant::Uuid(u) => u.to_string(),
            Variant::Point(p) => format!("point({} {})", p.x, p.y),
        }
    }
}

// Strict typed equality: the wire preserves type tags, so round-trip
// comparison does not coerce.
impl PartialEq for Variant {
    fn eq(&self, other: &Self) -> bool {
        use Variant::*;
        match (self, other) {
            (Null, Null) => true,
            (Int(a), Int(b)) => a == b,
            (Int64(a), Int64(b)) => a == b,
            (Double(a), Double(b)) => a == b,
            (Bool(a), Bool(b)) => a == b,
            (String(a), String(b)) => a.as_str() == b.as_str(),
            (Tuple(a), Tuple(b)) => a == b,
            (Composite(a), Composite(b)) => a == b,
            (Uuid(a), Uuid(b)) => a == b,
            (Point(a), Point(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Variant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.dump())
    }
}

impl From<i32> for Variant {
    fn from(v: i32) -> Self {
        Variant::Int(v)
    }
}

impl From<i64> for Variant {
    fn from(v: i64) -> Self {
        Variant::Int64(v)
    }
}

impl From<f64> for Variant {
    fn from(v: f64) -> Self {
        Variant::Double(v)
    }
}

impl From<bool> for Variant {
    fn from(v: bool) -> Self {
        Variant::Bool(v)
    }
}

impl From<&str> for Variant {
    fn from(v: &str) -> Self {
        Variant::str(v)
    }
}

impl From<String> for Variant {
    fn from(v: String) -> Self {
        Variant::str(v)
    }
}

/// A list of variants with an explicit array marker bit. The marker
/// distinguishes a single-element array value from a scalar one.
#[derive(Debug, Clone, Default)]
pub struct VariantArray {
    pub values: Vec<Variant>,
    is_array: bool,
}

// Equality canonicalizes the marker: a multi-value list is an array
// whether or not it was marked explicitly.
impl PartialEq for VariantArray {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values && self.is_array_value() == other.is_array_value()
    }
}

impl VariantArray {
    pub fn new() -> Self {
        VariantArray::default()
    }

    pub fn from_values(values: Vec<Variant>) -> Self {
        VariantArray { values, is_array: false }
    }

    pub fn single(v: Variant) -> Self {
        VariantArray { values: vec![v], is_array: false }
    }

    pub fn mark_array(mut self, is_array: bool) -> Self {
        self.is_array = is_array;
        self
    }

    pub fn set_array_flag(&mut self, is_array: bool) {
        self.is_array = is_array;
    }

    pub fn is_array_value(&self) -> bool {
        self.is_array || self.values.len() > 1
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn push(&mut self, v: Variant) {
        self.values.push(v);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Variant> {
        self.values.iter()
    }

    pub fn ensure_hold(self) -> Self {
        VariantArray {
            values: self.values.into_iter().map(Variant::ensure_hold).collect(),
            is_array: self.is_array,
        }
    }
}

impl From<Vec<Variant>> for VariantArray {
    fn from(values: Vec<Variant>) -> Self {
        VariantArray::from_values(values)
    }
}

impl IntoIterator for VariantArray {
    type Item = Variant;
    type IntoIter = std::vec::IntoIter<Variant>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

impl<'a> IntoIterator for &'a VariantArray {
    type Item = &'a Variant;
    type IntoIter = std::slice::Iter<'a, Variant>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_hold_detaches_payload_region() {
        let pv = PayloadValue::new(5, Some(b"hello"), 0);
        let v = Variant::String(VariantString::Payload { value: pv.clone(), offset: 0, len: 5 });
        assert_eq!(pv.refcount(), 2);
        let held = v.ensure_hold();
        assert_eq!(held.as_str(), Some("hello"));
        assert_eq!(pv.refcount(), 1);
    }

    #[test]
    fn relaxed_compare_coerces_strings() {
        assert_eq!(
            Variant::str("10").relax_compare_with_string(&Variant::Int(10)),
            Ordering::Equal
        );
        assert_ne!(Variant::str("10"), Variant::Int(10));
    }

    #[test]
    fn numeric_cross_type_compare() {
        assert_eq!(Variant::Int(5).compare(&Variant::Double(5.0)), Some(Ordering::Equal));
        assert_eq!(Variant::Int64(3).compare(&Variant::Int(7)), Some(Ordering::Less));
        assert_eq!(Variant::str("a").compare(&Variant::Int(1)), None);
    }

    #[test]
    fn array_marker_survives_single_element() {
        let arr = VariantArray::single(Variant::Int(1)).mark_array(true);
        assert!(arr.is_array_value());
        let scalar = VariantArray::single(Variant::Int(1));
        assert!(!scalar.is_array_value());
    }
}
