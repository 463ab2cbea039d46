use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use super::CodecError;

/// Value model understood by the wire codec.
///
/// The derived `Ord` is the canonical order used when sets and maps are
/// encoded: variants compare in declaration order, then by contents.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    BigInt(BigInt),
    Text(String),
    List(Vec<WireValue>),
    Tuple(Vec<WireValue>),
    Set(BTreeSet<WireValue>),
    FrozenSet(BTreeSet<WireValue>),
    Map(BTreeMap<WireValue, WireValue>),
    Object(WireObject),
}

impl WireValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn list(items: impl IntoIterator<Item = WireValue>) -> Self {
        Self::List(items.into_iter().collect())
    }

    pub fn tuple(items: impl IntoIterator<Item = WireValue>) -> Self {
        Self::Tuple(items.into_iter().collect())
    }

    pub fn set(items: impl IntoIterator<Item = WireValue>) -> Self {
        Self::Set(items.into_iter().collect())
    }

    pub fn frozen_set(items: impl IntoIterator<Item = WireValue>) -> Self {
        Self::FrozenSet(items.into_iter().collect())
    }

    pub fn map(entries: impl IntoIterator<Item = (WireValue, WireValue)>) -> Self {
        Self::Map(entries.into_iter().collect())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::BigInt(_) => "bigint",
            Self::Text(_) => "text",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Set(_) => "set",
            Self::FrozenSet(_) => "frozenset",
            Self::Map(_) => "map",
            Self::Object(_) => "object",
        }
    }

    /// Lists, tuples, sets, maps and objects count toward the nesting limit.
    pub fn is_container(&self) -> bool {
        matches!(
            self,
            Self::List(_)
                | Self::Tuple(_)
                | Self::Set(_)
                | Self::FrozenSet(_)
                | Self::Map(_)
                | Self::Object(_)
        )
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&WireObject> {
        match self {
            Self::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<bool> for WireValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for WireValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for WireValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for WireValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<&str> for WireValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for WireValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<BigInt> for WireValue {
    fn from(value: BigInt) -> Self {
        Self::BigInt(value)
    }
}

impl From<WireObject> for WireValue {
    fn from(value: WireObject) -> Self {
        Self::Object(value)
    }
}

impl<T: Into<WireValue>> From<Option<T>> for WireValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// An instance of a registered object type: a type name plus its
/// serializable fields in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WireObject {
    pub type_name: String,
    pub fields: Vec<(String, WireValue)>,
}

impl WireObject {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<WireValue>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn field(&self, name: &str) -> Option<&WireValue> {
        self.fields
            .iter()
            .find(|(field_name, _)| field_name == name)
            .map(|(_, value)| value)
    }
}

/// Arbitrary-precision integer stored as its canonical decimal text:
/// an optional `-` followed by digits, no leading zeros, no `-0`.
///
/// Ordering is numeric. Canonical text makes equal values byte-equal, so
/// comparing sign, then digit count, then digits is enough.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BigInt(String);

impl Ord for BigInt {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.is_negative(), other.is_negative()) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => compare_magnitude(&self.0, &other.0),
            (true, true) => compare_magnitude(&other.0[1..], &self.0[1..]),
        }
    }
}

impl PartialOrd for BigInt {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn compare_magnitude(left: &str, right: &str) -> Ordering {
    left.len()
        .cmp(&right.len())
        .then_with(|| left.as_bytes().cmp(right.as_bytes()))
}

impl BigInt {
    pub fn as_decimal(&self) -> &str {
        &self.0
    }

    pub fn is_negative(&self) -> bool {
        self.0.starts_with('-')
    }

    pub(crate) fn from_canonical(text: &str) -> Self {
        Self(text.to_string())
    }

    /// Narrows to `i64` when the value fits.
    pub fn to_i64(&self) -> Option<i64> {
        self.0.parse().ok()
    }
}

impl From<i64> for BigInt {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl From<i128> for BigInt {
    fn from(value: i128) -> Self {
        Self(value.to_string())
    }
}

impl From<u128> for BigInt {
    fn from(value: u128) -> Self {
        Self(value.to_string())
    }
}

impl FromStr for BigInt {
    type Err = CodecError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if is_canonical_decimal(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(CodecError::InvalidBigInt {
                text: raw.to_string(),
            })
        }
    }
}

impl fmt::Display for BigInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub(crate) fn is_canonical_decimal(raw: &str) -> bool {
    let digits = raw.strip_prefix('-').unwrap_or(raw);
    if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return false;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return false;
    }
    !(raw.starts_with('-') && digits == "0")
}
