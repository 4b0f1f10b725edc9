// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Typed Value Model
//!
//! `TypedValue` is the one type every datasource driver, projection,
//! merge/diff/integrity algorithm, and wire event shares. Every value
//! flowing through the relay — a row fetched from a source, a value
//! bound into a query parameter, an attribute on a cached object, a
//! payload field on a published event — is a `TypedValue`.
//!
//! ## Purpose
//!
//! A CDC relay sits between heterogeneous datasources (SQL, LDAP,
//! flatfile, ...) that each have their own native type system. Rather
//! than propagate `Box<dyn Any>` or per-backend types through the merge
//! and diff algorithms, every driver normalizes its rows into
//! `TypedValue` at the boundary. This keeps [`crate::merge`],
//! [`crate::diff`], and the integrity evaluator backend-agnostic.
//!
//! ## Why `Eq`/`Hash` on a type containing `f64`
//!
//! The diff algorithm (C7) uses `TypedValue` as a `HashMap`/`BTreeMap`
//! key and compares whole attribute maps for equality between cache and
//! fetched snapshots. IEEE-754 equality is unsuitable for that (NaN !=
//! NaN breaks reflexivity), so `Float` compares and hashes by bit
//! pattern after collapsing all NaN payloads to one canonical pattern.
//! This is a well-known pattern for using floats as hash keys and does
//! not change arithmetic behavior — only equality/hash identity.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A single value flowing through the relay, tagged with its logical
/// type. Mirrors the wire representation from the external interface:
/// bytes are base64 on the wire, timestamps are timezone-less ISO-8601.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TypedValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    #[serde(with = "bytes_as_base64")]
    Bytes(Vec<u8>),
    Timestamp(NaiveDateTime),
    List(Vec<TypedValue>),
    Mapping(BTreeMap<String, TypedValue>),
}

mod bytes_as_base64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

impl TypedValue {
    /// `true` for [`TypedValue::Null`], used throughout C5/C6 to treat a
    /// null attribute as "absent" for merge-conflict and concatenation
    /// purposes.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Canonical bit pattern used for `Eq`/`Hash`. All NaN payloads
    /// collapse to one pattern so the derived-by-hand impls below stay
    /// reflexive.
    fn float_key(f: f64) -> u64 {
        if f.is_nan() {
            u64::MAX
        } else {
            f.to_bits()
        }
    }
}

impl PartialEq for TypedValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => Self::float_key(*a) == Self::float_key(*b),
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Timestamp(a), Self::Timestamp(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Mapping(a), Self::Mapping(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for TypedValue {}

impl Hash for TypedValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Null => {}
            Self::Bool(b) => b.hash(state),
            Self::Int(i) => i.hash(state),
            Self::Float(f) => Self::float_key(*f).hash(state),
            Self::Text(s) => s.hash(state),
            Self::Bytes(b) => b.hash(state),
            Self::Timestamp(t) => t.hash(state),
            Self::List(l) => l.hash(state),
            Self::Mapping(m) => {
                for (k, v) in m {
                    k.hash(state);
                    v.hash(state);
                }
            }
        }
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => write!(f, "{s}"),
            Self::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
            Self::Timestamp(t) => write!(f, "{}", t.format("%Y-%m-%dT%H:%M:%S")),
            Self::List(l) => {
                write!(f, "[")?;
                for (i, v) in l.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Self::Mapping(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// The local identity of an object within one `EntityType`: either a
/// single attribute value or an ordered composite of several, per the
/// entity's `PrimaryKeySpec`.
///
/// # Examples
///
/// ```
/// use cdc_relay_domain::value::{PrimaryKeyValue, TypedValue};
///
/// let simple = PrimaryKeyValue::Simple(TypedValue::Text("u-1042".into()));
/// assert_eq!(simple.to_string(), "u-1042");
///
/// let composite = PrimaryKeyValue::Composite(vec![
///     TypedValue::Text("acme".into()),
///     TypedValue::Int(7),
/// ]);
/// assert_eq!(composite.to_string(), "acme\u{1f}7");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryKeyValue {
    Simple(TypedValue),
    Composite(Vec<TypedValue>),
}

impl fmt::Display for PrimaryKeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple(v) => write!(f, "{v}"),
            // 0x1f (unit separator) is not a realistic field value, so the
            // rendered string is still a safe, stable sled/log key.
            Self::Composite(vs) => {
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        write!(f, "\u{1f}")?;
                    }
                    write!(f, "{v}")?;
                }
                Ok(())
            }
        }
    }
}

/// The immutable synthetic identity an object is given on first
/// observation (C3/C5), surviving any later rename of its local primary
/// key. Producer and consumer caches are both indexed primarily by
/// `RemotePkeyValue`; `PrimaryKeyValue` is derived, display-oriented
/// state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemotePkeyValue(String);

impl RemotePkeyValue {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemotePkeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RemotePkeyValue {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RemotePkeyValue {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_null() {
        assert!(TypedValue::Null.is_null());
        assert!(!TypedValue::Int(0).is_null());
    }

    #[test]
    fn float_equality_is_reflexive_for_nan() {
        let a = TypedValue::Float(f64::NAN);
        let b = TypedValue::Float(f64::NAN);
        assert_eq!(a, b);
    }

    #[test]
    fn float_equality_distinguishes_values() {
        assert_ne!(TypedValue::Float(1.0), TypedValue::Float(2.0));
        assert_eq!(TypedValue::Float(1.5), TypedValue::Float(1.5));
    }

    #[test]
    fn mapping_equality_is_order_independent() {
        let mut a = BTreeMap::new();
        a.insert("x".to_string(), TypedValue::Int(1));
        a.insert("y".to_string(), TypedValue::Int(2));
        let mut b = BTreeMap::new();
        b.insert("y".to_string(), TypedValue::Int(2));
        b.insert("x".to_string(), TypedValue::Int(1));
        assert_eq!(TypedValue::Mapping(a), TypedValue::Mapping(b));
    }

    #[test]
    fn display_renders_list() {
        let list = TypedValue::List(vec![TypedValue::Int(1), TypedValue::Text("a".into())]);
        assert_eq!(list.to_string(), "[1, a]");
    }

    #[test]
    fn primary_key_composite_display_is_stable() {
        let pk = PrimaryKeyValue::Composite(vec![TypedValue::Text("a".into()), TypedValue::Int(1)]);
        assert_eq!(pk.to_string(), "a\u{1f}1");
    }

    #[test]
    fn typed_value_roundtrips_through_json() {
        let v = TypedValue::Bytes(vec![1, 2, 3]);
        let json = serde_json::to_string(&v).unwrap();
        let back: TypedValue = serde_json::from_str(&json).unwrap();
        assert_eq!(v, back);
    }
}
