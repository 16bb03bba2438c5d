//! Tagged entity identifiers.
//!
//! Every persisted entity is addressed by a short type tag plus its storage key,
//! rendered as `"a:1"`. Tags are declared in entity metadata, so turning an
//! arbitrary string into a [`TaggedId`] goes through
//! [`MetadataRegistry::parse_id`](crate::meta::MetadataRegistry::parse_id).

use crate::error::{Error, Result};
use crate::value::Value;
use serde::{Serialize, Serializer};
use std::fmt;

/// The storage half of a tagged id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IdValue {
    /// Integer keys (sequences, auto-increment)
    Int(i64),
    /// Opaque keys (uuids, natural keys)
    Text(String),
}

impl IdValue {
    /// Parse the part after the tag. All-digit strings become integers.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::InvalidId(raw.to_string()));
        }
        if let Ok(n) = raw.parse::<i64>() {
            return Ok(IdValue::Int(n));
        }
        Ok(IdValue::Text(raw.to_string()))
    }

    /// Read an id out of a row value.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(v) => Some(IdValue::Int(i64::from(*v))),
            Value::BigInt(v) => Some(IdValue::Int(*v)),
            Value::Text(s) => Some(IdValue::Text(s.clone())),
            _ => None,
        }
    }

    /// The value bound into SQL for this id.
    pub fn to_value(&self) -> Value {
        match self {
            IdValue::Int(v) => Value::BigInt(*v),
            IdValue::Text(s) => Value::Text(s.clone()),
        }
    }
}

impl fmt::Display for IdValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdValue::Int(v) => write!(f, "{}", v),
            IdValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// A type tag plus storage key, unique across the whole entity graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaggedId {
    tag: &'static str,
    value: IdValue,
}

impl TaggedId {
    pub fn new(tag: &'static str, value: IdValue) -> Self {
        Self { tag, value }
    }

    /// Shorthand for integer keys.
    pub fn int(tag: &'static str, value: i64) -> Self {
        Self::new(tag, IdValue::Int(value))
    }

    pub fn tag(&self) -> &'static str {
        self.tag
    }

    pub fn value(&self) -> &IdValue {
        &self.value
    }

    /// The value bound into SQL for this id.
    pub fn to_value(&self) -> Value {
        self.value.to_value()
    }
}

impl fmt::Display for TaggedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tag, self.value)
    }
}

impl Serialize for TaggedId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Split `"tag:key"` into its parts without resolving the tag.
pub fn split_tagged(raw: &str) -> Result<(&str, &str)> {
    match raw.split_once(':') {
        Some((tag, key)) if !tag.is_empty() && !key.is_empty() => Ok((tag, key)),
        _ => Err(Error::InvalidId(raw.to_string())),
    }
}
