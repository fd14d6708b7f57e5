//! Span annotations: tags, log records, and span references.

use std::borrow::Cow;
use std::fmt;
use std::time::SystemTime;

use crate::span_context::SpanContext;

/// Value of a span [`Tag`].
///
/// Carriers and senders understand exactly these shapes; anything else should
/// be converted to its string representation by the caller.
#[derive(Clone, Debug, PartialEq)]
pub enum TagValue {
    /// Boolean values
    Bool(bool),
    /// Signed integer values
    I64(i64),
    /// Floating point values
    F64(f64),
    /// String values
    String(String),
    /// Opaque byte values
    Bytes(Vec<u8>),
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Bool(v) => write!(f, "{}", v),
            TagValue::I64(v) => write!(f, "{}", v),
            TagValue::F64(v) => write!(f, "{}", v),
            TagValue::String(v) => write!(f, "{}", v),
            TagValue::Bytes(v) => write!(f, "{:02x?}", v),
        }
    }
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        TagValue::Bool(value)
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        TagValue::I64(value)
    }
}

impl From<i32> for TagValue {
    fn from(value: i32) -> Self {
        TagValue::I64(value.into())
    }
}

impl From<f64> for TagValue {
    fn from(value: f64) -> Self {
        TagValue::F64(value)
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        TagValue::String(value.to_string())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        TagValue::String(value)
    }
}

impl From<Cow<'_, str>> for TagValue {
    fn from(value: Cow<'_, str>) -> Self {
        TagValue::String(value.into_owned())
    }
}

impl From<Vec<u8>> for TagValue {
    fn from(value: Vec<u8>) -> Self {
        TagValue::Bytes(value)
    }
}

/// A key/value annotation on a span or a log record field.
#[derive(Clone, Debug, PartialEq)]
pub struct Tag {
    key: String,
    value: TagValue,
}

impl Tag {
    /// Create a tag from a key and anything convertible into a [`TagValue`].
    pub fn new(key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        Tag {
            key: key.into(),
            value: value.into(),
        }
    }

    /// The tag key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The tag value.
    pub fn value(&self) -> &TagValue {
        &self.value
    }
}

/// A timestamped set of fields attached to a span.
#[derive(Clone, Debug, PartialEq)]
pub struct LogRecord {
    /// Wall-clock time at which the fields were recorded.
    pub timestamp: SystemTime,
    /// The recorded fields.
    pub fields: Vec<Tag>,
}

/// The causal relationship carried by a [`Reference`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferenceType {
    /// The referenced span is a parent that depends on this span's outcome.
    ChildOf,
    /// The referenced span does not depend on this span's outcome.
    FollowsFrom,
}

/// A causal reference from a new span to an existing span context.
#[derive(Clone, Debug)]
pub struct Reference {
    /// The relationship between the spans.
    pub kind: ReferenceType,
    /// The referenced span context.
    pub context: SpanContext,
}

impl Reference {
    /// A `ChildOf` reference to `context`.
    pub fn child_of(context: SpanContext) -> Self {
        Reference {
            kind: ReferenceType::ChildOf,
            context,
        }
    }

    /// A `FollowsFrom` reference to `context`.
    pub fn follows_from(context: SpanContext) -> Self {
        Reference {
            kind: ReferenceType::FollowsFrom,
            context,
        }
    }
}
