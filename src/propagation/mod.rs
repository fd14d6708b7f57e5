//! Moving span contexts across process boundaries.
//!
//! A [`Propagator`] writes a [`SpanContext`] into a carrier and reads one
//! back out. Text carriers implement [`Injector`]/[`Extractor`]; the binary
//! wire format works directly on byte buffers.

use std::collections::HashMap;
use std::fmt;

use crate::errors::PropagationError;
use crate::span_context::SpanContext;

mod b3;
mod binary;
mod text_map;

pub use b3::B3Propagator;
pub use binary::BinaryPropagator;
pub use text_map::TextMapPropagator;

/// The text carrier formats a tracer can serve.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Format {
    /// Arbitrary string keys and values.
    TextMap,
    /// HTTP headers: keys compared case-insensitively on extract, values
    /// URL-encoded.
    HttpHeaders,
}

/// A carrier that spans context data can be written into.
pub trait Injector {
    /// Set a key/value pair.
    fn set(&mut self, key: &str, value: String);
}

/// A carrier that span context data can be read from.
pub trait Extractor {
    /// Value for the given key, if present.
    fn get(&self, key: &str) -> Option<&str>;

    /// All keys present in the carrier.
    fn keys(&self) -> Vec<&str>;
}

/// Serves one text format.
pub trait Propagator: Send + Sync + fmt::Debug {
    /// Write `context` into `carrier`.
    fn inject(
        &self,
        context: &SpanContext,
        carrier: &mut dyn Injector,
    ) -> Result<(), PropagationError>;

    /// Read a span context out of `carrier`.
    ///
    /// A carrier holding only out-of-band data (a debug correlation id or
    /// bulk baggage) yields an invalid context carrying that data rather
    /// than an error.
    fn extract(&self, carrier: &dyn Extractor) -> Result<SpanContext, PropagationError>;
}

impl Injector for HashMap<String, String> {
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_string(), value);
    }
}

impl Extractor for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<&str> {
        self.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_map_carrier() {
        let mut map: HashMap<String, String> = HashMap::new();
        Injector::set(&mut map, "key", "value".to_string());
        assert_eq!(Extractor::get(&map, "key"), Some("value"));
        assert_eq!(Extractor::keys(&map), vec!["key"]);
    }
}
