//! The native text propagation format.
//!
//! One header (default `uber-trace-id`) carries the span context as
//! `{trace-id}:{span-id}:{parent-id}:{flags}`; baggage items travel under a
//! key prefix (default `uberctx-`). Two more headers are understood on
//! extract: a debug correlation id and bulk baggage as comma-separated
//! `key=value` pairs.

use std::collections::HashMap;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

use crate::constants::{
    JAEGER_BAGGAGE_HEADER, JAEGER_DEBUG_HEADER, TRACE_BAGGAGE_HEADER_PREFIX,
    TRACE_CONTEXT_HEADER_NAME,
};
use crate::errors::PropagationError;
use crate::propagation::{Extractor, Injector, Propagator};
use crate::span_context::SpanContext;

/// Characters escaped in URL-encoded carrier values.
const ESCAPED: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'%')
    .add(b';')
    .add(b',')
    .add(b'=');

/// Propagator for [`Format::TextMap`] and [`Format::HttpHeaders`].
///
/// [`Format::TextMap`]: crate::propagation::Format::TextMap
/// [`Format::HttpHeaders`]: crate::propagation::Format::HttpHeaders
#[derive(Clone, Debug)]
pub struct TextMapPropagator {
    trace_context_header: String,
    baggage_prefix: String,
    url_encoding: bool,
}

impl Default for TextMapPropagator {
    fn default() -> Self {
        TextMapPropagator::new()
    }
}

impl TextMapPropagator {
    /// The plain text-map propagator: default headers, no URL encoding.
    pub fn new() -> Self {
        Self::with_custom_header_and_baggage(TRACE_CONTEXT_HEADER_NAME, TRACE_BAGGAGE_HEADER_PREFIX, false)
    }

    /// The HTTP-headers propagator: default headers, URL-encoded values.
    pub fn http_headers() -> Self {
        Self::with_custom_header_and_baggage(TRACE_CONTEXT_HEADER_NAME, TRACE_BAGGAGE_HEADER_PREFIX, true)
    }

    /// A propagator with custom header names.
    ///
    /// Empty names fall back to the defaults. Header names are matched
    /// case-insensitively on extract, so they are stored lower-cased.
    pub fn with_custom_header_and_baggage(
        trace_context_header: &str,
        baggage_prefix: &str,
        url_encoding: bool,
    ) -> Self {
        let trace_context_header = if trace_context_header.trim().is_empty() {
            TRACE_CONTEXT_HEADER_NAME
        } else {
            trace_context_header.trim()
        };
        let baggage_prefix = if baggage_prefix.trim().is_empty() {
            TRACE_BAGGAGE_HEADER_PREFIX
        } else {
            baggage_prefix.trim()
        };
        TextMapPropagator {
            trace_context_header: trace_context_header.to_lowercase(),
            baggage_prefix: baggage_prefix.to_lowercase(),
            url_encoding,
        }
    }

    fn encode_value(&self, value: &str) -> String {
        if self.url_encoding {
            utf8_percent_encode(value, ESCAPED).to_string()
        } else {
            value.to_string()
        }
    }

    fn decode_value(&self, value: &str) -> String {
        if self.url_encoding {
            percent_decode_str(value).decode_utf8_lossy().into_owned()
        } else {
            value.to_string()
        }
    }
}

/// Parse a `jaeger-baggage` header: comma-separated `key=value` pairs.
/// Malformed pairs are skipped.
fn parse_bulk_baggage(header: &str, baggage: &mut HashMap<String, String>) {
    for pair in header.split(',') {
        if let Some((key, value)) = pair.split_once('=') {
            baggage.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
}

impl Propagator for TextMapPropagator {
    fn inject(
        &self,
        context: &SpanContext,
        carrier: &mut dyn Injector,
    ) -> Result<(), PropagationError> {
        carrier.set(&self.trace_context_header, context.to_string());
        for (key, value) in context.baggage() {
            carrier.set(
                &format!("{}{}", self.baggage_prefix, key),
                self.encode_value(value),
            );
        }
        Ok(())
    }

    fn extract(&self, carrier: &dyn Extractor) -> Result<SpanContext, PropagationError> {
        let mut trace_context: Option<SpanContext> = None;
        let mut baggage: HashMap<String, String> = HashMap::new();
        let mut debug_id: Option<String> = None;

        for key in carrier.keys() {
            let value = match carrier.get(key) {
                Some(value) => value,
                None => continue,
            };
            let lowercase_key = key.to_lowercase();
            if lowercase_key == self.trace_context_header {
                let decoded = self.decode_value(value);
                trace_context = Some(
                    decoded
                        .parse::<SpanContext>()
                        .map_err(|_| PropagationError::SpanContextCorrupted)?,
                );
            } else if lowercase_key == JAEGER_DEBUG_HEADER {
                debug_id = Some(self.decode_value(value));
            } else if lowercase_key == JAEGER_BAGGAGE_HEADER {
                parse_bulk_baggage(&self.decode_value(value), &mut baggage);
            } else if let Some(baggage_key) = lowercase_key.strip_prefix(self.baggage_prefix.as_str())
            {
                baggage.insert(baggage_key.to_string(), self.decode_value(value));
            }
        }

        match trace_context {
            Some(context) => {
                let mut context = context;
                for (key, value) in baggage {
                    context = context.with_baggage_item(key, value);
                }
                Ok(context)
            }
            None if debug_id.is_none() && baggage.is_empty() => {
                Err(PropagationError::SpanContextNotFound)
            }
            None => Ok(SpanContext::debug_baggage_only(debug_id, baggage)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span_context::{SpanId, TraceId};
    use std::collections::HashMap as Carrier;

    fn context_with_baggage() -> SpanContext {
        SpanContext::new(
            TraceId::new(1, 2),
            SpanId::from_u64(3),
            SpanId::from_u64(4),
            true,
            None,
        )
        .with_baggage_item("tenant", "acme corp")
        .with_baggage_item("flow", "checkout")
    }

    #[test]
    fn text_map_round_trip_preserves_identity_and_baggage() {
        let propagator = TextMapPropagator::new();
        let context = context_with_baggage();

        let mut carrier: Carrier<String, String> = Carrier::new();
        propagator.inject(&context, &mut carrier).unwrap();
        assert_eq!(
            carrier.get(TRACE_CONTEXT_HEADER_NAME).map(String::as_str),
            Some("10000000000000002:3:4:1")
        );

        let extracted = propagator.extract(&carrier).unwrap();
        assert_eq!(extracted.trace_id(), context.trace_id());
        assert_eq!(extracted.span_id(), context.span_id());
        assert_eq!(extracted.parent_id(), context.parent_id());
        assert!(extracted.is_sampled());
        assert_eq!(extracted.baggage(), context.baggage());
    }

    #[test]
    fn http_headers_encode_values_and_ignore_key_case() {
        let propagator = TextMapPropagator::http_headers();
        let context = context_with_baggage();

        let mut carrier: Carrier<String, String> = Carrier::new();
        propagator.inject(&context, &mut carrier).unwrap();
        assert_eq!(
            carrier.get("uberctx-tenant").map(String::as_str),
            Some("acme%20corp")
        );

        // Upper-case the keys as a proxy might.
        let shouty: Carrier<String, String> = carrier
            .iter()
            .map(|(key, value)| (key.to_uppercase(), value.clone()))
            .collect();
        let extracted = propagator.extract(&shouty).unwrap();
        assert_eq!(
            extracted.baggage().get("tenant").map(String::as_str),
            Some("acme corp")
        );
        assert_eq!(extracted.trace_id(), context.trace_id());
    }

    #[test]
    fn empty_carrier_is_not_found() {
        let propagator = TextMapPropagator::new();
        let carrier: Carrier<String, String> = Carrier::new();
        assert_eq!(
            propagator.extract(&carrier),
            Err(PropagationError::SpanContextNotFound)
        );
    }

    #[test]
    fn malformed_context_is_corrupted() {
        let propagator = TextMapPropagator::new();
        for bad in ["", "abc", "x:1:1:1", "1:1:1:1:1", "1:1:1:999"] {
            let mut carrier: Carrier<String, String> = Carrier::new();
            carrier.insert(TRACE_CONTEXT_HEADER_NAME.to_string(), bad.to_string());
            assert_eq!(
                propagator.extract(&carrier),
                Err(PropagationError::SpanContextCorrupted),
                "value: {:?}",
                bad
            );
        }
    }

    #[test]
    fn debug_header_alone_yields_debug_context() {
        let propagator = TextMapPropagator::new();
        let mut carrier: Carrier<String, String> = Carrier::new();
        carrier.insert(JAEGER_DEBUG_HEADER.to_string(), "ticket-99".to_string());

        let extracted = propagator.extract(&carrier).unwrap();
        assert!(!extracted.is_valid());
        assert_eq!(extracted.debug_id(), Some("ticket-99"));
    }

    #[test]
    fn bulk_baggage_header_is_parsed() {
        let propagator = TextMapPropagator::new();
        let mut carrier: Carrier<String, String> = Carrier::new();
        carrier.insert(
            JAEGER_BAGGAGE_HEADER.to_string(),
            "tenant=acme, flow=checkout, malformed".to_string(),
        );

        let extracted = propagator.extract(&carrier).unwrap();
        assert!(!extracted.is_valid());
        assert_eq!(
            extracted.baggage().get("tenant").map(String::as_str),
            Some("acme")
        );
        assert_eq!(
            extracted.baggage().get("flow").map(String::as_str),
            Some("checkout")
        );
        assert_eq!(extracted.baggage().len(), 2);
    }

    #[test]
    fn custom_headers_and_fallbacks() {
        let propagator = TextMapPropagator::with_custom_header_and_baggage("X-Trace", "X-Ctx-", false);
        let context = context_with_baggage();
        let mut carrier: Carrier<String, String> = Carrier::new();
        propagator.inject(&context, &mut carrier).unwrap();
        assert!(carrier.contains_key("x-trace"));
        assert!(carrier.contains_key("x-ctx-tenant"));

        let fallback = TextMapPropagator::with_custom_header_and_baggage("  ", "", false);
        let mut carrier: Carrier<String, String> = Carrier::new();
        fallback.inject(&context, &mut carrier).unwrap();
        assert!(carrier.contains_key(TRACE_CONTEXT_HEADER_NAME));
    }

    #[test]
    fn url_encoded_trace_header_is_decoded() {
        let propagator = TextMapPropagator::http_headers();
        let mut carrier: Carrier<String, String> = Carrier::new();
        carrier.insert(
            TRACE_CONTEXT_HEADER_NAME.to_string(),
            "10000000000000002%3A3%3A4%3A1".to_string(),
        );
        let extracted = propagator.extract(&carrier).unwrap();
        assert_eq!(extracted.trace_id(), TraceId::new(1, 2));
        assert_eq!(extracted.span_id(), SpanId::from_u64(3));
    }
}
