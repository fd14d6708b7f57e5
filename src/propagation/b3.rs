//! Zipkin B3 multi-header propagation, for interop with Zipkin-instrumented
//! services.

use crate::errors::PropagationError;
use crate::propagation::{Extractor, Injector, Propagator};
use crate::span_context::{SpanContext, SpanId, TraceId};

const B3_TRACE_ID_HEADER: &str = "x-b3-traceid";
const B3_SPAN_ID_HEADER: &str = "x-b3-spanid";
const B3_PARENT_SPAN_ID_HEADER: &str = "x-b3-parentspanid";
const B3_SAMPLED_HEADER: &str = "x-b3-sampled";

/// Propagator speaking the `x-b3-*` multi-header format.
///
/// Header keys are lower-case; extraction matches them case-insensitively,
/// since HTTP and gRPC differ on header capitalization.
#[derive(Clone, Debug, Default)]
pub struct B3Propagator {
    _private: (),
}

impl B3Propagator {
    /// Create a B3 propagator.
    pub fn new() -> Self {
        B3Propagator::default()
    }
}

impl Propagator for B3Propagator {
    fn inject(
        &self,
        context: &SpanContext,
        carrier: &mut dyn Injector,
    ) -> Result<(), PropagationError> {
        carrier.set(B3_TRACE_ID_HEADER, context.trace_id().to_string());
        if context.parent_id().is_valid() {
            carrier.set(
                B3_PARENT_SPAN_ID_HEADER,
                context.parent_id().to_string(),
            );
        }
        carrier.set(B3_SPAN_ID_HEADER, context.span_id().to_string());
        carrier.set(
            B3_SAMPLED_HEADER,
            if context.is_sampled() { "1" } else { "0" }.to_string(),
        );
        Ok(())
    }

    fn extract(&self, carrier: &dyn Extractor) -> Result<SpanContext, PropagationError> {
        let mut trace_id = TraceId::default();
        let mut span_id = SpanId::default();
        let mut parent_id = SpanId::default();
        let mut sampled = false;

        for key in carrier.keys() {
            let value = match carrier.get(key) {
                Some(value) => value,
                None => continue,
            };
            match key.to_lowercase().as_str() {
                B3_TRACE_ID_HEADER => {
                    trace_id = value
                        .parse()
                        .map_err(|_| PropagationError::SpanContextCorrupted)?;
                }
                B3_SPAN_ID_HEADER => {
                    span_id = value
                        .parse()
                        .map_err(|_| PropagationError::SpanContextCorrupted)?;
                }
                B3_PARENT_SPAN_ID_HEADER => {
                    parent_id = value
                        .parse()
                        .map_err(|_| PropagationError::SpanContextCorrupted)?;
                }
                B3_SAMPLED_HEADER => {
                    sampled = value == "1" || value == "true";
                }
                _ => {}
            }
        }

        if !trace_id.is_valid() {
            return Err(PropagationError::SpanContextNotFound);
        }
        Ok(SpanContext::with_parts(
            trace_id,
            span_id,
            parent_id,
            Default::default(),
            None,
            std::sync::Arc::new(crate::span_context::SamplingState::with_flags(
                if sampled { 1 } else { 0 },
            )),
        ))
    }
}
