//! The opaque binary propagation format.
//!
//! Big-endian layout: trace id high and low (u64 each), span id (u64),
//! parent id (u64), flags (u8), baggage count (u32), then length-prefixed
//! key/value pairs (u32 lengths).

use std::collections::HashMap;

use crate::errors::PropagationError;
use crate::span_context::{SamplingState, SpanContext, SpanId, TraceId};
use std::sync::Arc;

/// Encoder/decoder of span contexts as opaque byte sequences.
#[derive(Clone, Debug, Default)]
pub struct BinaryPropagator {
    _private: (),
}

impl BinaryPropagator {
    /// Create a binary propagator.
    pub fn new() -> Self {
        BinaryPropagator::default()
    }

    /// Append `context` to `buffer`.
    pub fn inject(&self, context: &SpanContext, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&context.trace_id().high.to_be_bytes());
        buffer.extend_from_slice(&context.trace_id().low.to_be_bytes());
        buffer.extend_from_slice(&context.span_id().to_u64().to_be_bytes());
        buffer.extend_from_slice(&context.parent_id().to_u64().to_be_bytes());
        buffer.push(context.flags());

        let baggage = context.baggage();
        buffer.extend_from_slice(&(baggage.len() as u32).to_be_bytes());
        for (key, value) in baggage {
            buffer.extend_from_slice(&(key.len() as u32).to_be_bytes());
            buffer.extend_from_slice(key.as_bytes());
            buffer.extend_from_slice(&(value.len() as u32).to_be_bytes());
            buffer.extend_from_slice(value.as_bytes());
        }
    }

    /// Decode a span context from `data`.
    pub fn extract(&self, data: &[u8]) -> Result<SpanContext, PropagationError> {
        if data.is_empty() {
            return Err(PropagationError::SpanContextNotFound);
        }
        let mut reader = Reader { data };
        let trace_id = TraceId::new(reader.read_u64()?, reader.read_u64()?);
        let span_id = SpanId::from_u64(reader.read_u64()?);
        let parent_id = SpanId::from_u64(reader.read_u64()?);
        let flags = reader.read_u8()?;

        let baggage_count = reader.read_u32()? as usize;
        let mut baggage = HashMap::with_capacity(baggage_count.min(64));
        for _ in 0..baggage_count {
            let key = reader.read_string()?;
            let value = reader.read_string()?;
            baggage.insert(key, value);
        }

        Ok(SpanContext::with_parts(
            trace_id,
            span_id,
            parent_id,
            Arc::new(baggage),
            None,
            Arc::new(SamplingState::with_flags(flags)),
        ))
    }
}

struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], PropagationError> {
        if self.data.len() < len {
            return Err(PropagationError::SpanContextCorrupted);
        }
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Ok(head)
    }

    fn read_u8(&mut self) -> Result<u8, PropagationError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, PropagationError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes(
            bytes.try_into().map_err(|_| PropagationError::SpanContextCorrupted)?,
        ))
    }

    fn read_u64(&mut self) -> Result<u64, PropagationError> {
        let bytes = self.take(8)?;
        Ok(u64::from_be_bytes(
            bytes.try_into().map_err(|_| PropagationError::SpanContextCorrupted)?,
        ))
    }

    fn read_string(&mut self) -> Result<String, PropagationError> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| PropagationError::SpanContextCorrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context_with_baggage() -> SpanContext {
        SpanContext::new(
            TraceId::new(0x0102, 0x0304),
            SpanId::from_u64(0x05),
            SpanId::from_u64(0x06),
            true,
            None,
        )
        .with_baggage_item("tenant", "acme")
        .with_baggage_item("flow", "checkout")
    }

    #[test]
    fn binary_round_trip_preserves_everything() {
        let propagator = BinaryPropagator::new();
        let context = context_with_baggage();

        let mut buffer = Vec::new();
        propagator.inject(&context, &mut buffer);
        let extracted = propagator.extract(&buffer).unwrap();

        assert_eq!(extracted.trace_id(), context.trace_id());
        assert_eq!(extracted.span_id(), context.span_id());
        assert_eq!(extracted.parent_id(), context.parent_id());
        assert_eq!(extracted.flags(), context.flags());
        assert_eq!(extracted.baggage(), context.baggage());
    }

    #[test]
    fn fixed_layout_prefix() {
        let propagator = BinaryPropagator::new();
        let context = SpanContext::new(
            TraceId::new(1, 2),
            SpanId::from_u64(3),
            SpanId::from_u64(4),
            true,
            None,
        );
        let mut buffer = Vec::new();
        propagator.inject(&context, &mut buffer);

        let mut expected = Vec::new();
        expected.extend_from_slice(&1u64.to_be_bytes());
        expected.extend_from_slice(&2u64.to_be_bytes());
        expected.extend_from_slice(&3u64.to_be_bytes());
        expected.extend_from_slice(&4u64.to_be_bytes());
        expected.push(1); // sampled flag
        expected.extend_from_slice(&0u32.to_be_bytes());
        assert_eq!(buffer, expected);
    }

    #[test]
    fn empty_input_is_not_found() {
        assert_eq!(
            BinaryPropagator::new().extract(&[]),
            Err(PropagationError::SpanContextNotFound)
        );
    }

    #[test]
    fn truncated_input_is_corrupted() {
        let propagator = BinaryPropagator::new();
        let mut buffer = Vec::new();
        propagator.inject(&context_with_baggage(), &mut buffer);

        for cut in [1, 8, 16, 33, buffer.len() - 1] {
            assert_eq!(
                propagator.extract(&buffer[..cut]),
                Err(PropagationError::SpanContextCorrupted),
                "cut at {}",
                cut
            );
        }
    }

    #[test]
    fn lying_baggage_count_is_corrupted() {
        let propagator = BinaryPropagator::new();
        let context = SpanContext::new(
            TraceId::new(1, 2),
            SpanId::from_u64(3),
            SpanId::default(),
            false,
            None,
        );
        let mut buffer = Vec::new();
        propagator.inject(&context, &mut buffer);
        // Overwrite the baggage count with a huge number.
        let count_offset = buffer.len() - 4;
        buffer[count_offset..].copy_from_slice(&u32::MAX.to_be_bytes());
        assert_eq!(
            propagator.extract(&buffer),
            Err(PropagationError::SpanContextCorrupted)
        );
    }
}
