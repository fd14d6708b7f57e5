//! Trace identity: trace/span ids, the per-trace sampling state, and the
//! propagable [`SpanContext`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::errors::TraceError;

pub(crate) const FLAG_SAMPLED: u8 = 1;
pub(crate) const FLAG_DEBUG: u8 = 2;
pub(crate) const FLAG_FIREHOSE: u8 = 8;

/// Globally unique 128-bit identifier of a trace.
///
/// Usually generated as a random number; a trace id is valid iff any bit is
/// non-zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TraceId {
    /// The most significant 64 bits.
    pub high: u64,
    /// The least significant 64 bits.
    pub low: u64,
}

impl TraceId {
    /// Construct a trace id from its two halves.
    pub const fn new(high: u64, low: u64) -> Self {
        TraceId { high, low }
    }

    /// Returns `true` if the trace id is non-zero.
    pub fn is_valid(&self) -> bool {
        self.high != 0 || self.low != 0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.high == 0 {
            write!(f, "{:x}", self.low)
        } else {
            write!(f, "{:x}{:016x}", self.high, self.low)
        }
    }
}

impl FromStr for TraceId {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 32 {
            return Err(TraceError::InvalidArgument(format!(
                "trace id must be 1-32 hex characters, got {:?}",
                s
            )));
        }
        let parse = |part: &str| {
            u64::from_str_radix(part, 16).map_err(|err| {
                TraceError::InvalidArgument(format!("cannot parse trace id {:?}: {}", s, err))
            })
        };
        if s.len() > 16 {
            let (high, low) = s.split_at(s.len() - 16);
            Ok(TraceId::new(parse(high)?, parse(low)?))
        } else {
            Ok(TraceId::new(0, parse(s)?))
        }
    }
}

/// Unique 64-bit identifier of a span within its trace.
///
/// Zero is reserved to mean "no parent".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SpanId(u64);

impl SpanId {
    /// Construct a span id from a `u64`.
    pub const fn from_u64(id: u64) -> Self {
        SpanId(id)
    }

    /// The raw `u64` value.
    pub const fn to_u64(self) -> u64 {
        self.0
    }

    /// Returns `true` if the span id is non-zero.
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl FromStr for SpanId {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 16 {
            return Err(TraceError::InvalidArgument(format!(
                "span id must be 1-16 hex characters, got {:?}",
                s
            )));
        }
        u64::from_str_radix(s, 16).map(SpanId).map_err(|err| {
            TraceError::InvalidArgument(format!("cannot parse span id {:?}: {}", s, err))
        })
    }
}

/// Sampling flags shared by every span of one trace within this process.
///
/// Spans of one trace may be finished concurrently, so all mutations are
/// atomic bitwise operations. Only the lower 8 bits are used.
#[derive(Debug, Default)]
pub struct SamplingState {
    flags: AtomicU8,
}

impl SamplingState {
    pub(crate) fn with_flags(flags: u8) -> Self {
        SamplingState {
            flags: AtomicU8::new(flags),
        }
    }

    pub(crate) fn set_sampled(&self) {
        self.flags.fetch_or(FLAG_SAMPLED, Ordering::Relaxed);
    }

    pub(crate) fn reset_sampled(&self) {
        self.flags.fetch_and(!FLAG_SAMPLED, Ordering::Relaxed);
    }

    pub(crate) fn set_debug_and_sampled(&self) {
        self.flags.fetch_or(FLAG_DEBUG | FLAG_SAMPLED, Ordering::Relaxed);
    }

    pub(crate) fn set_firehose(&self) {
        self.flags.fetch_or(FLAG_FIREHOSE, Ordering::Relaxed);
    }

    pub(crate) fn flags(&self) -> u8 {
        self.flags.load(Ordering::Relaxed)
    }

    pub(crate) fn is_sampled(&self) -> bool {
        self.flags() & FLAG_SAMPLED == FLAG_SAMPLED
    }

    pub(crate) fn is_debug(&self) -> bool {
        self.flags() & FLAG_DEBUG == FLAG_DEBUG
    }

    pub(crate) fn is_firehose(&self) -> bool {
        self.flags() & FLAG_FIREHOSE == FLAG_FIREHOSE
    }
}

/// Propagated span identity and state.
///
/// A span context is an immutable value: adding a baggage item produces a new
/// context with a new baggage snapshot, while the original is untouched. The
/// sampling state, in contrast, is shared by reference with every other
/// context of the same trace in this process, so sampling overrides take
/// effect for all of them at once.
#[derive(Clone, Debug)]
pub struct SpanContext {
    trace_id: TraceId,
    span_id: SpanId,
    parent_id: SpanId,
    baggage: Arc<HashMap<String, String>>,
    debug_id: Option<String>,
    state: Arc<SamplingState>,
}

impl SpanContext {
    /// Construct a span context with a fresh sampling state.
    pub fn new(
        trace_id: TraceId,
        span_id: SpanId,
        parent_id: SpanId,
        sampled: bool,
        baggage: Option<HashMap<String, String>>,
    ) -> Self {
        let state = SamplingState::default();
        if sampled {
            state.set_sampled();
        }
        SpanContext {
            trace_id,
            span_id,
            parent_id,
            baggage: Arc::new(baggage.unwrap_or_default()),
            debug_id: None,
            state: Arc::new(state),
        }
    }

    pub(crate) fn with_parts(
        trace_id: TraceId,
        span_id: SpanId,
        parent_id: SpanId,
        baggage: Arc<HashMap<String, String>>,
        debug_id: Option<String>,
        state: Arc<SamplingState>,
    ) -> Self {
        SpanContext {
            trace_id,
            span_id,
            parent_id,
            baggage,
            debug_id,
            state,
        }
    }

    /// A context carrying only a debug correlation id and/or baggage, used
    /// when a carrier had no trace identity but did have out-of-band data.
    pub(crate) fn debug_baggage_only(
        debug_id: Option<String>,
        baggage: HashMap<String, String>,
    ) -> Self {
        SpanContext {
            trace_id: TraceId::default(),
            span_id: SpanId::default(),
            parent_id: SpanId::default(),
            baggage: Arc::new(baggage),
            debug_id,
            state: Arc::new(SamplingState::default()),
        }
    }

    /// The trace id of this context.
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// The span id of this context.
    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    /// The id of the parent span, zero for a root span.
    pub fn parent_id(&self) -> SpanId {
        self.parent_id
    }

    /// Returns whether this trace was chosen for retention by the sampler.
    pub fn is_sampled(&self) -> bool {
        self.state.is_sampled()
    }

    /// Returns whether sampling was explicitly requested out-of-band.
    pub fn is_debug(&self) -> bool {
        self.state.is_debug()
    }

    /// Returns whether the trace is flagged as firehose traffic.
    pub fn is_firehose(&self) -> bool {
        self.state.is_firehose()
    }

    /// Returns `true` if this context represents a real trace: a valid trace
    /// id and a non-zero span id.
    pub fn is_valid(&self) -> bool {
        self.trace_id.is_valid() && self.span_id.is_valid()
    }

    /// The current flags byte of the shared sampling state.
    pub fn flags(&self) -> u8 {
        self.state.flags()
    }

    /// The baggage carried by this context.
    pub fn baggage(&self) -> &HashMap<String, String> {
        &self.baggage
    }

    /// The debug correlation id supplied out-of-band during extraction.
    pub fn debug_id(&self) -> Option<&str> {
        self.debug_id.as_deref()
    }

    /// Create a new context with an extra baggage item; the receiver is left
    /// unchanged.
    pub fn with_baggage_item(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut baggage = (*self.baggage).clone();
        baggage.insert(key.into(), value.into());
        SpanContext {
            trace_id: self.trace_id,
            span_id: self.span_id,
            parent_id: self.parent_id,
            baggage: Arc::new(baggage),
            debug_id: None,
            state: Arc::clone(&self.state),
        }
    }

    /// Returns `true` when this context exists only to carry a debug
    /// correlation id from extraction into the next root span.
    pub(crate) fn is_debug_id_container_only(&self) -> bool {
        !self.trace_id.is_valid() && self.debug_id.is_some()
    }

    pub(crate) fn baggage_arc(&self) -> Arc<HashMap<String, String>> {
        Arc::clone(&self.baggage)
    }

    pub(crate) fn sampling_state(&self) -> &Arc<SamplingState> {
        &self.state
    }
}

impl PartialEq for SpanContext {
    fn eq(&self, other: &Self) -> bool {
        self.trace_id == other.trace_id
            && self.span_id == other.span_id
            && self.parent_id == other.parent_id
            && self.flags() == other.flags()
            && self.baggage == other.baggage
            && self.debug_id == other.debug_id
    }
}

impl fmt::Display for SpanContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.trace_id,
            self.span_id,
            self.parent_id,
            self.flags()
        )
    }
}

impl FromStr for SpanContext {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(TraceError::InvalidArgument(
                "cannot parse span context from an empty string".to_string(),
            ));
        }
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 4 {
            return Err(TraceError::InvalidArgument(format!(
                "span context must have 4 colon-separated parts, got {:?}",
                s
            )));
        }
        let trace_id = parts[0].parse::<TraceId>()?;
        let span_id = parts[1].parse::<SpanId>()?;
        let parent_id = parts[2].parse::<SpanId>()?;
        let flags = parts[3].parse::<u8>().map_err(|err| {
            TraceError::InvalidArgument(format!("cannot parse flags {:?}: {}", parts[3], err))
        })?;
        Ok(SpanContext {
            trace_id,
            span_id,
            parent_id,
            baggage: Arc::new(HashMap::new()),
            debug_id: None,
            state: Arc::new(SamplingState::with_flags(flags)),
        })
    }
}
