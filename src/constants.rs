//! Tag keys, carrier keys, and sampler type names shared across the crate.

/// The name of the HTTP header or `TextMap` carrier key used to propagate the
/// trace context.
///
/// This must be lower-case to avoid mismatches when decoding incoming headers.
pub const TRACE_CONTEXT_HEADER_NAME: &str = "uber-trace-id";

/// The prefix of carrier keys used to propagate individual baggage items.
///
/// This must be lower-case to avoid mismatches when decoding incoming headers.
pub const TRACE_BAGGAGE_HEADER_PREFIX: &str = "uberctx-";

/// Carrier key which, if found during extraction, forces the trace to be
/// sampled as a "debug" trace.
///
/// The value of the key is recorded as a tag on the root span, so that the
/// trace can be found in the UI using this value as a correlation ID.
pub const JAEGER_DEBUG_HEADER: &str = "jaeger-debug-id";

/// Carrier key used to submit baggage in bulk, as comma-separated
/// `key1=value1, key2=value2` pairs.
///
/// Unlike [`TRACE_BAGGAGE_HEADER_PREFIX`] it can be used when no span context
/// exists in the carrier at all.
pub const JAEGER_BAGGAGE_HEADER: &str = "jaeger-baggage";

/// Span tag holding the type of the sampler that made the sampling decision.
pub const SAMPLER_TYPE_TAG_KEY: &str = "sampler.type";

/// Span tag holding the parameter of the sampler that made the sampling
/// decision.
pub const SAMPLER_PARAM_TAG_KEY: &str = "sampler.param";

/// Span tag that overrides the sampling decision for the whole trace.
///
/// A positive value forces the trace to be sampled as a debug trace, a zero
/// value clears the sampled flag. See [`Span::set_tag`](crate::Span::set_tag).
pub const SAMPLING_PRIORITY_TAG_KEY: &str = "sampling.priority";

/// `sampler.type` value reported by [`ConstSampler`](crate::ConstSampler).
pub const SAMPLER_TYPE_CONST: &str = "const";

/// `sampler.type` value reported by
/// [`ProbabilisticSampler`](crate::ProbabilisticSampler).
pub const SAMPLER_TYPE_PROBABILISTIC: &str = "probabilistic";

/// `sampler.type` value reported by
/// [`RateLimitingSampler`](crate::RateLimitingSampler).
pub const SAMPLER_TYPE_RATE_LIMITING: &str = "ratelimiting";

/// `sampler.type` value reported when the lower-bound rate limiter of a
/// guaranteed-throughput sampler made the decision.
pub const SAMPLER_TYPE_LOWER_BOUND: &str = "lowerbound";
