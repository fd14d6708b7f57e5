//! A client library for [Jaeger](https://www.jaegertracing.io/) distributed
//! tracing.
//!
//! The library instruments an application to emit causally-linked spans,
//! propagates trace identity across process boundaries, and decides per
//! trace whether data is retained or discarded. Spans are handed to an
//! out-of-process agent through a pluggable [`Sender`]; the same agent
//! serves sampling strategy, throttling credits, and baggage restrictions
//! through the [`SamplingManager`], [`CreditManager`], and
//! [`RestrictionSource`] interfaces. Transport implementations for those
//! interfaces live outside this crate.
//!
//! # Getting started
//!
//! ```
//! use jaeger_client::{ConstSampler, InMemoryReporter, Tag, Tracer};
//!
//! let reporter = InMemoryReporter::new();
//! let tracer = Tracer::builder("ordering-service")
//!     .with_sampler(ConstSampler::new(true))
//!     .with_reporter(reporter.clone())
//!     .build();
//!
//! let span = tracer.start_span("checkout");
//! span.set_tag(Tag::new("items", 3i64));
//! span.finish();
//!
//! tracer.close().unwrap();
//! assert_eq!(reporter.spans().len(), 1);
//! ```
//!
//! # Propagation
//!
//! ```
//! use std::collections::HashMap;
//! use jaeger_client::{Format, Tracer};
//!
//! let tracer = Tracer::builder("ordering-service").build();
//! let span = tracer.start_span("handle-request");
//!
//! let mut headers: HashMap<String, String> = HashMap::new();
//! tracer
//!     .inject(&span.context(), Format::HttpHeaders, &mut headers)
//!     .unwrap();
//!
//! let extracted = tracer.extract(Format::HttpHeaders, &headers).unwrap();
//! assert_eq!(extracted.trace_id(), span.context().trace_id());
//! # span.finish();
//! # tracer.close().unwrap();
//! ```
//!
//! # Sampling
//!
//! Production deployments typically use
//! [`RemotelyControlledSampler`], which polls the agent for the strategy of
//! this service and hot-swaps between probabilistic, rate-limiting, and
//! per-operation adaptive sampling as operators reconfigure it.

#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod baggage;
pub mod constants;
pub mod errors;
pub mod logger;
pub mod metrics;
pub mod propagation;
pub mod reporter;
pub mod sampler;
pub mod span;
pub mod span_context;
pub mod tag;
pub mod throttler;
pub mod tracer;

mod worker;

pub use errors::{PropagationError, TraceError};
pub use logger::{Logger, NullLogger, StdoutLogger, TracingLogger};
pub use metrics::{
    Counter, Gauge, InMemoryMetricsFactory, Metrics, MetricsFactory, NullMetricsFactory,
};
pub use propagation::{
    B3Propagator, BinaryPropagator, Extractor, Format, Injector, Propagator, TextMapPropagator,
};
pub use reporter::{
    CompositeReporter, InMemoryReporter, LoggingReporter, NullReporter, RemoteReporter, Reporter,
    ReporterConfig, Sender,
};
pub use sampler::{
    AdaptiveSampler, ConstSampler, GuaranteedThroughputSampler, ProbabilisticSampler,
    RateLimitingSampler, RemotelyControlledSampler, Sampler, SamplingDecision, SamplingManager,
};
pub use span::{Span, SpanData};
pub use span_context::{SamplingState, SpanContext, SpanId, TraceId};
pub use tag::{LogRecord, Reference, ReferenceType, Tag, TagValue};
pub use throttler::{CreditManager, DefaultThrottler, RemoteThrottler, Throttler};
pub use tracer::{IdGenerator, RandomIdGenerator, SpanBuilder, Tracer, TracerBuilder};

pub use baggage::{
    BaggageRestrictionManager, DefaultBaggageRestrictionManager, RemoteRestrictionManager,
    Restriction, RestrictionSource,
};
