//! The tracer: factory for spans, owner of the sampler, the reporter, the
//! propagators, and the background helpers.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use rand::{rngs, Rng, SeedableRng};

use crate::baggage::{BaggageRestrictionManager, BaggageSetter, DefaultBaggageRestrictionManager};
use crate::constants::JAEGER_DEBUG_HEADER;
use crate::errors::{PropagationError, TraceError};
use crate::logger::{Logger, NullLogger};
use crate::metrics::Metrics;
use crate::propagation::{
    BinaryPropagator, Extractor, Format, Injector, Propagator, TextMapPropagator,
};
use crate::reporter::{NullReporter, Reporter};
use crate::sampler::{ConstSampler, Sampler};
use crate::span::{Span, SpanState};
use crate::span_context::{SamplingState, SpanContext, SpanId, TraceId};
use crate::tag::{Reference, ReferenceType, Tag};
use crate::throttler::{DefaultThrottler, Throttler};

/// Generates trace and span ids.
pub trait IdGenerator: Send + Sync + fmt::Debug {
    /// Generate a new, valid trace id.
    fn new_trace_id(&self) -> TraceId;

    /// Generate a new, non-zero span id.
    fn new_span_id(&self) -> SpanId;
}

thread_local! {
    static CURRENT_RNG: RefCell<rngs::SmallRng> = RefCell::new(rngs::SmallRng::from_entropy());
}

/// Default [`IdGenerator`], backed by a per-thread random number generator.
#[derive(Clone, Debug, Default)]
pub struct RandomIdGenerator {
    _private: (),
}

impl IdGenerator for RandomIdGenerator {
    fn new_trace_id(&self) -> TraceId {
        CURRENT_RNG.with(|rng| {
            let mut rng = rng.borrow_mut();
            loop {
                let id: u128 = rng.gen();
                if id != 0 {
                    return TraceId::new((id >> 64) as u64, id as u64);
                }
            }
        })
    }

    fn new_span_id(&self) -> SpanId {
        CURRENT_RNG.with(|rng| {
            let mut rng = rng.borrow_mut();
            loop {
                let id: u64 = rng.gen();
                if id != 0 {
                    return SpanId::from_u64(id);
                }
            }
        })
    }
}

struct TracerInner {
    service_name: String,
    sampler: Box<dyn Sampler>,
    reporter: Box<dyn Reporter>,
    throttler: Arc<dyn Throttler>,
    restriction_manager: Arc<dyn BaggageRestrictionManager>,
    baggage_setter: BaggageSetter,
    id_generator: Box<dyn IdGenerator>,
    propagators: HashMap<Format, Arc<dyn Propagator>>,
    binary_propagator: BinaryPropagator,
    clock: fn() -> SystemTime,
    metrics: Metrics,
    logger: Arc<dyn Logger>,
}

/// Creates and reports spans for one service.
///
/// Cheap to clone; all clones share the same sampler, reporter, and
/// background workers. [`Tracer::close`] shuts the shared machinery down and
/// should be called exactly once, after the last span.
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("service_name", &self.inner.service_name)
            .finish()
    }
}

impl Tracer {
    /// Start building a tracer for `service_name`.
    pub fn builder(service_name: impl Into<String>) -> TracerBuilder {
        TracerBuilder::new(service_name.into())
    }

    /// The service this tracer reports for.
    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    /// Start a span with no options.
    pub fn start_span(&self, operation_name: impl Into<String>) -> Span {
        self.span_builder(operation_name).start(self)
    }

    /// Start describing a span: references, tags, an explicit start time.
    pub fn span_builder(&self, operation_name: impl Into<String>) -> SpanBuilder {
        SpanBuilder::from_name(operation_name)
    }

    /// Write `context` into `carrier` in the given text format.
    pub fn inject(
        &self,
        context: &SpanContext,
        format: Format,
        carrier: &mut dyn Injector,
    ) -> Result<(), PropagationError> {
        match self.inner.propagators.get(&format) {
            Some(propagator) => propagator.inject(context, carrier),
            None => Err(PropagationError::InvalidCarrier),
        }
    }

    /// Read a span context out of `carrier` in the given text format.
    pub fn extract(
        &self,
        format: Format,
        carrier: &dyn Extractor,
    ) -> Result<SpanContext, PropagationError> {
        let propagator = self
            .inner
            .propagators
            .get(&format)
            .ok_or(PropagationError::InvalidCarrier)?;
        let result = propagator.extract(carrier);
        if let Err(PropagationError::SpanContextCorrupted) = result {
            self.inner.metrics.span_context_decoding_errors.inc(1);
        }
        result
    }

    /// Append `context` to `buffer` in the binary wire format.
    pub fn inject_binary(&self, context: &SpanContext, buffer: &mut Vec<u8>) {
        self.inner.binary_propagator.inject(context, buffer);
    }

    /// Decode a span context from the binary wire format.
    pub fn extract_binary(&self, data: &[u8]) -> Result<SpanContext, PropagationError> {
        let result = self.inner.binary_propagator.extract(data);
        if let Err(PropagationError::SpanContextCorrupted) = result {
            self.inner.metrics.span_context_decoding_errors.inc(1);
        }
        result
    }

    /// Close the sampler, the throttler, the restriction manager, and the
    /// reporter (which flushes). The first error encountered is returned.
    pub fn close(&self) -> Result<(), TraceError> {
        self.inner.sampler.close();
        self.inner.throttler.close();
        self.inner.restriction_manager.close();
        self.inner.reporter.close()
    }

    pub(crate) fn now(&self) -> SystemTime {
        (self.inner.clock)()
    }

    pub(crate) fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    pub(crate) fn logger(&self) -> &Arc<dyn Logger> {
        &self.inner.logger
    }

    pub(crate) fn baggage_setter(&self) -> &BaggageSetter {
        &self.inner.baggage_setter
    }

    pub(crate) fn report_span(&self, data: crate::span::SpanData) {
        self.inner.reporter.report(data);
    }

    /// Whether `operation` may start a debug trace right now.
    pub(crate) fn is_debug_allowed(&self, operation: &str) -> bool {
        if self.inner.throttler.is_throttled(operation) {
            self.inner.metrics.throttled_debug_spans.inc(1);
            self.inner
                .logger
                .info(&format!("debug span throttled for operation {}", operation));
            false
        } else {
            true
        }
    }

    fn build_span(&self, builder: SpanBuilder) -> Span {
        let SpanBuilder {
            operation_name,
            start_time,
            mut tags,
            references,
        } = builder;
        let start_time = start_time.unwrap_or_else(|| self.now());

        let parent = references
            .iter()
            .find(|reference| reference.kind == ReferenceType::ChildOf)
            .or_else(|| {
                references
                    .iter()
                    .find(|reference| reference.kind == ReferenceType::FollowsFrom)
            })
            .map(|reference| reference.context.clone());

        let context = match &parent {
            Some(parent_context) if parent_context.is_valid() => SpanContext::with_parts(
                parent_context.trace_id(),
                self.inner.id_generator.new_span_id(),
                parent_context.span_id(),
                parent_context.baggage_arc(),
                None,
                Arc::clone(parent_context.sampling_state()),
            ),
            _ => {
                let trace_id = self.inner.id_generator.new_trace_id();
                let span_id = self.inner.id_generator.new_span_id();
                let state = Arc::new(SamplingState::default());

                match &parent {
                    Some(parent_context) if parent_context.is_debug_id_container_only() => {
                        if let Some(debug_id) = parent_context.debug_id() {
                            if self.is_debug_allowed(&operation_name) {
                                state.set_debug_and_sampled();
                                tags.push(Tag::new(JAEGER_DEBUG_HEADER, debug_id));
                            }
                        }
                    }
                    _ => {
                        let decision = self.inner.sampler.is_sampled(trace_id, &operation_name);
                        if decision.sampled {
                            state.set_sampled();
                            tags.extend(decision.tags);
                            self.inner.metrics.traces_sampled.inc(1);
                        } else {
                            self.inner.metrics.traces_not_sampled.inc(1);
                        }
                    }
                }

                // Even an invalid parent may carry baggage, e.g. one built
                // from a carrier holding only baggage headers.
                let baggage = parent
                    .as_ref()
                    .map(|parent_context| parent_context.baggage_arc())
                    .unwrap_or_default();
                SpanContext::with_parts(
                    trace_id,
                    span_id,
                    SpanId::default(),
                    baggage,
                    None,
                    state,
                )
            }
        };

        self.inner.metrics.started_spans.inc(1);
        Span::new(
            self.clone(),
            SpanState {
                context,
                operation_name,
                start_time,
                tags,
                logs: Vec::new(),
                references,
                finished: false,
            },
        )
    }
}

/// Describes a span before it is started.
#[derive(Debug)]
pub struct SpanBuilder {
    operation_name: String,
    start_time: Option<SystemTime>,
    tags: Vec<Tag>,
    references: Vec<Reference>,
}

impl SpanBuilder {
    /// A builder for a span named `operation_name`.
    pub fn from_name(operation_name: impl Into<String>) -> Self {
        SpanBuilder {
            operation_name: operation_name.into(),
            start_time: None,
            tags: Vec::new(),
            references: Vec::new(),
        }
    }

    /// Use an explicit start time instead of the tracer's clock.
    pub fn with_start_time(mut self, start_time: SystemTime) -> Self {
        self.start_time = Some(start_time);
        self
    }

    /// Attach a tag at creation.
    pub fn with_tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }

    /// Add a `ChildOf` reference to `parent`.
    pub fn child_of(mut self, parent: &SpanContext) -> Self {
        self.references.push(Reference::child_of(parent.clone()));
        self
    }

    /// Add a `FollowsFrom` reference to `predecessor`.
    pub fn follows_from(mut self, predecessor: &SpanContext) -> Self {
        self.references
            .push(Reference::follows_from(predecessor.clone()));
        self
    }

    /// Add an arbitrary reference.
    pub fn with_reference(mut self, reference: Reference) -> Self {
        self.references.push(reference);
        self
    }

    /// Start the span. The first `ChildOf` reference, or failing that the
    /// first `FollowsFrom` reference, determines the parent.
    pub fn start(self, tracer: &Tracer) -> Span {
        tracer.build_span(self)
    }
}

/// Builder for [`Tracer`].
pub struct TracerBuilder {
    service_name: String,
    sampler: Option<Box<dyn Sampler>>,
    reporter: Option<Box<dyn Reporter>>,
    throttler: Option<Arc<dyn Throttler>>,
    restriction_manager: Option<Arc<dyn BaggageRestrictionManager>>,
    id_generator: Option<Box<dyn IdGenerator>>,
    propagators: Vec<(Format, Arc<dyn Propagator>)>,
    clock: fn() -> SystemTime,
    metrics: Option<Metrics>,
    logger: Arc<dyn Logger>,
}

impl fmt::Debug for TracerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracerBuilder")
            .field("service_name", &self.service_name)
            .finish()
    }
}

impl TracerBuilder {
    fn new(service_name: String) -> Self {
        TracerBuilder {
            service_name,
            sampler: None,
            reporter: None,
            throttler: None,
            restriction_manager: None,
            id_generator: None,
            propagators: Vec::new(),
            clock: SystemTime::now,
            metrics: None,
            logger: Arc::new(NullLogger),
        }
    }

    /// The sampler deciding which traces are retained. Defaults to
    /// [`ConstSampler`] with `true`.
    pub fn with_sampler(mut self, sampler: impl Sampler + 'static) -> Self {
        self.sampler = Some(Box::new(sampler));
        self
    }

    /// Where finished spans go. Defaults to [`NullReporter`].
    pub fn with_reporter(mut self, reporter: impl Reporter + 'static) -> Self {
        self.reporter = Some(Box::new(reporter));
        self
    }

    /// The throttler gating debug traces. Defaults to [`DefaultThrottler`],
    /// which never throttles.
    pub fn with_throttler(mut self, throttler: impl Throttler + 'static) -> Self {
        self.throttler = Some(Arc::new(throttler));
        self
    }

    /// The baggage restriction policy. Defaults to
    /// [`DefaultBaggageRestrictionManager`].
    pub fn with_baggage_restriction_manager(
        mut self,
        manager: impl BaggageRestrictionManager + 'static,
    ) -> Self {
        self.restriction_manager = Some(Arc::new(manager));
        self
    }

    /// The id generator. Defaults to [`RandomIdGenerator`].
    pub fn with_id_generator(mut self, id_generator: impl IdGenerator + 'static) -> Self {
        self.id_generator = Some(Box::new(id_generator));
        self
    }

    /// Override the propagator serving a text format. By default
    /// [`Format::TextMap`] and [`Format::HttpHeaders`] are served by the
    /// native propagator, the latter with URL-encoded values.
    pub fn with_propagator(mut self, format: Format, propagator: impl Propagator + 'static) -> Self {
        self.propagators.push((format, Arc::new(propagator)));
        self
    }

    /// The wall clock used for span timestamps.
    pub fn with_clock(mut self, clock: fn() -> SystemTime) -> Self {
        self.clock = clock;
        self
    }

    /// Metrics destination. Defaults to a no-op.
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Logger for the tracer's own diagnostics. Defaults to [`NullLogger`].
    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Build the tracer.
    pub fn build(self) -> Tracer {
        let metrics = self.metrics.unwrap_or_else(Metrics::noop);
        let throttler = self
            .throttler
            .unwrap_or_else(|| Arc::new(DefaultThrottler));
        let restriction_manager = self
            .restriction_manager
            .unwrap_or_else(|| Arc::new(DefaultBaggageRestrictionManager::default()));

        // Identify this client instance to the agent before any credit
        // fetches happen.
        let uuid: u128 = rand::random();
        throttler.set_uuid(&format!("{:032x}", uuid));

        let mut propagators: HashMap<Format, Arc<dyn Propagator>> = HashMap::new();
        propagators.insert(Format::TextMap, Arc::new(TextMapPropagator::new()));
        propagators.insert(
            Format::HttpHeaders,
            Arc::new(TextMapPropagator::http_headers()),
        );
        for (format, propagator) in self.propagators {
            propagators.insert(format, propagator);
        }

        let baggage_setter = BaggageSetter::new(
            self.service_name.clone(),
            Arc::clone(&restriction_manager),
            metrics.clone(),
        );

        Tracer {
            inner: Arc::new(TracerInner {
                service_name: self.service_name,
                sampler: self
                    .sampler
                    .unwrap_or_else(|| Box::new(ConstSampler::new(true))),
                reporter: self.reporter.unwrap_or_else(|| Box::new(NullReporter)),
                throttler,
                restriction_manager,
                baggage_setter,
                id_generator: self
                    .id_generator
                    .unwrap_or_else(|| Box::new(RandomIdGenerator::default())),
                propagators,
                binary_propagator: BinaryPropagator::new(),
                clock: self.clock,
                metrics,
                logger: self.logger,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::InMemoryMetricsFactory;
    use crate::reporter::InMemoryReporter;
    use crate::tag::TagValue;
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[test]
    fn random_ids_are_valid_and_distinct() {
        let generator = RandomIdGenerator::default();
        let a = generator.new_trace_id();
        let b = generator.new_trace_id();
        assert!(a.is_valid() && b.is_valid());
        assert_ne!(a, b);
        assert!(generator.new_span_id().is_valid());
    }

    #[test]
    fn sampler_decision_counts_traces() {
        let factory = InMemoryMetricsFactory::new();
        let tracer = Tracer::builder("svc")
            .with_sampler(ConstSampler::new(true))
            .with_metrics(Metrics::new(&factory))
            .build();
        tracer.start_span("a").finish();
        assert_eq!(factory.counter_value("tracer.sampled", &[]), 1);

        // Child spans reuse the parent's decision, no new trace counted.
        let root = tracer.start_span("root");
        tracer
            .span_builder("child")
            .child_of(&root.context())
            .start(&tracer)
            .finish();
        assert_eq!(factory.counter_value("tracer.sampled", &[]), 2);
        tracer.close().unwrap();
    }

    #[test]
    fn follows_from_sets_parentage() {
        let tracer = Tracer::builder("svc").build();
        let first = tracer.start_span("first");
        let second = tracer
            .span_builder("second")
            .follows_from(&first.context())
            .start(&tracer);
        assert_eq!(second.context().trace_id(), first.context().trace_id());
        assert_eq!(second.context().parent_id(), first.context().span_id());
        tracer.close().unwrap();
    }

    #[test]
    fn debug_id_only_parent_starts_debug_trace() {
        let reporter = InMemoryReporter::new();
        let tracer = Tracer::builder("svc")
            .with_sampler(ConstSampler::new(false))
            .with_reporter(reporter.clone())
            .build();

        let mut carrier: StdHashMap<String, String> = StdHashMap::new();
        carrier.insert(JAEGER_DEBUG_HEADER.to_string(), "ticket-17".to_string());
        let extracted = tracer.extract(Format::TextMap, &carrier).unwrap();
        assert!(!extracted.is_valid());

        let span = tracer
            .span_builder("debugged")
            .child_of(&extracted)
            .start(&tracer);
        let context = span.context();
        assert!(context.is_valid());
        assert!(context.is_debug() && context.is_sampled());
        assert!(context.parent_id() == SpanId::default());
        span.finish();

        let spans = reporter.spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(
            spans[0].tag(JAEGER_DEBUG_HEADER),
            Some(&TagValue::String("ticket-17".to_string()))
        );
        tracer.close().unwrap();
    }

    #[derive(Clone, Debug, Default)]
    struct ThrottleEverything {
        uuid_seen: Arc<Mutex<Option<String>>>,
    }

    impl Throttler for ThrottleEverything {
        fn is_throttled(&self, _operation: &str) -> bool {
            true
        }

        fn set_uuid(&self, uuid: &str) {
            *self.uuid_seen.lock().unwrap() = Some(uuid.to_string());
        }
    }

    #[test]
    fn throttled_debug_id_falls_back_to_sampler() {
        let factory = InMemoryMetricsFactory::new();
        let tracer = Tracer::builder("svc")
            .with_sampler(ConstSampler::new(false))
            .with_throttler(ThrottleEverything::default())
            .with_metrics(Metrics::new(&factory))
            .build();

        let mut carrier: StdHashMap<String, String> = StdHashMap::new();
        carrier.insert(JAEGER_DEBUG_HEADER.to_string(), "ticket-17".to_string());
        let extracted = tracer.extract(Format::TextMap, &carrier).unwrap();

        let span = tracer
            .span_builder("debugged")
            .child_of(&extracted)
            .start(&tracer);
        assert!(!span.context().is_debug());
        assert!(!span.context().is_sampled());
        assert_eq!(factory.counter_value("tracer.throttled-debug-spans", &[]), 1);
        tracer.close().unwrap();
    }

    #[test]
    fn builder_hands_uuid_to_throttler() {
        let throttler = ThrottleEverything::default();
        let uuid_seen = Arc::clone(&throttler.uuid_seen);
        let tracer = Tracer::builder("svc").with_throttler(throttler).build();
        let uuid = uuid_seen.lock().unwrap().clone().expect("uuid not set");
        assert_eq!(uuid.len(), 32);
        tracer.close().unwrap();
    }

    #[test]
    fn corrupted_carrier_counts_decoding_error() {
        let factory = InMemoryMetricsFactory::new();
        let tracer = Tracer::builder("svc")
            .with_metrics(Metrics::new(&factory))
            .build();
        let mut carrier: StdHashMap<String, String> = StdHashMap::new();
        carrier.insert(
            crate::constants::TRACE_CONTEXT_HEADER_NAME.to_string(),
            "not-a-context".to_string(),
        );
        assert_eq!(
            tracer.extract(Format::TextMap, &carrier),
            Err(PropagationError::SpanContextCorrupted)
        );
        assert_eq!(
            factory.counter_value("tracer.span-context-decoding-errors", &[]),
            1
        );
        tracer.close().unwrap();
    }

    #[derive(Debug, Default)]
    struct FlagReporter {
        closed: Arc<AtomicBool>,
    }

    impl Reporter for FlagReporter {
        fn report(&self, _span: crate::span::SpanData) {}

        fn close(&self) -> Result<(), TraceError> {
            self.closed.store(true, Ordering::Relaxed);
            Ok(())
        }
    }

    #[test]
    fn close_reaches_the_reporter() {
        let closed = Arc::new(AtomicBool::new(false));
        let reporter = FlagReporter {
            closed: Arc::clone(&closed),
        };
        let tracer = Tracer::builder("svc").with_reporter(reporter).build();
        tracer.close().unwrap();
        assert!(closed.load(Ordering::Relaxed));
    }

    #[test]
    fn explicit_clock_drives_timestamps() {
        fn fixed_clock() -> SystemTime {
            SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(42)
        }
        let reporter = InMemoryReporter::new();
        let tracer = Tracer::builder("svc")
            .with_reporter(reporter.clone())
            .with_clock(fixed_clock)
            .build();
        let span = tracer.start_span("op");
        span.finish();
        assert_eq!(reporter.spans()[0].start_time, fixed_clock());
        assert_eq!(reporter.spans()[0].duration, std::time::Duration::ZERO);
        tracer.close().unwrap();
    }
}
