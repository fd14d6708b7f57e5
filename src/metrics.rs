//! Counters and gauges emitted by the tracer.
//!
//! The crate does not ship a metrics backend; it emits through the
//! [`MetricsFactory`] abstraction and leaves aggregation and export to the
//! host application. [`InMemoryMetricsFactory`] exists for tests.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

/// A monotonically increasing counter.
pub trait Counter: Send + Sync + fmt::Debug {
    /// Add `delta` to the counter.
    fn inc(&self, delta: i64);
}

/// An instantaneous value.
pub trait Gauge: Send + Sync + fmt::Debug {
    /// Record the current value.
    fn update(&self, value: i64);
}

/// Creates named counters and gauges with fixed tag sets.
pub trait MetricsFactory: Send + Sync {
    /// Create or look up the counter with the given name and tags.
    fn counter(&self, name: &str, tags: &[(&str, &str)]) -> Arc<dyn Counter>;

    /// Create or look up the gauge with the given name and tags.
    fn gauge(&self, name: &str, tags: &[(&str, &str)]) -> Arc<dyn Gauge>;
}

/// All metrics emitted by the tracer, pre-resolved against a factory so the
/// hot path never formats metric names.
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Number of spans started by this tracer.
    pub started_spans: Arc<dyn Counter>,
    /// Number of spans finished by this tracer.
    pub finished_spans: Arc<dyn Counter>,
    /// Number of traces the sampler decided to retain.
    pub traces_sampled: Arc<dyn Counter>,
    /// Number of traces the sampler decided to discard.
    pub traces_not_sampled: Arc<dyn Counter>,
    /// Number of spans the throttler prevented from becoming debug spans.
    pub throttled_debug_spans: Arc<dyn Counter>,
    /// Number of carriers that held a corrupted span context.
    pub span_context_decoding_errors: Arc<dyn Counter>,

    /// Number of spans the sender accepted.
    pub reporter_success: Arc<dyn Counter>,
    /// Number of spans the sender rejected.
    pub reporter_failure: Arc<dyn Counter>,
    /// Number of spans dropped because the reporter queue was full.
    pub reporter_dropped: Arc<dyn Counter>,
    /// Current depth of the reporter queue.
    pub reporter_queue_length: Arc<dyn Gauge>,

    /// Number of successful sampling-strategy polls.
    pub sampler_retrieved: Arc<dyn Counter>,
    /// Number of polls that installed a different sampler.
    pub sampler_updated: Arc<dyn Counter>,
    /// Number of polls that failed to reach the strategy endpoint.
    pub sampler_query_failure: Arc<dyn Counter>,
    /// Number of polls whose response could not be turned into a sampler.
    pub sampler_parsing_failure: Arc<dyn Counter>,

    /// Number of baggage items written successfully.
    pub baggage_update_success: Arc<dyn Counter>,
    /// Number of baggage writes rejected by restrictions.
    pub baggage_update_failure: Arc<dyn Counter>,
    /// Number of baggage values truncated to their maximum length.
    pub baggage_truncations: Arc<dyn Counter>,
    /// Number of successful baggage-restriction polls.
    pub baggage_restrictions_update_success: Arc<dyn Counter>,
    /// Number of failed baggage-restriction polls.
    pub baggage_restrictions_update_failure: Arc<dyn Counter>,

    /// Number of successful throttler credit polls.
    pub throttler_update_success: Arc<dyn Counter>,
    /// Number of failed throttler credit polls.
    pub throttler_update_failure: Arc<dyn Counter>,
}

impl Metrics {
    /// Resolve every metric against `factory`.
    pub fn new(factory: &dyn MetricsFactory) -> Self {
        Metrics {
            started_spans: factory.counter("tracer.started-spans", &[]),
            finished_spans: factory.counter("tracer.finished-spans", &[]),
            traces_sampled: factory.counter("tracer.sampled", &[]),
            traces_not_sampled: factory.counter("tracer.not-sampled", &[]),
            throttled_debug_spans: factory.counter("tracer.throttled-debug-spans", &[]),
            span_context_decoding_errors: factory
                .counter("tracer.span-context-decoding-errors", &[]),
            reporter_success: factory.counter("reporter.spans", &[("result", "ok")]),
            reporter_failure: factory.counter("reporter.spans", &[("result", "err")]),
            reporter_dropped: factory.counter("reporter.spans", &[("result", "dropped")]),
            reporter_queue_length: factory.gauge("reporter.queue-length", &[]),
            sampler_retrieved: factory.counter("sampler.retrieved", &[]),
            sampler_updated: factory.counter("sampler.updated", &[]),
            sampler_query_failure: factory.counter("sampler.query.failure", &[]),
            sampler_parsing_failure: factory.counter("sampler.parsing.failure", &[]),
            baggage_update_success: factory.counter("baggage.updates", &[("result", "ok")]),
            baggage_update_failure: factory.counter("baggage.updates", &[("result", "err")]),
            baggage_truncations: factory.counter("baggage.truncations", &[]),
            baggage_restrictions_update_success: factory
                .counter("baggage.restrictions-updates", &[("result", "ok")]),
            baggage_restrictions_update_failure: factory
                .counter("baggage.restrictions-updates", &[("result", "err")]),
            throttler_update_success: factory.counter("throttler.updates", &[("result", "ok")]),
            throttler_update_failure: factory.counter("throttler.updates", &[("result", "err")]),
        }
    }

    /// Metrics that go nowhere.
    pub fn noop() -> Self {
        Metrics::new(&NullMetricsFactory)
    }
}

/// A factory whose counters and gauges discard every value.
#[derive(Clone, Debug, Default)]
pub struct NullMetricsFactory;

#[derive(Debug)]
struct NullCounter;

impl Counter for NullCounter {
    fn inc(&self, _delta: i64) {}
}

#[derive(Debug)]
struct NullGauge;

impl Gauge for NullGauge {
    fn update(&self, _value: i64) {}
}

impl MetricsFactory for NullMetricsFactory {
    fn counter(&self, _name: &str, _tags: &[(&str, &str)]) -> Arc<dyn Counter> {
        Arc::new(NullCounter)
    }

    fn gauge(&self, _name: &str, _tags: &[(&str, &str)]) -> Arc<dyn Gauge> {
        Arc::new(NullGauge)
    }
}

/// A factory that keeps every value in memory so tests can assert on it.
#[derive(Clone, Debug, Default)]
pub struct InMemoryMetricsFactory {
    counters: Arc<Mutex<HashMap<String, Arc<AtomicCell>>>>,
    gauges: Arc<Mutex<HashMap<String, Arc<AtomicCell>>>>,
}

#[derive(Debug, Default)]
struct AtomicCell {
    value: AtomicI64,
}

impl Counter for AtomicCell {
    fn inc(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }
}

impl Gauge for AtomicCell {
    fn update(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }
}

fn metric_key(name: &str, tags: &[(&str, &str)]) -> String {
    let mut tags: Vec<_> = tags.to_vec();
    tags.sort();
    let mut key = name.to_string();
    for (tag, value) in tags {
        key.push('|');
        key.push_str(tag);
        key.push('=');
        key.push_str(value);
    }
    key
}

impl InMemoryMetricsFactory {
    /// Create an empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(
        table: &Mutex<HashMap<String, Arc<AtomicCell>>>,
        name: &str,
        tags: &[(&str, &str)],
    ) -> Arc<AtomicCell> {
        let mut table = table.lock().unwrap();
        Arc::clone(table.entry(metric_key(name, tags)).or_default())
    }

    /// The current value of the counter, or zero if it was never created.
    pub fn counter_value(&self, name: &str, tags: &[(&str, &str)]) -> i64 {
        self.counters
            .lock()
            .unwrap()
            .get(&metric_key(name, tags))
            .map(|cell| cell.value.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// The last value recorded by the gauge, or zero if it was never created.
    pub fn gauge_value(&self, name: &str, tags: &[(&str, &str)]) -> i64 {
        self.gauges
            .lock()
            .unwrap()
            .get(&metric_key(name, tags))
            .map(|cell| cell.value.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl MetricsFactory for InMemoryMetricsFactory {
    fn counter(&self, name: &str, tags: &[(&str, &str)]) -> Arc<dyn Counter> {
        Self::cell(&self.counters, name, tags)
    }

    fn gauge(&self, name: &str, tags: &[(&str, &str)]) -> Arc<dyn Gauge> {
        Self::cell(&self.gauges, name, tags)
    }
}
