//! The mutable record of one unit of work.

use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use crate::constants::SAMPLING_PRIORITY_TAG_KEY;
use crate::span_context::SpanContext;
use crate::tag::{LogRecord, Reference, Tag, TagValue};
use crate::tracer::Tracer;

/// A named, timed operation in progress.
///
/// All mutators take `&self` and synchronize internally, so a span may be
/// shared across threads. Mutation is only meaningful between creation and
/// [`finish`](Span::finish); a second finish is a programmer error and is
/// logged and discarded.
#[derive(Debug)]
pub struct Span {
    tracer: Tracer,
    inner: Mutex<SpanState>,
}

#[derive(Debug)]
pub(crate) struct SpanState {
    pub(crate) context: SpanContext,
    pub(crate) operation_name: String,
    pub(crate) start_time: SystemTime,
    pub(crate) tags: Vec<Tag>,
    pub(crate) logs: Vec<LogRecord>,
    pub(crate) references: Vec<Reference>,
    pub(crate) finished: bool,
}

/// Immutable snapshot of a finished span, handed to the reporter.
#[derive(Clone, Debug)]
pub struct SpanData {
    /// The span's identity and trace-wide state.
    pub context: SpanContext,
    /// The operation the span measured.
    pub operation_name: String,
    /// Wall-clock start time.
    pub start_time: SystemTime,
    /// Time between start and finish.
    pub duration: Duration,
    /// Tags recorded on the span.
    pub tags: Vec<Tag>,
    /// Log records recorded on the span.
    pub logs: Vec<LogRecord>,
    /// Causal references to other spans.
    pub references: Vec<Reference>,
}

impl SpanData {
    /// Look up a tag by key.
    pub fn tag(&self, key: &str) -> Option<&TagValue> {
        self.tags
            .iter()
            .find(|tag| tag.key() == key)
            .map(|tag| tag.value())
    }
}

impl Span {
    pub(crate) fn new(tracer: Tracer, state: SpanState) -> Self {
        Span {
            tracer,
            inner: Mutex::new(state),
        }
    }

    /// The span's context. The returned value shares the trace's sampling
    /// state, so it remains live as the trace evolves.
    pub fn context(&self) -> SpanContext {
        self.inner.lock().unwrap().context.clone()
    }

    /// The current operation name.
    pub fn operation_name(&self) -> String {
        self.inner.lock().unwrap().operation_name.clone()
    }

    /// Rename the operation. Allowed until the span finishes.
    pub fn set_operation_name(&self, operation_name: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.finished {
            return;
        }
        inner.operation_name = operation_name.into();
    }

    /// Record a tag on the span.
    ///
    /// Tags on unsampled spans are not recorded, with one exception: the
    /// `sampling.priority` tag is a control tag that mutates the trace's
    /// sampling state. A positive priority forces the trace to be retained
    /// as a debug trace (subject to debug throttling); zero clears the
    /// sampled flag for the whole trace.
    pub fn set_tag(&self, tag: Tag) {
        if tag.key() == SAMPLING_PRIORITY_TAG_KEY && !self.apply_sampling_priority(&tag) {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.finished || !inner.context.is_sampled() {
            return;
        }
        inner.tags.push(tag);
    }

    /// Returns whether the tag should also be recorded on the span.
    fn apply_sampling_priority(&self, tag: &Tag) -> bool {
        let priority = match tag.value() {
            TagValue::I64(value) => *value,
            _ => return false,
        };
        let context = self.context();
        if priority <= 0 {
            context.sampling_state().reset_sampled();
            return true;
        }
        if context.is_debug() {
            return true;
        }
        if self.tracer.is_debug_allowed(&self.operation_name()) {
            context.sampling_state().set_debug_and_sampled();
            return true;
        }
        false
    }

    /// Append a log record with the given fields at the current time.
    pub fn log_fields(&self, fields: impl IntoIterator<Item = Tag>) {
        let timestamp = self.tracer.now();
        let mut inner = self.inner.lock().unwrap();
        if inner.finished || !inner.context.is_sampled() {
            return;
        }
        inner.logs.push(LogRecord {
            timestamp,
            fields: fields.into_iter().collect(),
        });
    }

    /// Append a log record built from key/value pairs at the current time.
    pub fn log_kv<K, V>(&self, pairs: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<TagValue>,
    {
        self.log_fields(
            pairs
                .into_iter()
                .map(|(key, value)| Tag::new(key, value))
                .collect::<Vec<_>>(),
        );
    }

    /// Set a baggage item, propagated to future children of this span and
    /// across process boundaries.
    ///
    /// The write goes through the tracer's baggage restrictions: the key may
    /// be rejected and the value may be truncated. The span adopts a new
    /// context; other contexts of the trace are unaffected.
    pub fn set_baggage_item(&self, key: &str, value: &str) {
        let timestamp = self.tracer.now();
        let mut inner = self.inner.lock().unwrap();
        if inner.finished {
            return;
        }
        let (context, record) = self
            .tracer
            .baggage_setter()
            .apply(&inner.context, key, value, timestamp);
        inner.context = context;
        if let Some(record) = record {
            inner.logs.push(record);
        }
    }

    /// Read a baggage item from the span's context.
    pub fn baggage_item(&self, key: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .context
            .baggage()
            .get(key)
            .cloned()
    }

    /// Mark the whole trace as firehose traffic.
    pub fn set_firehose(&self) {
        self.inner
            .lock()
            .unwrap()
            .context
            .sampling_state()
            .set_firehose();
    }

    /// Finish the span at the current time.
    pub fn finish(&self) {
        self.finish_with_timestamp(self.tracer.now());
    }

    /// Finish the span at `finish_time`. If sampled, the span is handed to
    /// the reporter; the span must not be mutated afterwards.
    pub fn finish_with_timestamp(&self, finish_time: SystemTime) {
        let data = {
            let mut inner = self.inner.lock().unwrap();
            if inner.finished {
                drop(inner);
                self.tracer.logger().error(&format!(
                    "span {} finished more than once, ignoring",
                    self.operation_name()
                ));
                return;
            }
            inner.finished = true;
            let duration = finish_time
                .duration_since(inner.start_time)
                .unwrap_or_default();
            inner.context.is_sampled().then(|| SpanData {
                context: inner.context.clone(),
                operation_name: inner.operation_name.clone(),
                start_time: inner.start_time,
                duration,
                tags: inner.tags.clone(),
                logs: inner.logs.clone(),
                references: inner.references.clone(),
            })
        };
        self.tracer.metrics().finished_spans.inc(1);
        if let Some(data) = data {
            self.tracer.report_span(data);
        }
    }
}
