//! Reporters: where finished spans go.
//!
//! The interesting one is [`RemoteReporter`], which decouples span producers
//! from a network-bound sender through a bounded queue and a dedicated
//! worker thread. Producers never block: when the queue is full the span is
//! dropped and counted.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::errors::TraceError;
use crate::logger::{Logger, NullLogger};
use crate::metrics::Metrics;
use crate::span::SpanData;

/// Maximum number of spans buffered by a [`RemoteReporter`] awaiting the
/// worker thread.
pub(crate) const DEFAULT_QUEUE_SIZE: usize = 100;
/// How long the worker buffers spans before handing them to the sender.
pub(crate) const DEFAULT_BUFFER_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
/// Spans handed to the sender between flushes before an early flush.
pub(crate) const DEFAULT_BATCH_SIZE: usize = 100;
/// Deadline for `flush` and `close` acknowledgements.
pub(crate) const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Environment variable overriding the queue size.
pub const JAEGER_REPORTER_MAX_QUEUE_SIZE: &str = "JAEGER_REPORTER_MAX_QUEUE_SIZE";
/// Environment variable overriding the flush interval, in milliseconds.
pub const JAEGER_REPORTER_FLUSH_INTERVAL: &str = "JAEGER_REPORTER_FLUSH_INTERVAL";

/// Receives finished spans.
pub trait Reporter: Send + Sync + fmt::Debug {
    /// Accept one finished span. Never blocks the caller and never fails
    /// loudly; overload shows up as metrics, not errors.
    fn report(&self, span: SpanData);

    /// Flush whatever the reporter buffers and release its resources.
    /// Blocks until drained or a deadline passes.
    fn close(&self) -> Result<(), TraceError> {
        Ok(())
    }
}

/// Discards every span.
#[derive(Clone, Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn report(&self, _span: SpanData) {}
}

/// Logs every span through the tracer's [`Logger`].
#[derive(Clone, Debug)]
pub struct LoggingReporter {
    logger: Arc<dyn Logger>,
}

impl LoggingReporter {
    /// A reporter that logs through `logger`.
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        LoggingReporter { logger }
    }
}

impl Reporter for LoggingReporter {
    fn report(&self, span: SpanData) {
        self.logger.info(&format!(
            "reporting span {} ({})",
            span.operation_name, span.context
        ));
    }
}

/// Collects spans in memory; the test double of choice.
#[derive(Clone, Debug, Default)]
pub struct InMemoryReporter {
    spans: Arc<Mutex<Vec<SpanData>>>,
}

impl InMemoryReporter {
    /// An empty reporter.
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of every span reported so far.
    pub fn spans(&self) -> Vec<SpanData> {
        self.spans.lock().unwrap().clone()
    }

    /// Forget all reported spans.
    pub fn reset(&self) {
        self.spans.lock().unwrap().clear();
    }
}

impl Reporter for InMemoryReporter {
    fn report(&self, span: SpanData) {
        self.spans.lock().unwrap().push(span);
    }
}

/// Fans spans out to several reporters.
#[derive(Debug)]
pub struct CompositeReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl CompositeReporter {
    /// A reporter delegating to `reporters` in order.
    pub fn new(reporters: Vec<Box<dyn Reporter>>) -> Self {
        CompositeReporter { reporters }
    }
}

impl Reporter for CompositeReporter {
    fn report(&self, span: SpanData) {
        for reporter in &self.reporters {
            reporter.report(span.clone());
        }
    }

    /// Closes every delegate; the first error wins, later ones are dropped.
    fn close(&self) -> Result<(), TraceError> {
        let mut result = Ok(());
        for reporter in &self.reporters {
            let outcome = reporter.close();
            if result.is_ok() {
                result = outcome;
            }
        }
        result
    }
}

/// The transport half of the reporting pipeline. The sender owns the batch
/// buffer and the wire format; this crate only drives it.
pub trait Sender: Send {
    /// Buffer one span, flushing internally if the batch is full. Returns
    /// how many spans were put on the wire by this call.
    fn append(&mut self, span: SpanData) -> Result<usize, TraceError>;

    /// Put every buffered span on the wire. Returns how many were sent.
    fn flush(&mut self) -> Result<usize, TraceError>;

    /// Flush and release the transport.
    fn close(&mut self) -> Result<(), TraceError>;
}

/// Configuration of a [`RemoteReporter`].
///
/// `Default` reads the `JAEGER_REPORTER_*` environment variables; the
/// `with_*` methods override them.
#[derive(Clone, Debug)]
pub struct ReporterConfig {
    queue_size: usize,
    buffer_flush_interval: Duration,
    batch_size: usize,
    close_timeout: Duration,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        let mut config = ReporterConfig {
            queue_size: DEFAULT_QUEUE_SIZE,
            buffer_flush_interval: DEFAULT_BUFFER_FLUSH_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        };
        if let Some(queue_size) = std::env::var(JAEGER_REPORTER_MAX_QUEUE_SIZE)
            .ok()
            .and_then(|value| usize::from_str(&value).ok())
        {
            config.queue_size = queue_size;
        }
        if let Some(millis) = std::env::var(JAEGER_REPORTER_FLUSH_INTERVAL)
            .ok()
            .and_then(|value| u64::from_str(&value).ok())
        {
            config.buffer_flush_interval = Duration::from_millis(millis);
        }
        config
    }
}

impl ReporterConfig {
    /// Size of the bounded span queue. Spans submitted while it is full are
    /// dropped and counted.
    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size.max(1);
        self
    }

    /// How long the worker buffers spans before flushing the sender.
    pub fn with_buffer_flush_interval(mut self, interval: Duration) -> Self {
        self.buffer_flush_interval = interval;
        self
    }

    /// Spans handed to the sender between flushes before the worker flushes
    /// early.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Deadline for `flush` and `close` to complete.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }
}

/// Messages travelling from producers to the worker thread. Control
/// messages share the queue with spans, so a close naturally drains
/// everything submitted before it.
enum ReporterMessage {
    Span(SpanData),
    Flush(SyncSender<Result<(), TraceError>>),
    Close(SyncSender<Result<(), TraceError>>),
}

/// Builder for [`RemoteReporter`].
pub struct RemoteReporterBuilder {
    sender: Box<dyn Sender>,
    config: ReporterConfig,
    metrics: Metrics,
    logger: Arc<dyn Logger>,
}

impl fmt::Debug for RemoteReporterBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteReporterBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl RemoteReporterBuilder {
    /// Queue and batching parameters.
    pub fn with_config(mut self, config: ReporterConfig) -> Self {
        self.config = config;
        self
    }

    /// Metrics destination for pipeline accounting.
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Logger for drop and transport diagnostics.
    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Build the reporter and start its worker thread.
    pub fn build(self) -> RemoteReporter {
        RemoteReporter::new(self.sender, self.config, self.metrics, self.logger)
    }
}

/// A reporter that queues spans to a dedicated worker, which batches them
/// into a [`Sender`].
pub struct RemoteReporter {
    message_sender: SyncSender<ReporterMessage>,
    queue_length: Arc<AtomicUsize>,
    handle: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    dropped_count: AtomicUsize,
    close_timeout: Duration,
    metrics: Metrics,
    logger: Arc<dyn Logger>,
}

impl RemoteReporter {
    /// Start building a reporter around `sender`.
    pub fn builder(sender: impl Sender + 'static) -> RemoteReporterBuilder {
        RemoteReporterBuilder {
            sender: Box::new(sender),
            config: ReporterConfig::default(),
            metrics: Metrics::noop(),
            logger: Arc::new(NullLogger),
        }
    }

    fn new(
        sender: Box<dyn Sender>,
        config: ReporterConfig,
        metrics: Metrics,
        logger: Arc<dyn Logger>,
    ) -> Self {
        let (message_sender, message_receiver) =
            mpsc::sync_channel::<ReporterMessage>(config.queue_size);
        let queue_length = Arc::new(AtomicUsize::new(0));

        let close_timeout = config.close_timeout;
        let worker_queue_length = Arc::clone(&queue_length);
        let worker_metrics = metrics.clone();
        let worker_logger = Arc::clone(&logger);
        let handle = thread::Builder::new()
            .name("jaeger.client.reporter".to_string())
            .spawn(move || {
                run_worker(
                    message_receiver,
                    sender,
                    config,
                    worker_queue_length,
                    worker_metrics,
                    worker_logger,
                )
            })
            .ok();

        RemoteReporter {
            message_sender,
            queue_length,
            handle: Mutex::new(handle),
            closed: AtomicBool::new(false),
            dropped_count: AtomicUsize::new(0),
            close_timeout,
            metrics,
            logger,
        }
    }

    /// Force the worker to flush the sender, waiting for the result.
    pub fn flush(&self) -> Result<(), TraceError> {
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        self.message_sender
            .send(ReporterMessage::Flush(ack_tx))
            .map_err(|_| TraceError::Other("reporter worker has exited".to_string()))?;
        match ack_rx.recv_timeout(self.close_timeout) {
            Ok(result) => result,
            Err(_) => Err(TraceError::Timeout(self.close_timeout)),
        }
    }

    fn count_dropped(&self, count: usize) {
        self.metrics.reporter_dropped.inc(count as i64);
        if self.dropped_count.fetch_add(count, Ordering::Relaxed) == 0 {
            self.logger.error(
                "reporter queue is full, dropping spans; further drops are counted silently",
            );
        }
    }
}

impl fmt::Debug for RemoteReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteReporter")
            .field("queue_length", &self.queue_length.load(Ordering::Relaxed))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Reporter for RemoteReporter {
    fn report(&self, span: SpanData) {
        if self.closed.load(Ordering::Relaxed) {
            self.count_dropped(1);
            return;
        }
        match self.message_sender.try_send(ReporterMessage::Span(span)) {
            Ok(()) => {
                self.queue_length.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.count_dropped(1);
            }
        }
    }

    /// Signals the worker to drain and flush, waits for it within the close
    /// deadline, then joins the thread. Calls after the first are no-ops.
    fn close(&self) -> Result<(), TraceError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        if self
            .message_sender
            .send(ReporterMessage::Close(ack_tx))
            .is_err()
        {
            return Ok(());
        }
        match ack_rx.recv_timeout(self.close_timeout) {
            Ok(result) => {
                if let Some(handle) = self.handle.lock().unwrap().take() {
                    let _ = handle.join();
                }
                result
            }
            Err(_) => {
                // Whatever is still queued will never be sent.
                let remaining = self.queue_length.load(Ordering::Relaxed);
                if remaining > 0 {
                    self.count_dropped(remaining);
                }
                Err(TraceError::Timeout(self.close_timeout))
            }
        }
    }
}

fn run_worker(
    receiver: mpsc::Receiver<ReporterMessage>,
    mut sender: Box<dyn Sender>,
    config: ReporterConfig,
    queue_length: Arc<AtomicUsize>,
    metrics: Metrics,
    logger: Arc<dyn Logger>,
) {
    // Spans handed to the sender since its last flush.
    let mut pending: usize = 0;
    let mut last_flush = Instant::now();

    // Flush the sender and settle the success/failure accounting.
    fn flush_sender(
        sender: &mut Box<dyn Sender>,
        pending: &mut usize,
        last_flush: &mut Instant,
        queue_length: &AtomicUsize,
        metrics: &Metrics,
        logger: &Arc<dyn Logger>,
    ) -> Result<(), TraceError> {
        *last_flush = Instant::now();
        let result = match sender.flush() {
            Ok(sent) => {
                metrics.reporter_success.inc(sent as i64);
                Ok(())
            }
            Err(err) => {
                metrics.reporter_failure.inc(*pending as i64);
                logger.error(&format!("failed to flush spans: {}", err));
                Err(err)
            }
        };
        *pending = 0;
        metrics
            .reporter_queue_length
            .update(queue_length.load(Ordering::Relaxed) as i64);
        result
    }

    loop {
        let timeout = config
            .buffer_flush_interval
            .checked_sub(last_flush.elapsed())
            .unwrap_or(Duration::ZERO);
        match receiver.recv_timeout(timeout) {
            Ok(ReporterMessage::Span(span)) => {
                queue_length.fetch_sub(1, Ordering::Relaxed);
                match sender.append(span) {
                    Ok(sent) if sent > 0 => {
                        metrics.reporter_success.inc(sent as i64);
                        pending = (pending + 1).saturating_sub(sent);
                    }
                    Ok(_) => pending += 1,
                    Err(err) => {
                        metrics.reporter_failure.inc(pending as i64 + 1);
                        pending = 0;
                        logger.error(&format!("failed to append span: {}", err));
                    }
                }
                if pending >= config.batch_size {
                    let _ = flush_sender(
                        &mut sender,
                        &mut pending,
                        &mut last_flush,
                        &queue_length,
                        &metrics,
                        &logger,
                    );
                }
            }
            Ok(ReporterMessage::Flush(ack)) => {
                let result = flush_sender(
                    &mut sender,
                    &mut pending,
                    &mut last_flush,
                    &queue_length,
                    &metrics,
                    &logger,
                );
                let _ = ack.send(result);
            }
            Ok(ReporterMessage::Close(ack)) => {
                // The queue is FIFO, so every span submitted before the close
                // signal has already been drained at this point.
                let flushed = flush_sender(
                    &mut sender,
                    &mut pending,
                    &mut last_flush,
                    &queue_length,
                    &metrics,
                    &logger,
                );
                let closed = sender.close();
                let _ = ack.send(flushed.and(closed));
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                let _ = flush_sender(
                    &mut sender,
                    &mut pending,
                    &mut last_flush,
                    &queue_length,
                    &metrics,
                    &logger,
                );
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = flush_sender(
                    &mut sender,
                    &mut pending,
                    &mut last_flush,
                    &queue_length,
                    &metrics,
                    &logger,
                );
                let _ = sender.close();
                break;
            }
        }
    }
}
