//! A sampler whose strategy is controlled by a remote endpoint.
//!
//! The sampler owns an inner sampler and a background poller. Every
//! `refresh_interval` the poller asks the [`SamplingManager`] for the current
//! strategy of the service and, if the response differs from what is
//! installed, hot-swaps the inner sampler. The hot path only takes a read
//! lock for the duration of a single decision.

use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::errors::TraceError;
use crate::logger::{Logger, NullLogger};
use crate::metrics::Metrics;
use crate::span_context::TraceId;
use crate::worker::Poller;

use super::strategy::SamplingStrategyResponse;
use super::{
    AdaptiveSampler, ProbabilisticSampler, RateLimitingSampler, Sampler, SamplingDecision,
    DEFAULT_MAX_OPERATIONS,
};

/// How often the sampling strategy is refreshed by default.
pub const DEFAULT_SAMPLING_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// The sampling rate used until the first strategy arrives, unless the
/// initial sampler is overridden.
pub const DEFAULT_SAMPLING_PROBABILITY: f64 = 0.001;

/// Source of sampling strategies, typically an HTTP endpoint on the local
/// agent. Implementations live outside this crate.
pub trait SamplingManager: Send + Sync {
    /// Fetch the current sampling strategy for `service`.
    fn get_sampling_strategy(
        &self,
        service: &str,
    ) -> Result<SamplingStrategyResponse, TraceError>;
}

/// The sampler currently installed by the poller.
///
/// Keeping the concrete types (rather than a trait object) lets strategy
/// updates compare parameters and skip no-op swaps, and lets a per-operation
/// update mutate the adaptive sampler in place.
#[derive(Debug)]
enum InnerSampler {
    Probabilistic(ProbabilisticSampler),
    RateLimiting(RateLimitingSampler),
    Adaptive(AdaptiveSampler),
    Custom(Box<dyn Sampler>),
}

impl InnerSampler {
    fn is_sampled(&self, trace_id: TraceId, operation: &str) -> SamplingDecision {
        match self {
            InnerSampler::Probabilistic(sampler) => sampler.is_sampled(trace_id, operation),
            InnerSampler::RateLimiting(sampler) => sampler.is_sampled(trace_id, operation),
            InnerSampler::Adaptive(sampler) => sampler.is_sampled(trace_id, operation),
            InnerSampler::Custom(sampler) => sampler.is_sampled(trace_id, operation),
        }
    }

    fn close(&self) {
        match self {
            InnerSampler::Adaptive(sampler) => sampler.close(),
            InnerSampler::Custom(sampler) => sampler.close(),
            InnerSampler::Probabilistic(_) | InnerSampler::RateLimiting(_) => {}
        }
    }
}

struct SamplerState {
    service_name: String,
    manager: Box<dyn SamplingManager>,
    current: RwLock<InnerSampler>,
    max_operations: usize,
    metrics: Metrics,
    logger: Arc<dyn Logger>,
}

impl SamplerState {
    fn update_sampler(&self) {
        let response = match self.manager.get_sampling_strategy(&self.service_name) {
            Ok(response) => response,
            Err(err) => {
                self.metrics.sampler_query_failure.inc(1);
                self.logger.error(&format!(
                    "failed to fetch sampling strategy for {}: {}",
                    self.service_name, err
                ));
                return;
            }
        };
        self.metrics.sampler_retrieved.inc(1);
        match self.apply(response) {
            Ok(true) => self.metrics.sampler_updated.inc(1),
            Ok(false) => {}
            Err(err) => {
                self.metrics.sampler_parsing_failure.inc(1);
                self.logger.error(&format!(
                    "failed to apply sampling strategy for {}: {}",
                    self.service_name, err
                ));
            }
        }
    }

    /// Install the strategy carried by `response`. Returns whether the inner
    /// sampler changed; the current sampler is kept on any error.
    fn apply(&self, response: SamplingStrategyResponse) -> Result<bool, TraceError> {
        if let Some(strategies) = response.operation_sampling {
            let mut current = self.current.write().unwrap();
            if let InnerSampler::Adaptive(sampler) = &*current {
                sampler.update(&strategies)?;
            } else {
                *current =
                    InnerSampler::Adaptive(AdaptiveSampler::new(&strategies, self.max_operations)?);
            }
            return Ok(true);
        }
        if let Some(strategy) = response.probabilistic_sampling {
            let replacement = ProbabilisticSampler::new(strategy.sampling_rate)?;
            let mut current = self.current.write().unwrap();
            if let InnerSampler::Probabilistic(existing) = &*current {
                if *existing == replacement {
                    return Ok(false);
                }
            }
            *current = InnerSampler::Probabilistic(replacement);
            return Ok(true);
        }
        if let Some(strategy) = response.rate_limiting_sampling {
            let mut current = self.current.write().unwrap();
            if let InnerSampler::RateLimiting(existing) = &*current {
                if existing.max_traces_per_second() == strategy.max_traces_per_second {
                    return Ok(false);
                }
            }
            *current = InnerSampler::RateLimiting(RateLimitingSampler::new(
                strategy.max_traces_per_second,
            ));
            return Ok(true);
        }
        Err(TraceError::InvalidArgument(
            "sampling strategy response carries no strategy".to_string(),
        ))
    }
}

/// Builder for [`RemotelyControlledSampler`].
pub struct RemotelyControlledSamplerBuilder {
    service_name: String,
    manager: Box<dyn SamplingManager>,
    refresh_interval: Duration,
    max_operations: usize,
    initial_sampling_rate: f64,
    initial_sampler: Option<Box<dyn Sampler>>,
    metrics: Metrics,
    logger: Arc<dyn Logger>,
}

impl fmt::Debug for RemotelyControlledSamplerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemotelyControlledSamplerBuilder")
            .field("service_name", &self.service_name)
            .field("refresh_interval", &self.refresh_interval)
            .finish()
    }
}

impl RemotelyControlledSamplerBuilder {
    fn new(service_name: String, manager: Box<dyn SamplingManager>) -> Self {
        RemotelyControlledSamplerBuilder {
            service_name,
            manager,
            refresh_interval: DEFAULT_SAMPLING_REFRESH_INTERVAL,
            max_operations: DEFAULT_MAX_OPERATIONS,
            initial_sampling_rate: DEFAULT_SAMPLING_PROBABILITY,
            initial_sampler: None,
            metrics: Metrics::noop(),
            logger: Arc::new(NullLogger),
        }
    }

    /// How often to poll for strategy changes. A short interval has a
    /// network-overhead cost and should be avoided.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Cap on the number of per-operation samplers kept when the strategy is
    /// per-operation.
    pub fn with_max_operations(mut self, max_operations: usize) -> Self {
        self.max_operations = max_operations;
        self
    }

    /// The probabilistic rate used before the first strategy arrives.
    pub fn with_initial_sampling_rate(mut self, sampling_rate: f64) -> Self {
        self.initial_sampling_rate = sampling_rate;
        self
    }

    /// Use an arbitrary sampler until the first strategy arrives.
    pub fn with_initial_sampler(mut self, sampler: impl Sampler + 'static) -> Self {
        self.initial_sampler = Some(Box::new(sampler));
        self
    }

    /// Metrics destination for poll outcomes.
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Logger for poll failures.
    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Build the sampler and start its poller.
    ///
    /// Fails if the initial sampling rate is out of range.
    pub fn build(self) -> Result<RemotelyControlledSampler, TraceError> {
        let initial = match self.initial_sampler {
            Some(sampler) => InnerSampler::Custom(sampler),
            None => {
                InnerSampler::Probabilistic(ProbabilisticSampler::new(self.initial_sampling_rate)?)
            }
        };
        let state = Arc::new(SamplerState {
            service_name: self.service_name,
            manager: self.manager,
            current: RwLock::new(initial),
            max_operations: self.max_operations,
            metrics: self.metrics,
            logger: self.logger,
        });
        let poller_state = Arc::clone(&state);
        let poller = Poller::spawn("jaeger.client.sampler", self.refresh_interval, move || {
            poller_state.update_sampler()
        });
        Ok(RemotelyControlledSampler {
            state,
            poller: Mutex::new(Some(poller)),
        })
    }
}

/// A sampler that periodically pulls its strategy from a remote endpoint and
/// hot-swaps its inner sampler accordingly.
pub struct RemotelyControlledSampler {
    state: Arc<SamplerState>,
    poller: Mutex<Option<Poller>>,
}

impl RemotelyControlledSampler {
    /// Start building a sampler for `service_name`, fed by `manager`.
    pub fn builder(
        service_name: impl Into<String>,
        manager: impl SamplingManager + 'static,
    ) -> RemotelyControlledSamplerBuilder {
        RemotelyControlledSamplerBuilder::new(service_name.into(), Box::new(manager))
    }
}

impl fmt::Debug for RemotelyControlledSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemotelyControlledSampler")
            .field("service_name", &self.state.service_name)
            .field("current", &*self.state.current.read().unwrap())
            .finish()
    }
}

impl Sampler for RemotelyControlledSampler {
    fn is_sampled(&self, trace_id: TraceId, operation: &str) -> SamplingDecision {
        self.state
            .current
            .read()
            .unwrap()
            .is_sampled(trace_id, operation)
    }

    /// Stops the poller, waits for it, then closes the inner sampler.
    fn close(&self) {
        if let Some(mut poller) = self.poller.lock().unwrap().take() {
            poller.shutdown();
        }
        self.state.current.read().unwrap().close();
    }
}
