//! Sampling: the per-trace decision whether span data is retained.
//!
//! Every sampler reports the type and parameter of the decision as tags;
//! those tags are attached to the root span of the trace so the backend can
//! tell how the trace was selected. They document the decision, they do not
//! re-trigger it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, RwLock};

use crate::constants::{
    SAMPLER_PARAM_TAG_KEY, SAMPLER_TYPE_CONST, SAMPLER_TYPE_LOWER_BOUND,
    SAMPLER_TYPE_PROBABILISTIC, SAMPLER_TYPE_RATE_LIMITING, SAMPLER_TYPE_TAG_KEY,
};
use crate::errors::TraceError;
use crate::span_context::TraceId;
use crate::tag::Tag;

mod rate_limit;
pub(crate) mod remote;
pub(crate) mod strategy;

pub use remote::{
    RemotelyControlledSampler, RemotelyControlledSamplerBuilder, SamplingManager,
    DEFAULT_SAMPLING_PROBABILITY, DEFAULT_SAMPLING_REFRESH_INTERVAL,
};
pub use strategy::{
    OperationSamplingStrategy, PerOperationSamplingStrategies, ProbabilisticSamplingStrategy,
    RateLimitingSamplingStrategy, SamplingStrategyResponse, SamplingStrategyType,
};

use rate_limit::LeakyBucket;

/// Default cap on the number of per-operation samplers held by an
/// [`AdaptiveSampler`].
pub const DEFAULT_MAX_OPERATIONS: usize = 2000;

/// Only the low 63 bits of a trace id participate in probabilistic
/// comparisons, so the boundary for rate 1.0 (2^63) still fits in a u64.
const MAX_RANDOM_NUMBER: u64 = (1 << 63) - 1;

/// The outcome of one sampling decision.
#[derive(Clone, Debug, PartialEq)]
pub struct SamplingDecision {
    /// Whether the trace is retained.
    pub sampled: bool,
    /// `sampler.type` / `sampler.param` tags documenting the decision.
    pub tags: Vec<Tag>,
}

/// Decides, once per trace, whether span data is recorded.
pub trait Sampler: Send + Sync + fmt::Debug {
    /// Decide whether the trace identified by `trace_id` is sampled.
    ///
    /// `operation` is the name of the root span; per-operation samplers key
    /// off it, the rest ignore it.
    fn is_sampled(&self, trace_id: TraceId, operation: &str) -> SamplingDecision;

    /// Release any resources held by the sampler.
    fn close(&self) {}
}

fn decision_tags(sampler_type: &'static str, param: impl Into<crate::tag::TagValue>) -> Vec<Tag> {
    vec![
        Tag::new(SAMPLER_TYPE_TAG_KEY, sampler_type),
        Tag::new(SAMPLER_PARAM_TAG_KEY, param),
    ]
}

/// A sampler that always returns the same decision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConstSampler {
    decision: bool,
}

impl ConstSampler {
    /// Create a sampler that always decides `decision`.
    pub fn new(decision: bool) -> Self {
        ConstSampler { decision }
    }
}

impl Sampler for ConstSampler {
    fn is_sampled(&self, _trace_id: TraceId, _operation: &str) -> SamplingDecision {
        SamplingDecision {
            sampled: self.decision,
            tags: decision_tags(SAMPLER_TYPE_CONST, self.decision),
        }
    }
}

/// Samples a fixed fraction of traces, deterministically by trace id.
///
/// The low 63 bits of `trace_id.low` are compared against
/// `floor(rate * 2^63)`, so an id below the boundary samples at every rate
/// greater than or equal to its implied ratio.
#[derive(Clone, Debug)]
pub struct ProbabilisticSampler {
    sampling_rate: f64,
    sampling_boundary: u64,
}

impl ProbabilisticSampler {
    /// Create a sampler retaining the given fraction of traces.
    ///
    /// Fails unless `0.0 <= sampling_rate <= 1.0`.
    pub fn new(sampling_rate: f64) -> Result<Self, TraceError> {
        if !(0.0..=1.0).contains(&sampling_rate) {
            return Err(TraceError::InvalidArgument(format!(
                "sampling rate must be between 0.0 and 1.0, got {}",
                sampling_rate
            )));
        }
        Ok(ProbabilisticSampler {
            sampling_rate,
            sampling_boundary: (sampling_rate * (1u64 << 63) as f64) as u64,
        })
    }

    /// The configured sampling rate.
    pub fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }
}

impl PartialEq for ProbabilisticSampler {
    fn eq(&self, other: &Self) -> bool {
        self.sampling_rate == other.sampling_rate
    }
}

impl Sampler for ProbabilisticSampler {
    fn is_sampled(&self, trace_id: TraceId, _operation: &str) -> SamplingDecision {
        SamplingDecision {
            sampled: (trace_id.low & MAX_RANDOM_NUMBER) < self.sampling_boundary,
            tags: decision_tags(SAMPLER_TYPE_PROBABILISTIC, self.sampling_rate),
        }
    }
}

/// Samples at most `max_traces_per_second` traces, using a token bucket with
/// capacity `max(max_traces_per_second, 1)`.
#[derive(Debug)]
pub struct RateLimitingSampler {
    max_traces_per_second: f64,
    bucket: Mutex<LeakyBucket>,
}

impl RateLimitingSampler {
    /// Create a sampler limited to `max_traces_per_second`.
    pub fn new(max_traces_per_second: f64) -> Self {
        RateLimitingSampler {
            max_traces_per_second,
            bucket: Mutex::new(LeakyBucket::new(
                max_traces_per_second.max(1.0),
                max_traces_per_second,
            )),
        }
    }

    /// The configured rate.
    pub fn max_traces_per_second(&self) -> f64 {
        self.max_traces_per_second
    }

    /// Change the rate, preserving the bucket's current credit balance.
    pub(crate) fn update(&mut self, max_traces_per_second: f64) {
        self.max_traces_per_second = max_traces_per_second;
        self.bucket
            .get_mut()
            .unwrap()
            .update(max_traces_per_second, max_traces_per_second.max(1.0));
    }
}

impl PartialEq for RateLimitingSampler {
    fn eq(&self, other: &Self) -> bool {
        self.max_traces_per_second == other.max_traces_per_second
    }
}

impl Sampler for RateLimitingSampler {
    fn is_sampled(&self, _trace_id: TraceId, _operation: &str) -> SamplingDecision {
        let sampled = self.bucket.lock().unwrap().check_credit();
        SamplingDecision {
            sampled,
            tags: decision_tags(SAMPLER_TYPE_RATE_LIMITING, self.max_traces_per_second),
        }
    }
}

/// Combines a [`ProbabilisticSampler`] with a per-operation lower-bound rate
/// limiter: a trace is sampled when either fires.
///
/// Probabilistic decisions also consume a lower-bound credit, so the lower
/// bound guarantees a minimum rate rather than adding to the probabilistic
/// one. The reported tags come from the probabilistic sampler when it fired,
/// otherwise from the lower bound (with the sampling rate as the parameter).
#[derive(Debug)]
pub struct GuaranteedThroughputSampler {
    operation: String,
    probabilistic: ProbabilisticSampler,
    lower_bound_sampler: RateLimitingSampler,
    lower_bound: f64,
}

impl GuaranteedThroughputSampler {
    /// Create a sampler for `operation` with the given lower bound (traces
    /// per second) and probabilistic sampling rate.
    pub fn new(
        operation: impl Into<String>,
        lower_bound: f64,
        sampling_rate: f64,
    ) -> Result<Self, TraceError> {
        Ok(GuaranteedThroughputSampler {
            operation: operation.into(),
            probabilistic: ProbabilisticSampler::new(sampling_rate)?,
            lower_bound_sampler: RateLimitingSampler::new(lower_bound),
            lower_bound,
        })
    }

    /// The operation this sampler serves.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// The current lower bound.
    pub fn lower_bound(&self) -> f64 {
        self.lower_bound
    }

    /// The current probabilistic sampling rate.
    pub fn sampling_rate(&self) -> f64 {
        self.probabilistic.sampling_rate()
    }

    /// Install new parameters. The lower-bound bucket keeps its current
    /// credit balance when only the rate changes.
    pub(crate) fn update(&mut self, lower_bound: f64, sampling_rate: f64) -> Result<(), TraceError> {
        if sampling_rate != self.probabilistic.sampling_rate() {
            self.probabilistic = ProbabilisticSampler::new(sampling_rate)?;
        }
        if lower_bound != self.lower_bound {
            self.lower_bound_sampler.update(lower_bound);
            self.lower_bound = lower_bound;
        }
        Ok(())
    }
}

impl Sampler for GuaranteedThroughputSampler {
    fn is_sampled(&self, trace_id: TraceId, operation: &str) -> SamplingDecision {
        let decision = self.probabilistic.is_sampled(trace_id, operation);
        if decision.sampled {
            // Keep the lower-bound budget in step with actual throughput.
            self.lower_bound_sampler.is_sampled(trace_id, operation);
            return decision;
        }
        let lower = self.lower_bound_sampler.is_sampled(trace_id, operation);
        SamplingDecision {
            sampled: lower.sampled,
            tags: decision_tags(SAMPLER_TYPE_LOWER_BOUND, self.probabilistic.sampling_rate()),
        }
    }
}

/// Per-operation [`GuaranteedThroughputSampler`]s with a probabilistic
/// fallback for operations that have no strategy of their own.
///
/// Operations seen for the first time get their own sampler, built from the
/// default probability and lower bound, until `max_operations` is reached;
/// after that new operations fall through to the default sampler.
#[derive(Debug)]
pub struct AdaptiveSampler {
    inner: RwLock<AdaptiveInner>,
    max_operations: usize,
}

#[derive(Debug)]
struct AdaptiveInner {
    samplers: HashMap<String, GuaranteedThroughputSampler>,
    default_sampler: ProbabilisticSampler,
    lower_bound: f64,
}

impl AdaptiveSampler {
    /// Build a sampler from per-operation strategies.
    ///
    /// Fails if any probability is outside [0.0, 1.0].
    pub fn new(
        strategies: &PerOperationSamplingStrategies,
        max_operations: usize,
    ) -> Result<Self, TraceError> {
        let default_sampler = ProbabilisticSampler::new(strategies.default_sampling_probability)?;
        let lower_bound = strategies.default_lower_bound_traces_per_second;
        let mut samplers = HashMap::with_capacity(strategies.per_operation_strategies.len());
        for strategy in &strategies.per_operation_strategies {
            samplers.insert(
                strategy.operation.clone(),
                GuaranteedThroughputSampler::new(
                    strategy.operation.as_str(),
                    lower_bound,
                    strategy.probabilistic_sampling.sampling_rate,
                )?,
            );
        }
        Ok(AdaptiveSampler {
            inner: RwLock::new(AdaptiveInner {
                samplers,
                default_sampler,
                lower_bound,
            }),
            max_operations,
        })
    }

    /// Install new strategies: the defaults are replaced, existing
    /// per-operation samplers are updated in place (keeping their rate-limit
    /// balances), and new operations are inserted.
    ///
    /// Fails without modifying anything if any probability is out of range.
    pub fn update(&self, strategies: &PerOperationSamplingStrategies) -> Result<(), TraceError> {
        let default_sampler = ProbabilisticSampler::new(strategies.default_sampling_probability)?;
        for strategy in &strategies.per_operation_strategies {
            let rate = strategy.probabilistic_sampling.sampling_rate;
            if !(0.0..=1.0).contains(&rate) {
                return Err(TraceError::InvalidArgument(format!(
                    "sampling rate must be between 0.0 and 1.0, got {} for operation {}",
                    rate, strategy.operation
                )));
            }
        }

        let mut inner = self.inner.write().unwrap();
        let lower_bound = strategies.default_lower_bound_traces_per_second;
        inner.default_sampler = default_sampler;
        inner.lower_bound = lower_bound;
        for strategy in &strategies.per_operation_strategies {
            let rate = strategy.probabilistic_sampling.sampling_rate;
            if let Some(sampler) = inner.samplers.get_mut(&strategy.operation) {
                // Rates were validated above, update cannot fail here.
                sampler.update(lower_bound, rate)?;
            } else {
                inner.samplers.insert(
                    strategy.operation.clone(),
                    GuaranteedThroughputSampler::new(strategy.operation.as_str(), lower_bound, rate)?,
                );
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn operation_count(&self) -> usize {
        self.inner.read().unwrap().samplers.len()
    }
}

impl Sampler for AdaptiveSampler {
    fn is_sampled(&self, trace_id: TraceId, operation: &str) -> SamplingDecision {
        {
            let inner = self.inner.read().unwrap();
            if let Some(sampler) = inner.samplers.get(operation) {
                return sampler.is_sampled(trace_id, operation);
            }
        }

        let mut inner = self.inner.write().unwrap();
        // Another thread may have inserted the operation between the locks.
        if let Some(sampler) = inner.samplers.get(operation) {
            return sampler.is_sampled(trace_id, operation);
        }
        if inner.samplers.len() >= self.max_operations {
            return inner.default_sampler.is_sampled(trace_id, operation);
        }
        let lower_bound = inner.lower_bound;
        let rate = inner.default_sampler.sampling_rate();
        match GuaranteedThroughputSampler::new(operation, lower_bound, rate) {
            Ok(sampler) => {
                let decision = sampler.is_sampled(trace_id, operation);
                inner.samplers.insert(operation.to_string(), sampler);
                decision
            }
            Err(_) => inner.default_sampler.is_sampled(trace_id, operation),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::TagValue;
    use rand::Rng;

    const TEST_OPERATION: &str = "op";
    const FIRST_TIME_OPERATION: &str = "firstTimeOp";
    const TEST_DEFAULT_PROBABILITY: f64 = 0.5;
    // Boundary for rate 0.5 is 2^62.
    const TEST_MAX_ID: u64 = 1 << 62;

    fn probabilistic_tags(rate: f64) -> Vec<Tag> {
        vec![
            Tag::new(SAMPLER_TYPE_TAG_KEY, SAMPLER_TYPE_PROBABILISTIC),
            Tag::new(SAMPLER_PARAM_TAG_KEY, rate),
        ]
    }

    fn lower_bound_tags(rate: f64) -> Vec<Tag> {
        vec![
            Tag::new(SAMPLER_TYPE_TAG_KEY, SAMPLER_TYPE_LOWER_BOUND),
            Tag::new(SAMPLER_PARAM_TAG_KEY, rate),
        ]
    }

    fn low_id(low: u64) -> TraceId {
        TraceId::new(0, low)
    }

    #[test]
    fn sampler_tags() {
        let cases: Vec<(Box<dyn Sampler>, &str, TagValue)> = vec![
            (
                Box::new(ConstSampler::new(true)),
                SAMPLER_TYPE_CONST,
                TagValue::Bool(true),
            ),
            (
                Box::new(ConstSampler::new(false)),
                SAMPLER_TYPE_CONST,
                TagValue::Bool(false),
            ),
            (
                Box::new(ProbabilisticSampler::new(0.1).unwrap()),
                SAMPLER_TYPE_PROBABILISTIC,
                TagValue::F64(0.1),
            ),
            (
                Box::new(RateLimitingSampler::new(0.1)),
                SAMPLER_TYPE_RATE_LIMITING,
                TagValue::F64(0.1),
            ),
        ];
        for (sampler, expected_type, expected_param) in cases {
            let decision = sampler.is_sampled(low_id(1), TEST_OPERATION);
            let mut matched = 0;
            for tag in &decision.tags {
                if tag.key() == SAMPLER_TYPE_TAG_KEY {
                    assert_eq!(tag.value(), &TagValue::from(expected_type));
                    matched += 1;
                }
                if tag.key() == SAMPLER_PARAM_TAG_KEY {
                    assert_eq!(tag.value(), &expected_param);
                    matched += 1;
                }
            }
            assert_eq!(matched, 2);
        }
    }

    #[test]
    fn probabilistic_sampler_rejects_bad_rates() {
        assert!(ProbabilisticSampler::new(-0.1).is_err());
        assert!(ProbabilisticSampler::new(1.1).is_err());
    }

    #[test]
    fn probabilistic_sampler_thresholds_on_low_bits() {
        let sampler = ProbabilisticSampler::new(0.5).unwrap();
        let decision = sampler.is_sampled(low_id(TEST_MAX_ID + 10), TEST_OPERATION);
        assert!(!decision.sampled);
        assert_eq!(decision.tags, probabilistic_tags(0.5));

        let decision = sampler.is_sampled(low_id(TEST_MAX_ID - 20), TEST_OPERATION);
        assert!(decision.sampled);
        assert_eq!(decision.tags, probabilistic_tags(0.5));

        // The high half of the trace id does not participate.
        let decision = sampler.is_sampled(TraceId::new(u64::MAX, TEST_MAX_ID - 20), TEST_OPERATION);
        assert!(decision.sampled);
    }

    #[test]
    fn probabilistic_sampler_equality() {
        let a = ProbabilisticSampler::new(0.5).unwrap();
        let b = ProbabilisticSampler::new(0.5).unwrap();
        let c = ProbabilisticSampler::new(0.25).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn probabilistic_sampler_converges_to_rate() {
        let total = 10_000;
        let mut rng = rand::thread_rng();
        for rate in [0.25, 0.5, 0.75] {
            let sampler = ProbabilisticSampler::new(rate).unwrap();
            let mut sampled = 0;
            for _ in 0..total {
                let trace_id = TraceId::new(rng.gen(), rng.gen());
                if sampler.is_sampled(trace_id, TEST_OPERATION).sampled {
                    sampled += 1;
                }
            }
            let got = sampled as f64 / total as f64;
            // Binomial proportion confidence interval; succeeds 99.9999% of
            // the time.
            let z = 4.75342;
            let tolerance = z * (got * (1.0 - got) / total as f64).sqrt();
            assert!(
                (got - rate).abs() <= tolerance,
                "rate {}: got {} (tolerance {})",
                rate,
                got,
                tolerance
            );
        }
    }

    #[test]
    fn rate_limiting_sampler_equality() {
        let a = RateLimitingSampler::new(2.0);
        let b = RateLimitingSampler::new(2.0);
        let c = RateLimitingSampler::new(3.0);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn rate_limiting_sampler_caps_burst() {
        // Capacity max(2, 1) = 2, so exactly two immediate decisions pass.
        let sampler = RateLimitingSampler::new(2.0);
        assert!(sampler.is_sampled(low_id(1), TEST_OPERATION).sampled);
        assert!(sampler.is_sampled(low_id(1), TEST_OPERATION).sampled);
        assert!(!sampler.is_sampled(low_id(1), TEST_OPERATION).sampled);
    }

    #[test]
    fn guaranteed_throughput_sampler_update() {
        let mut sampler = GuaranteedThroughputSampler::new(TEST_OPERATION, 2.0, 0.5).unwrap();
        assert_eq!(sampler.lower_bound(), 2.0);
        assert_eq!(sampler.sampling_rate(), 0.5);

        sampler.update(1.0, 0.6).unwrap();
        assert_eq!(sampler.lower_bound(), 1.0);
        assert_eq!(sampler.sampling_rate(), 0.6);

        assert!(sampler.update(1.0, 1.5).is_err());
    }

    #[test]
    fn adaptive_sampler_decision_sequence() {
        let strategies = PerOperationSamplingStrategies {
            default_sampling_probability: TEST_DEFAULT_PROBABILITY,
            default_lower_bound_traces_per_second: 2.0,
            per_operation_strategies: vec![OperationSamplingStrategy {
                operation: TEST_OPERATION.to_string(),
                probabilistic_sampling: ProbabilisticSamplingStrategy {
                    sampling_rate: TEST_DEFAULT_PROBABILITY,
                },
            }],
            ..Default::default()
        };
        let sampler = AdaptiveSampler::new(&strategies, DEFAULT_MAX_OPERATIONS).unwrap();

        // Probabilistic fires and also consumes one lower-bound credit.
        let decision = sampler.is_sampled(low_id(TEST_MAX_ID - 20), TEST_OPERATION);
        assert!(decision.sampled);
        assert_eq!(decision.tags, probabilistic_tags(TEST_DEFAULT_PROBABILITY));

        // Above the boundary the lower bound picks it up.
        let decision = sampler.is_sampled(low_id(TEST_MAX_ID + 10), TEST_OPERATION);
        assert!(decision.sampled);
        assert_eq!(decision.tags, lower_bound_tags(TEST_DEFAULT_PROBABILITY));

        // Both lower-bound credits are spent now.
        let decision = sampler.is_sampled(low_id(TEST_MAX_ID + 10), TEST_OPERATION);
        assert!(!decision.sampled);

        // A first-time operation gets the default probabilistic sampler.
        let decision = sampler.is_sampled(low_id(TEST_MAX_ID - 20), FIRST_TIME_OPERATION);
        assert!(decision.sampled);
        assert_eq!(decision.tags, probabilistic_tags(TEST_DEFAULT_PROBABILITY));
    }

    #[test]
    fn adaptive_sampler_rejects_bad_probabilities() {
        for rate in [-0.1, 1.1] {
            let strategies = PerOperationSamplingStrategies {
                default_sampling_probability: TEST_DEFAULT_PROBABILITY,
                default_lower_bound_traces_per_second: 2.0,
                per_operation_strategies: vec![OperationSamplingStrategy {
                    operation: TEST_OPERATION.to_string(),
                    probabilistic_sampling: ProbabilisticSamplingStrategy {
                        sampling_rate: rate,
                    },
                }],
                ..Default::default()
            };
            assert!(AdaptiveSampler::new(&strategies, DEFAULT_MAX_OPERATIONS).is_err());
        }
    }

    #[test]
    fn adaptive_sampler_update_inserts_and_replaces() {
        let strategies = PerOperationSamplingStrategies {
            default_sampling_probability: TEST_DEFAULT_PROBABILITY,
            default_lower_bound_traces_per_second: 2.0,
            per_operation_strategies: vec![OperationSamplingStrategy {
                operation: TEST_OPERATION.to_string(),
                probabilistic_sampling: ProbabilisticSamplingStrategy { sampling_rate: 0.1 },
            }],
            ..Default::default()
        };
        let sampler = AdaptiveSampler::new(&strategies, DEFAULT_MAX_OPERATIONS).unwrap();
        assert_eq!(sampler.operation_count(), 1);

        let updated = PerOperationSamplingStrategies {
            default_sampling_probability: 0.1,
            default_lower_bound_traces_per_second: 3.0,
            per_operation_strategies: vec![
                OperationSamplingStrategy {
                    operation: TEST_OPERATION.to_string(),
                    probabilistic_sampling: ProbabilisticSamplingStrategy { sampling_rate: 0.2 },
                },
                OperationSamplingStrategy {
                    operation: FIRST_TIME_OPERATION.to_string(),
                    probabilistic_sampling: ProbabilisticSamplingStrategy { sampling_rate: 0.2 },
                },
            ],
            ..Default::default()
        };
        sampler.update(&updated).unwrap();
        assert_eq!(sampler.operation_count(), 2);
        {
            let inner = sampler.inner.read().unwrap();
            assert_eq!(inner.lower_bound, 3.0);
            assert_eq!(inner.default_sampler.sampling_rate(), 0.1);
            assert_eq!(inner.samplers[TEST_OPERATION].sampling_rate(), 0.2);
        }

        // A bad probability leaves the sampler untouched.
        let bad = PerOperationSamplingStrategies {
            default_sampling_probability: 1.5,
            ..Default::default()
        };
        assert!(sampler.update(&bad).is_err());
        assert_eq!(
            sampler.inner.read().unwrap().default_sampler.sampling_rate(),
            0.1
        );
    }

    #[test]
    fn adaptive_sampler_caps_tracked_operations() {
        let strategies = PerOperationSamplingStrategies {
            default_sampling_probability: 1.0,
            default_lower_bound_traces_per_second: 1.0,
            ..Default::default()
        };
        let sampler = AdaptiveSampler::new(&strategies, 2).unwrap();
        sampler.is_sampled(low_id(1), "op-1");
        sampler.is_sampled(low_id(1), "op-2");
        sampler.is_sampled(low_id(1), "op-3");
        assert_eq!(sampler.operation_count(), 2);

        // Overflow operations still get the default decision.
        let decision = sampler.is_sampled(low_id(1), "op-4");
        assert!(decision.sampled);
        assert_eq!(decision.tags, probabilistic_tags(1.0));
    }
}
