//! Wire types of the sampling-strategy endpoint.
//!
//! These mirror the JSON served by the agent's `/sampling` endpoint; field
//! names are camelCase on the wire.

use serde::{Deserialize, Serialize};

/// Samples traces with a fixed probability.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProbabilisticSamplingStrategy {
    /// The sampling probability in the range [0.0, 1.0].
    pub sampling_rate: f64,
}

/// Samples a fixed number of traces per second.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitingSamplingStrategy {
    /// Maximum number of traces to sample per second.
    pub max_traces_per_second: f64,
}

/// Sampling strategy for a single operation (aka endpoint, span name).
/// Only probabilistic sampling is supported per operation.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationSamplingStrategy {
    /// The operation the strategy applies to.
    pub operation: String,
    /// The probabilistic strategy for that operation.
    pub probabilistic_sampling: ProbabilisticSamplingStrategy,
}

/// Per-operation strategies plus service-wide defaults.
///
/// Useful for services whose endpoints receive vastly different traffic,
/// where any single sampling rate would produce either too much data for some
/// endpoints or almost none for others.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PerOperationSamplingStrategies {
    /// Sampling probability for operations that match none of the
    /// per-operation strategies.
    pub default_sampling_probability: f64,
    /// Lower-bound rate limit guaranteeing some minimal amount of traces for
    /// every operation. The limit is local to one service instance.
    pub default_lower_bound_traces_per_second: f64,
    /// Strategies for individual operations of the service.
    pub per_operation_strategies: Vec<OperationSamplingStrategy>,
    /// Upper-bound rate limit. Accepted on the wire but not enforced.
    pub default_upper_bound_traces_per_second: f64,
}

/// Legacy discriminator of [`SamplingStrategyResponse`].
///
/// The enum was never extended when per-operation strategies were introduced,
/// so consumers should ignore it and check which strategy field is present,
/// starting with `operation_sampling`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum SamplingStrategyType {
    /// Probabilistic sampling.
    Probabilistic,
    /// Rate-limiting sampling.
    RateLimiting,
}

/// The overall sampling strategy for one service.
///
/// Treated as a union: exactly one of the strategy fields should be present.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SamplingStrategyResponse {
    /// See [`SamplingStrategyType`]; ignored by this client.
    pub strategy_type: Option<SamplingStrategyType>,
    /// Present for a service-wide probabilistic strategy.
    pub probabilistic_sampling: Option<ProbabilisticSamplingStrategy>,
    /// Present for a service-wide rate-limiting strategy.
    pub rate_limiting_sampling: Option<RateLimitingSamplingStrategy>,
    /// Present for per-operation strategies.
    pub operation_sampling: Option<PerOperationSamplingStrategies>,
}
