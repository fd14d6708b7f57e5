//! Error types returned by tracer components.

use std::time::Duration;
use thiserror::Error;

/// Errors returned by constructors, background pollers, and shutdown paths.
///
/// The hot path (starting, mutating and finishing spans) never returns
/// errors; failures there are counted as metrics and logged instead.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TraceError {
    /// A constructor was given an out-of-range or malformed argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No sampling strategy is known for the requested service.
    #[error("no sampling strategy found for service {0}")]
    StrategyNotFound(String),

    /// A span context could not be moved through a carrier.
    #[error(transparent)]
    Propagation(#[from] PropagationError),

    /// A remote endpoint could not be reached or answered with an error.
    #[error("transport error: {0}")]
    Transport(String),

    /// A blocking operation did not complete within its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Any other error, wrapped as a message.
    #[error("{0}")]
    Other(String),
}

/// Errors surfaced by [`Tracer::inject`] and [`Tracer::extract`].
///
/// [`Tracer::inject`]: crate::Tracer::inject
/// [`Tracer::extract`]: crate::Tracer::extract
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum PropagationError {
    /// The carrier cannot hold data for the requested format.
    #[error("invalid carrier for the requested format")]
    InvalidCarrier,

    /// The carrier holds trace identity data, but it is malformed.
    #[error("span context corrupted in the carrier")]
    SpanContextCorrupted,

    /// The carrier holds no trace identity data at all.
    #[error("span context not found in the carrier")]
    SpanContextNotFound,
}
