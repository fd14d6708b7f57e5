//! Internal diagnostics logging.
//!
//! The tracer never logs on its own behalf unless given a [`Logger`]; the
//! default is [`NullLogger`]. [`TracingLogger`] forwards to the `tracing`
//! facade for applications that already collect structured logs.

use std::fmt;

/// Destination for the tracer's own diagnostics.
pub trait Logger: Send + Sync + fmt::Debug {
    /// Report an error condition.
    fn error(&self, msg: &str);

    /// Report an informational message.
    fn info(&self, msg: &str);
}

/// Discards all messages.
#[derive(Clone, Debug, Default)]
pub struct NullLogger;

impl Logger for NullLogger {
    fn error(&self, _msg: &str) {}

    fn info(&self, _msg: &str) {}
}

/// Forwards messages to the `tracing` facade.
#[derive(Clone, Debug, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn error(&self, msg: &str) {
        tracing::error!(target: "jaeger_client", "{}", msg);
    }

    fn info(&self, msg: &str) {
        tracing::info!(target: "jaeger_client", "{}", msg);
    }
}

/// Writes messages to stdout/stderr; handy in examples and ad-hoc debugging.
#[derive(Clone, Debug, Default)]
pub struct StdoutLogger;

impl Logger for StdoutLogger {
    fn error(&self, msg: &str) {
        eprintln!("ERROR: {}", msg);
    }

    fn info(&self, msg: &str) {
        println!("{}", msg);
    }
}
