//! Baggage write policy: which keys may be set and how long values may be.
//!
//! Restrictions are either a process-wide default or pulled periodically from
//! the agent. Every baggage write goes through the [`BaggageSetter`], which
//! enforces the restriction, truncates over-long values, emits metrics, and
//! records the change as a log record on the span.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::errors::TraceError;
use crate::logger::{Logger, NullLogger};
use crate::metrics::Metrics;
use crate::span_context::SpanContext;
use crate::tag::{LogRecord, Tag};
use crate::worker::Poller;

/// Default maximum length of a baggage value when no restriction applies.
pub const DEFAULT_MAX_VALUE_LENGTH: usize = 2048;

/// How often remote restrictions are refreshed by default.
pub const DEFAULT_RESTRICTION_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// The policy for one baggage key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Restriction {
    /// Whether the key may be written at all.
    pub key_allowed: bool,
    /// Maximum length of the value; longer values are truncated.
    pub max_value_length: usize,
}

/// Decides which baggage keys a service may set.
pub trait BaggageRestrictionManager: Send + Sync + fmt::Debug {
    /// The restriction applying to `key` for `service`.
    fn get_restriction(&self, service: &str, key: &str) -> Restriction;

    /// Release any resources held by the manager.
    fn close(&self) {}
}

/// Allows every key, bounding only the value length.
#[derive(Clone, Debug)]
pub struct DefaultBaggageRestrictionManager {
    max_value_length: usize,
}

impl Default for DefaultBaggageRestrictionManager {
    fn default() -> Self {
        DefaultBaggageRestrictionManager {
            max_value_length: DEFAULT_MAX_VALUE_LENGTH,
        }
    }
}

impl DefaultBaggageRestrictionManager {
    /// A manager allowing every key with values up to `max_value_length`.
    pub fn new(max_value_length: usize) -> Self {
        DefaultBaggageRestrictionManager { max_value_length }
    }
}

impl BaggageRestrictionManager for DefaultBaggageRestrictionManager {
    fn get_restriction(&self, _service: &str, _key: &str) -> Restriction {
        Restriction {
            key_allowed: true,
            max_value_length: self.max_value_length,
        }
    }
}

/// One restriction entry as served by the agent.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KeyRestriction {
    /// The baggage key the restriction applies to.
    pub baggage_key: String,
    /// Maximum length of values written under the key.
    pub max_value_length: usize,
}

/// Source of baggage restrictions, typically an HTTP endpoint on the local
/// agent. Implementations live outside this crate.
pub trait RestrictionSource: Send + Sync {
    /// Fetch the full restriction list for `service`.
    fn fetch_restrictions(&self, service: &str) -> Result<Vec<KeyRestriction>, TraceError>;
}

struct RestrictionState {
    service_name: String,
    source: Box<dyn RestrictionSource>,
    restrictions: RwLock<Option<HashMap<String, Restriction>>>,
    deny_on_initialization: bool,
    metrics: Metrics,
    logger: Arc<dyn Logger>,
}

impl RestrictionState {
    fn update_restrictions(&self) {
        match self.source.fetch_restrictions(&self.service_name) {
            Ok(entries) => {
                let table = entries
                    .into_iter()
                    .map(|entry| {
                        (
                            entry.baggage_key,
                            Restriction {
                                key_allowed: true,
                                max_value_length: entry.max_value_length,
                            },
                        )
                    })
                    .collect();
                *self.restrictions.write().unwrap() = Some(table);
                self.metrics.baggage_restrictions_update_success.inc(1);
            }
            Err(err) => {
                self.metrics.baggage_restrictions_update_failure.inc(1);
                self.logger.error(&format!(
                    "failed to fetch baggage restrictions for {}: {}",
                    self.service_name, err
                ));
            }
        }
    }
}

/// Builder for [`RemoteRestrictionManager`].
pub struct RemoteRestrictionManagerBuilder {
    service_name: String,
    source: Box<dyn RestrictionSource>,
    refresh_interval: Duration,
    deny_on_initialization: bool,
    metrics: Metrics,
    logger: Arc<dyn Logger>,
}

impl fmt::Debug for RemoteRestrictionManagerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteRestrictionManagerBuilder")
            .field("service_name", &self.service_name)
            .field("refresh_interval", &self.refresh_interval)
            .finish()
    }
}

impl RemoteRestrictionManagerBuilder {
    /// How often to refresh the restriction table.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Deny all baggage writes until the first successful fetch. The default
    /// is to allow everything with the default value length instead.
    pub fn with_deny_on_initialization(mut self, deny: bool) -> Self {
        self.deny_on_initialization = deny;
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

    /// Build the manager and start its poller.
    pub fn build(self) -> RemoteRestrictionManager {
        let state = Arc::new(RestrictionState {
            service_name: self.service_name,
            source: self.source,
            restrictions: RwLock::new(None),
            deny_on_initialization: self.deny_on_initialization,
            metrics: self.metrics,
            logger: self.logger,
        });
        let poller_state = Arc::clone(&state);
        let poller = Poller::spawn(
            "jaeger.client.baggage",
            self.refresh_interval,
            move || poller_state.update_restrictions(),
        );
        RemoteRestrictionManager {
            state,
            poller: Mutex::new(Some(poller)),
        }
    }
}

/// A restriction manager that polls the agent for the allowed baggage keys
/// of this service.
///
/// Keys absent from a fetched restriction table are denied. Before the first
/// successful fetch the manager either allows everything (default) or denies
/// everything (`deny_on_initialization`).
pub struct RemoteRestrictionManager {
    state: Arc<RestrictionState>,
    poller: Mutex<Option<Poller>>,
}

impl RemoteRestrictionManager {
    /// Start building a manager for `service_name`, fed by `source`.
    pub fn builder(
        service_name: impl Into<String>,
        source: impl RestrictionSource + 'static,
    ) -> RemoteRestrictionManagerBuilder {
        RemoteRestrictionManagerBuilder {
            service_name: service_name.into(),
            source: Box::new(source),
            refresh_interval: DEFAULT_RESTRICTION_REFRESH_INTERVAL,
            deny_on_initialization: false,
            metrics: Metrics::noop(),
            logger: Arc::new(NullLogger),
        }
    }
}

impl fmt::Debug for RemoteRestrictionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteRestrictionManager")
            .field("service_name", &self.state.service_name)
            .finish()
    }
}

impl BaggageRestrictionManager for RemoteRestrictionManager {
    fn get_restriction(&self, _service: &str, key: &str) -> Restriction {
        let restrictions = self.state.restrictions.read().unwrap();
        match &*restrictions {
            Some(table) => table.get(key).cloned().unwrap_or(Restriction {
                key_allowed: false,
                max_value_length: 0,
            }),
            None => Restriction {
                key_allowed: !self.state.deny_on_initialization,
                max_value_length: DEFAULT_MAX_VALUE_LENGTH,
            },
        }
    }

    fn close(&self) {
        if let Some(mut poller) = self.poller.lock().unwrap().take() {
            poller.shutdown();
        }
    }
}

/// Applies restrictions to baggage writes and accounts for them.
#[derive(Clone, Debug)]
pub(crate) struct BaggageSetter {
    service_name: String,
    manager: Arc<dyn BaggageRestrictionManager>,
    metrics: Metrics,
}

impl BaggageSetter {
    pub(crate) fn new(
        service_name: String,
        manager: Arc<dyn BaggageRestrictionManager>,
        metrics: Metrics,
    ) -> Self {
        BaggageSetter {
            service_name,
            manager,
            metrics,
        }
    }

    /// Apply one baggage write to `context`.
    ///
    /// Returns the context the span should adopt and, when the span is
    /// sampled, a log record describing the write.
    pub(crate) fn apply(
        &self,
        context: &SpanContext,
        key: &str,
        value: &str,
        timestamp: SystemTime,
    ) -> (SpanContext, Option<LogRecord>) {
        let restriction = self.manager.get_restriction(&self.service_name, key);
        if !restriction.key_allowed {
            self.metrics.baggage_update_failure.inc(1);
            let record = self.log_record(context, key, value, timestamp, false, true);
            return (context.clone(), record);
        }

        let mut truncated = false;
        let mut value = value;
        if value.len() > restriction.max_value_length {
            truncated = true;
            value = truncate_to_boundary(value, restriction.max_value_length);
            self.metrics.baggage_truncations.inc(1);
        }

        let next = context.with_baggage_item(key, value);
        self.metrics.baggage_update_success.inc(1);
        let record = self.log_record(&next, key, value, timestamp, truncated, false);
        (next, record)
    }

    fn log_record(
        &self,
        context: &SpanContext,
        key: &str,
        value: &str,
        timestamp: SystemTime,
        truncated: bool,
        invalid: bool,
    ) -> Option<LogRecord> {
        if !context.is_sampled() {
            return None;
        }
        let mut fields = vec![
            Tag::new("event", "baggage"),
            Tag::new("key", key),
            Tag::new("value", value),
        ];
        if truncated {
            fields.push(Tag::new("truncated", true));
        }
        if invalid {
            fields.push(Tag::new("invalid", true));
        }
        Some(LogRecord { timestamp, fields })
    }
}

/// Truncate to `max` bytes without splitting a UTF-8 code point.
fn truncate_to_boundary(value: &str, max: usize) -> &str {
    let mut end = max;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}
