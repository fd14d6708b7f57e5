//! Credit-based throttling of debug traces.
//!
//! Debug traces bypass the sampler, so the agent hands out per-operation
//! credits to keep them rare. Checking an operation debits one credit; the
//! background poller tops the balances up from the [`CreditManager`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::TraceError;
use crate::logger::{Logger, NullLogger};
use crate::metrics::Metrics;
use crate::worker::Poller;

/// Credits required for an operation to pass unthrottled; passing debits
/// exactly this amount.
const MINIMUM_CREDITS: f64 = 1.0;

/// How often credit balances are refreshed by default.
pub const DEFAULT_THROTTLER_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Cap on the credits an operation can accumulate while idle.
pub const DEFAULT_MAX_CREDITS: f64 = 10.0;

/// Decides whether a per-operation event may proceed.
pub trait Throttler: Send + Sync + fmt::Debug {
    /// Returns `true` when `operation` must be throttled.
    fn is_throttled(&self, operation: &str) -> bool;

    /// Record the client uuid used to identify this process to the agent.
    fn set_uuid(&self, _uuid: &str) {}

    /// Release any resources held by the throttler.
    fn close(&self) {}
}

/// A throttler that never throttles.
#[derive(Clone, Debug, Default)]
pub struct DefaultThrottler;

impl Throttler for DefaultThrottler {
    fn is_throttled(&self, _operation: &str) -> bool {
        false
    }
}

/// One credit grant as served by the agent.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreditResponse {
    /// The operation the credits are granted to.
    pub operation: String,
    /// The granted amount.
    pub credits: f64,
}

/// Source of throttling credits, typically an HTTP endpoint on the local
/// agent. Implementations live outside this crate.
pub trait CreditManager: Send + Sync {
    /// Fetch credit grants for the given operations on behalf of the client
    /// identified by `uuid`.
    fn fetch_credits(
        &self,
        uuid: &str,
        service: &str,
        operations: &[String],
    ) -> Result<Vec<CreditResponse>, TraceError>;
}

struct ThrottlerState {
    service_name: String,
    manager: Box<dyn CreditManager>,
    credits: Mutex<HashMap<String, f64>>,
    uuid: RwLock<String>,
    max_credits: f64,
    metrics: Metrics,
    logger: Arc<dyn Logger>,
}

impl ThrottlerState {
    /// Top up every tracked operation from the credit manager.
    fn refresh_credits(&self) {
        let operations: Vec<String> = self.credits.lock().unwrap().keys().cloned().collect();
        if operations.is_empty() {
            return;
        }
        let granted = match self.fetch_credits(&operations) {
            Ok(granted) => {
                self.metrics.throttler_update_success.inc(1);
                granted
            }
            Err(()) => {
                self.metrics.throttler_update_failure.inc(1);
                return;
            }
        };
        let mut credits = self.credits.lock().unwrap();
        for grant in granted {
            let balance = credits.entry(grant.operation).or_insert(0.0);
            *balance = (*balance + grant.credits).min(self.max_credits);
        }
    }

    fn fetch_credits(&self, operations: &[String]) -> Result<Vec<CreditResponse>, ()> {
        let uuid = self.uuid.read().unwrap().clone();
        if uuid.is_empty() {
            self.logger
                .error("throttler uuid is not set, failed to fetch credits");
            return Err(());
        }
        self.manager
            .fetch_credits(&uuid, &self.service_name, operations)
            .map_err(|err| {
                self.logger
                    .error(&format!("failed to fetch throttling credits: {}", err));
            })
    }
}

/// Builder for [`RemoteThrottler`].
pub struct RemoteThrottlerBuilder {
    service_name: String,
    manager: Box<dyn CreditManager>,
    refresh_interval: Duration,
    max_credits: f64,
    metrics: Metrics,
    logger: Arc<dyn Logger>,
}

impl fmt::Debug for RemoteThrottlerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteThrottlerBuilder")
            .field("service_name", &self.service_name)
            .field("refresh_interval", &self.refresh_interval)
            .finish()
    }
}

impl RemoteThrottlerBuilder {
    /// How often to top up credit balances.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Cap on the credits one operation can bank.
    pub fn with_max_credits(mut self, max_credits: f64) -> Self {
        self.max_credits = max_credits;
        self
    }

    /// Metrics destination for poll outcomes.
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Logger for fetch failures.
    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Build the throttler and start its poller.
    pub fn build(self) -> RemoteThrottler {
        let state = Arc::new(ThrottlerState {
            service_name: self.service_name,
            manager: self.manager,
            credits: Mutex::new(HashMap::new()),
            uuid: RwLock::new(String::new()),
            max_credits: self.max_credits,
            metrics: self.metrics,
            logger: self.logger,
        });
        let poller_state = Arc::clone(&state);
        let poller = Poller::spawn(
            "jaeger.client.throttler",
            self.refresh_interval,
            move || poller_state.refresh_credits(),
        );
        RemoteThrottler {
            state,
            poller: Mutex::new(Some(poller)),
        }
    }
}

/// A throttler that polls the agent for per-operation credits.
///
/// The first check of an unknown operation fetches credits synchronously; if
/// that fetch fails the operation is throttled until the next attempt. The
/// client uuid must be set before any fetch can succeed.
pub struct RemoteThrottler {
    state: Arc<ThrottlerState>,
    poller: Mutex<Option<Poller>>,
}

impl RemoteThrottler {
    /// Start building a throttler for `service_name`, fed by `manager`.
    pub fn builder(
        service_name: impl Into<String>,
        manager: impl CreditManager + 'static,
    ) -> RemoteThrottlerBuilder {
        RemoteThrottlerBuilder {
            service_name: service_name.into(),
            manager: Box::new(manager),
            refresh_interval: DEFAULT_THROTTLER_REFRESH_INTERVAL,
            max_credits: DEFAULT_MAX_CREDITS,
            metrics: Metrics::noop(),
            logger: Arc::new(NullLogger),
        }
    }
}

impl fmt::Debug for RemoteThrottler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteThrottler")
            .field("service_name", &self.state.service_name)
            .finish()
    }
}

impl Throttler for RemoteThrottler {
    fn is_throttled(&self, operation: &str) -> bool {
        let mut credits = self.state.credits.lock().unwrap();
        if !credits.contains_key(operation) {
            // First sighting of this operation: fetch its credits while
            // holding the lock so concurrent checks cannot double-fetch.
            let granted = match self.state.fetch_credits(&[operation.to_string()]) {
                Ok(granted) if !granted.is_empty() => granted,
                _ => return true,
            };
            for grant in granted {
                let balance = credits.entry(grant.operation).or_insert(0.0);
                *balance = (*balance + grant.credits).min(self.state.max_credits);
            }
        }
        match credits.get_mut(operation) {
            Some(balance) if *balance >= MINIMUM_CREDITS => {
                *balance -= MINIMUM_CREDITS;
                false
            }
            _ => true,
        }
    }

    fn set_uuid(&self, uuid: &str) {
        *self.state.uuid.write().unwrap() = uuid.to_string();
    }

    fn close(&self) {
        if let Some(mut poller) = self.poller.lock().unwrap().take() {
            poller.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::InMemoryMetricsFactory;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct MockCreditManager {
        credits_per_operation: Arc<Mutex<f64>>,
        calls: Arc<AtomicUsize>,
        fail: Arc<Mutex<bool>>,
    }

    impl MockCreditManager {
        fn with_credits(credits: f64) -> Self {
            MockCreditManager {
                credits_per_operation: Arc::new(Mutex::new(credits)),
                ..Default::default()
            }
        }
    }

    impl CreditManager for MockCreditManager {
        fn fetch_credits(
            &self,
            _uuid: &str,
            _service: &str,
            operations: &[String],
        ) -> Result<Vec<CreditResponse>, TraceError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if *self.fail.lock().unwrap() {
                return Err(TraceError::Transport("agent down".to_string()));
            }
            let credits = *self.credits_per_operation.lock().unwrap();
            Ok(operations
                .iter()
                .map(|operation| CreditResponse {
                    operation: operation.clone(),
                    credits,
                })
                .collect())
        }
    }

    fn build(manager: &MockCreditManager, factory: &InMemoryMetricsFactory) -> RemoteThrottler {
        let throttler = RemoteThrottler::builder("svc", manager.clone())
            .with_refresh_interval(Duration::from_secs(3600))
            .with_metrics(Metrics::new(factory))
            .build();
        throttler.set_uuid("test-uuid");
        throttler
    }

    #[test]
    fn default_throttler_never_throttles() {
        assert!(!DefaultThrottler.is_throttled("anything"));
    }

    #[test]
    fn first_check_fetches_synchronously_and_debits() {
        let manager = MockCreditManager::with_credits(2.0);
        let factory = InMemoryMetricsFactory::new();
        let throttler = build(&manager, &factory);

        assert!(!throttler.is_throttled("op"));
        assert_eq!(manager.calls.load(Ordering::Relaxed), 1);
        assert!(!throttler.is_throttled("op"));
        assert!(throttler.is_throttled("op"));
        // Later checks of a known operation do not fetch again.
        assert_eq!(manager.calls.load(Ordering::Relaxed), 1);
        throttler.close();
    }

    #[test]
    fn fetch_failure_throttles_until_retry() {
        let manager = MockCreditManager::with_credits(1.0);
        *manager.fail.lock().unwrap() = true;
        let factory = InMemoryMetricsFactory::new();
        let throttler = build(&manager, &factory);

        assert!(throttler.is_throttled("op"));

        *manager.fail.lock().unwrap() = false;
        assert!(!throttler.is_throttled("op"));
        throttler.close();
    }

    #[test]
    fn unset_uuid_blocks_fetches() {
        let manager = MockCreditManager::with_credits(5.0);
        let factory = InMemoryMetricsFactory::new();
        let throttler = RemoteThrottler::builder("svc", manager.clone())
            .with_refresh_interval(Duration::from_secs(3600))
            .with_metrics(Metrics::new(&factory))
            .build();

        assert!(throttler.is_throttled("op"));
        assert_eq!(manager.calls.load(Ordering::Relaxed), 0);

        throttler.set_uuid("now-set");
        assert!(!throttler.is_throttled("op"));
        throttler.close();
    }

    #[test]
    fn refresh_accumulates_up_to_the_cap() {
        let manager = MockCreditManager::with_credits(8.0);
        let factory = InMemoryMetricsFactory::new();
        let throttler = RemoteThrottler::builder("svc", manager.clone())
            .with_refresh_interval(Duration::from_secs(3600))
            .with_max_credits(10.0)
            .with_metrics(Metrics::new(&factory))
            .build();
        throttler.set_uuid("test-uuid");

        assert!(!throttler.is_throttled("op")); // 8 fetched, 7 left

        throttler.state.refresh_credits(); // 7 + 8 clamped to 10
        assert_eq!(
            factory.counter_value("throttler.updates", &[("result", "ok")]),
            1
        );
        let mut passes = 0;
        while !throttler.is_throttled("op") {
            passes += 1;
            assert!(passes < 100, "throttler never engaged");
        }
        assert_eq!(passes, 10);
        throttler.close();
    }

    #[test]
    fn refresh_failure_is_counted() {
        let manager = MockCreditManager::with_credits(1.0);
        let factory = InMemoryMetricsFactory::new();
        let throttler = build(&manager, &factory);

        assert!(!throttler.is_throttled("op"));
        *manager.fail.lock().unwrap() = true;
        throttler.state.refresh_credits();
        assert_eq!(
            factory.counter_value("throttler.updates", &[("result", "err")]),
            1
        );
        throttler.close();
    }
}
