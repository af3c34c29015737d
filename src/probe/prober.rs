//! Health prober
//!
//! Issues periodic liveness/latency checks against every registered service
//! endpoint. Probes for different services run concurrently, bounded by a
//! shared worker pool; every probe carries a hard timeout, so one hung
//! endpoint can never delay probing of another. A failed probe is retried on
//! the next scheduled tick only.

use crate::error::{ProbeError, StoreError};
use crate::model::{HealthCheckResult, HealthStatus, SeriesKey};
use crate::probe::transport::ProbeTransport;
use crate::store::TimeSeriesStore;
use chrono::Utc;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
// tokio's Instant, so the schedule advances with the runtime clock in tests
use tokio::time::{Instant, MissedTickBehavior};

/// Metric name of the 0/1 health gauge written per probe
pub const HEALTHY_METRIC: &str = "service_healthy";
/// Metric name of the probe latency gauge written per probe
pub const LATENCY_METRIC: &str = "service_probe_latency_ms";

/// A registered probe target
#[derive(Debug, Clone)]
pub struct ServiceEndpoint {
    /// Service identity; label value on the emitted series
    pub service: String,
    /// URL probed with a bounded-timeout round trip
    pub url: String,
    /// Per-service override of the default probe interval
    pub interval: Option<Duration>,
}

/// Periodically probes registered endpoints and records the outcomes
pub struct HealthProber {
    registry: RwLock<HashMap<String, ServiceEndpoint>>,
    /// Per-service next-due schedule, owned by the scheduler loop
    next_due: Mutex<HashMap<String, Instant>>,
    transport: Arc<dyn ProbeTransport>,
    store: Arc<TimeSeriesStore>,
    /// Hard bound on a single probe; on expiry the probe is abandoned and
    /// recorded as unhealthy, never left hanging
    timeout: Duration,
    default_interval: Duration,
    /// Latency above this classifies a successful response as degraded
    degraded_threshold_ms: f64,
    /// Bounds concurrent outbound probes across all services
    pool: Arc<Semaphore>,
    /// Set when the store rejects writes entirely; engine-fatal
    store_down: AtomicBool,
}

impl HealthProber {
    pub fn new(
        transport: Arc<dyn ProbeTransport>,
        store: Arc<TimeSeriesStore>,
        timeout: Duration,
        default_interval: Duration,
        degraded_threshold_ms: f64,
        pool_size: usize,
    ) -> Self {
        Self {
            registry: RwLock::new(HashMap::new()),
            next_due: Mutex::new(HashMap::new()),
            transport,
            store,
            timeout,
            default_interval,
            degraded_threshold_ms,
            pool: Arc::new(Semaphore::new(pool_size.max(1))),
            store_down: AtomicBool::new(false),
        }
    }

    /// Register a service for probing; replaces an existing registration
    /// with the same identity
    pub fn register(&self, endpoint: ServiceEndpoint) {
        info!(
            "registered probe target '{}' -> {} (interval {:?})",
            endpoint.service,
            endpoint.url,
            endpoint.interval.unwrap_or(self.default_interval)
        );
        if let Ok(mut registry) = self.registry.write() {
            registry.insert(endpoint.service.clone(), endpoint);
        }
    }

    /// Stop future probing of a service
    ///
    /// Already-stored series are untouched and age out through normal
    /// retention.
    pub fn unregister(&self, service: &str) -> bool {
        if let Ok(mut due) = self.next_due.lock() {
            due.remove(service);
        }
        match self.registry.write() {
            Ok(mut registry) => registry.remove(service).is_some(),
            Err(_) => false,
        }
    }

    /// Registered service identities
    pub fn registered_services(&self) -> Vec<String> {
        self.registry
            .read()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Run one probe against an endpoint and classify the outcome
    ///
    /// Never returns an error: timeouts and connection failures become
    /// `Unhealthy` results, local to this service and this tick.
    pub async fn probe_once(&self, endpoint: &ServiceEndpoint) -> HealthCheckResult {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.transport.probe(&endpoint.url)).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        let (status, error) = match outcome {
            Err(_) => (
                HealthStatus::Unhealthy,
                Some(
                    ProbeError::Timeout {
                        timeout_ms: self.timeout.as_millis() as u64,
                    }
                    .to_string(),
                ),
            ),
            Ok(Err(e)) => (HealthStatus::Unhealthy, Some(e.to_string())),
            Ok(Ok(response)) if !response.is_success() => (
                HealthStatus::Degraded,
                Some(format!("status code {}", response.status_code)),
            ),
            Ok(Ok(_)) if latency_ms > self.degraded_threshold_ms => (
                HealthStatus::Degraded,
                Some(format!("latency {:.1}ms above threshold", latency_ms)),
            ),
            Ok(Ok(_)) => (HealthStatus::Healthy, None),
        };

        HealthCheckResult {
            service: endpoint.service.clone(),
            timestamp: Utc::now(),
            status,
            latency_ms,
            error,
        }
    }

    /// Write a probe outcome as the two per-service gauge series
    ///
    /// An out-of-order sample is logged and dropped; a store that cannot
    /// accept writes at all flips the fatal flag.
    pub fn record(&self, result: &HealthCheckResult) {
        if let Some(detail) = &result.error {
            debug!(
                "probe '{}': {:?} in {:.1}ms ({})",
                result.service, result.status, result.latency_ms, detail
            );
        }
        let labels: &[(&str, &str)] = &[("service", result.service.as_str())];
        let writes = [
            (SeriesKey::new(HEALTHY_METRIC, labels), result.status.as_gauge()),
            (SeriesKey::new(LATENCY_METRIC, labels), result.latency_ms),
        ];
        for (key, value) in writes {
            match self.store.write(&key, result.timestamp, value) {
                Ok(()) => {}
                Err(e @ StoreError::OutOfOrderSample { .. }) => {
                    warn!("dropping probe sample: {}", e);
                }
                Err(e @ StoreError::Unavailable(_)) => {
                    error!("store rejected probe write: {}", e);
                    self.store_down.store(true, Ordering::SeqCst);
                    return;
                }
            }
        }
    }

    /// Probe one endpoint and record the outcome
    pub async fn probe_and_record(&self, endpoint: &ServiceEndpoint) {
        let result = self.probe_once(endpoint).await;
        self.record(&result);
    }

    /// Scheduler loop
    ///
    /// Ticks at one-second granularity and launches due probes as
    /// independent tasks through the worker pool. On shutdown, in-flight
    /// probes are allowed to finish or time out before the loop returns.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` when the store stops accepting
    /// writes; this is the engine-fatal path.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), StoreError> {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight: JoinSet<()> = JoinSet::new();

        info!(
            "health prober started (default interval {:?}, timeout {:?})",
            self.default_interval, self.timeout
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.store_down.load(Ordering::SeqCst) {
                        return Err(StoreError::Unavailable(
                            "probe writes rejected".to_string(),
                        ));
                    }
                    self.launch_due_probes(&mut in_flight);
                    // Reap finished probes without blocking the tick.
                    while in_flight.try_join_next().is_some() {}
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("health prober draining {} in-flight probes", in_flight.len());
        while in_flight.join_next().await.is_some() {}
        info!("health prober stopped");
        Ok(())
    }

    fn launch_due_probes(self: &Arc<Self>, in_flight: &mut JoinSet<()>) {
        let endpoints: Vec<ServiceEndpoint> = match self.registry.read() {
            Ok(registry) => registry.values().cloned().collect(),
            Err(_) => return,
        };
        let now = Instant::now();
        let mut due = match self.next_due.lock() {
            Ok(due) => due,
            Err(poisoned) => poisoned.into_inner(),
        };

        for endpoint in endpoints {
            let is_due = due
                .get(&endpoint.service)
                .map_or(true, |next| *next <= now);
            if !is_due {
                continue;
            }
            let interval = endpoint.interval.unwrap_or(self.default_interval);
            due.insert(endpoint.service.clone(), now + interval);

            let prober = Arc::clone(self);
            in_flight.spawn(async move {
                let permit = match prober.pool.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return, // pool closed during shutdown
                };
                prober.probe_and_record(&endpoint).await;
                drop(permit);
            });
        }
    }
}
