// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;

use jiff::Timestamp;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::alerts::AlertTransition;
use crate::constants::{
    BENCHMARK_PATH, FRACTAL_BENCHMARK_PATH, HEALTH_PATH, LIVE_PATH, METRICS_PATH, READY_PATH, SYSTEM_PATH,
};
use crate::models::{
    BenchmarkReport, FractalBenchmarkReport, FractalImage, FractalParams, HealthReport, LivenessReport, MetricsSnapshot,
    ReadinessReport, SystemInfo,
};
use crate::pipeline::Pipeline;
use crate::poller::{self, PollerHandle};
use crate::{
    Alert, AlertEngine, AlertId, CacheStats, CanonicalKey, CircuitRegistry, CircuitState, ClientConfig, Coalescer, ConfigError,
    Event, EventBus, EventKind, HistoryStore, MetricSample, RequestExecutor, RequestSpec, Result, RetryPolicy, Subscription,
    Summary, TimeRange, Transport,
};

/// The entry point for talking to a performance service.
///
/// A client owns every piece of shared state: the circuit registry, the fractal result cache,
/// the metric history, the alert engine and the event bus. It is constructed once from a
/// [`ClientConfig`] and cloned cheaply wherever it is needed; clones share all state.
///
/// # Examples
///
/// ```no_run
/// # #[cfg(feature = "hyper")]
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// use telltale::models::FractalParams;
/// use telltale::{ClientConfig, TelemetryClient};
///
/// let client = TelemetryClient::connect(ClientConfig::new("http://localhost:8080"))?;
///
/// // Identical concurrent requests share one network call.
/// let view = FractalParams::mandelbrot().with_zoom(250.0);
/// let (a, b) = tokio::join!(client.generate_fractal(view), client.generate_fractal(view));
/// assert_eq!(a?.data, b?.data);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct TelemetryClient {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: ClientConfig,
    pipeline: Pipeline,
    benchmark_retry: RetryPolicy,
    fractals: Coalescer<Arc<FractalImage>>,
    history: Mutex<HistoryStore>,
    alerts: Mutex<AlertEngine>,
    events: EventBus,
    snapshot: Mutex<Option<(Instant, Arc<MetricsSnapshot>)>>,
}

impl TelemetryClient {
    /// Creates a client that sends its requests through `transport`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the configuration fails
    /// [`ClientConfig::validate`].
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> std::result::Result<Self, ConfigError> {
        config.validate()?;

        let retry = RetryPolicy::from(&config.retry);
        let pipeline = Pipeline::new(
            RequestExecutor::new(transport, &config.base_url),
            Arc::new(CircuitRegistry::new(config.breaker.clone())),
            retry.clone(),
        );

        Ok(Self {
            inner: Arc::new(Inner {
                benchmark_retry: retry.no_retry_on_timeout(),
                fractals: Coalescer::new(config.cache.ttl),
                history: Mutex::new(HistoryStore::new(config.poll.history_capacity)),
                alerts: Mutex::new(AlertEngine::new(&config.alerts)),
                events: EventBus::new(),
                snapshot: Mutex::new(None),
                pipeline,
                config,
            }),
        })
    }

    /// Creates a client that talks to the service over HTTP using [`HyperTransport`][crate::HyperTransport].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the configuration fails
    /// [`ClientConfig::validate`].
    #[cfg(feature = "hyper")]
    #[cfg_attr(docsrs, doc(cfg(feature = "hyper")))]
    pub fn connect(config: ClientConfig) -> std::result::Result<Self, ConfigError> {
        Self::new(config, Arc::new(crate::HyperTransport::new()))
    }

    /// The validated configuration the client was built from.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Returns the current metrics snapshot.
    ///
    /// A snapshot fetched less than [`PollOptions::snapshot_max_age`][crate::PollOptions::snapshot_max_age]
    /// ago is returned without a request. A fetched snapshot is not recorded in the history and
    /// not evaluated against the alert rules; that only happens on [`poll_once`][Self::poll_once].
    ///
    /// # Errors
    ///
    /// Returns the terminal error of the request pipeline.
    pub async fn current_metrics(&self) -> Result<Arc<MetricsSnapshot>> {
        let max_age = self.inner.config.poll.snapshot_max_age;
        let fresh = self
            .inner
            .snapshot
            .lock()
            .as_ref()
            .filter(|(fetched_at, _)| fetched_at.elapsed() < max_age)
            .map(|(_, snapshot)| Arc::clone(snapshot));

        match fresh {
            Some(snapshot) => Ok(snapshot),
            None => self.fetch_metrics().await,
        }
    }

    /// Runs the service's CPU and memory benchmark.
    ///
    /// The benchmark has its own long timeout and a timed-out run is not retried.
    ///
    /// # Errors
    ///
    /// Returns the terminal error of the request pipeline.
    pub async fn run_benchmark(&self) -> Result<BenchmarkReport> {
        let spec = RequestSpec::post(BENCHMARK_PATH, None, self.inner.config.timeouts.benchmark);
        self.inner.pipeline.call_with(&spec, &self.inner.benchmark_retry).await
    }

    /// Runs the service's fractal rendering benchmark over its fixed resolution ladder.
    ///
    /// Uses the benchmark timeout and, like [`run_benchmark`][Self::run_benchmark], does not
    /// retry a timed-out run. Results are not cached.
    ///
    /// # Errors
    ///
    /// Returns the terminal error of the request pipeline.
    pub async fn run_fractal_benchmark(&self) -> Result<FractalBenchmarkReport> {
        let spec = RequestSpec::post(FRACTAL_BENCHMARK_PATH, None, self.inner.config.timeouts.benchmark);
        self.inner.pipeline.call_with(&spec, &self.inner.benchmark_retry).await
    }

    /// Fetches the service's host description.
    ///
    /// # Errors
    ///
    /// Returns the terminal error of the request pipeline.
    pub async fn system_info(&self) -> Result<SystemInfo> {
        let spec = RequestSpec::get(SYSTEM_PATH, self.inner.config.timeouts.request);
        self.inner.pipeline.call(&spec).await
    }

    /// Renders a fractal on the service.
    ///
    /// The parameters are [clamped][FractalParams::clamped] first and sent as the query string
    /// of a `POST` to the fractal kind's path. Requests whose clamped
    /// parameters share a cache key are coalesced: while one is in flight, identical calls wait
    /// for it, and its successful result is served from the cache until the TTL runs out.
    ///
    /// # Errors
    ///
    /// Returns the terminal error of the request pipeline, shared by every coalesced caller.
    pub async fn generate_fractal(&self, params: FractalParams) -> Result<Arc<FractalImage>> {
        let params = params.clamped();
        let key = params.canonical_key(self.inner.config.cache.key_precision);
        let timeouts = &self.inner.config.timeouts;
        let spec = RequestSpec::post(
            params.kind.path(),
            None,
            params.timeout(timeouts.fractal_base, timeouts.fractal_max),
        )
        .with_query(params.query_pairs());
        let pipeline = self.inner.pipeline.clone();

        self.inner
            .fractals
            .execute(key, move || async move { pipeline.call::<FractalImage>(&spec).await.map(Arc::new) })
            .await
    }

    /// Queries the service's health endpoint.
    ///
    /// # Errors
    ///
    /// Returns the terminal error of the request pipeline.
    pub async fn health(&self) -> Result<HealthReport> {
        let spec = RequestSpec::get(HEALTH_PATH, self.inner.config.timeouts.request);
        self.inner.pipeline.call(&spec).await
    }

    /// Queries the service's readiness check.
    ///
    /// A service that is not ready answers `503`, which surfaces as [`Error::Server`][crate::Error::Server]
    /// after the usual retries and counts against the readiness circuit.
    ///
    /// # Errors
    ///
    /// Returns the terminal error of the request pipeline.
    pub async fn readiness(&self) -> Result<ReadinessReport> {
        let spec = RequestSpec::get(READY_PATH, self.inner.config.timeouts.request);
        self.inner.pipeline.call(&spec).await
    }

    /// Queries the service's liveness check.
    ///
    /// # Errors
    ///
    /// Returns the terminal error of the request pipeline.
    pub async fn liveness(&self) -> Result<LivenessReport> {
        let spec = RequestSpec::get(LIVE_PATH, self.inner.config.timeouts.request);
        self.inner.pipeline.call(&spec).await
    }

    /// Fetches one snapshot, records its samples and evaluates the alert rules.
    ///
    /// Subscribers receive an [`Event::Metrics`] followed by one [`Event::Alert`] or
    /// [`Event::AlertCleared`] per alert transition. On failure the history is left untouched
    /// and subscribers receive an [`Event::PollFailed`].
    ///
    /// # Errors
    ///
    /// Returns the same error that was published.
    pub async fn poll_once(&self) -> Result<Arc<MetricsSnapshot>> {
        match self.fetch_metrics().await {
            Ok(snapshot) => {
                self.ingest(&snapshot);
                Ok(snapshot)
            }
            Err(error) => {
                tracing::event!(
                    name: "telltale.poll.failed",
                    tracing::Level::WARN,
                    error.kind = error.kind().as_str(),
                    error.degraded = error.is_degraded(),
                    error.message = %error,
                );
                self.inner.events.publish(&Event::PollFailed(error.clone()));
                Err(error)
            }
        }
    }

    /// Starts polling on a background task at the configured interval.
    ///
    /// The first poll happens immediately. The same task also sweeps expired entries out of
    /// the result cache. Polling stops when the returned handle is stopped or dropped.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn start_polling(&self) -> PollerHandle {
        poller::spawn(self.clone())
    }

    /// Registers `callback` for events of `kind`.
    ///
    /// Callbacks run synchronously on the task that publishes the event and must not block.
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(kind, callback)
    }

    /// Marks an active alert as resolved. Returns `false` if no unresolved alert has that id.
    pub fn resolve_alert(&self, id: &AlertId) -> bool {
        self.inner.alerts.lock().resolve(id, Timestamp::now())
    }

    /// Unresolved alerts, oldest first.
    #[must_use]
    pub fn active_alerts(&self) -> Vec<Alert> {
        self.inner.alerts.lock().active_alerts()
    }

    /// Recently raised alerts, oldest first, including cleared and resolved ones.
    #[must_use]
    pub fn alert_history(&self) -> Vec<Alert> {
        self.inner.alerts.lock().history()
    }

    /// The most recent sample of `metric`.
    #[must_use]
    pub fn latest(&self, metric: &str) -> Option<MetricSample> {
        self.inner.history.lock().latest(metric)
    }

    /// Recorded samples of `metric` inside `range`, oldest first.
    #[must_use]
    pub fn history(&self, metric: &str, range: TimeRange) -> Vec<MetricSample> {
        self.inner.history.lock().range(metric, range)
    }

    /// Statistics over the recorded window of `metric`.
    #[must_use]
    pub fn summary(&self, metric: &str) -> Option<Summary> {
        self.inner.history.lock().summary(metric)
    }

    /// State of the circuit guarding `endpoint`, e.g. `"/api/performance/metrics"`.
    #[must_use]
    pub fn circuit_state(&self, endpoint: &str) -> CircuitState {
        self.inner.pipeline.circuits().state(endpoint)
    }

    /// Counters of the fractal result cache.
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.fractals.stats()
    }

    /// Drops expired fractal results and returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        self.inner.fractals.purge_expired()
    }

    async fn fetch_metrics(&self) -> Result<Arc<MetricsSnapshot>> {
        let spec = RequestSpec::get(METRICS_PATH, self.inner.config.timeouts.request);
        let snapshot = Arc::new(self.inner.pipeline.call::<MetricsSnapshot>(&spec).await?);

        *self.inner.snapshot.lock() = Some((Instant::now(), Arc::clone(&snapshot)));
        Ok(snapshot)
    }

    fn ingest(&self, snapshot: &Arc<MetricsSnapshot>) {
        let transitions: Vec<AlertTransition> = {
            let mut history = self.inner.history.lock();
            let mut alerts = self.inner.alerts.lock();

            snapshot
                .samples()
                .into_iter()
                .flat_map(|sample| {
                    let transitions = alerts.evaluate(&sample);
                    history.record(sample);
                    transitions
                })
                .collect()
        };

        let events = &self.inner.events;
        events.publish(&Event::Metrics(Arc::clone(snapshot)));
        for transition in transitions {
            match transition {
                AlertTransition::Raised(alert) => events.publish(&Event::Alert(alert)),
                AlertTransition::Cleared(alert) => events.publish(&Event::AlertCleared(alert)),
            };
        }
    }
}
