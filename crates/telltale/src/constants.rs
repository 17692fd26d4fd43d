// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

/// Consecutive failures that open an endpoint's circuit.
///
/// A low threshold suits a client that polls a single backend: two failures in a row are a
/// strong signal that the backend is down and further calls only add latency.
pub(crate) const DEFAULT_FAILURE_THRESHOLD: u32 = 2;

/// Time an open circuit waits after its last failure before admitting a trial call.
pub(crate) const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

/// Retries performed after the first attempt.
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 2;

/// Base delay of the exponential backoff schedule.
///
/// The delay before retry `k` is `base * 2^k`, so the defaults wait 2s and then 4s.
pub(crate) const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Jitter is off by default so that the backoff schedule is deterministic.
pub(crate) const DEFAULT_USE_JITTER: bool = false;

/// Timeout of a regular request.
pub(crate) const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout of a benchmark run, which executes for a long time on the service.
pub(crate) const DEFAULT_BENCHMARK_TIMEOUT: Duration = Duration::from_secs(120);

/// Timeout of a fractal request of the lowest complexity class.
pub(crate) const DEFAULT_FRACTAL_BASE_TIMEOUT: Duration = Duration::from_secs(15);

/// Upper bound of the complexity-scaled fractal timeout.
pub(crate) const DEFAULT_FRACTAL_MAX_TIMEOUT: Duration = Duration::from_secs(90);

/// Time a coalesced result stays in the cache.
pub(crate) const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

/// Interval of the background sweep that drops expired cache entries.
pub(crate) const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Decimal places kept when floats become part of a cache key.
pub(crate) const DEFAULT_KEY_PRECISION: u8 = 6;

/// Interval between two metric polls.
pub(crate) const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(12);

/// Age under which a fetched snapshot is served without another request.
pub(crate) const DEFAULT_SNAPSHOT_MAX_AGE: Duration = Duration::from_secs(5);

/// Samples kept per metric history window.
pub(crate) const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Alerts kept in the alert history log.
pub(crate) const DEFAULT_ALERT_LOG_CAPACITY: usize = 50;

/// Proportional excess at which an alert is escalated from warning to error.
pub(crate) const DEFAULT_ERROR_RATIO: f64 = 0.05;

/// Proportional excess at which an alert is escalated from error to critical.
pub(crate) const DEFAULT_CRITICAL_RATIO: f64 = 0.15;

/// Header carrying the per-attempt correlation identifier.
pub(crate) const CORRELATION_HEADER: &str = "x-correlation-id";

pub(crate) const METRICS_PATH: &str = "/api/performance/metrics";
pub(crate) const SYSTEM_PATH: &str = "/api/performance/system";
pub(crate) const BENCHMARK_PATH: &str = "/api/performance/benchmark";
pub(crate) const HEALTH_PATH: &str = "/health";
pub(crate) const READY_PATH: &str = "/health/ready";
pub(crate) const LIVE_PATH: &str = "/health/live";
pub(crate) const MANDELBROT_PATH: &str = "/api/fractals/mandelbrot";
pub(crate) const JULIA_PATH: &str = "/api/fractals/julia";
pub(crate) const FRACTAL_BENCHMARK_PATH: &str = "/api/fractals/benchmark";
