// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::alerts::{Comparison, SeverityBands, ThresholdRule};
use crate::constants::*;

/// Configuration of a [`TelemetryClient`][crate::TelemetryClient].
///
/// Every value has a default, so a configuration only needs the base URL of the service.
/// Settings can be adjusted with the fluent setters or by mutating the grouped option structs
/// directly. Configurations can also be loaded from JSON, where durations are given in
/// milliseconds and missing fields fall back to their defaults:
///
/// ```rust
/// use std::time::Duration;
/// use telltale::ClientConfig;
///
/// let config = ClientConfig::from_json(
///     r#"{
///         "base_url": "http://metrics.internal:8080",
///         "poll": { "interval_ms": 15000 },
///         "breaker": { "failure_threshold": 3 }
///     }"#,
/// )?;
///
/// assert_eq!(config.poll.interval, Duration::from_secs(15));
/// assert_eq!(config.breaker.failure_threshold, 3);
/// assert_eq!(config.breaker.cooldown, Duration::from_secs(30));
/// # Ok::<(), telltale::ConfigError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[non_exhaustive]
pub struct ClientConfig {
    /// Scheme, host and port of the service, e.g. `http://localhost:8080`.
    pub base_url: String,
    /// Circuit breaker settings.
    pub breaker: BreakerOptions,
    /// Retry and backoff settings.
    pub retry: RetryOptions,
    /// Per-operation timeouts.
    pub timeouts: TimeoutOptions,
    /// Result cache settings.
    pub cache: CacheOptions,
    /// Metric polling and history settings.
    pub poll: PollOptions,
    /// Alert rules and alert log settings.
    pub alerts: AlertOptions,
}

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[non_exhaustive]
pub struct BreakerOptions {
    /// Consecutive failures that open a circuit.
    pub failure_threshold: u32,
    /// Time after the last failure before a trial call is admitted.
    #[serde(rename = "cooldown_ms", with = "duration_ms")]
    pub cooldown: Duration,
}

/// Retry and backoff settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[non_exhaustive]
pub struct RetryOptions {
    /// Retries performed after the first attempt.
    pub max_retries: u32,
    /// Base of the exponential backoff; the delay before retry `k` is `base_delay * 2^k`.
    #[serde(rename = "base_delay_ms", with = "duration_ms")]
    pub base_delay: Duration,
    /// Optional cap on a single backoff delay.
    #[serde(rename = "max_delay_ms", with = "option_duration_ms")]
    pub max_delay: Option<Duration>,
    /// Randomizes delays by ±25% to desynchronize clients.
    pub jitter: bool,
}

/// Per-operation timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[non_exhaustive]
pub struct TimeoutOptions {
    /// Timeout of regular requests (metrics, health).
    #[serde(rename = "request_ms", with = "duration_ms")]
    pub request: Duration,
    /// Timeout of a benchmark run.
    #[serde(rename = "benchmark_ms", with = "duration_ms")]
    pub benchmark: Duration,
    /// Timeout of a fractal request of the lowest complexity.
    #[serde(rename = "fractal_base_ms", with = "duration_ms")]
    pub fractal_base: Duration,
    /// Upper bound of the complexity-scaled fractal timeout.
    #[serde(rename = "fractal_max_ms", with = "duration_ms")]
    pub fractal_max: Duration,
}

/// Result cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[non_exhaustive]
pub struct CacheOptions {
    /// Time a result stays fresh.
    #[serde(rename = "ttl_ms", with = "duration_ms")]
    pub ttl: Duration,
    /// Interval of the background sweep of expired entries.
    #[serde(rename = "sweep_interval_ms", with = "duration_ms")]
    pub sweep_interval: Duration,
    /// Decimal places kept when floats become part of a cache key.
    pub key_precision: u8,
}

/// Metric polling and history settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[non_exhaustive]
pub struct PollOptions {
    /// Interval between two polls.
    #[serde(rename = "interval_ms", with = "duration_ms")]
    pub interval: Duration,
    /// Age under which [`current_metrics`][crate::TelemetryClient::current_metrics] serves the
    /// last snapshot without a request.
    #[serde(rename = "snapshot_max_age_ms", with = "duration_ms")]
    pub snapshot_max_age: Duration,
    /// Samples kept per metric.
    pub history_capacity: usize,
}

/// Alert rules and alert log settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[non_exhaustive]
pub struct AlertOptions {
    /// Threshold rules evaluated against every sample.
    pub rules: Vec<ThresholdRule>,
    /// Alerts kept in the history log.
    pub log_capacity: usize,
    /// Excess ratios that escalate alert severity.
    pub bands: SeverityBands,
}

/// A configuration that could not be loaded or is not usable.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read configuration from {}", path.display())]
    Io {
        /// The file that was read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration is not valid JSON or has unknown fields.
    #[error("cannot parse configuration")]
    Parse(#[from] serde_json::Error),

    /// A setting has a value that cannot work.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// The offending setting.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

impl ClientConfig {
    /// Creates a configuration with default settings for the service at `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Parses a JSON configuration and validates it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON and [`ConfigError::Invalid`] when a
    /// setting fails [`validate`][Self::validate].
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] when the file cannot be read, otherwise the errors of
    /// [`from_json`][Self::from_json].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// Checks that every setting has a workable value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(invalid("base_url", format!("'{}' is not an http(s) URL", self.base_url)));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold", "must be at least 1"));
        }
        if self.poll.interval.is_zero() {
            return Err(invalid("poll.interval_ms", "must be greater than zero"));
        }
        if self.cache.sweep_interval.is_zero() {
            return Err(invalid("cache.sweep_interval_ms", "must be greater than zero"));
        }
        if self.poll.history_capacity == 0 {
            return Err(invalid("poll.history_capacity", "must be at least 1"));
        }
        if self.alerts.log_capacity == 0 {
            return Err(invalid("alerts.log_capacity", "must be at least 1"));
        }
        if self.cache.key_precision > 12 {
            return Err(invalid("cache.key_precision", "must not exceed 12 decimal places"));
        }
        for (field, timeout) in [
            ("timeouts.request_ms", self.timeouts.request),
            ("timeouts.benchmark_ms", self.timeouts.benchmark),
            ("timeouts.fractal_base_ms", self.timeouts.fractal_base),
        ] {
            if timeout.is_zero() {
                return Err(invalid(field, "must be greater than zero"));
            }
        }
        if self.timeouts.fractal_max < self.timeouts.fractal_base {
            return Err(invalid("timeouts.fractal_max_ms", "must not be below timeouts.fractal_base_ms"));
        }
        if let Some(rule) = self.alerts.rules.iter().find(|rule| !rule.threshold.is_finite()) {
            return Err(invalid("alerts.rules", format!("threshold of '{}' is not finite", rule.metric)));
        }
        self.alerts.bands.validate().map_err(|reason| invalid("alerts.bands", reason))
    }

    /// Sets the base URL of the service.
    #[must_use]
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Sets the interval between two metric polls.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll.interval = interval;
        self
    }

    /// Sets the number of samples kept per metric.
    #[must_use]
    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.poll.history_capacity = capacity;
        self
    }

    /// Sets the time a coalesced result stays in the cache.
    #[must_use]
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache.ttl = ttl;
        self
    }

    /// Sets the consecutive failures that open a circuit.
    #[must_use]
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.breaker.failure_threshold = threshold;
        self
    }

    /// Sets the cooldown of an open circuit.
    #[must_use]
    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.breaker.cooldown = cooldown;
        self
    }

    /// Sets the retries performed after the first attempt.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.retry.max_retries = retries;
        self
    }

    /// Sets the base delay of the exponential backoff.
    #[must_use]
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.retry.base_delay = delay;
        self
    }

    /// Sets the timeout of regular requests.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.request = timeout;
        self
    }

    /// Replaces the alert rules.
    #[must_use]
    pub fn rules(mut self, rules: impl IntoIterator<Item = ThresholdRule>) -> Self {
        self.alerts.rules = rules.into_iter().collect();
        self
    }

    /// Adds an alert rule.
    #[must_use]
    pub fn rule(mut self, rule: ThresholdRule) -> Self {
        self.alerts.rules.push(rule);
        self
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            breaker: BreakerOptions::default(),
            retry: RetryOptions::default(),
            timeouts: TimeoutOptions::default(),
            cache: CacheOptions::default(),
            poll: PollOptions::default(),
            alerts: AlertOptions::default(),
        }
    }
}

impl Default for BreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: None,
            jitter: DEFAULT_USE_JITTER,
        }
    }
}

impl Default for TimeoutOptions {
    fn default() -> Self {
        Self {
            request: DEFAULT_REQUEST_TIMEOUT,
            benchmark: DEFAULT_BENCHMARK_TIMEOUT,
            fractal_base: DEFAULT_FRACTAL_BASE_TIMEOUT,
            fractal_max: DEFAULT_FRACTAL_MAX_TIMEOUT,
        }
    }
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_CACHE_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            key_precision: DEFAULT_KEY_PRECISION,
        }
    }
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            snapshot_max_age: DEFAULT_SNAPSHOT_MAX_AGE,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

impl Default for AlertOptions {
    fn default() -> Self {
        Self {
            rules: vec![
                ThresholdRule::new("cpu_usage_percent", Comparison::Above, 85.0),
                ThresholdRule::new("memory_usage_percent", Comparison::Above, 90.0),
                ThresholdRule::new("disk_usage_percent", Comparison::Above, 90.0),
            ],
            log_capacity: DEFAULT_ALERT_LOG_CAPACITY,
            bands: SeverityBands::default(),
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod option_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match duration {
            Some(duration) => super::duration_ms::serialize(duration, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|millis| millis.map(Duration::from_millis))
    }
}
