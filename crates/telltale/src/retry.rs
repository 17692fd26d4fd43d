// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::{Debug, Display};
use std::time::Duration;

use crate::config::RetryOptions;
use crate::{Error, Result};

/// Largest deviation jitter applies to a delay, relative to the delay.
const JITTER: f64 = 0.25;

/// A single attempt of a retried operation.
///
/// Indices are 0-based: attempt 0 is the initial try, attempt `k` is the `k`-th retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    index: u32,
    is_last: bool,
}

impl Default for Attempt {
    fn default() -> Self {
        Self::new(0, true)
    }
}

impl Attempt {
    /// Attempt number `index`; `is_last` marks the final permitted attempt.
    #[must_use]
    pub const fn new(index: u32, is_last: bool) -> Self {
        Self { index, is_last }
    }

    /// Whether this is the initial try.
    #[must_use]
    pub const fn is_first(self) -> bool {
        self.index == 0
    }

    /// Whether no further attempt follows this one, regardless of its outcome.
    #[must_use]
    pub const fn is_last(self) -> bool {
        self.is_last
    }

    /// 0-based attempt number.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    fn increment(self, max_retries: u32) -> Option<Self> {
        if self.index >= max_retries {
            return None;
        }

        let next = self.index.saturating_add(1);
        Some(Self::new(next, next >= max_retries))
    }
}

impl Display for Attempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.index, f)
    }
}

/// Non-cryptographic randomness for jitter; replaceable with a fixed source in tests.
#[derive(Clone, Default)]
enum Rnd {
    #[default]
    Real,

    #[cfg(test)]
    Fixed(f64),
}

impl Debug for Rnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Real => write!(f, "Real"),
            #[cfg(test)]
            Self::Fixed(value) => write!(f, "Fixed({value})"),
        }
    }
}

impl Rnd {
    fn next_f64(&self) -> f64 {
        match self {
            Self::Real => fastrand::f64(),
            #[cfg(test)]
            Self::Fixed(value) => *value,
        }
    }
}

/// Bounded exponential retry of transient failures.
///
/// The delay before retry `k` (k ≥ 1) is `base_delay × 2^k`, optionally capped by `max_delay`
/// and optionally jittered by ±25%. Only [transient][Error::is_transient] errors are retried;
/// timeouts can additionally be excluded per call with [`RetryPolicy::no_retry_on_timeout`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Option<Duration>,
    jitter: bool,
    retry_timeouts: bool,
    rnd: Rnd,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryOptions::default())
    }
}

impl From<&RetryOptions> for RetryPolicy {
    fn from(options: &RetryOptions) -> Self {
        Self {
            max_retries: options.max_retries,
            base_delay: options.base_delay,
            max_delay: options.max_delay,
            jitter: options.jitter,
            retry_timeouts: true,
            rnd: Rnd::Real,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    #[must_use]
    pub fn never() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Returns a copy that surfaces timeouts immediately instead of retrying them.
    #[must_use]
    pub fn no_retry_on_timeout(mut self) -> Self {
        self.retry_timeouts = false;
        self
    }

    /// Retries allowed after the initial try.
    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether `error` warrants another attempt under this policy.
    #[must_use]
    pub fn should_retry(&self, error: &Error) -> bool {
        match error {
            Error::Timeout { .. } => self.retry_timeouts,
            other => other.is_transient(),
        }
    }

    /// The delays before retries 1, 2, 3, ...
    pub fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
        DelaysIter {
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            jitter: self.jitter,
            rnd: self.rnd.clone(),
            attempt: 1,
        }
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error, or the retries
    /// are exhausted, in which case the last error is returned.
    ///
    /// `label` only identifies the operation in log events.
    ///
    /// # Errors
    ///
    /// Returns the error of the final attempt.
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delays = self.delays();
        let mut attempt = Attempt::new(0, self.max_retries == 0);

        loop {
            let error = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !self.should_retry(&error) {
                return Err(error);
            }

            let Some(next) = attempt.increment(self.max_retries) else {
                tracing::event!(
                    name: "telltale.retry.exhausted",
                    tracing::Level::WARN,
                    retry.operation = label,
                    retry.attempt.index = attempt.index(),
                    error.kind = %error.kind(),
                    error.message = %error,
                );
                return Err(error);
            };

            let delay = delays.next().unwrap_or(Duration::ZERO);

            tracing::event!(
                name: "telltale.retry",
                tracing::Level::WARN,
                retry.operation = label,
                retry.attempt.index = attempt.index(),
                retry.attempt.is_last = next.is_last(),
                retry.delay = delay.as_secs_f32(),
                error.kind = %error.kind(),
            );

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            attempt = next;
        }
    }

    #[cfg(test)]
    fn with_fixed_rnd(mut self, value: f64) -> Self {
        self.rnd = Rnd::Fixed(value);
        self
    }
}

#[derive(Debug)]
struct DelaysIter {
    base_delay: Duration,
    max_delay: Option<Duration>,
    jitter: bool,
    rnd: Rnd,
    attempt: u32,
}

impl Iterator for DelaysIter {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if self.base_delay.is_zero() {
            return Some(Duration::ZERO);
        }

        let mut delay = doubled(self.base_delay, self.attempt);
        if self.jitter {
            delay = jittered(delay, self.rnd.next_f64());
        }

        self.attempt = self.attempt.saturating_add(1);
        Some(self.max_delay.map_or(delay, |max| delay.min(max)))
    }
}

/// `base × 2^exponent`, saturating at [`Duration::MAX`].
fn doubled(base: Duration, exponent: u32) -> Duration {
    match 2_u32.checked_pow(exponent) {
        Some(factor) => base.saturating_mul(factor),
        None if base.is_zero() => Duration::ZERO,
        None => Duration::MAX,
    }
}

/// Scales `delay` by `1 ± JITTER`, where `unit` in `[0, 1]` picks the point in that band.
fn jittered(delay: Duration, unit: f64) -> Duration {
    let factor = JITTER.mul_add(2.0f64.mul_add(unit, -1.0), 1.0);
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}
