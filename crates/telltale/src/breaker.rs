// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::fmt::Display;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::BreakerOptions;
use crate::{Error, Result};

/// Observable state of an endpoint's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected until the cooldown elapses.
    Open,
    /// A single trial call is in flight; everything else is rejected.
    HalfOpen,
}

impl CircuitState {
    /// Lowercase name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecutionMode {
    Normal,
    Trial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
}

#[derive(Debug)]
enum Enter {
    Accepted(ExecutionMode),
    Rejected { retry_after: Duration },
}

#[derive(Debug, Clone, Copy)]
enum State {
    Closed,
    Open { until: Instant },
    HalfOpen,
}

#[derive(Debug)]
struct Circuit {
    state: State,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

impl Circuit {
    const fn new() -> Self {
        Self {
            state: State::Closed,
            consecutive_failures: 0,
            last_failure: None,
        }
    }

    const fn public_state(&self) -> CircuitState {
        match self.state {
            State::Closed => CircuitState::Closed,
            State::Open { .. } => CircuitState::Open,
            State::HalfOpen => CircuitState::HalfOpen,
        }
    }

    fn enter(&mut self, now: Instant) -> Enter {
        match self.state {
            State::Closed => Enter::Accepted(ExecutionMode::Normal),
            State::Open { until } if now >= until => {
                self.state = State::HalfOpen;
                Enter::Accepted(ExecutionMode::Trial)
            }
            State::Open { until } => Enter::Rejected {
                retry_after: until.saturating_duration_since(now),
            },
            State::HalfOpen => Enter::Rejected { retry_after: Duration::ZERO },
        }
    }

    fn exit(&mut self, outcome: Outcome, mode: ExecutionMode, now: Instant, options: &BreakerOptions) -> Transition {
        if outcome == Outcome::Failure {
            self.last_failure = Some(now);
        }

        match (self.state, mode, outcome) {
            (State::Closed, _, Outcome::Success) => {
                self.consecutive_failures = 0;
                Transition::None
            }
            (State::Closed, _, Outcome::Failure) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= options.failure_threshold {
                    self.state = State::Open {
                        until: now + options.cooldown,
                    };
                    Transition::Opened
                } else {
                    Transition::None
                }
            }
            (State::HalfOpen, ExecutionMode::Trial, Outcome::Success) => {
                self.consecutive_failures = 0;
                self.state = State::Closed;
                Transition::Closed
            }
            (State::HalfOpen, ExecutionMode::Trial, Outcome::Failure) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.state = State::Open {
                    until: now + options.cooldown,
                };
                Transition::Reopened
            }
            // A call admitted while closed that fails after the circuit opened pushes the
            // cooldown out, since the cooldown runs from the last failure.
            (State::Open { .. }, ExecutionMode::Normal, Outcome::Failure) => {
                self.state = State::Open {
                    until: now + options.cooldown,
                };
                Transition::None
            }
            _ => Transition::None,
        }
    }

    fn abandon_trial(&mut self, now: Instant) {
        if matches!(self.state, State::HalfOpen) {
            self.state = State::Open { until: now };
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    None,
    Opened,
    Closed,
    Reopened,
}

/// Per-endpoint circuit breakers.
///
/// One circuit exists per distinct endpoint path, created on first use. A circuit opens after
/// `failure_threshold` consecutive failures and rejects calls with [`Error::CircuitOpen`] until
/// `cooldown` has passed since the last failure. The next call after that is a trial: while it
/// is in flight every other caller is rejected, its success closes the circuit and its failure
/// reopens it for another cooldown.
///
/// Only errors that reflect the endpoint's health count as failures, see
/// [`Error::counts_against_circuit`].
#[derive(Debug)]
pub struct CircuitRegistry {
    circuits: Mutex<HashMap<String, Circuit>>,
    options: BreakerOptions,
}

impl CircuitRegistry {
    /// A registry whose circuits are all created closed on first use.
    #[must_use]
    pub fn new(options: BreakerOptions) -> Self {
        Self {
            circuits: Mutex::new(HashMap::new()),
            options,
        }
    }

    /// Runs `operation` if the circuit for `endpoint` admits it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CircuitOpen`] without invoking `operation` when the circuit rejects the
    /// call; otherwise returns whatever `operation` returns.
    pub async fn guard<T, F, Fut>(&self, endpoint: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mode = match self.enter(endpoint) {
            Enter::Accepted(mode) => mode,
            Enter::Rejected { retry_after } => {
                return Err(Error::CircuitOpen {
                    endpoint: endpoint.to_string(),
                    retry_after,
                });
            }
        };

        let mut pending = PendingExit {
            registry: self,
            endpoint,
            mode,
            settled: false,
        };

        let result = operation().await;

        pending.settle(match &result {
            Err(error) if error.counts_against_circuit() => Outcome::Failure,
            _ => Outcome::Success,
        });

        result
    }

    /// The current state of the circuit for `endpoint`; unknown endpoints are closed.
    ///
    /// An open circuit whose cooldown has elapsed is still reported as open until the next
    /// call turns it into a trial.
    #[must_use]
    pub fn state(&self, endpoint: &str) -> CircuitState {
        self.circuits
            .lock()
            .get(endpoint)
            .map_or(CircuitState::Closed, Circuit::public_state)
    }

    /// The number of consecutive failures recorded for `endpoint`.
    #[must_use]
    pub fn consecutive_failures(&self, endpoint: &str) -> u32 {
        self.circuits.lock().get(endpoint).map_or(0, |circuit| circuit.consecutive_failures)
    }

    /// When the last failure for `endpoint` was recorded.
    #[must_use]
    pub fn last_failure(&self, endpoint: &str) -> Option<Instant> {
        self.circuits.lock().get(endpoint).and_then(|circuit| circuit.last_failure)
    }

    /// Forgets everything about `endpoint`, closing its circuit.
    pub fn reset(&self, endpoint: &str) {
        if self.circuits.lock().remove(endpoint).is_some() {
            tracing::event!(
                name: "telltale.circuit.reset",
                tracing::Level::INFO,
                circuit.endpoint = endpoint,
            );
        }
    }

    fn enter(&self, endpoint: &str) -> Enter {
        let now = Instant::now();

        let enter = self
            .circuits
            .lock()
            .entry(endpoint.to_string())
            .or_insert_with(Circuit::new)
            .enter(now);

        match &enter {
            Enter::Accepted(ExecutionMode::Trial) => tracing::event!(
                name: "telltale.circuit.trial",
                tracing::Level::INFO,
                circuit.endpoint = endpoint,
                circuit.state = CircuitState::HalfOpen.as_str(),
            ),
            Enter::Rejected { retry_after } => tracing::event!(
                name: "telltale.circuit.rejected",
                tracing::Level::WARN,
                circuit.endpoint = endpoint,
                circuit.retry_after = retry_after.as_secs_f32(),
            ),
            Enter::Accepted(ExecutionMode::Normal) => {}
        }

        enter
    }

    fn exit(&self, endpoint: &str, outcome: Outcome, mode: ExecutionMode) {
        let now = Instant::now();

        let (transition, failures) = {
            let mut circuits = self.circuits.lock();
            let circuit = circuits.entry(endpoint.to_string()).or_insert_with(Circuit::new);
            (circuit.exit(outcome, mode, now, &self.options), circuit.consecutive_failures)
        };

        match transition {
            Transition::Opened => tracing::event!(
                name: "telltale.circuit.opened",
                tracing::Level::WARN,
                circuit.endpoint = endpoint,
                circuit.failures = failures,
                circuit.cooldown = self.options.cooldown.as_secs_f32(),
            ),
            Transition::Reopened => tracing::event!(
                name: "telltale.circuit.reopened",
                tracing::Level::WARN,
                circuit.endpoint = endpoint,
                circuit.cooldown = self.options.cooldown.as_secs_f32(),
            ),
            Transition::Closed => tracing::event!(
                name: "telltale.circuit.closed",
                tracing::Level::INFO,
                circuit.endpoint = endpoint,
            ),
            Transition::None => {}
        }
    }

    fn abandon(&self, endpoint: &str) {
        let now = Instant::now();
        if let Some(circuit) = self.circuits.lock().get_mut(endpoint) {
            circuit.abandon_trial(now);
        }
    }
}

/// Settles an admitted call. A trial dropped before settling hands the trial to the next caller.
struct PendingExit<'a> {
    registry: &'a CircuitRegistry,
    endpoint: &'a str,
    mode: ExecutionMode,
    settled: bool,
}

impl PendingExit<'_> {
    fn settle(&mut self, outcome: Outcome) {
        self.settled = true;
        self.registry.exit(self.endpoint, outcome, self.mode);
    }
}

impl Drop for PendingExit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.mode == ExecutionMode::Trial {
            self.registry.abandon(self.endpoint);
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use futures_util::FutureExt;
    use tokio::sync::oneshot;

    use super::*;
    use crate::ApiError;

    const ENDPOINT: &str = "/api/performance/metrics";

    fn registry() -> CircuitRegistry {
        CircuitRegistry::new(BreakerOptions {
            failure_threshold: 2,
            cooldown: Duration::from_secs(30),
        })
    }

    fn server_error() -> Error {
        Error::Server {
            endpoint: ENDPOINT.to_string(),
            status: 500,
            body: ApiError::from_status(http::StatusCode::INTERNAL_SERVER_ERROR),
        }
    }

    async fn fail(registry: &CircuitRegistry) -> Result<()> {
        registry.guard(ENDPOINT, || async { Err(server_error()) }).await
    }

    async fn succeed(registry: &CircuitRegistry) -> Result<u32> {
        registry.guard(ENDPOINT, || async { Ok(7) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_rejects_without_calling() {
        let registry = registry();
        fail(&registry).await.unwrap_err();
        assert_eq!(registry.state(ENDPOINT), CircuitState::Closed);
        fail(&registry).await.unwrap_err();
        assert_eq!(registry.state(ENDPOINT), CircuitState::Open);

        let calls = AtomicU32::new(0);
        let error = registry
            .guard(ENDPOINT, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await
            .unwrap_err();

        assert!(error.is_degraded());
        assert!(matches!(error, Error::CircuitOpen { retry_after, .. } if retry_after == Duration::from_secs(30)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_consecutive_failures() {
        let registry = registry();
        fail(&registry).await.unwrap_err();
        succeed(&registry).await.unwrap();
        fail(&registry).await.unwrap_err();

        assert_eq!(registry.state(ENDPOINT), CircuitState::Closed);
        assert_eq!(registry.consecutive_failures(ENDPOINT), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_do_not_trip_the_circuit() {
        let registry = registry();
        for _ in 0..5 {
            let result: Result<()> = registry
                .guard(ENDPOINT, || async {
                    Err(Error::Client {
                        endpoint: ENDPOINT.to_string(),
                        status: 404,
                        body: ApiError::from_status(http::StatusCode::NOT_FOUND),
                    })
                })
                .await;
            result.unwrap_err();
        }

        assert_eq!(registry.state(ENDPOINT), CircuitState::Closed);
        assert_eq!(registry.consecutive_failures(ENDPOINT), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn single_trial_after_cooldown_closes_on_success() {
        let registry = registry();
        fail(&registry).await.unwrap_err();
        fail(&registry).await.unwrap_err();

        tokio::time::advance(Duration::from_secs(30)).await;

        let (release, hold) = oneshot::channel::<()>();
        let trial = registry.guard(ENDPOINT, || async move {
            hold.await.ok();
            Ok(1)
        });
        tokio::pin!(trial);
        assert!((&mut trial).now_or_never().is_none());
        assert_eq!(registry.state(ENDPOINT), CircuitState::HalfOpen);

        let calls = AtomicU32::new(0);
        let concurrent = registry
            .guard(ENDPOINT, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(2) }
            })
            .await;
        assert!(matches!(concurrent, Err(Error::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        release.send(()).unwrap();
        assert_eq!(trial.await, Ok(1));
        assert_eq!(registry.state(ENDPOINT), CircuitState::Closed);
        assert_eq!(registry.consecutive_failures(ENDPOINT), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_restarts_cooldown() {
        let registry = registry();
        fail(&registry).await.unwrap_err();
        fail(&registry).await.unwrap_err();

        tokio::time::advance(Duration::from_secs(31)).await;
        fail(&registry).await.unwrap_err();
        assert_eq!(registry.state(ENDPOINT), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(succeed(&registry).await.unwrap_err().is_degraded());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(succeed(&registry).await, Ok(7));
        assert_eq!(registry.state(ENDPOINT), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_trial_lets_the_next_caller_trial() {
        let registry = registry();
        fail(&registry).await.unwrap_err();
        fail(&registry).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(30)).await;

        {
            let trial = registry.guard(ENDPOINT, || std::future::pending::<Result<()>>());
            tokio::pin!(trial);
            assert!((&mut trial).now_or_never().is_none());
            assert_eq!(registry.state(ENDPOINT), CircuitState::HalfOpen);
        }

        assert_eq!(succeed(&registry).await, Ok(7));
        assert_eq!(registry.state(ENDPOINT), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn late_failure_extends_cooldown() {
        let registry = registry();
        let (release, hold) = oneshot::channel::<()>();

        let slow = registry.guard(ENDPOINT, || async move {
            hold.await.ok();
            Err::<(), _>(server_error())
        });
        tokio::pin!(slow);
        assert!((&mut slow).now_or_never().is_none());

        fail(&registry).await.unwrap_err();
        fail(&registry).await.unwrap_err();
        assert_eq!(registry.state(ENDPOINT), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(20)).await;
        release.send(()).unwrap();
        slow.await.unwrap_err();

        tokio::time::advance(Duration::from_secs(15)).await;
        assert!(succeed(&registry).await.unwrap_err().is_degraded());

        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(succeed(&registry).await, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn circuits_are_isolated_per_endpoint() {
        let registry = registry();
        fail(&registry).await.unwrap_err();
        fail(&registry).await.unwrap_err();

        let other = registry.guard("/health", || async { Ok(()) }).await;

        assert_eq!(other, Ok(()));
        assert_eq!(registry.state("/health"), CircuitState::Closed);
        assert_eq!(registry.state(ENDPOINT), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_closes_the_circuit() {
        let registry = registry();
        fail(&registry).await.unwrap_err();
        fail(&registry).await.unwrap_err();
        assert!(registry.last_failure(ENDPOINT).is_some());

        registry.reset(ENDPOINT);

        assert_eq!(registry.state(ENDPOINT), CircuitState::Closed);
        assert_eq!(succeed(&registry).await, Ok(7));
    }
}
