// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::models::Validate;
use crate::{CircuitRegistry, RequestExecutor, RequestSpec, Result, RetryPolicy};

/// The resilience stack every call goes through: retry, then circuit breaker, then executor.
///
/// Each retry attempt is guarded by the circuit on its own, so a circuit that opens halfway
/// through the retries stops the remaining attempts with [`Error::CircuitOpen`][crate::Error::CircuitOpen],
/// which is never retried.
#[derive(Debug, Clone)]
pub(crate) struct Pipeline {
    executor: RequestExecutor,
    circuits: Arc<CircuitRegistry>,
    retry: RetryPolicy,
}

impl Pipeline {
    pub fn new(executor: RequestExecutor, circuits: Arc<CircuitRegistry>, retry: RetryPolicy) -> Self {
        Self { executor, circuits, retry }
    }

    pub fn circuits(&self) -> &CircuitRegistry {
        &self.circuits
    }

    /// Runs `spec` under the default retry policy.
    pub async fn call<T>(&self, spec: &RequestSpec) -> Result<T>
    where
        T: DeserializeOwned + Validate,
    {
        self.call_with(spec, &self.retry).await
    }

    /// Runs `spec` under `retry` instead of the default policy.
    pub async fn call_with<T>(&self, spec: &RequestSpec, retry: &RetryPolicy) -> Result<T>
    where
        T: DeserializeOwned + Validate,
    {
        retry
            .run(spec.path(), |_attempt| {
                self.circuits
                    .guard(spec.path(), || self.executor.execute::<T>(spec))
            })
            .await
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::config::{BreakerOptions, RetryOptions};
    use crate::models::HealthReport;
    use crate::testing::{FakeTransport, Reply};
    use crate::{CircuitState, Error};

    fn pipeline(transport: &FakeTransport, failure_threshold: u32) -> Pipeline {
        Pipeline::new(
            RequestExecutor::new(Arc::new(transport.clone()), "http://service.test"),
            Arc::new(CircuitRegistry::new(BreakerOptions {
                failure_threshold,
                cooldown: Duration::from_secs(30),
            })),
            RetryPolicy::from(&RetryOptions::default()),
        )
    }

    fn spec() -> RequestSpec {
        RequestSpec::get("/health", Duration::from_secs(1))
    }

    fn healthy() -> Reply {
        Reply::json(&json!({ "status": "healthy", "timestamp": "2024-05-01T12:00:00Z" }))
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried_through_the_circuit() {
        let transport = FakeTransport::new();
        transport.push(Reply::status(503, &json!({}))).push(healthy());
        let pipeline = pipeline(&transport, 5);

        let report: HealthReport = pipeline.call(&spec()).await.unwrap();

        assert!(report.status.is_serving());
        assert_eq!(transport.calls(), 2);
        assert_eq!(pipeline.circuits().state("/health"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn opening_circuit_stops_remaining_retries() {
        let transport = FakeTransport::new();
        transport.fallback(Reply::Fail("connection refused".to_string()));
        let pipeline = pipeline(&transport, 2);

        let error = pipeline.call::<HealthReport>(&spec()).await.unwrap_err();

        assert!(error.is_degraded());
        assert_eq!(transport.calls(), 2);

        let again = pipeline.call::<HealthReport>(&spec()).await.unwrap_err();
        assert!(matches!(again, Error::CircuitOpen { .. }));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn benchmark_style_policy_does_not_retry_timeouts() {
        let transport = FakeTransport::new();
        transport.fallback(Reply::Hang);
        let pipeline = pipeline(&transport, 5);
        let policy = RetryPolicy::from(&RetryOptions::default()).no_retry_on_timeout();

        let error = pipeline.call_with::<HealthReport>(&spec(), &policy).await.unwrap_err();

        assert!(matches!(error, Error::Timeout { .. }));
        assert_eq!(transport.calls(), 1);
    }
}
