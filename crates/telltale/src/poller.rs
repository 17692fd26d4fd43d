// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::TelemetryClient;

/// Controls the background polling task started by
/// [`TelemetryClient::start_polling`][crate::TelemetryClient::start_polling].
///
/// Polling and cache sweeping run concurrently on one task, so a poll that is waiting out its
/// retries does not hold back the sweep. Dropping the handle stops both.
#[derive(Debug)]
#[must_use = "dropping the handle stops polling"]
pub struct PollerHandle {
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Stops polling. A poll in progress is cancelled.
    pub fn stop(self) {
        drop(self);
    }

    /// Whether the task is still alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        if !self.task.is_finished() {
            self.task.abort();
            tracing::event!(name: "telltale.poller.stopped", tracing::Level::INFO, "polling stopped");
        }
    }
}

pub(crate) fn spawn(client: TelemetryClient) -> PollerHandle {
    let poll_every = client.config().poll.interval;
    let sweep_every = client.config().cache.sweep_interval;

    tracing::event!(
        name: "telltale.poller.started",
        tracing::Level::INFO,
        poll.interval = poll_every.as_secs_f32(),
        cache.sweep_interval = sweep_every.as_secs_f32(),
    );

    let task = tokio::spawn(async move {
        let polling = async {
            let mut poll = tokio::time::interval(poll_every);
            poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                poll.tick().await;
                // Failures were already published as `Event::PollFailed`.
                let _ = client.poll_once().await;
            }
        };

        let sweeping = async {
            let mut sweep = tokio::time::interval_at(Instant::now() + sweep_every, sweep_every);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                sweep.tick().await;
                let purged = client.purge_expired();
                if purged > 0 {
                    tracing::event!(name: "telltale.cache.swept", tracing::Level::DEBUG, cache.purged = purged);
                }
            }
        };

        tokio::join!(polling, sweeping);
    });

    PollerHandle { task }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use crate::models::FractalParams;
    use crate::models::metrics::tests::snapshot_json;
    use crate::testing::{FakeTransport, Reply};
    use crate::{ClientConfig, TelemetryClient};

    fn client(transport: &FakeTransport, config: ClientConfig) -> TelemetryClient {
        TelemetryClient::new(config, Arc::new(transport.clone())).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn polls_on_interval_until_stopped() {
        let transport = FakeTransport::new();
        transport.fallback(Reply::json(&snapshot_json(10.0)));
        let client = client(&transport, ClientConfig::new("http://service.test").poll_interval(Duration::from_secs(5)));

        let poller = client.start_polling();
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(poller.is_running());
        assert_eq!(transport.calls(), 3);

        poller.stop();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_stop_polling() {
        let transport = FakeTransport::new();
        transport
            .push(Reply::status(404, &json!({ "message": "not found" })))
            .fallback(Reply::json(&snapshot_json(10.0)));
        let client = client(
            &transport,
            ClientConfig::new("http://service.test")
                .poll_interval(Duration::from_secs(5))
                .failure_threshold(5),
        );

        let _poller = client.start_polling();
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(transport.calls(), 2);
        assert!(client.latest("cpu_usage_percent").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_runs_while_a_poll_is_retrying() {
        let transport = FakeTransport::new();
        transport.push(Reply::json(&json!({
            "data": vec![0_u8; 64 * 64 * 4],
            "width": 64,
            "height": 64,
            "computation_time_ms": 5,
            "zoom_level": 1.0,
        })));
        transport.fallback(Reply::Hang);
        let mut config = ClientConfig::new("http://service.test")
            .poll_interval(Duration::from_secs(3600))
            .cache_ttl(Duration::from_secs(10))
            .request_timeout(Duration::from_secs(60))
            .failure_threshold(10);
        config.cache.sweep_interval = Duration::from_secs(20);
        let client = client(&transport, config);

        client.generate_fractal(FractalParams::mandelbrot().with_size(64, 64)).await.unwrap();

        let _poller = client.start_polling();
        tokio::time::sleep(Duration::from_secs(21)).await;

        assert_eq!(transport.calls(), 2);
        assert_eq!(client.cache_stats().entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeps_expired_cache_entries() {
        let transport = FakeTransport::new();
        transport.fallback(Reply::json(&json!({
            "data": vec![0_u8; 64 * 64 * 4],
            "width": 64,
            "height": 64,
            "computation_time_ms": 5,
            "zoom_level": 1.0,
        })));
        let mut config = ClientConfig::new("http://service.test")
            .poll_interval(Duration::from_secs(3600))
            .cache_ttl(Duration::from_secs(30));
        config.cache.sweep_interval = Duration::from_secs(60);
        let client = client(&transport, config);

        client.generate_fractal(FractalParams::mandelbrot().with_size(64, 64)).await.unwrap();
        assert_eq!(client.cache_stats().entries, 1);

        let _poller = client.start_polling();
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(client.cache_stats().entries, 0);
    }
}
