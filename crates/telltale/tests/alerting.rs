// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg(feature = "test-util")]

//! Integration tests for polling, alert lifecycle and event dispatch using only public API.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use telltale::testing::{FakeTransport, Reply};
use telltale::{AlertSeverity, ClientConfig, Comparison, Event, EventKind, TelemetryClient, ThresholdRule, TimeRange};
use tokio::time::Instant;
use tracing_test::traced_test;

fn metrics(timestamp: &str, cpu: f64, memory: f64) -> Reply {
    Reply::json(&json!({
        "timestamp": timestamp,
        "system": {
            "cpu_usage_percent": cpu,
            "memory_usage_percent": memory,
            "memory_total_gb": 32.0,
            "memory_available_gb": 8.0,
            "disk_usage_percent": 61.5,
            "load_average_1m": 2.0,
            "load_average_5m": 1.5,
            "load_average_15m": 1.0,
            "uptime_seconds": 86400,
            "active_processes": 300
        },
        "application": {
            "requests_handled": 1200,
            "average_response_time_ms": 35.0,
            "cache_hit_rate": 0.8
        }
    }))
}

fn cpu_rule_client(transport: &FakeTransport) -> TelemetryClient {
    let config = ClientConfig::new("http://service.test").rules([ThresholdRule::new("cpu_usage_percent", Comparison::Above, 85.0)]);
    TelemetryClient::new(config, Arc::new(transport.clone())).unwrap()
}

#[tokio::test(start_paused = true)]
async fn alert_raised_once_and_cleared_once() {
    let transport = FakeTransport::new();
    transport
        .push(metrics("2024-05-01T12:00:00Z", 90.0, 40.0))
        .push(metrics("2024-05-01T12:00:12Z", 80.0, 40.0));
    let client = cpu_rule_client(&transport);

    let raised = Arc::new(AtomicUsize::new(0));
    let cleared = Arc::new(AtomicUsize::new(0));
    let _raised = client.subscribe(EventKind::Alert, {
        let raised = Arc::clone(&raised);
        move |event| {
            assert!(matches!(event, Event::Alert(alert) if alert.value == 90.0));
            raised.fetch_add(1, Ordering::SeqCst);
        }
    });
    let _cleared = client.subscribe(EventKind::AlertCleared, {
        let cleared = Arc::clone(&cleared);
        move |_| {
            cleared.fetch_add(1, Ordering::SeqCst);
        }
    });

    client.poll_once().await.unwrap();
    assert_eq!(raised.load(Ordering::SeqCst), 1);
    assert_eq!(client.active_alerts().len(), 1);

    client.poll_once().await.unwrap();
    assert_eq!(raised.load(Ordering::SeqCst), 1);
    assert_eq!(cleared.load(Ordering::SeqCst), 1);
    assert!(client.active_alerts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn twelve_second_polling_sequence() {
    let transport = FakeTransport::new();
    for (second, cpu) in [(0, 70.0), (12, 90.0), (24, 92.0), (36, 80.0)] {
        transport.push(metrics(&format!("2024-05-01T12:00:{second:02}Z"), cpu, 40.0));
    }
    let client = cpu_rule_client(&transport);

    let start = Instant::now();
    let timeline = Arc::new(Mutex::new(Vec::new()));
    let _subscriptions: Vec<_> = [EventKind::Alert, EventKind::AlertCleared]
        .into_iter()
        .map(|kind| {
            let timeline = Arc::clone(&timeline);
            client.subscribe(kind, move |event| timeline.lock().push((event.kind(), start.elapsed())))
        })
        .collect();

    let poller = client.start_polling();
    tokio::time::sleep(Duration::from_secs(37)).await;
    poller.stop();

    assert_eq!(
        *timeline.lock(),
        vec![
            (EventKind::Alert, Duration::from_secs(12)),
            (EventKind::AlertCleared, Duration::from_secs(36)),
        ]
    );

    let cpu = client.history("cpu_usage_percent", TimeRange::all());
    let values: Vec<_> = cpu.iter().map(|sample| sample.value()).collect();
    assert_eq!(values, vec![70.0, 90.0, 92.0, 80.0]);

    let summary = client.summary("cpu_usage_percent").unwrap();
    assert_eq!(summary.peak, 92.0);
    assert_eq!(summary.latest, 80.0);

    let recent = client.history(
        "cpu_usage_percent",
        TimeRange::since("2024-05-01T12:00:24Z".parse().unwrap()),
    );
    assert_eq!(recent.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn severity_escalates_with_excess() {
    let transport = FakeTransport::new();
    transport.push(metrics("2024-05-01T12:00:00Z", 99.0, 40.0));
    let client = cpu_rule_client(&transport);

    client.poll_once().await.unwrap();

    let alert = &client.active_alerts()[0];
    assert_eq!(alert.severity, AlertSeverity::Critical);
    assert_eq!(alert.threshold, 85.0);
}

#[tokio::test(start_paused = true)]
async fn history_window_is_bounded() {
    let transport = FakeTransport::new();
    transport.fallback(metrics("2024-05-01T12:00:00Z", 10.0, 40.0));
    let config = ClientConfig::new("http://service.test").history_capacity(3);
    let client = TelemetryClient::new(config, Arc::new(transport.clone())).unwrap();

    for _ in 0..5 {
        client.poll_once().await.unwrap();
    }

    assert_eq!(client.history("cpu_usage_percent", TimeRange::all()).len(), 3);
    assert_eq!(client.summary("load_average_1m").unwrap().count, 3);
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn panicking_subscriber_does_not_block_others() {
    let transport = FakeTransport::new();
    transport.push(metrics("2024-05-01T12:00:00Z", 95.0, 40.0));
    let client = cpu_rule_client(&transport);

    let received = Arc::new(Mutex::new(Vec::new()));
    let _faulty = client.subscribe(EventKind::Alert, |_| panic!("dashboard widget crashed"));
    let _healthy = client.subscribe(EventKind::Alert, {
        let received = Arc::clone(&received);
        move |event| {
            if let Event::Alert(alert) = event {
                received.lock().push(alert.id.clone());
            }
        }
    });

    client.poll_once().await.unwrap();

    assert_eq!(received.lock().len(), 1);
    assert_eq!(received.lock()[0].as_str(), "cpu_usage_percent>85");
    assert!(logs_contain("dashboard widget crashed"));
}

#[tokio::test(start_paused = true)]
async fn unsubscribed_callback_is_not_invoked() {
    let transport = FakeTransport::new();
    transport.fallback(metrics("2024-05-01T12:00:00Z", 10.0, 40.0));
    let client = cpu_rule_client(&transport);

    let count = Arc::new(AtomicUsize::new(0));
    let subscription = client.subscribe(EventKind::Metrics, {
        let count = Arc::clone(&count);
        move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        }
    });

    client.poll_once().await.unwrap();
    assert!(subscription.unsubscribe());
    client.poll_once().await.unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 1);
}
