// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Watches a performance service and prints alerts as they are raised and cleared.
//!
//! The configuration is read from the file named by `TELLTALE_CONFIG`; otherwise the service
//! at `TELLTALE_BASE_URL` (default `http://localhost:8080`) is watched with default settings.
//! Log verbosity is controlled with `RUST_LOG`, e.g. `RUST_LOG=telltale=debug`.
//!
//! Press Ctrl+C to stop.

use std::time::Duration;

use telltale::{ClientConfig, Event, EventKind, TelemetryClient};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("telltale=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::var("TELLTALE_CONFIG") {
        Ok(path) => ClientConfig::from_file(path)?,
        Err(_) => ClientConfig::new(std::env::var("TELLTALE_BASE_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())),
    };
    let client = TelemetryClient::connect(config)?;

    match client.health().await {
        Ok(report) => println!("service is {:?}, up for {}s", report.status, report.uptime_seconds),
        Err(error) => println!("health check failed: {error}"),
    }

    let _alerts = client.subscribe(EventKind::Alert, |event| {
        if let Event::Alert(alert) = event {
            println!("[{}] {}", alert.severity, alert.message);
        }
    });
    let _cleared = client.subscribe(EventKind::AlertCleared, |event| {
        if let Event::AlertCleared(alert) = event {
            println!("[cleared] {}", alert.id);
        }
    });
    let _failures = client.subscribe(EventKind::PollFailed, |event| {
        if let Event::PollFailed(error) = event {
            if error.is_degraded() {
                println!("service degraded: {error}");
            } else {
                println!("poll failed: {error}");
            }
        }
    });

    let poller = client.start_polling();

    let mut report = tokio::time::interval(Duration::from_secs(60));
    report.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = report.tick() => {
                if let Some(summary) = client.summary("cpu_usage_percent") {
                    println!(
                        "cpu over last {} samples: mean {:.1}%, peak {:.1}%, latest {:.1}%",
                        summary.count, summary.mean, summary.peak, summary.latest
                    );
                }
            }
        }
    }

    poller.stop();
    Ok(())
}
