// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Resilient telemetry polling, threshold alerting and request coalescing for remote services.
//!
//! `telltale` is the client-side coordination layer that sits between UI code and a remote
//! performance service. It fetches operational metrics and expensive compute results over an
//! unreliable network and shields its callers from that network:
//!
//! - every request carries a correlation id and a bounded timeout,
//! - failing endpoints are isolated by a per-endpoint circuit breaker,
//! - transient failures are retried with exponential backoff,
//! - identical expensive requests are coalesced and their results cached for a TTL,
//! - metric samples are kept in bounded history windows,
//! - threshold rules raise and clear alerts with hysteresis,
//! - observers receive updates through a typed event bus that isolates misbehaving subscribers.
//!
//! # Quick Start
//!
//! ```no_run
//! # #[cfg(feature = "hyper")]
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use telltale::{ClientConfig, EventKind, TelemetryClient};
//!
//! let config = ClientConfig::new("http://localhost:8080");
//! let client = TelemetryClient::connect(config)?;
//!
//! let _subscription = client.subscribe(EventKind::Alert, |event| {
//!     println!("alert raised: {event:?}");
//! });
//!
//! // Polling stops when the handle is dropped.
//! let _poller = client.start_polling();
//!
//! let snapshot = client.current_metrics().await?;
//! println!("cpu usage: {:.1}%", snapshot.system.cpu_usage_percent);
//! # Ok(())
//! # }
//! ```
//!
//! # Request Pipeline
//!
//! All network traffic flows through the same layers, outermost first:
//!
//! 1. [`RetryPolicy`] retries `Timeout`, `ServerError` and `NetworkError` failures.
//! 2. [`CircuitRegistry`] rejects calls to unhealthy endpoints with [`Error::CircuitOpen`]
//!    without touching the network.
//! 3. [`RequestExecutor`] performs one HTTP exchange through a [`Transport`], classifies the
//!    outcome and validates the response body.
//!
//! On-demand parameterized requests additionally pass through a [`Coalescer`], which serves
//! cached results and merges concurrent identical requests.
//!
//! # Features
//!
//! - `hyper` (default): enables [`HyperTransport`], a plain HTTP/1 transport built on `hyper`.
//! - `test-util`: exposes [`testing::FakeTransport`], a scripted transport that counts calls.

mod alerts;
mod breaker;
mod client;
mod coalesce;
mod config;
mod constants;
mod error;
mod events;
mod executor;
mod history;
pub mod models;
mod pipeline;
mod poller;
mod retry;
mod transport;

#[cfg(any(feature = "test-util", test))]
pub mod testing;

#[doc(inline)]
pub use alerts::{Alert, AlertEngine, AlertId, AlertSeverity, AlertTransition, Comparison, SeverityBands, ThresholdRule};
#[doc(inline)]
pub use breaker::{CircuitRegistry, CircuitState};
#[doc(inline)]
pub use client::TelemetryClient;
#[doc(inline)]
pub use coalesce::{CacheKey, CacheStats, CanonicalKey, Coalescer, KeyBuilder};
#[doc(inline)]
pub use config::{AlertOptions, BreakerOptions, CacheOptions, ClientConfig, ConfigError, PollOptions, RetryOptions, TimeoutOptions};
#[doc(inline)]
pub use error::{ApiError, Error, ErrorKind, Result};
#[doc(inline)]
pub use events::{Event, EventBus, EventKind, Subscription};
#[doc(inline)]
pub use executor::{RequestExecutor, RequestSpec};
#[doc(inline)]
pub use history::{HistoryStore, HistoryWindow, MetricSample, Summary, TimeRange};
#[doc(inline)]
pub use models::Validate;
#[doc(inline)]
pub use poller::PollerHandle;
#[doc(inline)]
pub use retry::{Attempt, RetryPolicy};
#[cfg(feature = "hyper")]
#[doc(inline)]
pub use transport::HyperTransport;
#[doc(inline)]
pub use transport::{Transport, TransportError};
