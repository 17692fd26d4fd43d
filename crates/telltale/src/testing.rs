// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Test doubles for exercising the client without a network.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;

use crate::{Transport, TransportError};

/// One scripted outcome of a [`FakeTransport`] exchange.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Respond with the given status and body.
    Response {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: Bytes,
    },
    /// Fail at the connection level.
    Fail(String),
    /// Never respond; only a timeout ends the exchange.
    Hang,
}

impl Reply {
    /// A 200 response with a JSON body.
    #[must_use]
    pub fn json(value: &serde_json::Value) -> Self {
        Self::status(200, value)
    }

    /// A response with the given status and JSON body.
    #[must_use]
    pub fn status(status: u16, value: &serde_json::Value) -> Self {
        Self::Response {
            status,
            body: Bytes::from(value.to_string()),
        }
    }
}

/// A recorded request.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// HTTP method.
    pub method: http::Method,
    /// Full request URI.
    pub uri: String,
    /// Value of the correlation header, if present.
    pub correlation_id: Option<String>,
    /// Request body.
    pub body: Bytes,
}

#[derive(Debug, Default)]
struct Script {
    replies: VecDeque<Reply>,
    fallback: Option<Reply>,
    requests: Vec<RecordedRequest>,
}

/// A [`Transport`] that replays scripted replies and records every request it receives.
///
/// Replies are consumed in order. Once the queue is empty, the fallback reply (if any) is used
/// for every further request; without a fallback the exchange fails at the connection level.
/// An optional latency is applied to every reply using tokio's clock, so paused-time tests can
/// drive it with `tokio::time::advance`.
#[derive(Debug, Clone, Default)]
pub struct FakeTransport {
    script: Arc<Mutex<Script>>,
    latency: Duration,
}

impl FakeTransport {
    /// Creates a transport with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `latency` to every reply.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queues a reply.
    pub fn push(&self, reply: Reply) -> &Self {
        self.script.lock().replies.push_back(reply);
        self
    }

    /// Sets the reply used once the queue is exhausted.
    pub fn fallback(&self, reply: Reply) -> &Self {
        self.script.lock().fallback = Some(reply);
        self
    }

    /// Number of requests received so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.script.lock().requests.len()
    }

    /// All requests received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.script.lock().requests.clone()
    }
}

impl Transport for FakeTransport {
    fn send(&self, request: http::Request<Bytes>) -> BoxFuture<'static, Result<http::Response<Bytes>, TransportError>> {
        let reply = {
            let mut script = self.script.lock();
            script.requests.push(RecordedRequest {
                method: request.method().clone(),
                uri: request.uri().to_string(),
                correlation_id: request
                    .headers()
                    .get(crate::constants::CORRELATION_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string),
                body: request.body().clone(),
            });
            script.replies.pop_front().or_else(|| script.fallback.clone())
        };
        let latency = self.latency;

        Box::pin(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }

            match reply {
                Some(Reply::Response { status, body }) => http::Response::builder()
                    .status(status)
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .body(body)
                    .map_err(|error| TransportError::new(error.to_string())),
                Some(Reply::Fail(message)) => Err(TransportError::new(message)),
                Some(Reply::Hang) => std::future::pending().await,
                None => Err(TransportError::new("connection refused: no scripted reply")),
            }
        })
    }
}
