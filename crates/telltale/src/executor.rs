// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Method, StatusCode, header};
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use uuid::Uuid;

use crate::constants::CORRELATION_HEADER;
use crate::models::Validate;
use crate::{ApiError, Error, Result, Transport};

/// Describes one call against the service.
///
/// The query string is not part of the [path](Self::path), so every parameter set of an endpoint
/// shares that endpoint's circuit.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpec {
    method: Method,
    path: Cow<'static, str>,
    query: Vec<(&'static str, String)>,
    body: Option<serde_json::Value>,
    timeout: Duration,
}

impl RequestSpec {
    /// A `GET` of `path` bounded by `timeout`.
    #[must_use]
    pub fn get(path: impl Into<Cow<'static, str>>, timeout: Duration) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            query: Vec::new(),
            body: None,
            timeout,
        }
    }

    /// A `POST` of `path` with an optional JSON body, bounded by `timeout`.
    #[must_use]
    pub fn post(path: impl Into<Cow<'static, str>>, body: Option<serde_json::Value>, timeout: Duration) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            query: Vec::new(),
            body,
            timeout,
        }
    }

    /// Appends query parameters, sent in the given order.
    ///
    /// Names and values are sent verbatim; `&`, `=`, `#` and whitespace are rejected as an
    /// [`Error::InvalidRequest`] when the request is built.
    #[must_use]
    pub fn with_query(mut self, pairs: impl IntoIterator<Item = (&'static str, String)>) -> Self {
        self.query.extend(pairs);
        self
    }

    /// The HTTP method.
    #[must_use]
    pub const fn method(&self) -> &Method {
        &self.method
    }

    /// The endpoint path; also the key of the endpoint's circuit.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The query parameters, in sending order.
    #[must_use]
    pub fn query(&self) -> &[(&'static str, String)] {
        &self.query
    }

    /// Upper bound of the whole exchange.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Issues single calls and classifies their outcome.
///
/// Every call carries a fresh correlation id in the `x-correlation-id` header and is bounded by
/// the timeout of its [`RequestSpec`]; when the timeout fires the in-flight exchange is dropped.
/// Responses are deserialized and then [validated][Validate], and anything that does not pass is
/// reported as [`Error::Validation`].
#[derive(Debug, Clone)]
pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    base_url: Arc<str>,
}

impl RequestExecutor {
    /// Creates an executor that sends requests for `base_url` through `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, base_url: &str) -> Self {
        Self {
            transport,
            base_url: Arc::from(base_url.trim_end_matches('/')),
        }
    }

    /// The base URL without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Performs the call described by `spec`.
    ///
    /// # Errors
    ///
    /// Returns the classified failure: [`Error::Timeout`], [`Error::Client`], [`Error::Server`],
    /// [`Error::Network`], [`Error::Validation`], or [`Error::InvalidRequest`] when no request
    /// could be built.
    pub async fn execute<T>(&self, spec: &RequestSpec) -> Result<T>
    where
        T: DeserializeOwned + Validate,
    {
        let correlation_id = Uuid::new_v4();
        let request = self.build(spec, correlation_id)?;
        let started = Instant::now();

        tracing::event!(
            name: "telltale.request.start",
            tracing::Level::DEBUG,
            request.method = %spec.method,
            request.endpoint = spec.path(),
            request.correlation_id = %correlation_id,
        );

        let result = match tokio::time::timeout(spec.timeout, self.transport.send(request)).await {
            Err(_elapsed) => Err(Error::Timeout {
                endpoint: spec.path().to_string(),
                timeout: spec.timeout,
            }),
            Ok(Err(error)) => Err(Error::Network {
                endpoint: spec.path().to_string(),
                message: error.message().to_string(),
            }),
            Ok(Ok(response)) => classify(spec.path(), response.status(), response.body()),
        };

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        match &result {
            Ok(_) => tracing::event!(
                name: "telltale.request.finish",
                tracing::Level::DEBUG,
                request.method = %spec.method,
                request.endpoint = spec.path(),
                request.correlation_id = %correlation_id,
                request.latency_ms = latency_ms,
            ),
            Err(error) => tracing::event!(
                name: "telltale.request.failed",
                tracing::Level::WARN,
                request.method = %spec.method,
                request.endpoint = spec.path(),
                request.correlation_id = %correlation_id,
                request.latency_ms = latency_ms,
                error.kind = %error.kind(),
                error.message = %error,
            ),
        }

        result
    }

    fn build(&self, spec: &RequestSpec, correlation_id: Uuid) -> Result<http::Request<Bytes>> {
        let invalid = |reason: String| Error::InvalidRequest {
            endpoint: spec.path().to_string(),
            reason,
        };

        let mut target = format!("{}{}", self.base_url, spec.path());
        for (index, (name, value)) in spec.query.iter().enumerate() {
            if [*name, value.as_str()]
                .iter()
                .any(|part| part.contains(['&', '=', '#']) || part.contains(char::is_whitespace))
            {
                return Err(invalid(format!("query parameter {name}={value} needs escaping")));
            }
            target.push(if index == 0 { '?' } else { '&' });
            target.push_str(name);
            target.push('=');
            target.push_str(value);
        }

        let uri = http::Uri::try_from(target).map_err(|error| invalid(error.to_string()))?;

        let mut builder = http::Request::builder()
            .method(spec.method.clone())
            .uri(uri)
            .header(header::ACCEPT, "application/json")
            .header(CORRELATION_HEADER, correlation_id.to_string());

        let body = match &spec.body {
            Some(body) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Bytes::from(serde_json::to_vec(body).map_err(|error| invalid(error.to_string()))?)
            }
            None => Bytes::new(),
        };

        builder.body(body).map_err(|error| invalid(error.to_string()))
    }
}

fn classify<T>(endpoint: &str, status: StatusCode, body: &[u8]) -> Result<T>
where
    T: DeserializeOwned + Validate,
{
    if status.is_client_error() {
        return Err(Error::Client {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            body: ApiError::from_response(status, body),
        });
    }

    if !status.is_success() {
        return Err(Error::Server {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            body: ApiError::from_response(status, body),
        });
    }

    let invalid = |reason: String| Error::Validation {
        endpoint: endpoint.to_string(),
        reason,
    };

    let value: T = serde_json::from_slice(body).map_err(|error| invalid(format!("malformed body: {error}")))?;
    value.validate().map_err(invalid)?;

    Ok(value)
}
