// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::{Display, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A terminal failure of a request after all resilience layers had their say.
///
/// The executor classifies every failure into one of these variants, the retry controller
/// decides which of them are worth another attempt, and the circuit breaker decides which of
/// them count against an endpoint's health. See [`ErrorKind`] for a payload-free view.
///
/// The type is `Clone` so that one settled result can be handed to every caller that joined a
/// coalesced request.
///
/// # Thread safety
///
/// This type is thread-safe.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum Error {
    /// The request did not complete within its timeout and was cancelled.
    #[error("request to {endpoint} timed out after {}ms", timeout.as_millis())]
    Timeout {
        /// The endpoint path that was called.
        endpoint: String,
        /// The timeout that was exceeded.
        timeout: Duration,
    },

    /// The service rejected the request with a 4xx status. Retrying will not help.
    #[error("request to {endpoint} was rejected with status {status}: {body}")]
    Client {
        /// The endpoint path that was called.
        endpoint: String,
        /// The HTTP status code.
        status: u16,
        /// The error body reported by the service, or one synthesized from the status.
        body: ApiError,
    },

    /// The service failed with a 5xx status. The failure is considered transient.
    #[error("request to {endpoint} failed with status {status}: {body}")]
    Server {
        /// The endpoint path that was called.
        endpoint: String,
        /// The HTTP status code.
        status: u16,
        /// The error body reported by the service, or one synthesized from the status.
        body: ApiError,
    },

    /// The request never produced an HTTP response (connection refused, reset, DNS, ...).
    #[error("network error while calling {endpoint}: {message}")]
    Network {
        /// The endpoint path that was called.
        endpoint: String,
        /// Description of the connection-level failure.
        message: String,
    },

    /// The response arrived but its body did not have the expected shape.
    #[error("invalid response from {endpoint}: {reason}")]
    Validation {
        /// The endpoint path that was called.
        endpoint: String,
        /// Why the response was rejected.
        reason: String,
    },

    /// The endpoint's circuit is open and the call was rejected without touching the network.
    #[error("service degraded: circuit for {endpoint} is open, next attempt allowed in {}ms", retry_after.as_millis())]
    CircuitOpen {
        /// The endpoint path whose circuit is open.
        endpoint: String,
        /// Time left until the circuit admits a trial call.
        retry_after: Duration,
    },

    /// The request could not be constructed, e.g. the base URL and path do not form a valid URI.
    #[error("invalid request for {endpoint}: {reason}")]
    InvalidRequest {
        /// The endpoint path that was called.
        endpoint: String,
        /// Why the request could not be built.
        reason: String,
    },

    /// The task producing a shared result was cancelled or panicked before it settled.
    #[error("shared request for {key} was abandoned before it settled")]
    Abandoned {
        /// The canonical key of the abandoned request.
        key: String,
    },
}

/// Payload-free classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// See [`Error::Timeout`].
    Timeout,
    /// See [`Error::Client`].
    Client,
    /// See [`Error::Server`].
    Server,
    /// See [`Error::Network`].
    Network,
    /// See [`Error::Validation`].
    Validation,
    /// See [`Error::CircuitOpen`].
    CircuitOpen,
    /// See [`Error::InvalidRequest`].
    InvalidRequest,
    /// See [`Error::Abandoned`].
    Abandoned,
}

impl ErrorKind {
    /// Returns a stable `snake_case` name, suitable for log fields.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Client => "client_error",
            Self::Server => "server_error",
            Self::Network => "network_error",
            Self::Validation => "validation_error",
            Self::CircuitOpen => "circuit_open",
            Self::InvalidRequest => "invalid_request",
            Self::Abandoned => "abandoned",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Returns the classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Client { .. } => ErrorKind::Client,
            Self::Server { .. } => ErrorKind::Server,
            Self::Network { .. } => ErrorKind::Network,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            Self::Abandoned { .. } => ErrorKind::Abandoned,
        }
    }

    /// Returns `true` for failures that may succeed when retried: timeouts, 5xx responses and
    /// connection-level errors.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Timeout | ErrorKind::Server | ErrorKind::Network)
    }

    /// Returns `true` when the failure is the "service degraded" signal of an open circuit,
    /// as opposed to a failure observed on the wire.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.kind() == ErrorKind::CircuitOpen
    }

    /// Returns `true` when the failure says something about the health of the endpoint and
    /// therefore counts towards opening its circuit.
    #[must_use]
    pub fn counts_against_circuit(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout | ErrorKind::Server | ErrorKind::Network | ErrorKind::Validation
        )
    }

    /// The HTTP status code, if the failure carried one.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Client { status, .. } | Self::Server { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// A specialized `Result` for telemetry client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Structured error body of a non-2xx response.
///
/// The service reports errors either flat as `{ "code", "message", "details" }` or nested as
/// `{ "error": { "code", "message", "context" } }`; both are accepted. When the body is neither,
/// an error is synthesized from the HTTP status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireError {
    Flat(ApiError),
    Nested { error: NestedError },
}

#[derive(Deserialize)]
struct NestedError {
    code: String,
    message: String,
    #[serde(default)]
    context: Option<serde_json::Value>,
}

impl ApiError {
    /// Parses an error body, falling back to a description synthesized from `status`.
    #[must_use]
    pub fn from_response(status: http::StatusCode, body: &[u8]) -> Self {
        match serde_json::from_slice::<WireError>(body) {
            Ok(WireError::Flat(error)) => error,
            Ok(WireError::Nested { error }) => Self {
                code: error.code,
                message: error.message,
                details: error.context,
            },
            Err(_) => Self::from_status(status),
        }
    }

    /// Synthesizes an error body from an HTTP status.
    #[must_use]
    pub fn from_status(status: http::StatusCode) -> Self {
        Self {
            code: format!("HTTP_{}", status.as_u16()),
            message: status.canonical_reason().unwrap_or("unknown status").to_string(),
            details: None,
        }
    }
}

impl Display for ApiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}
