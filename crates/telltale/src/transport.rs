// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::Debug;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use thiserror::Error;

/// Performs raw HTTP exchanges on behalf of the [`RequestExecutor`][crate::RequestExecutor].
///
/// A transport knows nothing about timeouts, retries or response shapes; it sends one request
/// and returns the complete response, or fails with a [`TransportError`] when no response could
/// be obtained. Non-2xx responses are *not* errors at this level.
///
/// The returned future is `'static` so that exchanges can outlive the borrow of the transport,
/// e.g. when a shared request runs on its own task.
pub trait Transport: Debug + Send + Sync + 'static {
    /// Sends `request` and resolves to the full response.
    fn send(&self, request: http::Request<Bytes>) -> BoxFuture<'static, Result<http::Response<Bytes>, TransportError>>;
}

/// A connection-level failure: no HTTP response was received.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransportError {
    message: String,
}

impl TransportError {
    /// Creates a transport error with the given description.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    /// The description of the failure.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

#[cfg(feature = "hyper")]
pub use hyper_transport::HyperTransport;

#[cfg(feature = "hyper")]
mod hyper_transport {
    use bytes::Bytes;
    use futures_util::future::BoxFuture;
    use http_body_util::{BodyExt, Full};
    use hyper_util::client::legacy::Client;
    use hyper_util::client::legacy::connect::HttpConnector;
    use hyper_util::rt::TokioExecutor;

    use super::{Transport, TransportError};

    /// Plain HTTP/1 transport built on the `hyper` client with connection pooling.
    ///
    /// Must be used from within a tokio runtime.
    #[derive(Debug, Clone)]
    pub struct HyperTransport {
        client: Client<HttpConnector, Full<Bytes>>,
    }

    impl HyperTransport {
        /// Creates a transport with a fresh connection pool.
        #[must_use]
        pub fn new() -> Self {
            Self {
                client: Client::builder(TokioExecutor::new()).build_http(),
            }
        }
    }

    impl Default for HyperTransport {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Transport for HyperTransport {
        fn send(&self, request: http::Request<Bytes>) -> BoxFuture<'static, Result<http::Response<Bytes>, TransportError>> {
            let client = self.client.clone();

            Box::pin(async move {
                let response = client
                    .request(request.map(Full::new))
                    .await
                    .map_err(|error| TransportError::new(error.to_string()))?;

                let (parts, body) = response.into_parts();
                let body = body
                    .collect()
                    .await
                    .map_err(|error| TransportError::new(format!("failed to read response body: {error}")))?
                    .to_bytes();

                Ok(http::Response::from_parts(parts, body))
            })
        }
    }
}
