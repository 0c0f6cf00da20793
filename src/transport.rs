//! The upstream transport seam.
//!
//! The guard never opens sockets itself. Everything that reaches the network goes through a
//! [`Transport`], which performs one request and reports either an opaque
//! [`HttpResponse`] or a [`TransportError`]. Any `tower::Service<TransportRequest>` can be
//! plugged in with [`ServiceTransport`]; the `reqwest` feature adds [`ReqwestTransport`].

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use tower_service::Service;

/// Header map used on both requests and responses. Names are kept as given.
pub type Headers = BTreeMap<String, String>;

/// HTTP method of an outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "UPPERCASE"))]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
        }
    }

    /// Only safe reads are served from the micro-cache.
    pub fn is_cacheable(&self) -> bool {
        matches!(self, Method::Get | Method::Head)
    }

    /// Methods that may be retried without changing upstream state twice.
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, Method::Post | Method::Patch)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque upstream response snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self { status, headers: Headers::new(), body: body.into() }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// `true` for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A single request handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
    pub timeout: Duration,
}

/// Failures reported by the transport itself, before any HTTP status exists.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("dns resolution failed: {0}")]
    Dns(String),
    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Timeouts and connection-level failures are transient; everything else is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Connect(_) | Self::Dns(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "TimeoutError",
            Self::Connect(_) => "ConnectionError",
            Self::Dns(_) => "DnsError",
            Self::Other(_) => "TransportError",
        }
    }
}

/// Performs one upstream request.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn perform(&self, request: TransportRequest) -> Result<HttpResponse, TransportError>;
}

#[async_trait]
impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    async fn perform(&self, request: TransportRequest) -> Result<HttpResponse, TransportError> {
        (**self).perform(request).await
    }
}

/// Adapts a `tower::Service<TransportRequest>` into a [`Transport`].
///
/// The service is cloned per call and driven with `oneshot`, so readiness is honored.
///
/// ```rust
/// use outbound_guard::transport::{HttpResponse, ServiceTransport, TransportError, TransportRequest};
/// use tower::service_fn;
///
/// let transport = ServiceTransport::new(service_fn(|req: TransportRequest| async move {
///     Ok::<_, TransportError>(HttpResponse::new(200, req.url.into_bytes()))
/// }));
/// # let _ = transport;
/// ```
#[derive(Debug, Clone)]
pub struct ServiceTransport<S> {
    inner: S,
}

impl<S> ServiceTransport<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S> Transport for ServiceTransport<S>
where
    S: Service<TransportRequest, Response = HttpResponse, Error = TransportError>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send,
{
    async fn perform(&self, request: TransportRequest) -> Result<HttpResponse, TransportError> {
        self.inner.clone().oneshot(request).await
    }
}

#[cfg(feature = "reqwest")]
pub use reqwest_transport::ReqwestTransport;

#[cfg(feature = "reqwest")]
mod reqwest_transport {
    use super::{HttpResponse, Transport, TransportError, TransportRequest};
    use async_trait::async_trait;
    use std::time::Duration;

    /// [`Transport`] backed by a shared `reqwest::Client`.
    #[derive(Debug, Clone, Default)]
    pub struct ReqwestTransport {
        client: reqwest::Client,
    }

    impl ReqwestTransport {
        pub fn new(client: reqwest::Client) -> Self {
            Self { client }
        }
    }

    fn map_error(err: reqwest::Error, timeout: Duration) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(timeout)
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }

    #[async_trait]
    impl Transport for ReqwestTransport {
        async fn perform(
            &self,
            request: TransportRequest,
        ) -> Result<HttpResponse, TransportError> {
            let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
                .map_err(|e| TransportError::Other(e.to_string()))?;
            let mut builder = self.client.request(method, &request.url).timeout(request.timeout);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let response = builder.send().await.map_err(|e| map_error(e, request.timeout))?;
            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();
            let body =
                response.bytes().await.map_err(|e| map_error(e, request.timeout))?.to_vec();

            Ok(HttpResponse { status, headers, body })
        }
    }
}
