//! Network primitive
//!
//! The only way the interceptor reaches the outside world. A fetch resolves
//! exactly once: with whatever response the network produced (error statuses
//! included) or with a [`NetworkError`] when no response could be obtained.

use crate::models::{
    header_value_bytes, header_value_to_string, InterceptedRequest, InterceptedResponse,
    ResponseSource,
};
use futures::future::BoxFuture;
use reqwest::header::{HeaderName, HeaderValue};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Headers that are recomputed by the HTTP client and must not be forwarded.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "transfer-encoding",
    "connection",
    "proxy-connection",
    "keep-alive",
];

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("network unreachable for {url}: {reason}")]
    Unreachable { url: String, reason: String },
    #[error("request to {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Asynchronous, single-resolution network fetch.
pub trait Network: Send + Sync {
    fn fetch(
        &self,
        request: InterceptedRequest,
    ) -> BoxFuture<'static, Result<InterceptedResponse, NetworkError>>;
}

/// [`Network`] implementation backed by `reqwest`.
#[derive(Clone)]
pub struct HttpNetwork {
    client: reqwest::Client,
    timeout: Option<Duration>,
}

impl HttpNetwork {
    pub fn new(timeout: Option<Duration>) -> anyhow::Result<Self> {
        // Never route through an ambient proxy; we may be that proxy.
        let mut builder = reqwest::Client::builder().no_proxy();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build()?;
        Ok(Self { client, timeout })
    }
}

impl Network for HttpNetwork {
    fn fetch(
        &self,
        request: InterceptedRequest,
    ) -> BoxFuture<'static, Result<InterceptedResponse, NetworkError>> {
        let client = self.client.clone();
        let timeout_ms = self.timeout.map(|t| t.as_millis() as u64).unwrap_or(0);
        Box::pin(async move {
            let url = request.url().to_string();
            let method = reqwest::Method::try_from(request.method()).map_err(|e| {
                NetworkError::InvalidRequest(format!("method {}: {}", request.method(), e))
            })?;
            let mut builder = client.request(method, &url);

            // `header` appends, so repeated names go out as separate lines.
            for (key, value) in request.headers() {
                if HOP_BY_HOP_HEADERS
                    .iter()
                    .any(|h| key.eq_ignore_ascii_case(h))
                {
                    continue;
                }
                let name = HeaderName::try_from(key.as_str())
                    .map_err(|e| NetworkError::InvalidRequest(format!("header {key}: {e}")))?;
                let value = HeaderValue::from_bytes(&header_value_bytes(value))
                    .map_err(|e| NetworkError::InvalidRequest(format!("header {key}: {e}")))?;
                builder = builder.header(name, value);
            }
            if let Some(body) = request.body() {
                builder = builder.body(body.to_vec());
            }

            let started = Instant::now();
            let response = builder
                .send()
                .await
                .map_err(|e| map_reqwest_error(e, &url, timeout_ms))?;

            let status_code = response.status().as_u16();
            let status_message = response.status().canonical_reason().map(String::from);
            let headers: Vec<(String, String)> = response
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), header_value_to_string(v.as_bytes())))
                .collect();
            let body = response
                .bytes()
                .await
                .map_err(|e| map_reqwest_error(e, &url, timeout_ms))?
                .to_vec();

            tracing::debug!(
                "Network fetch {} {} -> {} ({}ms)",
                request.method(),
                url,
                status_code,
                started.elapsed().as_millis()
            );

            Ok(InterceptedResponse {
                status_code,
                status_message,
                headers,
                body,
                source: ResponseSource::Network,
            })
        })
    }
}

fn map_reqwest_error(err: reqwest::Error, url: &str, timeout_ms: u64) -> NetworkError {
    if err.is_timeout() {
        NetworkError::Timeout {
            url: url.to_string(),
            timeout_ms,
        }
    } else if err.is_connect() {
        NetworkError::Unreachable {
            url: url.to_string(),
            reason: err.to_string(),
        }
    } else if err.is_builder() {
        NetworkError::InvalidRequest(err.to_string())
    } else {
        NetworkError::Transport(err.to_string())
    }
}
