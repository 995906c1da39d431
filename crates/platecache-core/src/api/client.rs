//! HTTP transport for the restaurant API.
//!
//! This module provides the `HttpTransport` struct, which resolves request
//! URLs against the configured API base URL and sends them with reqwest.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Url};
use tracing::{debug, warn};

use super::transport::{Method, Request, Response, Transport};
use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// Default HTTP request timeout in seconds.
/// A stalled request ends the current sync round instead of blocking it.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// HTTP transport for the restaurant API.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: Url,
}

impl HttpTransport {
    /// Create a transport for the API rooted at `base_url`
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ApiError::InvalidUrl(format!("{}: {}", base_url, e)))?;

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve a possibly relative URL against the base URL.
    /// Absolute URLs (as stored by older queue entries) are used as-is.
    pub fn resolve(&self, url: &str) -> Result<Url, ApiError> {
        self.base_url
            .join(url)
            .map_err(|e| ApiError::InvalidUrl(format!("{}: {}", url, e)))
    }

    fn builder(&self, request: &Request, url: Url) -> reqwest::RequestBuilder {
        let builder = match request.method {
            Method::Get => self.client.get(url),
            Method::Post => self.client.post(url),
            Method::Put => self.client.put(url),
            Method::Patch => self.client.patch(url),
            Method::Delete => self.client.delete(url),
        };
        let builder = builder.header(header::ACCEPT, "application/json");
        match &request.body {
            Some(body) => builder.json(body),
            None => builder,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &Request) -> Result<Response, ApiError> {
        let url = self.resolve(&request.url)?;
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = self.builder(request, url.clone()).send().await?;
            let status = response.status().as_u16();

            if status == 429 {
                // Rate limited
                retries += 1;
                if retries > MAX_RATE_LIMIT_RETRIES {
                    return Err(ApiError::RateLimited);
                }
                warn!(url = %url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms *= 2; // Exponential backoff
                continue;
            }

            let body = response.text().await?;
            debug!(method = %request.method, url = %url, status, "Response received");
            return Ok(Response { status, body });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> HttpTransport {
        HttpTransport::new("http://localhost:1337", Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_resolve_relative_urls() {
        let t = transport();
        assert_eq!(
            t.resolve("/restaurants/3").unwrap().as_str(),
            "http://localhost:1337/restaurants/3"
        );
        assert_eq!(
            t.resolve("/reviews/?restaurant_id=2").unwrap().as_str(),
            "http://localhost:1337/reviews/?restaurant_id=2"
        );
    }

    #[test]
    fn test_resolve_keeps_absolute_urls() {
        let t = transport();
        assert_eq!(
            t.resolve("http://example.com:8080/reviews").unwrap().as_str(),
            "http://example.com:8080/reviews"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let err = HttpTransport::new("not a url", Duration::from_secs(1)).err().unwrap();
        assert!(matches!(err, ApiError::InvalidUrl(_)));
    }
}
