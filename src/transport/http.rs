use crate::backend::error_classification;
use crate::{Error, ErrorContext, Result};
use reqwest::{Method, Proxy};
use std::env;
use std::time::Duration;
use url::Url;

/// Connection settings for [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub base_url: String,
    pub api_key: String,
    /// Hard per-request ceiling enforced by reqwest, independent of any
    /// caller deadline.
    pub timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
    pub proxy_url: Option<String>,
}

impl TransportConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        // Minimal production-friendly defaults (env-overridable).
        let timeout_secs = env::var("CONTEXT_CACHE_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(60);
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(timeout_secs),
            pool_max_idle_per_host: env::var("CONTEXT_CACHE_HTTP_POOL_MAX_IDLE_PER_HOST")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .unwrap_or(32),
            pool_idle_timeout: Duration::from_secs(90),
            proxy_url: env::var("CONTEXT_CACHE_PROXY_URL").ok(),
        }
    }
}

/// Raw outcome of one HTTP exchange that reached the server.
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
    pub retry_after_ms: Option<u64>,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Url,
    api_key: String,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    pub fn new(config: &TransportConfig) -> Result<Self> {
        // Url::join drops the last segment unless the base ends with '/'.
        let mut base = config.base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid base URL '{}': {}", config.base_url, e),
                ErrorContext::new().with_source("http_transport"),
            )
        })?;

        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(Some(config.pool_idle_timeout));

        if let Some(ref proxy_url) = config.proxy_url {
            let proxy = Proxy::all(proxy_url).map_err(|e| {
                Error::configuration_with_context(
                    format!("invalid proxy URL: {}", e),
                    ErrorContext::new().with_source("http_transport"),
                )
            })?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build().map_err(|e| {
            Error::configuration_with_context(
                format!("failed to build HTTP client: {}", e),
                ErrorContext::new().with_source("http_transport"),
            )
        })?;

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key.clone(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve a path relative to the base URL.
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url.join(path.trim_start_matches('/')).map_err(|e| {
            Error::configuration_with_context(
                format!("cannot build endpoint for '{}': {}", path, e),
                ErrorContext::new().with_source("http_transport"),
            )
        })
    }

    /// Perform one request and read the whole body.
    ///
    /// Non-2xx replies are returned as [`HttpReply`], not as errors; only
    /// failures that prevent reading a reply become (classified) errors.
    pub async fn send(
        &self,
        operation: &str,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
        request_id: &str,
    ) -> Result<HttpReply> {
        let url = self.endpoint(path)?;

        let mut req = self
            .client
            .request(method, url)
            .header("x-goog-api-key", self.api_key.as_str())
            .header("x-request-id", request_id);
        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| error_classification::from_transport(operation, &e, request_id))?;

        let status = resp.status().as_u16();
        let retry_after_ms = error_classification::retry_after_ms(resp.headers());
        let body = resp
            .text()
            .await
            .map_err(|e| error_classification::from_transport(operation, &e, request_id))?;

        Ok(HttpReply {
            status,
            body,
            retry_after_ms,
        })
    }
}
