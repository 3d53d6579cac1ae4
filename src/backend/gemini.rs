//! Gemini 上下文缓存后端 — 实现 Google Gemini cachedContents 与 generateContent 调用
//!
//! Google Generative Language (`v1beta`) backend. Key points:
//! - Direct calls put the prompt in `systemInstruction` and the message in a
//!   single `user` turn of `contents`.
//! - Cached calls replace `systemInstruction` with `cachedContent: <name>`.
//! - `POST cachedContents` mints the handle (`name`, e.g. `cachedContents/abc`);
//!   `DELETE <name>` removes it. TTL is sent as a `"<secs>s"` duration string.
//! - Response text lives in `candidates[0].content.parts[*].text`.
//! - The API key travels in the `x-goog-api-key` header.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error_classification;
use super::{CacheHandle, GenerationBackend};
use crate::context::CallContext;
use crate::error_class::ErrorClass;
use crate::transport::{HttpTransport, TransportConfig};
use crate::{Error, ErrorContext, Result};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/";
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash-001";

/// Gemini implementation of [`GenerationBackend`].
#[derive(Debug)]
pub struct GeminiBackend {
    transport: HttpTransport,
    model: String,
    closed: AtomicBool,
}

impl GeminiBackend {
    pub fn builder() -> GeminiBackendBuilder {
        GeminiBackendBuilder::new()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// `models/<id>`, accepting ids that already carry the prefix.
    fn model_path(&self) -> String {
        if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        }
    }

    fn ensure_open(&self, op: &str) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::closed("gemini backend is closed").with_source(op));
        }
        Ok(())
    }

    fn user_turn(message: &str) -> Value {
        serde_json::json!([{ "role": "user", "parts": [{ "text": message }] }])
    }

    fn direct_body(prompt: &str, message: &str) -> Value {
        serde_json::json!({
            "systemInstruction": { "parts": [{ "text": prompt }] },
            "contents": Self::user_turn(message),
        })
    }

    fn cached_body(handle: &CacheHandle, message: &str) -> Value {
        serde_json::json!({
            "cachedContent": handle.as_str(),
            "contents": Self::user_turn(message),
        })
    }

    fn create_body(model_path: &str, prompt: &str, ttl: Duration) -> Value {
        serde_json::json!({
            "model": model_path,
            "displayName": Self::display_name(prompt),
            "systemInstruction": { "parts": [{ "text": prompt }] },
            "ttl": format!("{}s", ttl.as_secs().max(1)),
        })
    }

    /// Stable, human-searchable label: same prompt, same name.
    fn display_name(prompt: &str) -> String {
        let digest = Sha256::digest(prompt.as_bytes());
        let hex: String = digest.iter().take(6).map(|b| format!("{:02x}", b)).collect();
        format!("context-cache-{}", hex)
    }

    /// Extract generated text; anything short of non-empty text is malformed.
    fn parse_generation(body: &Value) -> Result<String> {
        let candidates = body.get("candidates").and_then(|c| c.as_array());
        let Some(first) = candidates.and_then(|c| c.first()) else {
            let reason = body
                .pointer("/promptFeedback/blockReason")
                .and_then(|v| v.as_str())
                .map(|r| format!("prompt blocked: {}", r))
                .unwrap_or_else(|| "response has no candidates".to_string());
            return Err(Error::malformed_response(reason));
        };

        let text: String = first
            .pointer("/content/parts")
            .and_then(|p| p.as_array())
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect()
            })
            .unwrap_or_default();

        if text.is_empty() {
            let finish = first
                .get("finishReason")
                .and_then(|v| v.as_str())
                .unwrap_or("UNSPECIFIED");
            return Err(Error::malformed_response("candidate contains no text")
                .with_context(ErrorContext::new().with_details(format!("finish_reason: {}", finish))));
        }

        if let Some(usage) = body.get("usageMetadata") {
            debug!(
                prompt_tokens = usage["promptTokenCount"].as_u64().unwrap_or(0),
                cached_tokens = usage["cachedContentTokenCount"].as_u64().unwrap_or(0),
                output_tokens = usage["candidatesTokenCount"].as_u64().unwrap_or(0),
                "gemini usage"
            );
        }

        Ok(text)
    }

    fn parse_json(body: &str) -> Result<Value> {
        serde_json::from_str(body)
            .map_err(|e| Error::malformed_response(format!("invalid JSON body: {}", e)))
    }

    /// One round trip: send, check status, decode JSON, then `parse`. Tags
    /// any error with the operation and logs the outcome.
    async fn call<T, F>(
        &self,
        ctx: &CallContext,
        op: &'static str,
        method: Method,
        path: &str,
        body: Option<&Value>,
        parse: F,
    ) -> Result<T>
    where
        T: Send,
        F: FnOnce(Value) -> Result<T> + Send,
    {
        self.ensure_open(op)?;
        let request_id = Uuid::new_v4().to_string();
        let start = Instant::now();

        let outcome = ctx
            .run(op, async {
                let reply = self
                    .transport
                    .send(op, method, path, body, &request_id)
                    .await?;
                if !reply.is_success() {
                    return Err(error_classification::from_http_reply(
                        op,
                        reply.status,
                        &reply.body,
                        reply.retry_after_ms,
                        &request_id,
                    ));
                }
                let json = if reply.body.trim().is_empty() {
                    Value::Null
                } else {
                    Self::parse_json(&reply.body)?
                };
                parse(json)
            })
            .await;

        let duration_ms = start.elapsed().as_millis() as u64;
        match outcome {
            Ok(out) => {
                debug!(
                    operation = op,
                    request_id = request_id.as_str(),
                    duration_ms,
                    "gemini request succeeded"
                );
                Ok(out)
            }
            Err(e) => {
                let e = e.with_source(op);
                Self::log_failure(op, &request_id, duration_ms, &e);
                Err(e)
            }
        }
    }

    fn log_failure(op: &str, request_id: &str, duration_ms: u64, e: &Error) {
        let class = e.class();
        let status = e.context().status_code.unwrap_or(0);
        if class == ErrorClass::MalformedResponse {
            error!(
                operation = op,
                request_id,
                http_status = status,
                duration_ms,
                error = %e,
                "gemini returned a malformed response"
            );
        } else {
            warn!(
                operation = op,
                request_id,
                http_status = status,
                error_class = class.name(),
                duration_ms,
                "gemini request failed"
            );
        }
    }

    async fn generate(&self, ctx: &CallContext, op: &'static str, body: Value) -> Result<String> {
        let path = format!("{}:generateContent", self.model_path());
        self.call(ctx, op, Method::POST, &path, Some(&body), |json| {
            Self::parse_generation(&json)
        })
        .await
    }
}

#[async_trait]
impl GenerationBackend for GeminiBackend {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn generate_direct(
        &self,
        ctx: &CallContext,
        prompt: &str,
        message: &str,
    ) -> Result<String> {
        self.generate(ctx, "generate_direct", Self::direct_body(prompt, message))
            .await
    }

    async fn generate_with_handle(
        &self,
        ctx: &CallContext,
        handle: &CacheHandle,
        message: &str,
    ) -> Result<String> {
        self.generate(
            ctx,
            "generate_with_handle",
            Self::cached_body(handle, message),
        )
        .await
    }

    async fn create_cache(
        &self,
        ctx: &CallContext,
        prompt: &str,
        ttl: Duration,
    ) -> Result<CacheHandle> {
        let body = Self::create_body(&self.model_path(), prompt, ttl);
        let (name, expire_time) = self
            .call(
                ctx,
                "create_cache",
                Method::POST,
                "cachedContents",
                Some(&body),
                |json| {
                    let name = json
                        .get("name")
                        .and_then(|v| v.as_str())
                        .filter(|s| !s.is_empty())
                        .map(|s| s.to_string())
                        .ok_or_else(|| {
                            Error::malformed_response("cachedContents response has no name")
                        })?;
                    let expire_time = json
                        .get("expireTime")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string());
                    Ok((name, expire_time))
                },
            )
            .await?;

        info!(
            handle = name.as_str(),
            expire_time = expire_time.as_deref().unwrap_or(""),
            ttl_secs = ttl.as_secs(),
            "gemini cached content created"
        );
        Ok(CacheHandle::new(name))
    }

    async fn delete_cache(&self, ctx: &CallContext, handle: &CacheHandle) -> Result<()> {
        match self
            .call(ctx, "delete_cache", Method::DELETE, handle.as_str(), None, |_| Ok(()))
            .await
        {
            Ok(_) => {
                info!(handle = handle.as_str(), "gemini cached content deleted");
                Ok(())
            }
            Err(e)
                if e.context().status_code == Some(404)
                    || e.class() == ErrorClass::CacheInvalid =>
            {
                debug!(
                    handle = handle.as_str(),
                    "cached content already gone; treating delete as done"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn close(&self, _ctx: &CallContext) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(model = self.model.as_str(), "gemini backend closed");
        }
        Ok(())
    }
}

/// Builder for [`GeminiBackend`].
///
/// Keep this surface area small and predictable.
#[derive(Debug, Clone, Default)]
pub struct GeminiBackendBuilder {
    api_key: Option<String>,
    model: Option<String>,
    base_url: Option<String>,
    timeout: Option<Duration>,
    proxy_url: Option<String>,
}

impl GeminiBackendBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate from the environment:
    /// - `GEMINI_API_KEY` (or `GOOGLE_API_KEY`)
    /// - `CONTEXT_CACHE_MODEL`
    /// - `CONTEXT_CACHE_BASE_URL`
    ///
    /// Transport knobs (`CONTEXT_CACHE_HTTP_TIMEOUT_SECS`,
    /// `CONTEXT_CACHE_PROXY_URL`) are read when the transport is built.
    pub fn from_env() -> Self {
        Self {
            api_key: env::var("GEMINI_API_KEY")
                .or_else(|_| env::var("GOOGLE_API_KEY"))
                .ok()
                .filter(|k| !k.trim().is_empty()),
            model: env::var("CONTEXT_CACHE_MODEL").ok(),
            base_url: env::var("CONTEXT_CACHE_BASE_URL").ok(),
            timeout: None,
            proxy_url: None,
        }
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Override the API base URL.
    ///
    /// This is primarily for testing with mock servers.
    pub fn base_url_override(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Per-request HTTP timeout; caller deadlines still apply on top.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn proxy(mut self, proxy_url: impl Into<String>) -> Self {
        self.proxy_url = Some(proxy_url.into());
        self
    }

    pub fn build(self) -> Result<GeminiBackend> {
        let api_key = self.api_key.ok_or_else(|| {
            Error::configuration_with_context(
                "missing API key",
                ErrorContext::new()
                    .with_source("gemini_builder")
                    .with_details("set GEMINI_API_KEY or call api_key()"),
            )
        })?;

        let mut config = TransportConfig::new(
            self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL),
            api_key,
        );
        if let Some(t) = self.timeout {
            config.timeout = t;
        }
        if self.proxy_url.is_some() {
            config.proxy_url = self.proxy_url;
        }

        Ok(GeminiBackend {
            transport: HttpTransport::new(&config)?,
            model: self.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            closed: AtomicBool::new(false),
        })
    }
}
