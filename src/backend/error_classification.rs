//! Error classification logic
//!
//! The only place where transport errors and HTTP error bodies are inspected.
//! Everything downstream works with [`ErrorClass`] alone.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error_class::ErrorClass;
use crate::{Error, ErrorContext};

/// Messages the service uses when a `cachedContents/...` reference no longer
/// resolves (expired, deleted, or never existed for this key).
static CACHE_INVALID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(cached[ _]?content\S*\s.*(not found|expired|does not exist|permission denied|invalid))|(cache\S*\s.*(has )?expired)",
    )
    .expect("static regex")
});

/// Provider error fields pulled out of a JSON error body.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct ProviderError {
    pub message: Option<String>,
    pub status: Option<String>,
}

/// Parse the Google-style `{"error": {"code", "message", "status"}}` shape.
pub(crate) fn provider_error(body: &str) -> ProviderError {
    let Ok(json) = serde_json::from_str::<serde_json::Value>(body) else {
        return ProviderError::default();
    };
    let err = json.get("error");
    ProviderError {
        message: err
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        status: err
            .and_then(|e| e.get("status"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
    }
}

/// True when an error message describes an unusable cached context.
pub fn is_cache_invalid_message(message: &str) -> bool {
    CACHE_INVALID_PATTERN.is_match(message)
}

/// Classify a non-success HTTP reply.
///
/// Cache-invalid is checked first because the service reports a stale handle
/// as 403 or 404, which would otherwise read as auth or unknown.
pub fn classify_http(status: u16, body: &str) -> ErrorClass {
    let provider = provider_error(body);
    let text = provider.message.as_deref().unwrap_or(body);

    if matches!(status, 400 | 403 | 404) && is_cache_invalid_message(text) {
        return ErrorClass::CacheInvalid;
    }

    match ErrorClass::from_http_status(status) {
        ErrorClass::Unknown => provider
            .status
            .as_deref()
            .and_then(ErrorClass::from_rpc_status)
            .unwrap_or(ErrorClass::Unknown),
        class => class,
    }
}

/// Build a classified error for a non-success HTTP reply.
pub(crate) fn from_http_reply(
    operation: &str,
    status: u16,
    body: &str,
    retry_after_ms: Option<u64>,
    request_id: &str,
) -> Error {
    let class = classify_http(status, body);
    let provider = provider_error(body);
    let message = provider
        .message
        .clone()
        .unwrap_or_else(|| truncate(body, 512));

    let mut context = ErrorContext::new()
        .with_status_code(status)
        .with_request_id(request_id)
        .with_source(operation);
    if let Some(rpc) = provider.status {
        context = context.with_details(format!("provider_status: {}", rpc));
    }
    if class == ErrorClass::RateLimited {
        if let Some(ms) = retry_after_ms {
            context = context.with_retry_after_ms(ms);
        }
    }

    Error::backend(class, message, context)
}

/// Classify a failure that never produced an HTTP reply (or whose body could
/// not be read).
pub(crate) fn from_transport(operation: &str, err: &reqwest::Error, request_id: &str) -> Error {
    let class = if err.is_timeout() {
        ErrorClass::Timeout
    } else if err.is_decode() {
        ErrorClass::MalformedResponse
    } else if err.is_connect() || err.is_request() || err.is_body() {
        ErrorClass::Network
    } else {
        ErrorClass::Unknown
    };

    Error::backend(
        class,
        err.to_string(),
        ErrorContext::new()
            .with_request_id(request_id)
            .with_source(operation),
    )
}

/// Best-effort parsing of `Retry-After`; only the `<seconds>` form is supported.
pub(crate) fn retry_after_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    let raw = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    let secs: u64 = raw.trim().parse().ok()?;
    Some(secs.saturating_mul(1000))
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
