use crate::error_class::ErrorClass;
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    /// HTTP status returned by the remote service, if any.
    pub status_code: Option<u16>,
    /// Client-generated correlation id sent as `x-request-id`.
    pub request_id: Option<String>,
    /// Server-suggested wait before retrying (from `Retry-After`).
    pub retry_after_ms: Option<u64>,
    /// Additional context about the error (e.g., upstream message, provider status)
    pub details: Option<String>,
    /// Operation that produced the error (e.g., "create_cache", "generate_direct")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status_code(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn with_retry_after_ms(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(ms);
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Unified error type.
///
/// Call failures are always [`Error::Backend`] and carry an [`ErrorClass`];
/// the coordinator makes its decisions on that tag alone.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{class} error: {message}{}", format_context(.context))]
    Backend {
        class: ErrorClass,
        message: String,
        context: ErrorContext,
    },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(status) = ctx.status_code {
        parts.push(format!("status: {}", status));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if let Some(ref id) = ctx.request_id {
        parts.push(format!("request_id: {}", id));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Create a classified backend error with structured context.
    pub fn backend(class: ErrorClass, msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Backend {
            class,
            message: msg.into(),
            context,
        }
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::backend(ErrorClass::Timeout, msg, ErrorContext::new())
    }

    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Self::backend(ErrorClass::RateLimited, msg, ErrorContext::new())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::backend(ErrorClass::Network, msg, ErrorContext::new())
    }

    pub fn malformed_response(msg: impl Into<String>) -> Self {
        Self::backend(ErrorClass::MalformedResponse, msg, ErrorContext::new())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::backend(ErrorClass::Auth, msg, ErrorContext::new())
    }

    pub fn cache_invalid(msg: impl Into<String>) -> Self {
        Self::backend(ErrorClass::CacheInvalid, msg, ErrorContext::new())
    }

    pub fn closed(msg: impl Into<String>) -> Self {
        Self::backend(ErrorClass::Closed, msg, ErrorContext::new())
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Self::backend(ErrorClass::Unknown, msg, ErrorContext::new())
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// Taxonomy tag of this error. Configuration problems are not call
    /// failures and report as [`ErrorClass::Unknown`].
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Backend { class, .. } => *class,
            Error::Configuration { .. } => ErrorClass::Unknown,
        }
    }

    pub fn is_cache_invalid(&self) -> bool {
        self.class() == ErrorClass::CacheInvalid
    }

    pub fn is_closed(&self) -> bool {
        self.class() == ErrorClass::Closed
    }

    pub fn context(&self) -> &ErrorContext {
        match self {
            Error::Backend { context, .. } | Error::Configuration { context, .. } => context,
        }
    }

    /// Attach (replace) the structured context.
    pub fn with_context(mut self, new_ctx: ErrorContext) -> Self {
        match &mut self {
            Error::Backend { context, .. } | Error::Configuration { context, .. } => {
                *context = new_ctx;
            }
        }
        self
    }

    /// Record which operation produced this error, keeping any other context.
    pub fn with_source(mut self, source: &str) -> Self {
        match &mut self {
            Error::Backend { context, .. } | Error::Configuration { context, .. } => {
                if context.source.is_none() {
                    context.source = Some(source.to_string());
                }
            }
        }
        self
    }

    /// Suggested wait before retrying, when the remote supplied one.
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        self.context()
            .retry_after_ms
            .map(std::time::Duration::from_millis)
    }
}
