//! 错误分类：生成后端失败的封闭分类体系。
//!
//! Closed error taxonomy for generation backend failures.
//!
//! Every failure that leaves a [`GenerationBackend`](crate::backend::GenerationBackend)
//! carries exactly one [`ErrorClass`]. The set is deliberately small so that
//! calling code can pick a policy (retry now, retry later, surface to the user,
//! alert an operator) without inspecting vendor-specific detail.
//!
//! | Code  | Class                | Guidance                                   |
//! |-------|----------------------|--------------------------------------------|
//! | C1001 | `timeout`            | retry with backoff                         |
//! | C1002 | `rate_limited`       | retry later, honor `retry_after_ms`        |
//! | C1003 | `network`            | transient, retry                           |
//! | C2001 | `malformed_response` | backend contract violation, log loudly     |
//! | C2002 | `auth`               | credentials/configuration, usually fatal   |
//! | C3001 | `cache_invalid`      | healed by the coordinator                  |
//! | C4001 | `closed`             | local, raised after shutdown               |
//! | C9999 | `unknown`            | unclassified                               |
//!
//! ## Example
//!
//! ```rust
//! use context_cache::error_class::ErrorClass;
//!
//! let class = ErrorClass::from_http_status(429);
//! assert_eq!(class, ErrorClass::RateLimited);
//! assert_eq!(class.code(), "C1002");
//! assert!(class.retryable());
//! ```

use std::fmt;

/// Classification tag attached to every backend failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Deadline exceeded or the call was cancelled.
    Timeout,
    /// The remote service throttled the request.
    RateLimited,
    /// Connection-level or transient server failure.
    Network,
    /// The remote answered, but not in a shape we can use.
    MalformedResponse,
    /// Invalid, missing or insufficient credentials.
    Auth,
    /// The supplied cache handle is expired, deleted or unknown.
    CacheInvalid,
    /// The client or coordinator has been shut down.
    Closed,
    /// Could not be classified.
    Unknown,
}

impl ErrorClass {
    /// Returns the canonical code string (e.g. `"C3001"`).
    #[inline]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout => "C1001",
            Self::RateLimited => "C1002",
            Self::Network => "C1003",
            Self::MalformedResponse => "C2001",
            Self::Auth => "C2002",
            Self::CacheInvalid => "C3001",
            Self::Closed => "C4001",
            Self::Unknown => "C9999",
        }
    }

    /// Returns the snake_case name used in logs (e.g. `"cache_invalid"`).
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Network => "network",
            Self::MalformedResponse => "malformed_response",
            Self::Auth => "auth",
            Self::CacheInvalid => "cache_invalid",
            Self::Closed => "closed",
            Self::Unknown => "unknown",
        }
    }

    /// Whether a caller may reasonably retry the same request later.
    ///
    /// The coordinator never retries on these itself; this is guidance for the
    /// application layer.
    #[inline]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::RateLimited | Self::Network)
    }

    /// Parses a class name as produced by [`ErrorClass::name`].
    pub fn from_name(name: &str) -> Option<Self> {
        let class = match name {
            "timeout" => Self::Timeout,
            "rate_limited" => Self::RateLimited,
            "network" => Self::Network,
            "malformed_response" => Self::MalformedResponse,
            "auth" => Self::Auth,
            "cache_invalid" => Self::CacheInvalid,
            "closed" => Self::Closed,
            "unknown" => Self::Unknown,
            _ => return None,
        };
        Some(class)
    }

    /// Maps an HTTP status code to the most likely class.
    ///
    /// Cache-invalid cannot be derived from a status alone (the service reports
    /// it as 403/404 with a specific message); see
    /// [`classify_http`](crate::backend::error_classification::classify_http).
    pub fn from_http_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Auth,
            408 | 504 => Self::Timeout,
            429 => Self::RateLimited,
            500 | 502 | 503 => Self::Network,
            _ => Self::Unknown,
        }
    }

    /// Maps a Google RPC status string (`error.status` in JSON error bodies).
    pub fn from_rpc_status(status: &str) -> Option<Self> {
        let class = match status {
            "RESOURCE_EXHAUSTED" => Self::RateLimited,
            "UNAUTHENTICATED" | "PERMISSION_DENIED" => Self::Auth,
            "DEADLINE_EXCEEDED" | "CANCELLED" => Self::Timeout,
            "UNAVAILABLE" | "INTERNAL" => Self::Network,
            _ => return None,
        };
        Some(class)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
