//! 生成后端抽象层 — 无状态的远程生成服务适配器
//!
//! Generation backend abstraction. A backend performs exactly one remote call
//! per invocation and hands back either text, a fresh [`CacheHandle`], or an
//! already-classified [`Error`](crate::Error). It keeps no record of which
//! handles exist; handle ownership belongs to the
//! [`CacheCoordinator`](crate::coordinator::CacheCoordinator).

pub mod error_classification;
pub mod gemini;
pub mod scripted;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::context::CallContext;
use crate::Result;

pub use gemini::{GeminiBackend, GeminiBackendBuilder};
pub use scripted::{BackendCall, Outcome, ScriptedBackend};

/// Opaque reference to a server-side cached context.
///
/// Minted by [`GenerationBackend::create_cache`] and only meaningful to the
/// backend that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheHandle(String);

impl CacheHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheHandle {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CacheHandle {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Contract for a remote generation service with explicit context caching.
///
/// Implementations must:
/// - observe the [`CallContext`] and fail with a `timeout` error when it ends,
/// - never return an empty success (`malformed_response` instead),
/// - report a stale handle as `cache_invalid`,
/// - treat deleting an unknown handle as success,
/// - fail every operation with `closed` after [`close`](Self::close), without
///   touching the network.
#[async_trait]
pub trait GenerationBackend: Send + Sync + fmt::Debug {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Send the prompt and the message together.
    async fn generate_direct(&self, ctx: &CallContext, prompt: &str, message: &str)
        -> Result<String>;

    /// Send the message against a previously cached prompt.
    async fn generate_with_handle(
        &self,
        ctx: &CallContext,
        handle: &CacheHandle,
        message: &str,
    ) -> Result<String>;

    /// Create a cached context holding `prompt` for `ttl`.
    async fn create_cache(&self, ctx: &CallContext, prompt: &str, ttl: Duration)
        -> Result<CacheHandle>;

    /// Delete a cached context. Unknown handles are not an error.
    async fn delete_cache(&self, ctx: &CallContext, handle: &CacheHandle) -> Result<()>;

    /// Mark the backend permanently unusable. Idempotent.
    async fn close(&self, ctx: &CallContext) -> Result<()>;
}
