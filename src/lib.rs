//! # context-cache
//!
//! 带缓存上下文的生成协调器：对调用方透明地复用服务端缓存的系统提示，并在缓存失效时自动重建或降级。
//!
//! Cache-backed generation coordinator for LLM services that support
//! server-side cached contexts.
//!
//! ## Overview
//!
//! A long system prompt is uploaded once as a cached context. Each generation
//! call then references the cache instead of resending the prompt. Caches
//! expire or get evicted; when that happens the coordinator recreates the
//! cache once and retries, or falls back to sending the full prompt. Callers
//! never observe the difference.
//!
//! ## Core Philosophy
//!
//! - **Fail soft**: cache trouble degrades cost, never correctness
//! - **Stateless backends**: only the coordinator owns the live handle
//! - **Classified errors**: every failure carries an [`ErrorClass`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use context_cache::backend::GeminiBackendBuilder;
//! use context_cache::{CacheCoordinator, CallContext, CoordinatorConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> context_cache::Result<()> {
//!     let backend = Arc::new(GeminiBackendBuilder::from_env().build()?);
//!     let coordinator = CacheCoordinator::with_config(
//!         backend,
//!         "You are a terse assistant.",
//!         CoordinatorConfig::from_env(),
//!     )
//!     .await;
//!
//!     let ctx = CallContext::with_timeout(Duration::from_secs(30));
//!     let reply = coordinator.generate(&ctx, "Say hello.").await?;
//!     println!("{reply}");
//!
//!     coordinator.shutdown(&ctx).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`coordinator`] | Cache lifecycle, recovery and fallback |
//! | [`backend`] | Backend trait, Gemini REST backend, scripted test backend |
//! | [`transport`] | Shared HTTP client |
//! | [`context`] | Per-call deadlines and cancellation |
//! | [`error`] | Error type and structured context |
//! | [`error_class`] | Failure classes and their codes |

pub mod backend;
pub mod context;
pub mod coordinator;
pub mod error_class;
pub mod transport;

// Re-export main types for convenience
pub use backend::{CacheHandle, GenerationBackend};
pub use context::CallContext;
pub use coordinator::{CacheCoordinator, CoordinatorConfig, CoordinatorState, CoordinatorStats, Mode};
pub use error_class::ErrorClass;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
