//! 缓存协调器：在缓存上下文与直接调用之间透明切换，并串行化缓存重建。
//!
//! # Cache Coordinator
//!
//! [`CacheCoordinator`] owns one prompt and at most one live [`CacheHandle`].
//! Callers only see [`generate`](CacheCoordinator::generate) and
//! [`shutdown`](CacheCoordinator::shutdown); whether a request went through
//! the cache or carried the full prompt is invisible to them.
//!
//! ## Policy
//!
//! - Construction tries to create the cache once. Failure is not an error: the
//!   coordinator simply starts in direct mode.
//! - Only `cache_invalid` failures are intercepted. Every other error is
//!   returned exactly as the backend produced it.
//! - Recovery makes at most one recreation attempt and one retry per call. A
//!   failed recreation drops the coordinator into direct mode and serves the
//!   current call directly.
//!
//! ## Locking
//!
//! Two independent critical sections:
//!
//! | Lock | Guards | Held across network I/O |
//! |------|--------|-------------------------|
//! | `closed` (`std::sync::RwLock`) | shutdown latch | never |
//! | `slot` (`tokio::sync::Mutex`) | live handle, recreation | yes, during `create_cache` |
//!
//! Recreation runs entirely inside the `slot` lock, so N callers that observe
//! the same invalid handle produce one `create_cache` call. Each handle change
//! bumps a generation counter; a caller that acquires the lock after someone
//! else already replaced the handle skips straight to its retry.
//!
//! Waiting for `slot` is bounded by the caller's [`CallContext`]. A shutdown
//! that gives up waiting leaves the in-flight recreation to delete whatever
//! it mints once it sees the closed flag.
//!
//! ## Example
//!
//! ```rust
//! use context_cache::backend::ScriptedBackend;
//! use context_cache::{CacheCoordinator, CallContext, Mode};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> context_cache::Result<()> {
//! let backend = Arc::new(ScriptedBackend::new());
//! backend.on_cached(Ok("pong"));
//!
//! let coordinator = CacheCoordinator::new(backend.clone(), "You answer ping with pong.").await;
//! assert_eq!(coordinator.mode().await, Mode::Cached);
//!
//! let ctx = CallContext::background();
//! assert_eq!(coordinator.generate(&ctx, "ping").await?, "pong");
//!
//! coordinator.shutdown(&ctx).await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod stats;

pub use config::CoordinatorConfig;
pub use stats::CoordinatorStats;

use std::fmt;
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{CacheHandle, GenerationBackend};
use crate::context::CallContext;
use crate::{Error, Result};
use stats::AtomicStats;

/// Which path the next call would take. Derived from handle presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Cached,
    Direct,
}

/// Externally observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    ActiveCached,
    ActiveDirect,
    Closed,
}

#[derive(Debug, Default)]
struct HandleSlot {
    current: Option<CacheHandle>,
    // Bumped on every replacement or clear of `current`.
    generation: u64,
    last_attempt: Option<Instant>,
}

pub struct CacheCoordinator {
    backend: Arc<dyn GenerationBackend>,
    prompt: String,
    config: CoordinatorConfig,
    closed: RwLock<bool>,
    slot: Mutex<HandleSlot>,
    stats: AtomicStats,
}

impl fmt::Debug for CacheCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheCoordinator")
            .field("backend", &self.backend.name())
            .field("prompt_len", &self.prompt.len())
            .field("config", &self.config)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl CacheCoordinator {
    /// Create a coordinator with default configuration.
    pub async fn new(backend: Arc<dyn GenerationBackend>, prompt: impl Into<String>) -> Self {
        Self::with_config(backend, prompt, CoordinatorConfig::default()).await
    }

    pub async fn with_config(
        backend: Arc<dyn GenerationBackend>,
        prompt: impl Into<String>,
        config: CoordinatorConfig,
    ) -> Self {
        Self::with_context(&CallContext::background(), backend, prompt, config).await
    }

    /// Create a coordinator, bounding the initial cache creation by both
    /// `ctx` and `config.create_timeout`.
    ///
    /// Never fails: if the cache cannot be created the coordinator starts in
    /// direct mode.
    pub async fn with_context(
        ctx: &CallContext,
        backend: Arc<dyn GenerationBackend>,
        prompt: impl Into<String>,
        config: CoordinatorConfig,
    ) -> Self {
        let prompt = prompt.into();
        let stats = AtomicStats::default();
        let create_ctx = ctx.child().deadline_in(config.create_timeout);

        let current = match backend
            .create_cache(&create_ctx, &prompt, config.default_ttl)
            .await
        {
            Ok(handle) => {
                AtomicStats::bump(&stats.recreations);
                info!(
                    backend = backend.name(),
                    handle = handle.as_str(),
                    ttl_secs = config.default_ttl.as_secs(),
                    "cached context created, starting in cached mode"
                );
                Some(handle)
            }
            Err(e) => {
                AtomicStats::bump(&stats.recreation_failures);
                warn!(
                    backend = backend.name(),
                    error_class = e.class().name(),
                    error = %e,
                    "cache creation failed, starting in direct mode"
                );
                None
            }
        };

        Self {
            backend,
            prompt,
            config,
            closed: RwLock::new(false),
            slot: Mutex::new(HandleSlot {
                current,
                generation: 0,
                last_attempt: Some(Instant::now()),
            }),
            stats,
        }
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.stats.to_stats()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.read().unwrap_or_else(|e| e.into_inner())
    }

    /// The live handle, if any. Waits while a recreation is in flight.
    pub async fn handle(&self) -> Option<CacheHandle> {
        self.slot.lock().await.current.clone()
    }

    pub async fn mode(&self) -> Mode {
        if self.slot.lock().await.current.is_some() {
            Mode::Cached
        } else {
            Mode::Direct
        }
    }

    pub async fn state(&self) -> CoordinatorState {
        if self.is_closed() {
            return CoordinatorState::Closed;
        }
        match self.mode().await {
            Mode::Cached => CoordinatorState::ActiveCached,
            Mode::Direct => CoordinatorState::ActiveDirect,
        }
    }

    /// Generate a reply to `message` using the prompt as persistent context.
    ///
    /// Cache trouble never surfaces here: the caller either gets text or the
    /// same classified error it would get without caching.
    pub async fn generate(&self, ctx: &CallContext, message: &str) -> Result<String> {
        if self.is_closed() {
            return Err(Self::closed_error("generate"));
        }

        let Some((handle, generation)) = self.observe(ctx).await? else {
            return self.direct(ctx, message).await;
        };

        match self.cached(ctx, &handle, message).await {
            Err(e) if e.is_cache_invalid() => {
                AtomicStats::bump(&self.stats.cache_invalidations);
                warn!(
                    handle = handle.as_str(),
                    generation,
                    "cached context rejected, recovering"
                );
                self.recover(ctx, generation, message).await
            }
            other => other,
        }
    }

    /// Mark the coordinator closed and delete the live cache.
    ///
    /// Idempotent. Always `Ok` once the closed flag is set: a failed delete
    /// is logged and left to expire by TTL. The backend itself is not closed.
    pub async fn shutdown(&self, ctx: &CallContext) -> Result<()> {
        {
            let mut closed = self.closed.write().unwrap_or_else(|e| e.into_inner());
            if *closed {
                return Ok(());
            }
            *closed = true;
        }

        let handle = match self.lock_slot(ctx, "shutdown").await {
            Ok(mut slot) => {
                slot.generation += 1;
                slot.current.take()
            }
            Err(e) => {
                // The in-flight recreation sees the closed flag and discards
                // whatever it mints.
                warn!(
                    error = %e,
                    "shutdown gave up waiting for an in-flight recreation"
                );
                return Ok(());
            }
        };

        if let Some(handle) = handle {
            self.retire(ctx, &handle).await;
        }

        info!(backend = self.backend.name(), "cache coordinator shut down");
        Ok(())
    }

    /// Snapshot the live handle with its generation, re-arming the cache
    /// first when a re-cache interval is configured and due.
    async fn observe(&self, ctx: &CallContext) -> Result<Option<(CacheHandle, u64)>> {
        let mut slot = self.lock_slot(ctx, "generate").await?;
        if self.is_closed() {
            return Err(Self::closed_error("generate"));
        }
        if slot.current.is_none() && self.recache_due(&slot) {
            self.rearm(ctx, &mut slot).await;
        }
        Ok(slot.current.clone().map(|h| (h, slot.generation)))
    }

    /// Wait for the slot, giving up when `ctx` ends.
    async fn lock_slot(&self, ctx: &CallContext, op: &str) -> Result<MutexGuard<'_, HandleSlot>> {
        ctx.run(op, async { Ok(self.slot.lock().await) }).await
    }

    fn recache_due(&self, slot: &HandleSlot) -> bool {
        match (self.config.recache_interval, slot.last_attempt) {
            (Some(interval), Some(last)) => last.elapsed() >= interval,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    async fn rearm(&self, ctx: &CallContext, slot: &mut MutexGuard<'_, HandleSlot>) {
        slot.last_attempt = Some(Instant::now());
        match self
            .backend
            .create_cache(ctx, &self.prompt, self.config.default_ttl)
            .await
        {
            Ok(handle) if self.is_closed() => self.retire(ctx, &handle).await,
            Ok(handle) => {
                AtomicStats::bump(&self.stats.recreations);
                info!(handle = handle.as_str(), "cached context re-armed");
                slot.current = Some(handle);
                slot.generation += 1;
            }
            Err(e) => {
                AtomicStats::bump(&self.stats.recreation_failures);
                debug!(
                    error_class = e.class().name(),
                    "re-arming cached context failed, staying in direct mode"
                );
            }
        }
    }

    /// One recreation attempt, then one retry. Runs under the slot lock until
    /// the new handle (or the fallback) is committed.
    async fn recover(
        &self,
        ctx: &CallContext,
        observed_generation: u64,
        message: &str,
    ) -> Result<String> {
        let mut slot = self.lock_slot(ctx, "generate").await?;

        // Shutdown may have taken the handle while we waited for the lock.
        if self.is_closed() {
            return Err(Self::closed_error("generate"));
        }

        if slot.generation != observed_generation {
            AtomicStats::bump(&self.stats.skipped_recreations);
            let current = slot.current.clone();
            drop(slot);
            debug!(
                observed_generation,
                "handle already replaced by another caller, skipping recreation"
            );
            return match current {
                Some(handle) => self.cached(ctx, &handle, message).await,
                None => self.direct(ctx, message).await,
            };
        }

        slot.last_attempt = Some(Instant::now());
        let created = self
            .backend
            .create_cache(ctx, &self.prompt, self.config.default_ttl)
            .await;

        // A shutdown that stopped waiting for the slot left this to us.
        if self.is_closed() {
            slot.current = None;
            slot.generation += 1;
            drop(slot);
            if let Ok(handle) = created {
                self.retire(ctx, &handle).await;
            }
            return Err(Self::closed_error("generate"));
        }

        match created {
            Ok(handle) => {
                slot.current = Some(handle.clone());
                slot.generation += 1;
                drop(slot);
                AtomicStats::bump(&self.stats.recreations);
                info!(handle = handle.as_str(), "cached context recreated");
                self.cached(ctx, &handle, message).await
            }
            Err(e) => {
                slot.current = None;
                slot.generation += 1;
                drop(slot);
                AtomicStats::bump(&self.stats.recreation_failures);
                AtomicStats::bump(&self.stats.downgrades);
                warn!(
                    error_class = e.class().name(),
                    error = %e,
                    "cache recreation failed, falling back to direct mode"
                );
                self.direct(ctx, message).await
            }
        }
    }

    async fn cached(&self, ctx: &CallContext, handle: &CacheHandle, message: &str) -> Result<String> {
        AtomicStats::bump(&self.stats.cached_calls);
        self.backend.generate_with_handle(ctx, handle, message).await
    }

    async fn direct(&self, ctx: &CallContext, message: &str) -> Result<String> {
        AtomicStats::bump(&self.stats.direct_calls);
        self.backend
            .generate_direct(ctx, &self.prompt, message)
            .await
    }

    /// Best-effort delete; failures are left to expire by TTL.
    async fn retire(&self, ctx: &CallContext, handle: &CacheHandle) {
        match self.backend.delete_cache(ctx, handle).await {
            Ok(()) => info!(handle = handle.as_str(), "cached context deleted"),
            Err(e) => warn!(
                handle = handle.as_str(),
                error_class = e.class().name(),
                error = %e,
                "failed to delete cached context"
            ),
        }
    }

    fn closed_error(op: &str) -> Error {
        Error::closed("cache coordinator is shut down").with_source(op)
    }
}
