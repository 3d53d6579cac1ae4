//! In-memory backend with programmable outcomes, for testing.
//!
//! Every operation either pops a queued one-shot outcome or falls back to the
//! operation's default. All calls that would have reached the network are
//! journaled so tests can assert exactly what the coordinator did.

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{CacheHandle, GenerationBackend};
use crate::context::CallContext;
use crate::error_class::ErrorClass;
use crate::{Error, ErrorContext, Result};

/// Scripted result: a value, or a failure of the given class.
pub type Outcome<T> = std::result::Result<T, ErrorClass>;

/// One journaled backend invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    GenerateDirect { prompt: String, message: String },
    GenerateWithHandle { handle: String, message: String },
    CreateCache { prompt: String, ttl: Duration },
    DeleteCache { handle: String },
}

#[derive(Debug)]
struct Script<T> {
    queue: VecDeque<Outcome<T>>,
    default: Option<Outcome<T>>,
}

impl<T: Clone> Script<T> {
    fn new(default: Option<Outcome<T>>) -> Self {
        Self {
            queue: VecDeque::new(),
            default,
        }
    }

    fn next(&mut self) -> Option<Outcome<T>> {
        self.queue.pop_front().or_else(|| self.default.clone())
    }
}

#[derive(Debug)]
struct State {
    calls: Vec<BackendCall>,
    direct: Script<String>,
    cached: Script<String>,
    // No default means "mint H1, H2, ..." in creation order.
    create: Script<CacheHandle>,
    delete: Script<()>,
    created: u32,
    invalid_handles: HashSet<String>,
}

#[derive(Debug)]
pub struct ScriptedBackend {
    state: Mutex<State>,
    latency: Mutex<Option<Duration>>,
    closed: AtomicBool,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    /// Defaults: direct → `"direct"`, cached → `"cached"`, create → `H1`,
    /// `H2`, ..., delete → ok.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                calls: Vec::new(),
                direct: Script::new(Some(Ok("direct".to_string()))),
                cached: Script::new(Some(Ok("cached".to_string()))),
                create: Script::new(None),
                delete: Script::new(Some(Ok(()))),
                created: 0,
                invalid_handles: HashSet::new(),
            }),
            latency: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        // A panicking test thread must not hide the journal from the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Simulated network latency applied to every call.
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = Some(latency);
        self
    }

    pub fn on_direct(&self, outcome: Outcome<&str>) -> &Self {
        self.state().direct.default = Some(outcome.map(str::to_string));
        self
    }

    pub fn push_direct(&self, outcome: Outcome<&str>) -> &Self {
        self.state().direct.queue.push_back(outcome.map(str::to_string));
        self
    }

    pub fn on_cached(&self, outcome: Outcome<&str>) -> &Self {
        self.state().cached.default = Some(outcome.map(str::to_string));
        self
    }

    pub fn push_cached(&self, outcome: Outcome<&str>) -> &Self {
        self.state().cached.queue.push_back(outcome.map(str::to_string));
        self
    }

    pub fn on_create(&self, outcome: Outcome<&str>) -> &Self {
        self.state().create.default = Some(outcome.map(CacheHandle::from));
        self
    }

    pub fn push_create(&self, outcome: Outcome<&str>) -> &Self {
        self.state().create.queue.push_back(outcome.map(CacheHandle::from));
        self
    }

    pub fn on_delete(&self, outcome: Outcome<()>) -> &Self {
        self.state().delete.default = Some(outcome);
        self
    }

    /// Every cached call using `handle` fails with `cache_invalid`,
    /// regardless of the cached script.
    pub fn invalidate_handle(&self, handle: &str) -> &Self {
        self.state().invalid_handles.insert(handle.to_string());
        self
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.state().calls.clone()
    }

    pub fn create_cache_calls(&self) -> usize {
        self.count(|c| matches!(c, BackendCall::CreateCache { .. }))
    }

    pub fn direct_calls(&self) -> usize {
        self.count(|c| matches!(c, BackendCall::GenerateDirect { .. }))
    }

    pub fn cached_calls(&self) -> usize {
        self.count(|c| matches!(c, BackendCall::GenerateWithHandle { .. }))
    }

    pub fn delete_cache_calls(&self) -> usize {
        self.count(|c| matches!(c, BackendCall::DeleteCache { .. }))
    }

    /// Calls that would have touched the network.
    pub fn total_calls(&self) -> usize {
        self.state().calls.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn count(&self, pred: impl Fn(&BackendCall) -> bool) -> usize {
        self.state().calls.iter().filter(|c| pred(c)).count()
    }

    fn ensure_open(&self, op: &str) -> Result<()> {
        if self.is_closed() {
            return Err(Error::closed("scripted backend is closed").with_source(op));
        }
        Ok(())
    }

    fn fail(op: &str, class: ErrorClass) -> Error {
        Error::backend(
            class,
            format!("scripted {} failure", class),
            ErrorContext::new().with_source(op),
        )
    }

    /// Scripted text as a generation result; empty text is malformed.
    fn text(op: &str, outcome: Option<Outcome<String>>) -> Result<String> {
        match outcome {
            Some(Ok(text)) if text.is_empty() => {
                Err(Error::malformed_response("candidate contains no text").with_source(op))
            }
            Some(Ok(text)) => Ok(text),
            Some(Err(class)) => Err(Self::fail(op, class)),
            None => Err(Self::fail(op, ErrorClass::Unknown)),
        }
    }

    /// Wait out the simulated latency under the caller's context.
    async fn travel(&self, ctx: &CallContext, op: &str) -> Result<()> {
        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        ctx.run(op, async {
            if let Some(d) = latency {
                tokio::time::sleep(d).await;
            }
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate_direct(
        &self,
        ctx: &CallContext,
        prompt: &str,
        message: &str,
    ) -> Result<String> {
        const OP: &str = "generate_direct";
        self.ensure_open(OP)?;
        let outcome = {
            let mut st = self.state();
            st.calls.push(BackendCall::GenerateDirect {
                prompt: prompt.to_string(),
                message: message.to_string(),
            });
            st.direct.next()
        };
        self.travel(ctx, OP).await?;
        Self::text(OP, outcome)
    }

    async fn generate_with_handle(
        &self,
        ctx: &CallContext,
        handle: &CacheHandle,
        message: &str,
    ) -> Result<String> {
        const OP: &str = "generate_with_handle";
        self.ensure_open(OP)?;
        let outcome = {
            let mut st = self.state();
            st.calls.push(BackendCall::GenerateWithHandle {
                handle: handle.to_string(),
                message: message.to_string(),
            });
            if st.invalid_handles.contains(handle.as_str()) {
                Some(Err(ErrorClass::CacheInvalid))
            } else {
                st.cached.next()
            }
        };
        self.travel(ctx, OP).await?;
        Self::text(OP, outcome)
    }

    async fn create_cache(
        &self,
        ctx: &CallContext,
        prompt: &str,
        ttl: Duration,
    ) -> Result<CacheHandle> {
        const OP: &str = "create_cache";
        self.ensure_open(OP)?;
        let outcome = {
            let mut st = self.state();
            st.calls.push(BackendCall::CreateCache {
                prompt: prompt.to_string(),
                ttl,
            });
            st.created += 1;
            let seq = st.created;
            st.create
                .next()
                .unwrap_or_else(|| Ok(CacheHandle::new(format!("H{}", seq))))
        };
        self.travel(ctx, OP).await?;
        outcome.map_err(|class| Self::fail(OP, class))
    }

    async fn delete_cache(&self, ctx: &CallContext, handle: &CacheHandle) -> Result<()> {
        const OP: &str = "delete_cache";
        self.ensure_open(OP)?;
        let outcome = {
            let mut st = self.state();
            st.calls.push(BackendCall::DeleteCache {
                handle: handle.to_string(),
            });
            st.delete.next()
        };
        self.travel(ctx, OP).await?;
        match outcome {
            Some(Err(class)) => Err(Self::fail(OP, class)),
            _ => Ok(()),
        }
    }

    async fn close(&self, _ctx: &CallContext) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
