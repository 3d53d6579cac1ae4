use std::env;
use std::time::Duration;

/// Coordinator tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// TTL requested for every cached context.
    pub default_ttl: Duration,
    /// Upper bound for the construction-time cache creation.
    pub create_timeout: Duration,
    /// When set, a coordinator in direct mode tries to create a cache again
    /// once this much time has passed since the last attempt. `None` means a
    /// coordinator that fell back to direct mode stays there.
    pub recache_interval: Option<Duration>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            create_timeout: Duration::from_secs(30),
            recache_interval: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden from the environment:
    /// - `CONTEXT_CACHE_TTL_SECS` (default 3600)
    /// - `CONTEXT_CACHE_CREATE_TIMEOUT_SECS` (default 30)
    /// - `CONTEXT_CACHE_RECACHE_INTERVAL_SECS` (unset or 0 disables)
    pub fn from_env() -> Self {
        let secs = |name: &str| env::var(name).ok().and_then(|s| s.trim().parse::<u64>().ok());
        let mut cfg = Self::default();
        if let Some(ttl) = secs("CONTEXT_CACHE_TTL_SECS").filter(|s| *s > 0) {
            cfg.default_ttl = Duration::from_secs(ttl);
        }
        if let Some(t) = secs("CONTEXT_CACHE_CREATE_TIMEOUT_SECS").filter(|s| *s > 0) {
            cfg.create_timeout = Duration::from_secs(t);
        }
        cfg.recache_interval = secs("CONTEXT_CACHE_RECACHE_INTERVAL_SECS")
            .filter(|s| *s > 0)
            .map(Duration::from_secs);
        cfg
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_create_timeout(mut self, timeout: Duration) -> Self {
        self.create_timeout = timeout;
        self
    }

    pub fn with_recache_interval(mut self, interval: Duration) -> Self {
        self.recache_interval = Some(interval);
        self
    }
}
