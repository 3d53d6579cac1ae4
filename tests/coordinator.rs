//! Coordinator behavior against the scripted backend: fallback, recovery,
//! shutdown and concurrent recreation.

use context_cache::backend::{BackendCall, ScriptedBackend};
use context_cache::{
    CacheCoordinator, CallContext, CoordinatorConfig, CoordinatorState, ErrorClass, Mode,
};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const PROMPT: &str = "You are a helpful assistant.";

async fn coordinator(backend: &Arc<ScriptedBackend>) -> CacheCoordinator {
    CacheCoordinator::new(backend.clone(), PROMPT).await
}

#[tokio::test]
async fn test_cached_call_uses_handle() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.on_cached(Ok("pong"));
    let c = coordinator(&backend).await;

    let reply = c.generate(&CallContext::background(), "ping").await.unwrap();
    assert_eq!(reply, "pong");
    assert_eq!(
        backend.calls(),
        vec![
            BackendCall::CreateCache {
                prompt: PROMPT.into(),
                ttl: Duration::from_secs(3600)
            },
            BackendCall::GenerateWithHandle {
                handle: "H1".into(),
                message: "ping".into()
            },
        ]
    );
}

#[tokio::test]
async fn test_construction_failure_starts_direct() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.on_create(Err(ErrorClass::Unknown)).on_direct(Ok("hello"));
    let c = coordinator(&backend).await;

    assert_eq!(c.mode().await, Mode::Direct);
    assert_eq!(c.state().await, CoordinatorState::ActiveDirect);
    assert!(c.handle().await.is_none());

    let reply = c.generate(&CallContext::background(), "hi").await.unwrap();
    assert_eq!(reply, "hello");
    assert_eq!(
        backend.calls().last(),
        Some(&BackendCall::GenerateDirect {
            prompt: PROMPT.into(),
            message: "hi".into()
        })
    );
    // Direct mode never retries creation without a re-cache interval.
    c.generate(&CallContext::background(), "again").await.unwrap();
    assert_eq!(backend.create_cache_calls(), 1);
}

#[tokio::test]
async fn test_invalid_cache_recreated_once_then_retried() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.push_cached(Err(ErrorClass::CacheInvalid)).on_cached(Ok("ok"));
    let c = coordinator(&backend).await;

    let reply = c.generate(&CallContext::background(), "hi").await.unwrap();
    assert_eq!(reply, "ok");
    assert_eq!(backend.create_cache_calls(), 2);
    assert_eq!(c.handle().await.map(|h| h.into_inner()), Some("H2".to_string()));

    let handles: Vec<String> = backend
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            BackendCall::GenerateWithHandle { handle, .. } => Some(handle),
            _ => None,
        })
        .collect();
    assert_eq!(handles, vec!["H1".to_string(), "H2".to_string()]);

    let stats = c.stats();
    assert_eq!(stats.cache_invalidations, 1);
    assert_eq!(stats.recreations, 2);
    assert_eq!(stats.downgrades, 0);
}

#[tokio::test]
async fn test_retry_failure_is_returned_without_second_recreation() {
    let backend = Arc::new(ScriptedBackend::new());
    backend
        .push_cached(Err(ErrorClass::CacheInvalid))
        .push_cached(Err(ErrorClass::CacheInvalid));
    let c = coordinator(&backend).await;

    let err = c.generate(&CallContext::background(), "hi").await.unwrap_err();
    assert!(err.is_cache_invalid());
    assert_eq!(backend.create_cache_calls(), 2);
    assert_eq!(backend.cached_calls(), 2);
}

#[tokio::test]
async fn test_failed_recreation_falls_back_to_direct() {
    let backend = Arc::new(ScriptedBackend::new());
    let c = coordinator(&backend).await;
    backend
        .push_cached(Err(ErrorClass::CacheInvalid))
        .on_create(Err(ErrorClass::Network))
        .on_direct(Ok("from direct"));

    let ctx = CallContext::background();
    assert_eq!(c.generate(&ctx, "one").await.unwrap(), "from direct");
    assert_eq!(c.mode().await, Mode::Direct);

    assert_eq!(c.generate(&ctx, "two").await.unwrap(), "from direct");
    assert_eq!(backend.create_cache_calls(), 2);
    assert_eq!(backend.cached_calls(), 1);
    assert_eq!(backend.direct_calls(), 2);
    assert_eq!(c.stats().downgrades, 1);
}

#[tokio::test]
async fn test_other_errors_pass_through_untouched() {
    let backend = Arc::new(ScriptedBackend::new());
    backend
        .push_cached(Err(ErrorClass::RateLimited))
        .push_cached(Err(ErrorClass::Network))
        .push_cached(Err(ErrorClass::Auth));
    let c = coordinator(&backend).await;
    let ctx = CallContext::background();

    for expected in [ErrorClass::RateLimited, ErrorClass::Network, ErrorClass::Auth] {
        let err = c.generate(&ctx, "hi").await.unwrap_err();
        assert_eq!(err.class(), expected);
    }
    assert_eq!(backend.create_cache_calls(), 1);
    assert_eq!(backend.direct_calls(), 0);
    assert_eq!(c.mode().await, Mode::Cached);
}

#[tokio::test]
async fn test_direct_mode_errors_pass_through() {
    let backend = Arc::new(ScriptedBackend::new());
    backend
        .on_create(Err(ErrorClass::Unknown))
        .push_direct(Err(ErrorClass::MalformedResponse));
    let c = coordinator(&backend).await;

    let err = c.generate(&CallContext::background(), "hi").await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::MalformedResponse);
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let backend = Arc::new(ScriptedBackend::new());
    let c = coordinator(&backend).await;
    let ctx = CallContext::background();

    c.shutdown(&ctx).await.unwrap();
    c.shutdown(&ctx).await.unwrap();
    c.shutdown(&ctx).await.unwrap();

    assert_eq!(backend.delete_cache_calls(), 1);
    assert_eq!(
        backend.calls().last(),
        Some(&BackendCall::DeleteCache {
            handle: "H1".into()
        })
    );
    assert!(c.is_closed());
    assert_eq!(c.state().await, CoordinatorState::Closed);
    // The backend belongs to the caller.
    assert!(!backend.is_closed());
}

#[tokio::test]
async fn test_shutdown_swallows_delete_failure() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.on_delete(Err(ErrorClass::Network));
    let c = coordinator(&backend).await;

    c.shutdown(&CallContext::background()).await.unwrap();
    assert_eq!(backend.delete_cache_calls(), 1);
    assert!(c.is_closed());
}

#[tokio::test]
async fn test_shutdown_without_handle_deletes_nothing() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.on_create(Err(ErrorClass::Timeout));
    let c = coordinator(&backend).await;

    c.shutdown(&CallContext::background()).await.unwrap();
    assert_eq!(backend.delete_cache_calls(), 0);
}

#[tokio::test]
async fn test_generate_after_shutdown_is_closed() {
    let backend = Arc::new(ScriptedBackend::new());
    let c = coordinator(&backend).await;
    let ctx = CallContext::background();
    c.shutdown(&ctx).await.unwrap();
    let before = backend.total_calls();

    let err = c.generate(&ctx, "hi").await.unwrap_err();
    assert!(err.is_closed());
    assert_eq!(err.class(), ErrorClass::Closed);
    assert_eq!(backend.total_calls(), before);
}

#[tokio::test]
async fn test_timeout_is_not_treated_as_cache_invalid() {
    let backend = Arc::new(ScriptedBackend::new().with_latency(Duration::from_millis(200)));
    let c = coordinator(&backend).await;

    let ctx = CallContext::with_timeout(Duration::from_millis(20));
    let err = c.generate(&ctx, "hi").await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Timeout);
    assert_eq!(backend.create_cache_calls(), 1);
    assert_eq!(c.mode().await, Mode::Cached);
}

#[tokio::test]
async fn test_cancellation_propagates() {
    let backend = Arc::new(ScriptedBackend::new().with_latency(Duration::from_secs(5)));
    let c = CacheCoordinator::with_config(
        backend.clone(),
        PROMPT,
        CoordinatorConfig::new().with_create_timeout(Duration::from_millis(10)),
    )
    .await;

    let token = CancellationToken::new();
    let ctx = CallContext::with_cancellation(token.clone());
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    });

    let err = c.generate(&ctx, "hi").await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Timeout);
    canceller.await.unwrap();
}

#[tokio::test]
async fn test_recache_interval_rearms_direct_mode() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.on_create(Err(ErrorClass::Network));
    let c = CacheCoordinator::with_config(
        backend.clone(),
        PROMPT,
        CoordinatorConfig::new().with_recache_interval(Duration::from_millis(50)),
    )
    .await;
    let ctx = CallContext::background();

    // Not due yet.
    assert_eq!(c.generate(&ctx, "a").await.unwrap(), "direct");
    assert_eq!(backend.create_cache_calls(), 1);

    tokio::time::sleep(Duration::from_millis(80)).await;
    backend.on_create(Ok("H9"));
    assert_eq!(c.generate(&ctx, "b").await.unwrap(), "cached");
    assert_eq!(backend.create_cache_calls(), 2);
    assert_eq!(c.handle().await.map(|h| h.into_inner()), Some("H9".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_invalidation_single_recreation() {
    let backend = Arc::new(ScriptedBackend::new().with_latency(Duration::from_millis(20)));
    let c = Arc::new(coordinator(&backend).await);
    backend.invalidate_handle("H1");

    let tasks = (0..16).map(|i| {
        let c = c.clone();
        tokio::spawn(async move {
            c.generate(&CallContext::background(), &format!("q{}", i))
                .await
        })
    });
    for result in join_all(tasks).await {
        assert_eq!(result.unwrap().unwrap(), "cached");
    }

    assert_eq!(backend.create_cache_calls(), 2);
    assert_eq!(c.handle().await.map(|h| h.into_inner()), Some("H2".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_invalidation_single_failed_recreation() {
    let backend = Arc::new(ScriptedBackend::new().with_latency(Duration::from_millis(20)));
    let c = Arc::new(coordinator(&backend).await);
    backend
        .invalidate_handle("H1")
        .on_create(Err(ErrorClass::RateLimited));

    let tasks = (0..16).map(|i| {
        let c = c.clone();
        tokio::spawn(async move {
            c.generate(&CallContext::background(), &format!("q{}", i))
                .await
        })
    });
    for result in join_all(tasks).await {
        assert_eq!(result.unwrap().unwrap(), "direct");
    }

    assert_eq!(backend.create_cache_calls(), 2);
    assert_eq!(c.mode().await, Mode::Direct);
    assert_eq!(c.stats().downgrades, 1);
}

#[tokio::test]
async fn test_shutdown_races_with_generate() {
    let backend = Arc::new(ScriptedBackend::new().with_latency(Duration::from_millis(10)));
    let c = Arc::new(coordinator(&backend).await);
    backend.invalidate_handle("H1");

    let ctx = CallContext::background();
    let (generated, shut) = tokio::join!(c.generate(&ctx, "hi"), c.shutdown(&ctx));
    shut.unwrap();
    // Either served before the close, or rejected as closed; never a leaked handle.
    if let Err(e) = generated {
        assert!(e.is_closed() || e.is_cache_invalid());
    }
    assert!(c.handle().await.is_none());
    assert!(backend.delete_cache_calls() <= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_all_invalid_single_recreation() {
    let backend = Arc::new(ScriptedBackend::new().with_latency(Duration::from_millis(20)));
    let c = Arc::new(coordinator(&backend).await);
    backend.on_cached(Err(ErrorClass::CacheInvalid));

    let tasks = (0..16).map(|i| {
        let c = c.clone();
        tokio::spawn(async move {
            c.generate(&CallContext::background(), &format!("q{}", i))
                .await
        })
    });
    for result in join_all(tasks).await {
        assert!(result.unwrap().unwrap_err().is_cache_invalid());
    }

    assert_eq!(backend.create_cache_calls(), 2);
}

/// Start a background call that holds the slot lock through a slow
/// recreation. Returns once the recreation is in flight.
async fn recovering(
    backend: &Arc<ScriptedBackend>,
) -> (
    Arc<CacheCoordinator>,
    tokio::task::JoinHandle<context_cache::Result<String>>,
) {
    let c = Arc::new(coordinator(backend).await);
    backend.invalidate_handle("H1");
    let bg = {
        let c = c.clone();
        tokio::spawn(async move { c.generate(&CallContext::background(), "slow").await })
    };
    // Cached call takes 500ms, then create_cache holds the lock for 500ms.
    tokio::time::sleep(Duration::from_millis(700)).await;
    (c, bg)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_generate_lock_wait_honors_deadline() {
    let backend = Arc::new(ScriptedBackend::new().with_latency(Duration::from_millis(500)));
    let (c, bg) = recovering(&backend).await;

    let started = std::time::Instant::now();
    let err = c
        .generate(&CallContext::with_timeout(Duration::from_millis(50)), "fast")
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Timeout);
    assert!(started.elapsed() < Duration::from_millis(250));

    assert_eq!(bg.await.unwrap().unwrap(), "cached");
    assert_eq!(backend.create_cache_calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_lock_wait_honors_deadline() {
    let backend = Arc::new(ScriptedBackend::new().with_latency(Duration::from_millis(500)));
    let (c, bg) = recovering(&backend).await;

    let started = std::time::Instant::now();
    c.shutdown(&CallContext::with_timeout(Duration::from_millis(50)))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(250));
    assert!(c.is_closed());

    // The recreation finishes after shutdown and deletes what it minted.
    let err = bg.await.unwrap().unwrap_err();
    assert!(err.is_closed());
    assert_eq!(backend.delete_cache_calls(), 1);
    assert_eq!(
        backend.calls().last(),
        Some(&BackendCall::DeleteCache {
            handle: "H2".into()
        })
    );
    assert!(c.handle().await.is_none());
}
