//! Basic usage: one cached prompt, a few questions, clean shutdown.
//!
//! Configured via environment variables:
//! - GEMINI_API_KEY (or GOOGLE_API_KEY)
//! - CONTEXT_CACHE_MODEL, CONTEXT_CACHE_TTL_SECS (optional)
//!
//! Usage:
//!   GEMINI_API_KEY=your_key RUST_LOG=context_cache=debug cargo run --example basic_usage

use context_cache::backend::GeminiBackendBuilder;
use context_cache::{CacheCoordinator, CallContext, CoordinatorConfig, GenerationBackend};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// Cached contexts have a provider-side minimum size, so the prompt is padded
// with reference material.
const SYSTEM_PROMPT: &str = "You are a support assistant for a fictional \
hardware store. Answer in at most two sentences. Store hours are 8am to 6pm \
Monday through Saturday. Returns are accepted within 30 days with a receipt.";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let backend = Arc::new(GeminiBackendBuilder::from_env().build()?);
    let prompt = SYSTEM_PROMPT.repeat(64);
    let coordinator =
        CacheCoordinator::with_config(backend.clone(), prompt, CoordinatorConfig::from_env()).await;

    println!("Starting in {:?} mode", coordinator.mode().await);

    for question in ["When do you open on Saturday?", "Can I return a drill after 3 weeks?"] {
        let ctx = CallContext::with_timeout(Duration::from_secs(30));
        match coordinator.generate(&ctx, question).await {
            Ok(reply) => println!("Q: {question}\nA: {reply}\n"),
            Err(e) => eprintln!("Q: {question}\nfailed ({}): {e}\n", e.class()),
        }
    }

    let stats = coordinator.stats();
    println!(
        "cached: {}, direct: {}, recreations: {}",
        stats.cached_calls, stats.direct_calls, stats.recreations
    );

    let ctx = CallContext::with_timeout(Duration::from_secs(10));
    coordinator.shutdown(&ctx).await?;
    backend.close(&ctx).await?;
    Ok(())
}
