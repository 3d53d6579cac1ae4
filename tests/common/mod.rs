//! Mock Gemini server setup for integration tests

#![allow(dead_code)]

use context_cache::backend::{GeminiBackend, GeminiBackendBuilder};
use mockito::{Matcher, Mock, Server, ServerGuard};

pub const API_KEY: &str = "test-key";
pub const MODEL: &str = "gemini-test";

/// Test fixture that owns a mock server and knows the Gemini paths.
pub struct MockGemini {
    pub server: ServerGuard,
}

impl MockGemini {
    pub async fn new() -> Self {
        Self {
            server: Server::new_async().await,
        }
    }

    /// A backend pointed at the mock server through `base_url_override`.
    pub fn backend(&self) -> GeminiBackend {
        GeminiBackendBuilder::new()
            .api_key(API_KEY)
            .model(MODEL)
            .base_url_override(self.server.url())
            .build()
            .expect("backend builds")
    }

    pub fn generate_path() -> String {
        format!("/models/{}:generateContent", MODEL)
    }

    /// generateContent reply carrying `text` as the single part.
    pub fn reply_body(text: &str) -> String {
        serde_json::json!({
            "candidates": [{
                "content": { "role": "model", "parts": [{ "text": text }] },
                "finishReason": "STOP"
            }],
            "usageMetadata": {
                "promptTokenCount": 40,
                "cachedContentTokenCount": 32,
                "candidatesTokenCount": 3
            }
        })
        .to_string()
    }

    pub fn error_body(code: u16, status: &str, message: &str) -> String {
        serde_json::json!({
            "error": { "code": code, "message": message, "status": status }
        })
        .to_string()
    }

    /// generateContent that succeeds with `text`, any body.
    pub async fn mock_generate(&mut self, text: &str) -> Mock {
        self.server
            .mock("POST", Self::generate_path().as_str())
            .match_header("x-goog-api-key", API_KEY)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(Self::reply_body(text))
            .create_async()
            .await
    }

    /// generateContent for a specific cached content name.
    pub async fn mock_generate_cached(&mut self, name: &str, status: usize, body: String) -> Mock {
        self.server
            .mock("POST", Self::generate_path().as_str())
            .match_body(Matcher::PartialJson(
                serde_json::json!({ "cachedContent": name }),
            ))
            .with_status(status)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create_async()
            .await
    }

    pub async fn mock_create(&mut self, status: usize, body: String) -> Mock {
        self.server
            .mock("POST", "/cachedContents")
            .match_header("x-goog-api-key", API_KEY)
            .with_status(status)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create_async()
            .await
    }

    pub async fn mock_delete(&mut self, name: &str, status: usize) -> Mock {
        self.server
            .mock("DELETE", format!("/{}", name).as_str())
            .with_status(status)
            .with_header("content-type", "application/json")
            .with_body("{}")
            .create_async()
            .await
    }
}
