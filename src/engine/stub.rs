use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::traits::ModelEngine;
use super::types::EngineError;
use crate::config::DEFAULT_SERVER_BASE_URL;
use crate::models::Message;

const STUB_MODELS: &[&str] = &["stub-small", "stub-large"];
const TITLE_WORDS: usize = 5;

#[derive(Debug)]
struct StubState {
    initialized: bool,
    base_url: String,
    selected: Option<String>,
}

/// Offline engine that answers without a server. Useful for demos and for
/// exercising the UI before a local server is running.
pub struct StubEngine {
    latency: Duration,
    state: Mutex<StubState>,
}

impl StubEngine {
    pub fn new() -> Self {
        Self::with_latency(Duration::ZERO)
    }

    /// Every async call sleeps for `latency` first, to imitate a real server.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            state: Mutex::new(StubState {
                initialized: false,
                base_url: DEFAULT_SERVER_BASE_URL.to_string(),
                selected: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

impl Default for StubEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelEngine for StubEngine {
    async fn initialize(&self) -> Result<bool, EngineError> {
        self.pause().await;
        self.state().initialized = true;
        Ok(true)
    }

    async fn list_models(&self) -> Result<Vec<String>, EngineError> {
        Ok(STUB_MODELS.iter().map(|m| m.to_string()).collect())
    }

    fn select_model(&self, model_id: &str) {
        self.state().selected = Some(model_id.to_string());
    }

    fn selected_model(&self) -> Option<String> {
        self.state().selected.clone()
    }

    fn set_base_url(&self, base_url: &str) {
        self.state().base_url = base_url.to_string();
    }

    fn base_url(&self) -> String {
        self.state().base_url.clone()
    }

    async fn generate_reply(
        &self,
        prompt: &str,
        _context: &[Message],
    ) -> Result<String, EngineError> {
        self.pause().await;
        if !self.state().initialized {
            return Ok("Model not initialized.".to_string());
        }
        Ok(format!("[Local mock] Received: {}", prompt))
    }

    async fn generate_conversation_title(
        &self,
        first_prompt: &str,
    ) -> Result<String, EngineError> {
        self.pause().await;
        Ok(first_prompt
            .split_whitespace()
            .take(TITLE_WORDS)
            .collect::<Vec<_>>()
            .join(" "))
    }
}
