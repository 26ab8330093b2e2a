use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use reqwest::Client;

use super::models::*;
use crate::config::APP_NAME;
use crate::engine::traits::ModelEngine;
use crate::engine::types::EngineError;
use crate::models::{Message, Role};

const TITLE_INSTRUCTION: &str = "You name chat conversations. Reply with a short title \
(at most six words) for a conversation that starts with the user's message. \
Reply with the title only, without quotes or punctuation at the end.";

const TITLE_MAX_TOKENS: u32 = 24;
const TITLE_TEMPERATURE: f32 = 0.2;

#[derive(Debug, Default)]
struct LocalState {
    base_url: String,
    models: Option<Vec<String>>,
    selected: Option<String>,
}

/// Engine for servers exposing the OpenAI-compatible `/v1` API
/// (LM Studio, llama.cpp server, Ollama, vLLM).
pub struct LocalEngine {
    client: Client,
    state: Mutex<LocalState>,
}

impl LocalEngine {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::builder()
                .user_agent(format!("{}/{}", APP_NAME, env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_default(),
            state: Mutex::new(LocalState {
                base_url: base_url.trim_end_matches('/').to_string(),
                ..LocalState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.state().base_url, path)
    }

    fn translate_role(role: &Role) -> &'static str {
        match role {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    fn build_messages(prompt: &str, context: &[Message]) -> Vec<OpenAiMessage> {
        if context.is_empty() {
            return vec![OpenAiMessage {
                role: "user".to_string(),
                content: Some(prompt.to_string()),
            }];
        }

        context
            .iter()
            .map(|msg| OpenAiMessage {
                role: Self::translate_role(&msg.role).to_string(),
                content: Some(msg.content.clone()),
            })
            .collect()
    }

    fn parse_error_message(status: reqwest::StatusCode, body: &str) -> String {
        if let Ok(parsed) = serde_json::from_str::<OpenAiErrorResponse>(body) {
            return format!("HTTP {}: {}", status.as_u16(), parsed.error.message());
        }
        format!("HTTP {}: Request failed", status.as_u16())
    }

    async fn fetch_models(&self) -> Result<Vec<String>, EngineError> {
        let url = self.endpoint("/v1/models");

        let response = self.client.get(&url).send().await.map_err(|e| {
            EngineError::NetworkError(format!("Failed to connect to {}: {}", url, e))
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::RequestFailed(Self::parse_error_message(
                status, &body,
            )));
        }

        let model_list: OpenAiModelList = response.json().await.map_err(|e| {
            EngineError::InvalidResponse(format!("Failed to parse model list: {}", e))
        })?;

        Ok(model_list.data.into_iter().map(|m| m.id).collect())
    }

    async fn complete(
        &self,
        messages: Vec<OpenAiMessage>,
        temperature: Option<f32>,
        max_tokens: Option<u32>,
    ) -> Result<String, EngineError> {
        let model = self.selected_model().ok_or(EngineError::NoModelSelected)?;
        let url = self.endpoint("/v1/chat/completions");

        let request = OpenAiRequest {
            model,
            messages,
            stream: false,
            temperature,
            max_tokens,
        };

        let response = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| EngineError::NetworkError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::RequestFailed(Self::parse_error_message(
                status, &body,
            )));
        }

        let parsed: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| EngineError::InvalidResponse(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        if content.trim().is_empty() {
            return Err(EngineError::InvalidResponse(
                "No content in response".to_string(),
            ));
        }

        Ok(content)
    }
}

/// Reduce a model's answer to a bare title: first non-empty line, no
/// `Title:` label, no wrapping quotes or markdown, no trailing punctuation.
fn clean_title(raw: &str) -> String {
    let line = raw
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");

    let line = match line.get(..6) {
        Some(prefix) if prefix.eq_ignore_ascii_case("title:") => line[6..].trim(),
        _ => line,
    };

    let wrapper = |c: char| c.is_whitespace() || matches!(c, '"' | '\'' | '`' | '*' | '#' | '“' | '”');
    line.trim_start_matches(wrapper)
        .trim_end_matches(|c: char| wrapper(c) || matches!(c, '.' | '!' | ':' | ';' | ','))
        .to_string()
}

#[async_trait]
impl ModelEngine for LocalEngine {
    async fn initialize(&self) -> Result<bool, EngineError> {
        let models = self.fetch_models().await?;
        let ready = !models.is_empty();
        tracing::debug!("Local server reported {} models", models.len());
        self.state().models = Some(models);
        Ok(ready)
    }

    async fn list_models(&self) -> Result<Vec<String>, EngineError> {
        let cached = self.state().models.clone();
        match cached {
            Some(models) => Ok(models),
            None => {
                let models = self.fetch_models().await?;
                self.state().models = Some(models.clone());
                Ok(models)
            }
        }
    }

    fn select_model(&self, model_id: &str) {
        self.state().selected = Some(model_id.to_string());
    }

    fn selected_model(&self) -> Option<String> {
        self.state()
            .selected
            .clone()
            .filter(|m| !m.trim().is_empty())
    }

    fn set_base_url(&self, base_url: &str) {
        let base_url = base_url.trim_end_matches('/');
        let mut state = self.state();
        if state.base_url != base_url {
            // Models belong to a server; forget both the list and the pick.
            state.base_url = base_url.to_string();
            state.models = None;
            state.selected = None;
        }
    }

    fn base_url(&self) -> String {
        self.state().base_url.clone()
    }

    async fn generate_reply(
        &self,
        prompt: &str,
        context: &[Message],
    ) -> Result<String, EngineError> {
        let messages = Self::build_messages(prompt, context);
        self.complete(messages, None, None).await
    }

    async fn generate_conversation_title(
        &self,
        first_prompt: &str,
    ) -> Result<String, EngineError> {
        let messages = vec![
            OpenAiMessage {
                role: "system".to_string(),
                content: Some(TITLE_INSTRUCTION.to_string()),
            },
            OpenAiMessage {
                role: "user".to_string(),
                content: Some(first_prompt.to_string()),
            },
        ];
        let raw = self
            .complete(messages, Some(TITLE_TEMPERATURE), Some(TITLE_MAX_TOKENS))
            .await?;
        Ok(clean_title(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn completion(content: &str) -> serde_json::Value {
        json!({
            "id": "chatcmpl-1",
            "model": "qwen2.5-7b-instruct",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": content },
                "finish_reason": "stop"
            }]
        })
    }

    #[tokio::test]
    async fn test_initialize_lists_models_in_server_order() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "object": "list",
                "data": [
                    { "id": "qwen2.5-7b-instruct", "object": "model" },
                    { "id": "llama-3.2-3b", "object": "model" }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let engine = LocalEngine::new(&server.uri());
        assert!(engine.initialize().await.unwrap());
        // Served from the cache; the mock only allows one hit.
        let models = engine.list_models().await.unwrap();
        assert_eq!(models, vec!["qwen2.5-7b-instruct", "llama-3.2-3b"]);
    }

    #[tokio::test]
    async fn test_initialize_with_no_models_is_not_ready() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
            .mount(&server)
            .await;

        let engine = LocalEngine::new(&server.uri());
        assert!(!engine.initialize().await.unwrap());
    }

    #[tokio::test]
    async fn test_http_error_carries_server_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "error": { "message": "model store unavailable" }
            })))
            .mount(&server)
            .await;

        let engine = LocalEngine::new(&server.uri());
        let err = engine.initialize().await.unwrap_err();
        assert!(matches!(err, EngineError::RequestFailed(_)));
        assert!(err.to_string().contains("HTTP 500: model store unavailable"));
    }

    #[tokio::test]
    async fn test_plain_string_error_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({ "error": "No model loaded" })),
            )
            .mount(&server)
            .await;

        let engine = LocalEngine::new(&server.uri());
        engine.select_model("qwen2.5-7b-instruct");
        let err = engine.generate_reply("hi", &[]).await.unwrap_err();
        assert!(err.to_string().contains("HTTP 400: No model loaded"));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_network_error() {
        // Reserve a free port, then close it again so connections are refused.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let engine = LocalEngine::new(&format!("http://127.0.0.1:{}", port));
        let err = engine.initialize().await.unwrap_err();
        assert!(matches!(err, EngineError::NetworkError(_)));
    }

    #[tokio::test]
    async fn test_generate_reply_sends_full_context() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({
                "model": "qwen2.5-7b-instruct",
                "stream": false,
                "messages": [
                    { "role": "user", "content": "Hi" },
                    { "role": "assistant", "content": "Hello! How can I help?" },
                    { "role": "user", "content": "Tell me a joke" }
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("Why did the crab...")))
            .expect(1)
            .mount(&server)
            .await;

        let engine = LocalEngine::new(&server.uri());
        engine.select_model("qwen2.5-7b-instruct");
        let context = vec![
            Message::user("Hi"),
            Message::assistant("Hello! How can I help?"),
            Message::user("Tell me a joke"),
        ];
        let reply = engine.generate_reply("Tell me a joke", &context).await.unwrap();
        assert_eq!(reply, "Why did the crab...");
    }

    #[tokio::test]
    async fn test_generate_reply_without_selection_fails_fast() {
        let engine = LocalEngine::new("http://127.0.0.1:9");
        let err = engine.generate_reply("hi", &[]).await.unwrap_err();
        assert!(matches!(err, EngineError::NoModelSelected));
    }

    #[tokio::test]
    async fn test_empty_completion_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("   ")))
            .mount(&server)
            .await;

        let engine = LocalEngine::new(&server.uri());
        engine.select_model("m");
        let err = engine.generate_reply("hi", &[]).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_generate_title_is_cleaned() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({ "max_tokens": 24 })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(completion("Title: \"Rust borrow checker help\".\n")),
            )
            .mount(&server)
            .await;

        let engine = LocalEngine::new(&server.uri());
        engine.select_model("m");
        let title = engine
            .generate_conversation_title("Why does the borrow checker reject this?")
            .await
            .unwrap();
        assert_eq!(title, "Rust borrow checker help");
    }

    #[test]
    fn test_set_base_url_resets_server_state() {
        let engine = LocalEngine::new("http://localhost:1234/");
        assert_eq!(engine.base_url(), "http://localhost:1234");

        engine.select_model("m");
        engine.set_base_url("http://localhost:1234");
        assert_eq!(engine.selected_model().as_deref(), Some("m"));

        engine.set_base_url("http://10.0.0.2:8080");
        assert_eq!(engine.base_url(), "http://10.0.0.2:8080");
        assert_eq!(engine.selected_model(), None);
    }

    #[test]
    fn test_clean_title() {
        assert_eq!(clean_title("  \n**Weekend plans**\nextra"), "Weekend plans");
        assert_eq!(clean_title("“Café recommendations”!"), "Café recommendations");
        assert_eq!(clean_title(""), "");
    }
}
