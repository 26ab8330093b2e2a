use async_trait::async_trait;

use super::types::EngineError;
use crate::models::Message;

/// Model discovery and text generation, backed by a server or a stub.
///
/// Selection and base URL are plain state on the engine; everything that
/// talks to the backend is async and fallible.
#[async_trait]
pub trait ModelEngine: Send + Sync {
    /// Prepares the engine and reports whether it can serve requests.
    async fn initialize(&self) -> Result<bool, EngineError>;

    /// Model identifiers in the order the backend returns them.
    async fn list_models(&self) -> Result<Vec<String>, EngineError>;

    fn select_model(&self, model_id: &str);

    fn selected_model(&self) -> Option<String>;

    fn set_base_url(&self, base_url: &str);

    fn base_url(&self) -> String;

    /// `context` is the whole conversation so far, ending with the user
    /// message that carries `prompt`.
    async fn generate_reply(&self, prompt: &str, context: &[Message])
        -> Result<String, EngineError>;

    async fn generate_conversation_title(&self, first_prompt: &str)
        -> Result<String, EngineError>;
}
