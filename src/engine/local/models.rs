use serde::{Deserialize, Serialize};

// --- Request types ---

#[derive(Debug, Serialize)]
pub struct OpenAiRequest {
    pub model: String,
    pub messages: Vec<OpenAiMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenAiMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
}

// --- Response types ---

#[derive(Debug, Deserialize)]
pub struct OpenAiResponse {
    pub choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiChoice {
    pub message: OpenAiMessage,
}

// --- Model list ---

#[derive(Debug, Deserialize)]
pub struct OpenAiModelList {
    pub data: Vec<OpenAiModel>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiModel {
    pub id: String,
}

// --- Error types ---

#[derive(Debug, Deserialize)]
pub struct OpenAiErrorResponse {
    pub error: OpenAiErrorDetail,
}

// OpenAI nests the message in an object; some local servers send a bare string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum OpenAiErrorDetail {
    Object { message: String },
    Text(String),
}

impl OpenAiErrorDetail {
    pub fn message(&self) -> &str {
        match self {
            OpenAiErrorDetail::Object { message } => message,
            OpenAiErrorDetail::Text(message) => message,
        }
    }
}
