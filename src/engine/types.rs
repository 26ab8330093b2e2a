use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("No model selected")]
    NoModelSelected,
}
