use reqwest::StatusCode;

/// Errors surfaced by the chat session and its collaborators.
///
/// None of these are fatal: the session always returns to an idle state
/// that accepts the next turn.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("HTTP {status}: {body}")]
    Http { status: StatusCode, body: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("stream failed: {0}")]
    Stream(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("{0}")]
    Input(String),
}

pub type ChatResult<T> = Result<T, ChatError>;
