use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),
}

impl ClientError {
    pub fn user_message(&self) -> &'static str {
        match self {
            ClientError::Network(_) => "Network error. Check your connection.",
            ClientError::Timeout(_) => "Request timed out. Please try again.",
            ClientError::Storage(_) | ClientError::Io(_) | ClientError::Serialization(_) => {
                "Local storage is unavailable."
            }
            ClientError::Crypto(_) => "Stored settings could not be decrypted.",
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
