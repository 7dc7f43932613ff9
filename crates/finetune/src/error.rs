use thiserror::Error;

/// Errors surfaced by configuration, trainer construction and the training loop.
#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ConfigFormat(String),
    #[error("json encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("trainer initialization failed: {0}")]
    Initialization(String),
    #[error("training failed: {0}")]
    Runtime(String),
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("collective operation failed: {0}")]
    Distributed(String),
    #[error("tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::NotImplemented(message.into())
    }

    pub fn distributed(message: impl Into<String>) -> Self {
        Self::Distributed(message.into())
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}
