//! Ошибки LocalProvider: загрузка моделей, движок, сессия.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LocalProviderError {
    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("insufficient storage: {required} bytes required, {available} available")]
    InsufficientStorage { required: u64, available: u64 },

    #[error("download already in progress: {0}")]
    DownloadInProgress(String),

    #[error("download rejected by server: HTTP {0}")]
    RateLimited(u16),

    #[error("model file not found on server")]
    RemoteNotFound,

    #[error("download failed: HTTP {0}")]
    HttpStatus(u16),

    #[error("network error: {0}")]
    Network(String),

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("failed to publish model file: {0}")]
    Publish(String),

    #[error("model load failed: {0}")]
    ModelLoadFailed(String),

    #[error("inference failed: {0}")]
    InferenceFailed(String),

    #[error("engine already initialized")]
    AlreadyInitialized,

    #[error("engine not initialized")]
    NotInitialized,

    #[error("engine is busy: {0}")]
    NotReady(String),

    #[error("hardware detection failed: {0}")]
    HardwareDetectionFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LocalProviderError {
    /// Можно ли повторить ту же операцию с нуля.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::InsufficientStorage { .. }
                | Self::ModelNotFound(_)
                | Self::DownloadInProgress(_)
                | Self::AlreadyInitialized
        )
    }

    /// Сообщение для пользователя (кладётся в `DownloadState::Error`).
    pub fn user_message(&self) -> String {
        match self {
            Self::InsufficientStorage { required, .. } => format!(
                "Not enough space. Need ~{} MB free. Please free up space and try again.",
                required / (1024 * 1024)
            ),
            Self::RateLimited(_) => {
                "Download temporarily unavailable. Please try again in a few minutes.".to_string()
            }
            Self::RemoteNotFound => "Model file not found. Please check configuration.".to_string(),
            Self::HttpStatus(_) | Self::Network(_) => {
                "Network error. Please check your connection.".to_string()
            }
            Self::SizeMismatch { .. } => "Download corrupted. Please try again.".to_string(),
            Self::Publish(_) | Self::Io(_) => {
                "Could not save the model file. Please try again.".to_string()
            }
            other => other.to_string(),
        }
    }
}
