//! Обработка ошибок AI Runtime.
//!
//! Все ошибки проходят через thiserror. Без unwrap, без panic.

use backend_core::TranscriptError;
use local_provider::LocalProviderError;
use thiserror::Error;

/// Ошибки оркестратора чата.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("message is empty")]
    EmptyMessage,

    #[error("another turn is already in progress")]
    Busy,

    #[error("no model loaded")]
    NoModel,

    #[error("provider error: {0}")]
    Provider(#[from] LocalProviderError),

    #[error("transcript error: {0}")]
    Transcript(#[from] TranscriptError),
}

/// Ошибки файла настроек.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("unknown setting: {0}")]
    UnknownKey(String),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
