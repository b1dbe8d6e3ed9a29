//! AI Runtime: оркестрация чата поверх локальной модели.
//!
//! Pipeline: история → PromptBuilder → InferenceSession::generate (streaming) → черновик → история.

mod controller;
mod error;
mod prompt_builder;
mod settings;

pub use controller::{ChatController, TurnResult};
pub use error::{ChatError, SettingsError};
pub use prompt_builder::{FormattedPrompt, PromptBuilder, DEFAULT_SYSTEM_PROMPT};
pub use settings::{load_settings, save_settings, settings_path, ChatSettings};
