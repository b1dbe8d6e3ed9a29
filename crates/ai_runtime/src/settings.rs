//! Настройки чата (~/.localchat/settings.json).
//!
//! Значения приводятся к допустимым диапазонам и при записи, и при чтении.

use std::path::{Path, PathBuf};

use local_provider::{clamp_f32, SamplingParams, DEFAULT_MAX_TOKENS};
use serde::{Deserialize, Serialize};

use crate::error::SettingsError;
use crate::prompt_builder::DEFAULT_SYSTEM_PROMPT;

const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    /// Имя файла модели из каталога.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_model: Option<String>,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_tokens: u32,
    pub system_prompt: String,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            selected_model: None,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            max_tokens: DEFAULT_MAX_TOKENS,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl ChatSettings {
    pub fn clamped(self) -> Self {
        let sampling = self.to_sampling();
        Self {
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            top_k: sampling.top_k,
            max_tokens: sampling.max_tokens,
            ..self
        }
    }

    pub fn to_sampling(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            max_tokens: self.max_tokens,
        }
        .clamped()
    }

    /// Меняет одно поле по имени (`/set temperature 0.4`). Результат приводится к диапазону.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), SettingsError> {
        let invalid = || SettingsError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        match key {
            "temperature" => {
                let v: f32 = value.parse().map_err(|_| invalid())?;
                self.temperature = clamp_f32(v, 0.0, 2.0, 0.7);
            }
            "top_p" => {
                let v: f32 = value.parse().map_err(|_| invalid())?;
                self.top_p = clamp_f32(v, 0.0, 1.0, 0.9);
            }
            "top_k" => {
                let v: u32 = value.parse().map_err(|_| invalid())?;
                self.top_k = v.clamp(1, 100);
            }
            "max_tokens" => {
                let v: u32 = value.parse().map_err(|_| invalid())?;
                self.max_tokens = v.clamp(1, 2048);
            }
            "system_prompt" => {
                self.system_prompt = value.to_string();
            }
            other => return Err(SettingsError::UnknownKey(other.to_string())),
        }
        Ok(())
    }
}

pub fn settings_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".localchat")
        .join(SETTINGS_FILE)
}

/// Читает настройки. Нет файла или он битый: значения по умолчанию.
pub fn load_settings(path: &Path) -> ChatSettings {
    match std::fs::read_to_string(path) {
        Ok(s) => serde_json::from_str::<ChatSettings>(&s)
            .map(ChatSettings::clamped)
            .unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "settings file unreadable, using defaults");
                ChatSettings::default()
            }),
        Err(_) => ChatSettings::default(),
    }
}

pub fn save_settings(path: &Path, settings: &ChatSettings) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(&settings.clone().clamped())?;
    std::fs::write(path, json)?;
    Ok(())
}
