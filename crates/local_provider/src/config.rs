//! Конфигурация: каталог GGUF-моделей, параметры движка и сэмплинга, директории.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Семейство шаблона промпта (разметка ролей в тексте для движка).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptTemplate {
    /// `<|im_start|>role ... <|im_end|>` (Qwen и др.).
    ChatMl,
    /// `<|user|> ... <|end|>` (Phi-3).
    Phi3,
    /// `[INST] ... [/INST]` (Mistral).
    Mistral,
    /// `<|user|> ... </s>` (TinyLlama / Zephyr).
    Zephyr,
}

/// Запись каталога. Создаётся один раз при старте, не меняется.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AiModelDescriptor {
    pub name: &'static str,
    /// Ключ идентичности: имя файла в директории моделей.
    pub filename: &'static str,
    pub url: &'static str,
    /// Размер по каталогу: проверка свободного места и прогресс без Content-Length.
    pub size_bytes: u64,
    /// Точный размер файла, если известен. Проверяется после загрузки.
    pub expected_size: Option<u64>,
    pub template: PromptTemplate,
    pub ram_required_gb: u32,
    pub description: &'static str,
}

/// Статический каталог моделей.
pub const MODEL_CATALOG: &[AiModelDescriptor] = &[
    AiModelDescriptor {
        name: "TinyLlama 1.1B",
        filename: "tinyllama-1.1b-chat-v1.0.Q4_K_M.gguf",
        url: "https://huggingface.co/TheBloke/TinyLlama-1.1B-Chat-v1.0-GGUF/resolve/main/tinyllama-1.1b-chat-v1.0.Q4_K_M.gguf",
        size_bytes: 669_000_000,
        expected_size: None,
        template: PromptTemplate::Zephyr,
        ram_required_gb: 2,
        description: "Fastest. Good for older machines.",
    },
    AiModelDescriptor {
        name: "Qwen 2.5 1.5B",
        filename: "qwen2.5-1.5b-instruct-q4_k_m.gguf",
        url: "https://huggingface.co/Qwen/Qwen2.5-1.5B-Instruct-GGUF/resolve/main/qwen2.5-1.5b-instruct-q4_k_m.gguf",
        size_bytes: 1_120_000_000,
        expected_size: None,
        template: PromptTemplate::ChatMl,
        ram_required_gb: 3,
        description: "Smart and efficient. Best all-rounder.",
    },
    AiModelDescriptor {
        name: "Phi-3 Mini 3.8B",
        filename: "Phi-3-mini-4k-instruct-q4.gguf",
        url: "https://huggingface.co/microsoft/Phi-3-mini-4k-instruct-gguf/resolve/main/Phi-3-mini-4k-instruct-q4.gguf",
        size_bytes: 2_390_000_000,
        expected_size: None,
        template: PromptTemplate::Phi3,
        ram_required_gb: 4,
        description: "High quality. Needs a capable CPU.",
    },
    AiModelDescriptor {
        name: "Mistral 7B v0.3",
        filename: "mistral-7b-instruct-v0.3.Q4_K_M.gguf",
        url: "https://huggingface.co/maziyarpanahi/Mistral-7B-Instruct-v0.3-GGUF/resolve/main/Mistral-7B-Instruct-v0.3.Q4_K_M.gguf",
        size_bytes: 4_370_000_000,
        expected_size: None,
        template: PromptTemplate::Mistral,
        ram_required_gb: 6,
        description: "Flagship quality. 8 GB RAM or more.",
    },
];

/// Поиск в каталоге по имени файла.
pub fn find_model(filename: &str) -> Option<&'static AiModelDescriptor> {
    MODEL_CATALOG.iter().find(|m| m.filename == filename)
}

pub const DEFAULT_CONTEXT_SIZE: u32 = 2048;
pub const DEFAULT_MAX_TOKENS: u32 = 512;

/// Запас свободного места сверх размера модели.
pub const STORAGE_SAFETY_MARGIN: u64 = 200 * 1024 * 1024;

/// Параметры инициализации движка.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    pub context_size: u32,
    pub n_threads: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            context_size: DEFAULT_CONTEXT_SIZE,
            n_threads: crate::hardware_detect::inference_threads(),
        }
    }
}

/// Параметры сэмплинга для одной генерации.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_tokens: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

impl SamplingParams {
    /// Приводит значения к допустимым диапазонам.
    pub fn clamped(self) -> Self {
        Self {
            temperature: clamp_f32(self.temperature, 0.0, 2.0, 0.7),
            top_p: clamp_f32(self.top_p, 0.0, 1.0, 0.9),
            top_k: self.top_k.clamp(1, 100),
            max_tokens: self.max_tokens.clamp(1, 2048),
        }
    }
}

/// `f32::clamp` пропускает NaN, поэтому NaN заменяется значением по умолчанию.
pub fn clamp_f32(value: f32, min: f32, max: f32, fallback: f32) -> f32 {
    if value.is_nan() {
        fallback
    } else {
        value.clamp(min, max)
    }
}

#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Финальные файлы моделей.
    pub models_dir: PathBuf,
    /// Временные `<filename>.tmp` незавершённых загрузок.
    pub cache_dir: PathBuf,
    pub engine: EngineOptions,
}

impl LocalConfig {
    pub fn default_models_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("localchat")
            .join("models")
    }

    pub fn default_cache_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("localchat")
    }

    pub fn default_config() -> Self {
        Self {
            models_dir: Self::default_models_dir(),
            cache_dir: Self::default_cache_dir(),
            engine: EngineOptions::default(),
        }
    }

    /// Конфиг с явными директориями (тесты, переопределение через CLI).
    pub fn with_dirs(models_dir: PathBuf, cache_dir: PathBuf) -> Self {
        Self {
            models_dir,
            cache_dir,
            engine: EngineOptions::default(),
        }
    }

    pub fn model_path(&self, model: &AiModelDescriptor) -> PathBuf {
        self.models_dir.join(model.filename)
    }

    pub fn temp_path(&self, model: &AiModelDescriptor) -> PathBuf {
        self.cache_dir.join(format!("{}.tmp", model.filename))
    }
}
