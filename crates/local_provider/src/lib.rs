//! Локальные GGUF-модели: каталог, загрузка с докачкой, сессия inference.
//!
//! Движок llama.cpp подключается фичей `llama`. Без неё сессия работает с любым
//! `EngineLoader` (тесты, заглушки), а `default_loader()` возвращает ошибку загрузки.

mod config;
mod error;
pub mod hardware_detect;
mod inference;
mod model_manager;
mod session;
mod stop_sequence;

pub use config::{
    clamp_f32, find_model, AiModelDescriptor, EngineOptions, LocalConfig,
    PromptTemplate, SamplingParams, DEFAULT_CONTEXT_SIZE, DEFAULT_MAX_TOKENS, MODEL_CATALOG,
    STORAGE_SAFETY_MARGIN,
};
pub use error::LocalProviderError;
pub use hardware_detect::{StorageProbe, SystemStorage};
pub use inference::{default_loader, EngineHandle, EngineLoader, InferenceEngine};
pub use model_manager::{DownloadState, ModelManager};
pub use session::{GenerationOutcome, InferenceSession, InferenceState};
pub use stop_sequence::{StopCheck, StopMatcher};
