//! Состояние приложения: менеджер моделей, сессия inference, контроллер чата, настройки.

use std::path::PathBuf;
use std::sync::Arc;

use ai_runtime::{load_settings, save_settings, settings_path, ChatController, ChatError, SettingsError};
use backend_core::{default_transcript_path, init_tracing, logs_dir, JsonlTranscript};
use local_provider::{
    default_loader, find_model, InferenceSession, LocalConfig, LocalProviderError, ModelManager,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Provider(#[from] LocalProviderError),

    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error(transparent)]
    Settings(#[from] SettingsError),
}

pub struct AppState {
    pub models: Arc<ModelManager>,
    pub chat: Arc<ChatController>,
    pub settings_path: PathBuf,
    pub log_path: PathBuf,
}

impl AppState {
    pub fn init() -> Result<Self, AppError> {
        let log_path = init_tracing(&logs_dir())?;

        let config = LocalConfig::default_config();
        std::fs::create_dir_all(&config.models_dir)?;
        tracing::info!(
            models_dir = %config.models_dir.display(),
            cache_dir = %config.cache_dir.display(),
            n_ctx = config.engine.context_size,
            n_threads = config.engine.n_threads,
            "starting localchat"
        );

        let session = Arc::new(InferenceSession::new(default_loader(), config.engine.clone()));
        let models = Arc::new(ModelManager::new(config)?);

        let settings_path = settings_path();
        let settings = load_settings(&settings_path);
        let store = Arc::new(JsonlTranscript::new(default_transcript_path()));
        let chat = Arc::new(ChatController::new(session, store, settings));

        Ok(Self {
            models,
            chat,
            settings_path,
            log_path,
        })
    }

    /// Проверка файлов моделей, загрузка истории и ранее выбранной модели.
    pub async fn restore(&self) -> Result<(), AppError> {
        self.models.check_all().await;
        self.chat.load().await?;

        let selected = self.chat.settings().selected_model;
        if let Some(model) = selected.as_deref().and_then(find_model) {
            if self.models.is_downloaded(model).await {
                if let Err(e) = self
                    .chat
                    .switch_model(model, &self.models.model_path(model))
                    .await
                {
                    tracing::warn!(model = %model.filename, error = %e, "could not restore selected model");
                }
            }
        }
        Ok(())
    }

    pub fn save_settings(&self) -> Result<(), AppError> {
        save_settings(&self.settings_path, &self.chat.settings())?;
        Ok(())
    }
}
