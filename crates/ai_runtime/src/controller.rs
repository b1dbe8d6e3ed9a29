//! ChatController: ход чата: сохранить вопрос, собрать промпт, стримить ответ в черновик.
//!
//! UI не ждёт полного ответа; он подписан на черновик и историю через `watch`.
//! Остановка синхронная (`stop`), смена модели идёт строго stop → release → initialize.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use backend_core::{Message, TranscriptStore, DEFAULT_CONVERSATION_ID};
use local_provider::{
    AiModelDescriptor, GenerationOutcome, InferenceSession, InferenceState, LocalProviderError,
};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::ChatError;
use crate::prompt_builder::PromptBuilder;
use crate::settings::ChatSettings;

/// Итог одного хода.
#[derive(Debug, Clone)]
pub struct TurnResult {
    pub user: Message,
    /// Сохранённый ответ. `None`, если ход остановлен до первого фрагмента.
    pub reply: Option<Message>,
    pub outcome: GenerationOutcome,
}

pub struct ChatController {
    session: Arc<InferenceSession>,
    store: Arc<dyn TranscriptStore>,
    settings: Mutex<ChatSettings>,
    active_model: Mutex<Option<AiModelDescriptor>>,
    /// Один ход за раз; смена модели ждёт завершения текущего хода.
    turn: tokio::sync::Mutex<()>,
    /// Ход идёт (от захвата `turn` до конца `submit`).
    in_turn: AtomicBool,
    /// Запрос остановки текущего хода; сбрасывается в начале каждого хода.
    cancel: watch::Sender<bool>,
    draft: watch::Sender<String>,
    messages: watch::Sender<Vec<Message>>,
}

/// Снимает флаг `in_turn`, как бы ни закончился ход.
struct TurnFlag<'a>(&'a AtomicBool);

impl<'a> TurnFlag<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for TurnFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ChatController {
    pub fn new(
        session: Arc<InferenceSession>,
        store: Arc<dyn TranscriptStore>,
        settings: ChatSettings,
    ) -> Self {
        session.set_sampling(settings.to_sampling());
        let (draft, _) = watch::channel(String::new());
        let (messages, _) = watch::channel(Vec::new());
        let (cancel, _) = watch::channel(false);
        Self {
            session,
            store,
            settings: Mutex::new(settings),
            active_model: Mutex::new(None),
            turn: tokio::sync::Mutex::new(()),
            in_turn: AtomicBool::new(false),
            cancel,
            draft,
            messages,
        }
    }

    /// Читает историю из хранилища и публикует её.
    pub async fn load(&self) -> Result<Vec<Message>, ChatError> {
        let history = self.store.messages(DEFAULT_CONVERSATION_ID).await?;
        tracing::debug!(messages = history.len(), "transcript loaded");
        self.messages.send_replace(history.clone());
        Ok(history)
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.borrow().clone()
    }

    pub fn subscribe_messages(&self) -> watch::Receiver<Vec<Message>> {
        self.messages.subscribe()
    }

    pub fn draft(&self) -> String {
        self.draft.borrow().clone()
    }

    pub fn subscribe_draft(&self) -> watch::Receiver<String> {
        self.draft.subscribe()
    }

    pub fn session_state(&self) -> InferenceState {
        self.session.state()
    }

    pub fn active_model(&self) -> Option<AiModelDescriptor> {
        self.active_model.lock().clone()
    }

    pub fn settings(&self) -> ChatSettings {
        self.settings.lock().clone()
    }

    /// Новые настройки действуют со следующего хода.
    pub fn apply_settings(&self, settings: &ChatSettings) {
        let settings = settings.clone().clamped();
        self.session.set_sampling(settings.to_sampling());
        *self.settings.lock() = settings;
    }

    /// Один ход: вопрос → ответ. Второй ход во время текущего: `Busy`.
    pub async fn submit(&self, text: &str) -> Result<TurnResult, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let _turn = self.turn.try_lock().map_err(|_| ChatError::Busy)?;
        self.cancel.send_replace(false);
        let _in_turn = TurnFlag::enter(&self.in_turn);
        let mut cancel = self.cancel.subscribe();

        let model = self.active_model().ok_or(ChatError::NoModel)?;
        let state = self.session.state();
        if state != InferenceState::Ready {
            return Err(LocalProviderError::NotReady(format!("{state:?}")).into());
        }

        let user = Message::user(text);
        self.store.insert(&user).await?;
        self.messages.send_modify(|m| m.push(user.clone()));

        let history = self.messages();
        let system_prompt = self.settings.lock().system_prompt.clone();
        let prompt = PromptBuilder::build(model.template, &system_prompt, &history);
        tracing::debug!(model = %model.filename, history = history.len(), "prompt built");

        self.draft.send_replace(String::new());
        let outcome = if *cancel.borrow_and_update() {
            // Остановлено, пока сохранялся вопрос: до движка ход не дошёл.
            Ok(GenerationOutcome::Cancelled { tokens: 0 })
        } else {
            let generation = self
                .session
                .generate(&prompt.text, &prompt.stop_sequences, |piece| {
                    self.draft.send_modify(|d| d.push_str(piece));
                });
            tokio::pin!(generation);
            // Генерация опрашивается первой: к моменту остановки она уже захватила сессию.
            tokio::select! {
                biased;
                result = &mut generation => result,
                _ = async { cancel.wait_for(|stop| *stop).await.is_ok() } => {
                    self.session.stop();
                    generation.await
                }
            }
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                // Черновик остаётся на экране, ход можно повторить.
                tracing::warn!(error = %e, "turn failed");
                return Err(e.into());
            }
        };

        let content = self.draft().trim().to_string();
        let reply = match outcome {
            GenerationOutcome::Cancelled { .. } if content.is_empty() => None,
            GenerationOutcome::Cancelled { .. } => Some(Message::assistant(content).interrupted()),
            GenerationOutcome::Completed { .. } | GenerationOutcome::StopSequence { .. } => {
                Some(Message::assistant(content))
            }
        };
        if let Some(reply) = &reply {
            self.store.insert(reply).await?;
            self.messages.send_modify(|m| m.push(reply.clone()));
        }
        self.draft.send_replace(String::new());
        tracing::info!(tokens = outcome.tokens(), ?outcome, "turn finished");

        Ok(TurnResult {
            user,
            reply,
            outcome,
        })
    }

    /// Останавливает текущий ход. Можно вызывать из любого потока.
    /// Возвращает `true`, если шёл ход (в том числе ещё не дошедший до движка).
    pub fn stop(&self) -> bool {
        let in_turn = self.in_turn.load(Ordering::Acquire);
        if in_turn {
            self.cancel.send_replace(true);
        }
        self.session.stop() || in_turn
    }

    /// Смена модели: stop, дождаться хода, release, initialize.
    pub async fn switch_model(&self, model: &AiModelDescriptor, path: &Path) -> Result<(), ChatError> {
        self.stop();
        let _turn = self.turn.lock().await;
        self.session.release().await;
        *self.active_model.lock() = None;

        self.session.initialize(path).await?;
        *self.active_model.lock() = Some(model.clone());
        self.settings.lock().selected_model = Some(model.filename.to_string());
        tracing::info!(model = %model.filename, "active model switched");
        Ok(())
    }

    /// Выгружает модель (например, перед удалением её файла).
    pub async fn unload(&self) {
        self.stop();
        let _turn = self.turn.lock().await;
        self.session.release().await;
        *self.active_model.lock() = None;
    }

    /// Удаляет историю разговора.
    pub async fn clear(&self) -> Result<(), ChatError> {
        let _turn = self.turn.try_lock().map_err(|_| ChatError::Busy)?;
        self.store.clear(DEFAULT_CONVERSATION_ID).await?;
        self.messages.send_replace(Vec::new());
        self.draft.send_replace(String::new());
        tracing::info!("transcript cleared");
        Ok(())
    }
}
