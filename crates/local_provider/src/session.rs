//! Сессия inference: владеет единственным EngineHandle и ведёт генерацию.
//!
//! Движок работает в `spawn_blocking` и отдаёт фрагменты в ограниченный канал.
//! Один потребитель разбирает канал: стоп-строки, счётчик токенов, доставка в callback.
//! Доставка фрагмента и `stop()` идут под одним мьютексом, поэтому после возврата из
//! `stop()` ни один фрагмент этой генерации уже не будет передан наружу.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::config::{EngineOptions, SamplingParams};
use crate::error::LocalProviderError;
use crate::inference::{EngineHandle, EngineLoader};
use crate::stop_sequence::{StopCheck, StopMatcher};

/// Ёмкость канала фрагментов между движком и потребителем.
const FRAGMENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InferenceState {
    Uninitialized,
    Initializing,
    Ready,
    Generating { tokens_generated: usize },
    Error { message: String },
}

/// Чем закончилась генерация.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// Движок закончил сам (EOS или лимит токенов).
    Completed { tokens: usize },
    /// В выводе встретилась стоп-строка.
    StopSequence { tokens: usize },
    /// Остановлено пользователем.
    Cancelled { tokens: usize },
}

impl GenerationOutcome {
    pub fn tokens(&self) -> usize {
        match *self {
            Self::Completed { tokens }
            | Self::StopSequence { tokens }
            | Self::Cancelled { tokens } => tokens,
        }
    }
}

#[derive(Default)]
struct Generation {
    cancelled: AtomicBool,
    halt: Arc<AtomicBool>,
}

impl Generation {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct Inner {
    handle: Option<EngineHandle>,
    active: Option<Arc<Generation>>,
    sampling: SamplingParams,
    epoch: u64,
}

impl Inner {
    fn is_active(&self, generation: &Arc<Generation>) -> bool {
        self.active
            .as_ref()
            .is_some_and(|g| Arc::ptr_eq(g, generation))
    }
}

pub struct InferenceSession {
    loader: Arc<dyn EngineLoader>,
    options: EngineOptions,
    state: watch::Sender<InferenceState>,
    inner: Mutex<Inner>,
    /// Удерживается, пока идёт нативный вызов генерации.
    busy: Arc<tokio::sync::Mutex<()>>,
}

impl InferenceSession {
    pub fn new(loader: Arc<dyn EngineLoader>, options: EngineOptions) -> Self {
        let (state, _rx) = watch::channel(InferenceState::Uninitialized);
        Self {
            loader,
            options,
            state,
            inner: Mutex::new(Inner {
                handle: None,
                active: None,
                sampling: SamplingParams::default(),
                epoch: 0,
            }),
            busy: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn state(&self) -> InferenceState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<InferenceState> {
        self.state.subscribe()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().handle.is_some()
    }

    /// Путь загруженной модели.
    pub fn model_path(&self) -> Option<PathBuf> {
        self.inner
            .lock()
            .handle
            .as_ref()
            .map(|h| h.model_path().to_path_buf())
    }

    pub fn sampling(&self) -> SamplingParams {
        self.inner.lock().sampling
    }

    /// Параметры для следующих генераций (текущая не затрагивается).
    pub fn set_sampling(&self, params: SamplingParams) {
        self.inner.lock().sampling = params.clamped();
    }

    /// Загружает модель: Initializing → Ready | Error.
    pub async fn initialize(&self, path: &Path) -> Result<(), LocalProviderError> {
        let epoch = {
            let inner = self.inner.lock();
            let initializing = matches!(*self.state.borrow(), InferenceState::Initializing);
            if inner.handle.is_some() || initializing {
                return Err(LocalProviderError::AlreadyInitialized);
            }
            self.state.send_replace(InferenceState::Initializing);
            inner.epoch
        };
        tracing::info!(model = %path.display(), "loading model");

        let loader = Arc::clone(&self.loader);
        let options = self.options.clone();
        let model_path = path.to_path_buf();
        let loaded = tokio::task::spawn_blocking(move || {
            EngineHandle::load(loader.as_ref(), &model_path, &options)
        })
        .await
        .unwrap_or_else(|e| Err(LocalProviderError::ModelLoadFailed(e.to_string())));

        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            tracing::debug!(model = %path.display(), "session released while loading, dropping engine");
            return Err(LocalProviderError::NotReady(
                "session was released while loading".into(),
            ));
        }
        match loaded {
            Ok(handle) => {
                inner.handle = Some(handle);
                self.state.send_replace(InferenceState::Ready);
                tracing::info!(model = %path.display(), "model ready");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(model = %path.display(), error = %e, "model load failed");
                self.state.send_replace(InferenceState::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Запускает генерацию и отдаёт фрагменты в `on_token` по мере поступления.
    ///
    /// `on_token` вызывается под мьютексом сессии и не должен обращаться к ней.
    /// Ошибка движка возвращается как `Err`, сессия при этом остаётся `Ready`.
    pub async fn generate(
        &self,
        prompt: &str,
        stop_sequences: &[String],
        mut on_token: impl FnMut(&str) + Send,
    ) -> Result<GenerationOutcome, LocalProviderError> {
        let generation = self.claim()?;
        let active = ActiveGeneration {
            session: self,
            generation: Arc::clone(&generation),
        };

        // Нативный вызов предыдущей (остановленной) генерации мог ещё не вернуться.
        let busy = Arc::clone(&self.busy).lock_owned().await;
        if generation.is_cancelled() {
            return Ok(GenerationOutcome::Cancelled { tokens: 0 });
        }
        let (engine, params) = {
            let inner = self.inner.lock();
            match inner.handle.as_ref() {
                Some(handle) => (handle.engine(), inner.sampling),
                None => return Err(LocalProviderError::NotInitialized),
            }
        };

        let (tx, mut rx) = mpsc::channel::<String>(FRAGMENT_CHANNEL_CAPACITY);
        let halt = Arc::clone(&generation.halt);
        let prompt = prompt.to_string();
        let worker = tokio::task::spawn_blocking(move || {
            let _busy = busy;
            engine.clear_cache();
            engine.generate(&prompt, &params, &halt, &mut |piece| {
                if tx.blocking_send(piece.to_string()).is_err() {
                    halt.store(true, Ordering::Release);
                }
            })
        });

        let mut matcher = StopMatcher::new(stop_sequences);
        let mut tokens = 0usize;
        let mut matched = false;
        while let Some(piece) = rx.recv().await {
            if matched || generation.is_cancelled() {
                continue;
            }
            match matcher.push(&piece) {
                StopCheck::Continue => {
                    if self.deliver(&generation, &piece, tokens + 1, &mut on_token) {
                        tokens += 1;
                    }
                }
                StopCheck::Matched { forward } => {
                    generation.halt.store(true, Ordering::Release);
                    matched = true;
                    if !forward.is_empty() {
                        self.deliver(&generation, &forward, tokens, &mut on_token);
                    }
                    tracing::debug!(tokens, "stop sequence matched");
                }
            }
        }

        let result = worker
            .await
            .unwrap_or_else(|e| Err(LocalProviderError::InferenceFailed(e.to_string())));
        drop(active);

        if generation.is_cancelled() {
            tracing::info!(tokens, "generation cancelled");
            return Ok(GenerationOutcome::Cancelled { tokens });
        }
        match result {
            Ok(()) if matched => Ok(GenerationOutcome::StopSequence { tokens }),
            Ok(()) => {
                tracing::info!(tokens, "generation completed");
                Ok(GenerationOutcome::Completed { tokens })
            }
            Err(e) => {
                tracing::warn!(tokens, error = %e, "generation failed");
                Err(e)
            }
        }
    }

    /// Останавливает текущую генерацию. Generating → Ready ровно один раз, иначе no-op.
    /// Возвращает `true`, если генерация была остановлена этим вызовом.
    pub fn stop(&self) -> bool {
        let mut inner = self.inner.lock();
        let Some(generation) = inner.active.take() else {
            return false;
        };
        generation.cancelled.store(true, Ordering::Release);
        generation.halt.store(true, Ordering::Release);
        self.state.send_replace(InferenceState::Ready);
        tracing::debug!("generation stop requested");
        true
    }

    /// Останавливает генерацию, дожидается нативного вызова и освобождает движок.
    pub async fn release(&self) {
        self.stop();
        self.inner.lock().epoch += 1;
        let _busy = self.busy.lock().await;
        let handle = {
            let mut inner = self.inner.lock();
            let handle = inner.handle.take();
            self.state.send_replace(InferenceState::Uninitialized);
            handle
        };
        if let Some(handle) = handle {
            tracing::info!(model = %handle.model_path().display(), "releasing model");
        }
    }

    /// Ready → Generating(0) под блокировкой; новая генерация становится активной.
    fn claim(&self) -> Result<Arc<Generation>, LocalProviderError> {
        let mut inner = self.inner.lock();
        let state = self.state.borrow().clone();
        if state != InferenceState::Ready {
            return Err(LocalProviderError::NotReady(format!("{state:?}")));
        }
        if inner.handle.is_none() {
            return Err(LocalProviderError::NotInitialized);
        }
        let generation = Arc::new(Generation::default());
        inner.active = Some(Arc::clone(&generation));
        self.state
            .send_replace(InferenceState::Generating { tokens_generated: 0 });
        Ok(generation)
    }

    /// Передаёт фрагмент наружу и публикует `Generating(count)`, если генерация ещё активна.
    fn deliver(
        &self,
        generation: &Arc<Generation>,
        piece: &str,
        count: usize,
        on_token: &mut impl FnMut(&str),
    ) -> bool {
        let inner = self.inner.lock();
        if !inner.is_active(generation) {
            return false;
        }
        self.state.send_if_modified(|state| {
            let next = InferenceState::Generating {
                tokens_generated: count,
            };
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        on_token(piece);
        true
    }
}

/// Возвращает сессию в Ready, когда генерация закончилась (в том числе если future брошен).
struct ActiveGeneration<'a> {
    session: &'a InferenceSession,
    generation: Arc<Generation>,
}

impl Drop for ActiveGeneration<'_> {
    fn drop(&mut self) {
        let mut inner = self.session.inner.lock();
        if inner.is_active(&self.generation) {
            inner.active = None;
            self.generation.halt.store(true, Ordering::Release);
            self.session.state.send_replace(InferenceState::Ready);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::InferenceEngine;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Script {
        pieces: Vec<&'static str>,
        fail_after: Option<usize>,
        delay: Duration,
        finished: Arc<AtomicBool>,
        calls: Arc<AtomicUsize>,
        cache_clears: Arc<AtomicUsize>,
        seen_params: Arc<Mutex<Option<SamplingParams>>>,
    }

    struct ScriptedEngine(Script);

    impl InferenceEngine for ScriptedEngine {
        fn generate(
            &self,
            _prompt: &str,
            params: &SamplingParams,
            halt: &AtomicBool,
            on_token: &mut dyn FnMut(&str),
        ) -> Result<(), LocalProviderError> {
            self.0.calls.fetch_add(1, Ordering::SeqCst);
            *self.0.seen_params.lock() = Some(*params);
            let mut result = Ok(());
            for (i, piece) in self.0.pieces.iter().enumerate() {
                if self.0.fail_after == Some(i) {
                    result = Err(LocalProviderError::InferenceFailed("decode failed".into()));
                    break;
                }
                if halt.load(Ordering::Acquire) {
                    break;
                }
                if !self.0.delay.is_zero() {
                    std::thread::sleep(self.0.delay);
                }
                on_token(piece);
            }
            self.0.finished.store(true, Ordering::SeqCst);
            result
        }

        fn clear_cache(&self) {
            self.0.cache_clears.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ScriptLoader(Script);

    impl EngineLoader for ScriptLoader {
        fn load(
            &self,
            _path: &Path,
            _options: &EngineOptions,
        ) -> Result<Box<dyn InferenceEngine>, LocalProviderError> {
            Ok(Box::new(ScriptedEngine(self.0.clone())))
        }
    }

    fn options() -> EngineOptions {
        EngineOptions {
            context_size: 256,
            n_threads: 1,
        }
    }

    async fn ready_session(script: Script) -> (Arc<InferenceSession>, tempfile::NamedTempFile) {
        let file = tempfile::NamedTempFile::new().expect("temp model");
        let session = Arc::new(InferenceSession::new(Arc::new(ScriptLoader(script)), options()));
        session.initialize(file.path()).await.expect("initialize");
        (session, file)
    }

    fn collector() -> (Arc<Mutex<String>>, impl FnMut(&str) + Send) {
        let out = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&out);
        (out, move |piece: &str| sink.lock().push_str(piece))
    }

    #[tokio::test]
    async fn test_initialize_missing_file_sets_error() {
        let session = InferenceSession::new(Arc::new(ScriptLoader(Script::default())), options());
        let err = session
            .initialize(Path::new("/no/such/model.gguf"))
            .await
            .expect_err("must fail");
        assert!(matches!(err, LocalProviderError::ModelNotFound(_)));
        assert!(matches!(session.state(), InferenceState::Error { .. }));
        assert!(!session.is_initialized());
    }

    #[tokio::test]
    async fn test_initialize_twice_rejected() {
        let (session, file) = ready_session(Script::default()).await;
        let err = session.initialize(file.path()).await.expect_err("second init");
        assert!(matches!(err, LocalProviderError::AlreadyInitialized));
        assert_eq!(session.state(), InferenceState::Ready);
    }

    #[tokio::test]
    async fn test_generate_requires_ready() {
        let session = InferenceSession::new(Arc::new(ScriptLoader(Script::default())), options());
        let err = session
            .generate("hi", &[], |_| {})
            .await
            .expect_err("not loaded");
        assert!(matches!(err, LocalProviderError::NotReady(_)));
        assert_eq!(session.state(), InferenceState::Uninitialized);
    }

    #[tokio::test]
    async fn test_generate_completes_and_returns_to_ready() {
        let script = Script {
            pieces: vec!["Hello", ",", " world"],
            ..Script::default()
        };
        let cache_clears = Arc::clone(&script.cache_clears);
        let seen_params = Arc::clone(&script.seen_params);
        let (session, _file) = ready_session(script).await;
        session.set_sampling(SamplingParams {
            temperature: 5.0,
            ..SamplingParams::default()
        });
        let (out, sink) = collector();

        let outcome = session.generate("hi", &[], sink).await.expect("generate");
        assert_eq!(outcome, GenerationOutcome::Completed { tokens: 3 });
        assert_eq!(out.lock().as_str(), "Hello, world");
        assert_eq!(session.state(), InferenceState::Ready);
        assert_eq!(cache_clears.load(Ordering::SeqCst), 1);
        assert_eq!(seen_params.lock().map(|p| p.temperature), Some(2.0));
    }

    #[tokio::test]
    async fn test_token_counter_published_in_order() {
        let script = Script {
            pieces: vec!["a", "b", "c", "d"],
            ..Script::default()
        };
        let (session, _file) = ready_session(script).await;
        let rx = session.subscribe();
        let mut last = 0usize;
        let outcome = session
            .generate("hi", &[], move |_| {
                if let InferenceState::Generating { tokens_generated } = *rx.borrow() {
                    assert!(tokens_generated > last);
                    last = tokens_generated;
                }
            })
            .await
            .expect("generate");
        assert_eq!(outcome.tokens(), 4);
    }

    #[tokio::test]
    async fn test_stop_sequence_halts_and_freezes_counter() {
        let script = Script {
            pieces: vec!["Hel", "lo", "<|im_end|>", "<|im_start|>user", "more"],
            ..Script::default()
        };
        let (session, _file) = ready_session(script).await;
        let (out, sink) = collector();

        let outcome = session
            .generate("hi", &["<|im_end|>".to_string()], sink)
            .await
            .expect("generate");
        assert_eq!(outcome, GenerationOutcome::StopSequence { tokens: 2 });
        assert_eq!(out.lock().as_str(), "Hello");
        assert_eq!(session.state(), InferenceState::Ready);
    }

    #[tokio::test]
    async fn test_stop_sequence_forwards_pre_match_portion() {
        let script = Script {
            pieces: vec!["Sure", ". Done</s>[INST] next"],
            ..Script::default()
        };
        let (session, _file) = ready_session(script).await;
        let (out, sink) = collector();

        let outcome = session
            .generate("hi", &["</s>".to_string(), "[INST]".to_string()], sink)
            .await
            .expect("generate");
        assert_eq!(outcome, GenerationOutcome::StopSequence { tokens: 1 });
        assert_eq!(out.lock().as_str(), "Sure. Done");
    }

    #[tokio::test]
    async fn test_engine_failure_after_tokens_keeps_session_ready() {
        let pieces: Vec<&'static str> = vec!["t"; 20];
        let script = Script {
            pieces,
            fail_after: Some(12),
            ..Script::default()
        };
        let (session, _file) = ready_session(script).await;
        let (out, sink) = collector();

        let err = session
            .generate("hi", &[], sink)
            .await
            .expect_err("engine failure");
        assert!(matches!(err, LocalProviderError::InferenceFailed(_)));
        assert_eq!(out.lock().len(), 12);
        assert_eq!(session.state(), InferenceState::Ready);

        // Следующий ход принимается.
        let (_, sink) = collector();
        assert!(matches!(
            session.generate("again", &[], sink).await,
            Err(LocalProviderError::InferenceFailed(_))
        ));
        assert_eq!(session.state(), InferenceState::Ready);
    }

    #[tokio::test]
    async fn test_stop_drops_late_fragments_and_is_idempotent() {
        let script = Script {
            pieces: vec!["x"; 200],
            delay: Duration::from_millis(5),
            ..Script::default()
        };
        let (session, _file) = ready_session(script).await;
        let (out, sink) = collector();

        let task = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.generate("hi", &[], sink).await })
        };

        while out.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(session.stop());
        let seen = out.lock().len();
        assert_eq!(session.state(), InferenceState::Ready);
        assert!(!session.stop());

        let outcome = task.await.expect("join").expect("generate");
        assert!(matches!(outcome, GenerationOutcome::Cancelled { tokens } if tokens == seen));
        assert_eq!(out.lock().len(), seen);
        assert_eq!(session.state(), InferenceState::Ready);
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let (session, _file) = ready_session(Script::default()).await;
        assert!(!session.stop());
        assert_eq!(session.state(), InferenceState::Ready);
    }

    #[test]
    fn test_stop_when_uninitialized_is_noop() {
        let session = InferenceSession::new(Arc::new(ScriptLoader(Script::default())), options());
        assert!(!session.stop());
        assert!(!session.stop());
        assert_eq!(session.state(), InferenceState::Uninitialized);
        assert!(!session.is_initialized());
    }

    #[tokio::test]
    async fn test_stop_after_release_is_noop() {
        let (session, _file) = ready_session(Script::default()).await;
        session.release().await;
        assert!(!session.stop());
        assert_eq!(session.state(), InferenceState::Uninitialized);
    }

    #[tokio::test]
    async fn test_release_waits_for_native_call() {
        let finished = Arc::new(AtomicBool::new(false));
        let script = Script {
            pieces: vec!["y"; 100],
            delay: Duration::from_millis(5),
            finished: Arc::clone(&finished),
            ..Script::default()
        };
        let (session, _file) = ready_session(script).await;
        let (out, sink) = collector();

        let task = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.generate("hi", &[], sink).await })
        };
        while out.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        session.release().await;
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(session.state(), InferenceState::Uninitialized);
        assert!(session.model_path().is_none());

        let outcome = task.await.expect("join").expect("generate");
        assert!(matches!(outcome, GenerationOutcome::Cancelled { .. }));
        assert_eq!(session.state(), InferenceState::Uninitialized);

        let err = session
            .generate("again", &[], |_| {})
            .await
            .expect_err("released");
        assert!(matches!(err, LocalProviderError::NotReady(_)));
    }

    #[tokio::test]
    async fn test_generate_after_stop_waits_for_previous_worker() {
        let calls = Arc::new(AtomicUsize::new(0));
        let script = Script {
            pieces: vec!["z"; 50],
            delay: Duration::from_millis(2),
            calls: Arc::clone(&calls),
            ..Script::default()
        };
        let (session, _file) = ready_session(script).await;
        let (out, sink) = collector();
        let first = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.generate("one", &[], sink).await })
        };
        while out.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        session.stop();

        let (second_out, second_sink) = collector();
        let outcome = session
            .generate("two", &[], second_sink)
            .await
            .expect("second generate");
        assert_eq!(outcome, GenerationOutcome::Completed { tokens: 50 });
        assert_eq!(second_out.lock().len(), 50);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(
            first.await.expect("join").expect("first"),
            GenerationOutcome::Cancelled { .. }
        ));
    }
}
