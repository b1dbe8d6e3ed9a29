//! Граница с нативным движком: init / generate / stop / clear_cache / free.
//!
//! Движок непрозрачен. `generate` блокирует поток и вызывает `on_token` из своего
//! контекста исполнения. Остановка идёт через флаг `halt`, освобождение через `Drop`.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::config::{EngineOptions, SamplingParams};
use crate::error::LocalProviderError;

/// Загруженная модель, готовая к генерации.
pub trait InferenceEngine: Send + Sync {
    /// Генерирует продолжение `prompt`, отдавая фрагменты текста в `on_token`.
    /// Цикл обязан проверять `halt` между токенами и выходить, когда он выставлен.
    fn generate(
        &self,
        prompt: &str,
        params: &SamplingParams,
        halt: &AtomicBool,
        on_token: &mut dyn FnMut(&str),
    ) -> Result<(), LocalProviderError>;

    /// Сбрасывает состояние, сохранённое между ходами (KV-кэш).
    fn clear_cache(&self) {}
}

/// Фабрика движков: `init(path, context_size, threads)`.
pub trait EngineLoader: Send + Sync {
    fn load(
        &self,
        path: &Path,
        options: &EngineOptions,
    ) -> Result<Box<dyn InferenceEngine>, LocalProviderError>;
}

/// Единственный живой экземпляр движка. Владеет им только `InferenceSession`.
pub struct EngineHandle {
    engine: Arc<dyn InferenceEngine>,
    model_path: PathBuf,
}

impl EngineHandle {
    pub(crate) fn load(
        loader: &dyn EngineLoader,
        path: &Path,
        options: &EngineOptions,
    ) -> Result<Self, LocalProviderError> {
        if !path.exists() {
            return Err(LocalProviderError::ModelNotFound(path.display().to_string()));
        }
        let engine = loader.load(path, options)?;
        Ok(Self {
            engine: Arc::from(engine),
            model_path: path.to_path_buf(),
        })
    }

    pub(crate) fn engine(&self) -> Arc<dyn InferenceEngine> {
        Arc::clone(&self.engine)
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        tracing::debug!(model = %self.model_path.display(), "engine handle released");
    }
}

/// Загрузчик для сборки без нативного движка.
#[cfg(not(feature = "llama"))]
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableLoader;

#[cfg(not(feature = "llama"))]
impl EngineLoader for UnavailableLoader {
    fn load(
        &self,
        _path: &Path,
        _options: &EngineOptions,
    ) -> Result<Box<dyn InferenceEngine>, LocalProviderError> {
        Err(LocalProviderError::ModelLoadFailed(
            "local inference is not compiled in (build with the `llama` feature)".into(),
        ))
    }
}

/// Загрузчик, который использует приложение.
pub fn default_loader() -> Arc<dyn EngineLoader> {
    #[cfg(feature = "llama")]
    {
        Arc::new(llama::LlamaLoader)
    }
    #[cfg(not(feature = "llama"))]
    {
        Arc::new(UnavailableLoader)
    }
}

/// Забирает из буфера самый длинный валидный UTF-8 префикс.
/// Незавершённая последовательность в хвосте остаётся в буфере до следующего токена.
#[cfg_attr(not(feature = "llama"), allow(dead_code))]
pub(crate) fn take_utf8_prefix(buffer: &mut Vec<u8>) -> String {
    match std::str::from_utf8(buffer) {
        Ok(s) => {
            let out = s.to_string();
            buffer.clear();
            out
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let out = String::from_utf8_lossy(&buffer[..valid]).into_owned();
            buffer.drain(..valid);
            out
        }
        Err(_) => {
            let out = String::from_utf8_lossy(buffer).into_owned();
            buffer.clear();
            out
        }
    }
}

#[cfg(feature = "llama")]
mod llama {
    //! GGUF inference через llama.cpp.

    use std::num::NonZeroU32;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use llama_cpp_2::context::params::LlamaContextParams;
    use llama_cpp_2::llama_backend::LlamaBackend;
    use llama_cpp_2::llama_batch::LlamaBatch;
    use llama_cpp_2::model::params::LlamaModelParams;
    use llama_cpp_2::model::{AddBos, LlamaModel, Special};
    use llama_cpp_2::sampling::LlamaSampler;
    use parking_lot::Mutex;

    use super::{take_utf8_prefix, EngineLoader, InferenceEngine};
    use crate::config::{EngineOptions, SamplingParams};
    use crate::error::LocalProviderError;

    /// Максимум токенов в одном batch для decode (при большем префилле: "Insufficient Space").
    const PREFILL_BATCH_SIZE: usize = 512;

    /// Backend llama.cpp инициализируется один раз на процесс.
    static BACKEND: Mutex<Option<Arc<LlamaBackend>>> = parking_lot::const_mutex(None);

    fn backend() -> Result<Arc<LlamaBackend>, LocalProviderError> {
        let mut guard = BACKEND.lock();
        if let Some(backend) = guard.as_ref() {
            return Ok(Arc::clone(backend));
        }
        let backend = Arc::new(
            LlamaBackend::init().map_err(|e| LocalProviderError::ModelLoadFailed(e.to_string()))?,
        );
        *guard = Some(Arc::clone(&backend));
        Ok(backend)
    }

    pub struct LlamaLoader;

    impl EngineLoader for LlamaLoader {
        fn load(
            &self,
            path: &Path,
            options: &EngineOptions,
        ) -> Result<Box<dyn InferenceEngine>, LocalProviderError> {
            let backend = backend()?;
            let model = LlamaModel::load_from_file(&backend, path, &LlamaModelParams::default())
                .map_err(|e| LocalProviderError::ModelLoadFailed(e.to_string()))?;
            tracing::info!(
                model = %path.display(),
                n_ctx = options.context_size,
                n_threads = options.n_threads,
                "llama model loaded"
            );
            Ok(Box::new(LlamaEngine {
                backend,
                model,
                options: options.clone(),
            }))
        }
    }

    struct LlamaEngine {
        backend: Arc<LlamaBackend>,
        model: LlamaModel,
        options: EngineOptions,
    }

    impl LlamaEngine {
        fn sampler(params: &SamplingParams) -> LlamaSampler {
            if params.temperature < 0.01 {
                return LlamaSampler::greedy();
            }
            let seed = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.subsec_nanos())
                .unwrap_or(1234);
            LlamaSampler::chain_simple([
                LlamaSampler::top_k(params.top_k as i32),
                LlamaSampler::top_p(params.top_p, 1),
                LlamaSampler::temp(params.temperature),
                LlamaSampler::dist(seed),
            ])
        }
    }

    impl InferenceEngine for LlamaEngine {
        fn generate(
            &self,
            prompt: &str,
            params: &SamplingParams,
            halt: &AtomicBool,
            on_token: &mut dyn FnMut(&str),
        ) -> Result<(), LocalProviderError> {
            let n_ctx = NonZeroU32::new(self.options.context_size)
                .ok_or_else(|| LocalProviderError::InferenceFailed("Invalid context size".into()))?;
            let n_threads = self.options.n_threads as i32;
            let ctx_params = LlamaContextParams::default()
                .with_n_ctx(Some(n_ctx))
                .with_n_threads(n_threads)
                .with_n_threads_batch(n_threads);

            // Контекст создаётся на каждую генерацию, KV-кэш не переживает ход.
            let mut ctx = self
                .model
                .new_context(&self.backend, ctx_params)
                .map_err(|e| LocalProviderError::InferenceFailed(e.to_string()))?;

            let tokens_list = self
                .model
                .str_to_token(prompt, AddBos::Always)
                .map_err(|e| LocalProviderError::InferenceFailed(e.to_string()))?;
            if tokens_list.len() >= n_ctx.get() as usize {
                return Err(LocalProviderError::InferenceFailed(format!(
                    "prompt is {} tokens, context window is {}",
                    tokens_list.len(),
                    n_ctx
                )));
            }

            let mut batch = LlamaBatch::new(PREFILL_BATCH_SIZE, 1);
            let last_pos = (tokens_list.len() as i32).saturating_sub(1);

            // Prefill по чанкам, чтобы не превышать лимит batch.
            let mut pos = 0i32;
            for chunk in tokens_list.chunks(PREFILL_BATCH_SIZE) {
                batch.clear();
                for (j, &token) in chunk.iter().enumerate() {
                    let p = pos + j as i32;
                    batch
                        .add(token, p, &[0], p == last_pos)
                        .map_err(|e| LocalProviderError::InferenceFailed(e.to_string()))?;
                }
                ctx.decode(&mut batch)
                    .map_err(|e| LocalProviderError::InferenceFailed(e.to_string()))?;
                pos += chunk.len() as i32;
            }

            let mut sampler = Self::sampler(params);
            let mut n_cur = tokens_list.len() as i32;
            let mut pending: Vec<u8> = Vec::new();

            for _ in 0..params.max_tokens {
                if halt.load(Ordering::Acquire) || n_cur >= n_ctx.get() as i32 {
                    break;
                }

                let token = sampler.sample(&ctx, batch.n_tokens() - 1);
                sampler.accept(token);

                if self.model.is_eog_token(token) {
                    break;
                }

                let bytes = self
                    .model
                    .token_to_bytes(token, Special::Tokenize)
                    .map_err(|e| LocalProviderError::InferenceFailed(e.to_string()))?;
                pending.extend_from_slice(&bytes);
                let piece = take_utf8_prefix(&mut pending);
                if !piece.is_empty() {
                    on_token(&piece);
                }

                batch.clear();
                batch
                    .add(token, n_cur, &[0], true)
                    .map_err(|e| LocalProviderError::InferenceFailed(e.to_string()))?;
                n_cur += 1;

                ctx.decode(&mut batch)
                    .map_err(|e| LocalProviderError::InferenceFailed(e.to_string()))?;
            }

            if !pending.is_empty() && !halt.load(Ordering::Acquire) {
                on_token(&String::from_utf8_lossy(&pending));
            }
            Ok(())
        }
    }
}
