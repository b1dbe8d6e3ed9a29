//! Загрузка, проверка и публикация GGUF-моделей с докачкой.
//!
//! На каждое имя файла из каталога: одна ячейка `watch<DownloadState>`. Писатель один:
//! задача, которая захватила ячейку переводом в `Checking`. Остальные только читают снимки.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

use crate::config::{AiModelDescriptor, LocalConfig, MODEL_CATALOG, STORAGE_SAFETY_MARGIN};
use crate::error::LocalProviderError;
use crate::hardware_detect::{StorageProbe, SystemStorage};

/// Минимальный шаг публикации прогресса.
const PROGRESS_STEP: f32 = 0.01;

/// Состояние загрузки одной модели.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DownloadState {
    Idle,
    Checking,
    Downloading {
        /// 0.0..=1.0
        progress: f32,
        bytes_downloaded: u64,
        total_bytes: u64,
    },
    Verifying,
    Success,
    Error {
        message: String,
        retryable: bool,
    },
}

impl DownloadState {
    /// Идёт ли сейчас передача (Checking | Downloading | Verifying).
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            Self::Checking | Self::Downloading { .. } | Self::Verifying
        )
    }
}

/// Управление локальными файлами моделей.
pub struct ModelManager {
    config: LocalConfig,
    client: reqwest::Client,
    storage: Arc<dyn StorageProbe>,
    catalog: Vec<AiModelDescriptor>,
    states: HashMap<String, watch::Sender<DownloadState>>,
}

impl ModelManager {
    /// Менеджер для статического каталога и реального диска.
    pub fn new(config: LocalConfig) -> Result<Self, LocalProviderError> {
        Self::with_catalog(config, MODEL_CATALOG, Arc::new(SystemStorage))
    }

    pub fn with_catalog(
        config: LocalConfig,
        catalog: &[AiModelDescriptor],
        storage: Arc<dyn StorageProbe>,
    ) -> Result<Self, LocalProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .read_timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| LocalProviderError::Network(e.to_string()))?;

        let states = catalog
            .iter()
            .map(|m| {
                let (tx, _rx) = watch::channel(DownloadState::Idle);
                (m.filename.to_string(), tx)
            })
            .collect();

        Ok(Self {
            config,
            client,
            storage,
            catalog: catalog.to_vec(),
            states,
        })
    }

    pub fn config(&self) -> &LocalConfig {
        &self.config
    }

    pub fn catalog(&self) -> &[AiModelDescriptor] {
        &self.catalog
    }

    pub fn model_path(&self, model: &AiModelDescriptor) -> PathBuf {
        self.config.model_path(model)
    }

    pub fn temp_path(&self, model: &AiModelDescriptor) -> PathBuf {
        self.config.temp_path(model)
    }

    /// Текущее состояние модели. `None`: имени нет в каталоге.
    pub fn state(&self, filename: &str) -> Option<DownloadState> {
        self.states.get(filename).map(|tx| tx.borrow().clone())
    }

    /// Подписка на изменения состояния модели.
    pub fn subscribe(&self, filename: &str) -> Option<watch::Receiver<DownloadState>> {
        self.states.get(filename).map(|tx| tx.subscribe())
    }

    /// Снимок всех состояний.
    pub fn snapshot(&self) -> HashMap<String, DownloadState> {
        self.states
            .iter()
            .map(|(name, tx)| (name.clone(), tx.borrow().clone()))
            .collect()
    }

    /// Есть ли на диске финальный файл ненулевой длины.
    pub async fn is_downloaded(&self, model: &AiModelDescriptor) -> bool {
        file_len(&self.model_path(model)).await > 0
    }

    /// Проверить все модели каталога: Success при наличии файла, иначе Idle.
    /// Модели с активной загрузкой не трогает.
    pub async fn check_all(&self) -> HashMap<String, DownloadState> {
        for model in &self.catalog {
            let present = self.is_downloaded(model).await;
            if let Some(tx) = self.states.get(model.filename) {
                tx.send_if_modified(|state| {
                    if state.is_in_progress() {
                        return false;
                    }
                    let next = if present {
                        DownloadState::Success
                    } else {
                        DownloadState::Idle
                    };
                    if *state == next {
                        false
                    } else {
                        *state = next;
                        true
                    }
                });
            }
        }
        self.snapshot()
    }

    /// Скачать модель: Checking → Downloading → Verifying → Success | Error.
    ///
    /// Повторный вызов, пока та же модель в работе, отклоняется (`DownloadInProgress`)
    /// без изменения состояния.
    pub async fn download(&self, model: &AiModelDescriptor) -> Result<PathBuf, LocalProviderError> {
        let tx = self.cell(model)?;
        let claimed = tx.send_if_modified(|state| {
            if state.is_in_progress() {
                false
            } else {
                *state = DownloadState::Checking;
                true
            }
        });
        if !claimed {
            tracing::info!(model = %model.filename, "download already in progress, request ignored");
            return Err(LocalProviderError::DownloadInProgress(model.filename.to_string()));
        }

        let mut claim = Claim { tx, done: false };
        let result = self.run_download(model, tx).await;
        claim.done = true;

        match result {
            Ok(path) => {
                tracing::info!(model = %model.filename, path = %path.display(), "model downloaded and verified");
                tx.send_replace(DownloadState::Success);
                Ok(path)
            }
            Err(e) => {
                tracing::warn!(model = %model.filename, error = %e, "model download failed");
                tx.send_replace(DownloadState::Error {
                    message: e.user_message(),
                    retryable: e.is_retryable(),
                });
                Err(e)
            }
        }
    }

    /// Удалить финальный и временный файлы модели.
    pub async fn delete(&self, model: &AiModelDescriptor) -> Result<(), LocalProviderError> {
        let tx = self.cell(model)?;
        if tx.borrow().is_in_progress() {
            return Err(LocalProviderError::DownloadInProgress(model.filename.to_string()));
        }
        remove_if_exists(&self.model_path(model)).await?;
        remove_if_exists(&self.temp_path(model)).await?;
        tx.send_replace(DownloadState::Idle);
        tracing::info!(model = %model.filename, "model deleted");
        Ok(())
    }

    fn cell(
        &self,
        model: &AiModelDescriptor,
    ) -> Result<&watch::Sender<DownloadState>, LocalProviderError> {
        self.states
            .get(model.filename)
            .ok_or_else(|| LocalProviderError::ModelNotFound(model.filename.to_string()))
    }

    fn check_storage(&self, model: &AiModelDescriptor) -> Result<(), LocalProviderError> {
        let required = model.size_bytes.saturating_add(STORAGE_SAFETY_MARGIN);
        match self.storage.available_space(&self.config.models_dir) {
            Some(available) if available < required => {
                Err(LocalProviderError::InsufficientStorage { required, available })
            }
            Some(_) => Ok(()),
            None => {
                tracing::warn!(dir = %self.config.models_dir.display(), "could not determine free space, skipping storage check");
                Ok(())
            }
        }
    }

    async fn run_download(
        &self,
        model: &AiModelDescriptor,
        tx: &watch::Sender<DownloadState>,
    ) -> Result<PathBuf, LocalProviderError> {
        tokio::fs::create_dir_all(&self.config.models_dir).await?;
        tokio::fs::create_dir_all(&self.config.cache_dir).await?;
        self.check_storage(model)?;

        let temp_path = self.temp_path(model);
        let final_path = self.model_path(model);

        let existing = file_len(&temp_path).await;
        let resume_from = match model.expected_size {
            Some(expected) if existing >= expected => 0,
            _ => existing,
        };
        if resume_from == 0 && existing > 0 {
            tracing::debug!(model = %model.filename, bytes = existing, "discarding stale partial download");
            remove_if_exists(&temp_path).await?;
        }

        let mut request = self.client.get(model.url);
        if resume_from > 0 {
            tracing::debug!(model = %model.filename, offset = resume_from, "resuming download");
            request = request.header(RANGE, format!("bytes={resume_from}-"));
        }
        let response = request
            .send()
            .await
            .map_err(|e| LocalProviderError::Network(e.to_string()))?;

        let status = response.status();
        let start_len = match status {
            StatusCode::PARTIAL_CONTENT if resume_from > 0 => {
                if let Some(start) = content_range_start(response.headers().get(CONTENT_RANGE)) {
                    if start != resume_from {
                        remove_if_exists(&temp_path).await?;
                        return Err(LocalProviderError::Network(format!(
                            "server resumed at byte {start}, expected {resume_from}"
                        )));
                    }
                }
                resume_from
            }
            StatusCode::OK => {
                if resume_from > 0 {
                    tracing::debug!(model = %model.filename, "server ignored range request, restarting from zero");
                }
                0
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                remove_if_exists(&temp_path).await?;
                return Err(LocalProviderError::HttpStatus(status.as_u16()));
            }
            StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
                return Err(LocalProviderError::RateLimited(status.as_u16()));
            }
            StatusCode::NOT_FOUND => return Err(LocalProviderError::RemoteNotFound),
            other => return Err(LocalProviderError::HttpStatus(other.as_u16())),
        };

        // 206: дописываем; 200: файл заново, частичные байты отбрасываются.
        let mut file = if start_len > 0 {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&temp_path)
                .await?
        } else {
            tokio::fs::File::create(&temp_path).await?
        };

        let expected_total = response.content_length().map(|cl| start_len + cl);
        let progress_total = expected_total
            .or(model.expected_size)
            .unwrap_or(model.size_bytes)
            .max(1);

        let mut written = start_len;
        let mut last_progress = fraction(written, progress_total);
        tx.send_replace(DownloadState::Downloading {
            progress: last_progress,
            bytes_downloaded: written,
            total_bytes: progress_total,
        });

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    // Принятые байты остаются в .tmp для докачки.
                    file.flush().await?;
                    tracing::debug!(model = %model.filename, bytes = written, "transfer interrupted");
                    return Err(LocalProviderError::Network(e.to_string()));
                }
            };
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;

            let progress = fraction(written, progress_total);
            if progress - last_progress >= PROGRESS_STEP || (progress >= 1.0 && last_progress < 1.0) {
                tx.send_replace(DownloadState::Downloading {
                    progress,
                    bytes_downloaded: written,
                    total_bytes: progress_total,
                });
                last_progress = progress;
            }
        }
        file.flush().await?;
        drop(file);

        if last_progress < 1.0 {
            tx.send_replace(DownloadState::Downloading {
                progress: fraction(written, progress_total),
                bytes_downloaded: written,
                total_bytes: progress_total,
            });
        }

        tx.send_replace(DownloadState::Verifying);
        let actual = file_len(&temp_path).await;
        let mismatch = match (expected_total, model.expected_size) {
            (Some(total), _) if actual != total => Some(total),
            (_, Some(exact)) if actual != exact => Some(exact),
            _ if actual == 0 => Some(model.size_bytes),
            _ => None,
        };
        if let Some(expected) = mismatch {
            remove_if_exists(&temp_path).await?;
            return Err(LocalProviderError::SizeMismatch { expected, actual });
        }

        publish(&temp_path, &final_path).await?;
        Ok(final_path)
    }
}

/// Снимает захват ячейки, если future загрузки был брошен посередине.
struct Claim<'a> {
    tx: &'a watch::Sender<DownloadState>,
    done: bool,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.tx.send_if_modified(|state| {
            if state.is_in_progress() {
                *state = DownloadState::Error {
                    message: "Download interrupted. Please try again.".to_string(),
                    retryable: true,
                };
                true
            } else {
                false
            }
        });
    }
}

/// Атомарная публикация через rename. Если rename не удался (другой том), copy + delete.
async fn publish(temp_path: &Path, final_path: &Path) -> Result<(), LocalProviderError> {
    remove_if_exists(final_path)
        .await
        .map_err(|e| LocalProviderError::Publish(e.to_string()))?;

    match tokio::fs::rename(temp_path, final_path).await {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            tracing::debug!(error = %rename_err, "rename failed, falling back to copy");
            if let Err(copy_err) = tokio::fs::copy(temp_path, final_path).await {
                let _ = tokio::fs::remove_file(final_path).await;
                return Err(LocalProviderError::Publish(format!(
                    "rename: {rename_err}; copy: {copy_err}"
                )));
            }
            remove_if_exists(temp_path)
                .await
                .map_err(|e| LocalProviderError::Publish(e.to_string()))
        }
    }
}

fn fraction(done: u64, total: u64) -> f32 {
    (done as f64 / total as f64).min(1.0) as f32
}

/// Начало диапазона из `Content-Range: bytes <start>-<end>/<total>`.
fn content_range_start(value: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    let value = value?.to_str().ok()?;
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    range.split('-').next()?.trim().parse().ok()
}

async fn file_len(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
