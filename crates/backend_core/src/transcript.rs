//! История чата: append-only хранилище сообщений.
//!
//! Удаление только явное (`clear`). Формат файла: JSONL, одно сообщение на строку.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Единственный разговор приложения.
pub const DEFAULT_CONVERSATION_ID: i64 = 0;

#[derive(Error, Debug)]
pub enum TranscriptError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    /// Unix millis.
    pub timestamp: i64,
    pub conversation_id: i64,
    /// Черновик, сохранённый после остановки пользователем.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub interrupted: bool,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            conversation_id: DEFAULT_CONVERSATION_ID,
            interrupted: false,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn interrupted(mut self) -> Self {
        self.interrupted = true;
        self
    }
}

/// Хранилище истории. Вставка и чтение; удаление только явное.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    async fn insert(&self, message: &Message) -> Result<(), TranscriptError>;

    /// Сообщения разговора в порядке вставки.
    async fn messages(&self, conversation_id: i64) -> Result<Vec<Message>, TranscriptError>;

    async fn clear(&self, conversation_id: i64) -> Result<(), TranscriptError>;
}

/// Путь по умолчанию: <data_local_dir>/localchat/transcript.jsonl.
pub fn default_transcript_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("localchat")
        .join("transcript.jsonl")
}

/// JSONL-файл на диске.
pub struct JsonlTranscript {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlTranscript {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<Message>, TranscriptError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut messages = Vec::new();
        for (n, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(line) {
                Ok(m) => messages.push(m),
                Err(e) => {
                    tracing::warn!(line = n + 1, error = %e, path = %self.path.display(), "skipping unreadable transcript line");
                }
            }
        }
        Ok(messages)
    }
}

#[async_trait]
impl TranscriptStore for JsonlTranscript {
    async fn insert(&self, message: &Message) -> Result<(), TranscriptError> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn messages(&self, conversation_id: i64) -> Result<Vec<Message>, TranscriptError> {
        let _guard = self.write_lock.lock().await;
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(|m| m.conversation_id == conversation_id)
            .collect())
    }

    async fn clear(&self, conversation_id: i64) -> Result<(), TranscriptError> {
        let _guard = self.write_lock.lock().await;
        let kept: Vec<Message> = self
            .read_all()
            .await?
            .into_iter()
            .filter(|m| m.conversation_id != conversation_id)
            .collect();
        if kept.is_empty() {
            match tokio::fs::remove_file(&self.path).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                _ => return Ok(()),
            }
        }
        let mut body = String::new();
        for m in &kept {
            body.push_str(&serde_json::to_string(m)?);
            body.push('\n');
        }
        tokio::fs::write(&self.path, body).await?;
        Ok(())
    }
}

/// Хранилище в памяти (тесты, запуск без диска).
#[derive(Default)]
pub struct MemoryTranscript {
    messages: parking_lot::Mutex<Vec<Message>>,
}

impl MemoryTranscript {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TranscriptStore for MemoryTranscript {
    async fn insert(&self, message: &Message) -> Result<(), TranscriptError> {
        self.messages.lock().push(message.clone());
        Ok(())
    }

    async fn messages(&self, conversation_id: i64) -> Result<Vec<Message>, TranscriptError> {
        Ok(self
            .messages
            .lock()
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn clear(&self, conversation_id: i64) -> Result<(), TranscriptError> {
        self.messages
            .lock()
            .retain(|m| m.conversation_id != conversation_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_defaults() {
        let m = Message::user("hi");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.conversation_id, DEFAULT_CONVERSATION_ID);
        assert!(!m.interrupted);
        assert!(uuid::Uuid::parse_str(&m.id).is_ok());
        assert_ne!(m.id, Message::user("hi").id);

        let json = serde_json::to_string(&Message::assistant("ok")).expect("json");
        assert!(json.contains(r#""role":"assistant""#));
        assert!(!json.contains("interrupted"));
    }

    #[tokio::test]
    async fn test_jsonl_appends_and_reads_in_order() {
        let tmp = tempfile::tempdir().expect("tmp dir");
        let store = JsonlTranscript::new(tmp.path().join("nested").join("transcript.jsonl"));
        assert!(store.messages(0).await.expect("empty").is_empty());

        store.insert(&Message::user("first")).await.expect("insert");
        store
            .insert(&Message::assistant("partial").interrupted())
            .await
            .expect("insert");

        let reopened = JsonlTranscript::new(store.path());
        let messages = reopened.messages(0).await.expect("read");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "first");
        assert!(messages[1].interrupted);
    }

    #[tokio::test]
    async fn test_jsonl_skips_corrupt_lines_and_clears() {
        let tmp = tempfile::tempdir().expect("tmp dir");
        let path = tmp.path().join("transcript.jsonl");
        let store = JsonlTranscript::new(&path);
        store.insert(&Message::user("kept")).await.expect("insert");
        tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .expect("open")
            .write_all(b"{not json\n")
            .await
            .expect("write");

        assert_eq!(store.messages(0).await.expect("read").len(), 1);
        store.clear(0).await.expect("clear");
        assert!(store.messages(0).await.expect("read").is_empty());
    }

    #[tokio::test]
    async fn test_memory_transcript_clear() {
        let store = MemoryTranscript::new();
        store.insert(&Message::user("a")).await.expect("insert");
        store.insert(&Message::assistant("b")).await.expect("insert");
        assert_eq!(store.messages(0).await.expect("read").len(), 2);
        assert!(store.messages(1).await.expect("read").is_empty());
        store.clear(0).await.expect("clear");
        assert!(store.messages(0).await.expect("read").is_empty());
    }
}
