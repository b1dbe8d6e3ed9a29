//! Backend Core: хранение между запусками.
//!
//! Ответственность: история чата (append-only), директория логов, установка tracing.

pub mod logs;
pub mod transcript;

pub use logs::{ensure_logs_dir, init_tracing, logs_dir, LOG_FILE};
pub use transcript::{
    default_transcript_path, JsonlTranscript, MemoryTranscript, Message, Role, TranscriptError,
    TranscriptStore, DEFAULT_CONVERSATION_ID,
};
