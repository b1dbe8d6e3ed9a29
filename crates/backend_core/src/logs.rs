//! Логирование в ~/.localchat/logs/ для отладки.
//!
//! Терминал занят чатом, поэтому все события tracing уходят в файл localchat.log.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once};

use tracing_subscriber::EnvFilter;

pub const LOG_FILE: &str = "localchat.log";

const DEFAULT_FILTER: &str = "info,hyper=warn,reqwest=warn";

static INIT_TRACING: Once = Once::new();

/// Возвращает путь к директории логов: ~/.localchat/logs.
pub fn logs_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".localchat").join("logs"))
        .unwrap_or_else(|| PathBuf::from(".localchat").join("logs"))
}

/// Создаёт директорию логов при необходимости.
pub fn ensure_logs_dir(dir: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    Ok(dir.to_path_buf())
}

/// Ставит глобальный subscriber с записью в `<dir>/localchat.log`.
/// Фильтр берётся из `RUST_LOG`, иначе `info,hyper=warn,reqwest=warn`.
/// Повторные вызовы ничего не делают.
pub fn init_tracing(dir: &Path) -> std::io::Result<PathBuf> {
    let dir = ensure_logs_dir(dir)?;
    let path = dir.join(LOG_FILE);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;

    INIT_TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init();

        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            started_at = %chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            "localchat tracing initialized"
        );
    });
    Ok(path)
}
