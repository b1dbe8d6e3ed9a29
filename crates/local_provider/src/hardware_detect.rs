//! Определение CPU, RAM и свободного места на диске.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::LocalProviderError;

static DETECTED_THREADS: AtomicUsize = AtomicUsize::new(0);

/// Количество логических ядер CPU.
pub fn cpu_cores() -> Result<usize, LocalProviderError> {
    let cached = DETECTED_THREADS.load(Ordering::Relaxed);
    if cached > 0 {
        return Ok(cached);
    }
    let count = std::thread::available_parallelism()
        .map_err(|e| LocalProviderError::HardwareDetectionFailed(e.to_string()))?
        .get();
    DETECTED_THREADS.store(count, Ordering::Relaxed);
    Ok(count)
}

/// Потоки для inference: два ядра оставляем системе, не больше 8.
pub fn inference_threads() -> u32 {
    let cores = cpu_cores().unwrap_or(4);
    threads_for_cores(cores)
}

fn threads_for_cores(cores: usize) -> u32 {
    cores.saturating_sub(2).clamp(1, 8) as u32
}

/// Доступная RAM в байтах (приблизительно).
pub fn ram_bytes() -> u64 {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    sys.available_memory()
}

/// Байты в гигабайтах (GiB).
pub fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0 * 1024.0)
}

/// Хватит ли `available` байт RAM модели, которой по каталогу нужно `required_gb`.
pub fn ram_sufficient(required_gb: u32, available: u64) -> bool {
    bytes_to_gb(available) >= f64::from(required_gb)
}

/// Источник сведений о свободном месте. Отдельный trait, чтобы тесты могли подменить диск.
pub trait StorageProbe: Send + Sync {
    /// Свободные байты на томе, где лежит `path`. `None`: определить не удалось.
    fn available_space(&self, path: &Path) -> Option<u64>;
}

/// Реальный диск через sysinfo: том с самой длинной точкой монтирования, содержащей путь.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemStorage;

impl StorageProbe for SystemStorage {
    fn available_space(&self, path: &Path) -> Option<u64> {
        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let disks = sysinfo::Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|d| path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| d.available_space())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threads_for_cores() {
        assert_eq!(threads_for_cores(1), 1);
        assert_eq!(threads_for_cores(2), 1);
        assert_eq!(threads_for_cores(6), 4);
        assert_eq!(threads_for_cores(32), 8);
    }

    #[test]
    fn test_ram_sufficient() {
        const GIB: u64 = 1024 * 1024 * 1024;
        assert!(ram_sufficient(2, 2 * GIB));
        assert!(ram_sufficient(2, 3 * GIB));
        assert!(!ram_sufficient(6, 6 * GIB - 1));
        assert!(!ram_sufficient(1, 0));
        assert_eq!(bytes_to_gb(GIB / 2), 0.5);
    }

    #[test]
    fn test_cpu_cores_cached() {
        let first = cpu_cores().expect("cores");
        assert!(first >= 1);
        assert_eq!(cpu_cores().expect("cores"), first);
    }
}
