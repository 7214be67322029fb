//! Tracking and removal of local chunk files.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

/// Shared record of every local file a job has created.
///
/// Executors register a path before the file can become visible, so the
/// cleanup pass finds it even if the owning result is lost.
#[derive(Debug, Clone, Default)]
pub struct FileRegistry {
    paths: Arc<Mutex<Vec<PathBuf>>>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a path for cleanup.
    pub fn register(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let mut paths = self.lock();
        if !paths.contains(&path) {
            paths.push(path);
        }
    }

    /// Snapshot of the registered paths.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn take(&self) -> Vec<PathBuf> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<PathBuf>> {
        // A panic while holding the lock cannot leave the Vec inconsistent.
        self.paths.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Result of a cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: usize,
    pub failed: Vec<PathBuf>,
}

/// Deletes every registered file when cleaned up explicitly or dropped.
pub struct CleanupGuard {
    registry: FileRegistry,
}

impl CleanupGuard {
    pub fn new(registry: FileRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &FileRegistry {
        &self.registry
    }

    /// Remove every registered file that still exists, without blocking the runtime.
    pub async fn cleanup_async(&mut self) -> CleanupReport {
        let mut report = CleanupReport::default();
        for path in self.registry.take() {
            let removed = tokio::fs::remove_file(&path).await;
            report.record(path, removed);
        }
        debug!("Cleanup removed {} local files", report.removed);
        report
    }

    /// Blocking variant of [`CleanupGuard::cleanup_async`], used on drop.
    pub fn cleanup(&mut self) -> CleanupReport {
        let mut report = CleanupReport::default();
        for path in self.registry.take() {
            let removed = std::fs::remove_file(&path);
            report.record(path, removed);
        }
        debug!("Cleanup removed {} local files", report.removed);
        report
    }
}

impl CleanupReport {
    fn record(&mut self, path: PathBuf, removed: std::io::Result<()>) {
        match removed {
            Ok(()) => self.removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!("Failed to remove {}: {}", path.display(), e);
                self.failed.push(path);
            }
        }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if !self.registry.is_empty() {
            self.cleanup();
        }
    }
}
