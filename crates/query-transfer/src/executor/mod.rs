//! Single-chunk execution: query, serialize, atomically publish.
//!
//! Each chunk is written to a hidden `.partial` file next to its final name
//! and renamed into place only after the serializer has flushed everything.
//! Transient errors are retried with exponential backoff; permanent ones
//! fail the chunk on the first attempt.

mod retry;

pub use retry::RetryPolicy;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::TransferSettings;
use crate::core::{RowSerializer, SourceConnection};
use crate::error::{Result, TransferError};
use crate::orchestrator::FileRegistry;
use crate::planner::ChunkSpec;
use crate::pool::ChunkRunner;
use crate::serialize::OutputFormat;

/// Outcome status of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Success,
    Failed,
    /// Never started because the pool stopped dequeuing.
    Skipped,
}

/// Result of executing one chunk.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkResult {
    pub id: usize,

    /// Final file path. Only set when the file was fully written and renamed.
    pub file_path: Option<PathBuf>,

    pub row_count: u64,
    pub status: ChunkStatus,
    pub error: Option<String>,

    /// Attempts made, including the successful one.
    pub attempts: u32,
    pub duration_ms: u64,

    /// Size of the final file in bytes.
    pub bytes: u64,
}

impl ChunkResult {
    /// A failed result with no file.
    pub fn failed(id: usize, error: impl Into<String>) -> Self {
        Self {
            id,
            file_path: None,
            row_count: 0,
            status: ChunkStatus::Failed,
            error: Some(error.into()),
            attempts: 0,
            duration_ms: 0,
            bytes: 0,
        }
    }

    /// A result for a chunk that never ran.
    pub fn skipped(id: usize) -> Self {
        Self {
            status: ChunkStatus::Skipped,
            error: None,
            ..Self::failed(id, "")
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ChunkStatus::Success
    }
}

/// Runs chunk queries and writes their rows to local files.
pub struct ChunkExecutor {
    connection: Arc<dyn SourceConnection>,
    serializer: Arc<dyn RowSerializer>,
    temp_dir: PathBuf,
    retry: RetryPolicy,
    format: OutputFormat,
    job_tag: String,
    registry: FileRegistry,
}

impl ChunkExecutor {
    /// Create an executor using the temp dir, retry policy and format from `settings`.
    pub fn new(
        connection: Arc<dyn SourceConnection>,
        serializer: Arc<dyn RowSerializer>,
        settings: &TransferSettings,
    ) -> Self {
        Self {
            connection,
            serializer,
            temp_dir: settings.temp_dir.clone(),
            retry: settings.retry,
            format: settings.output_format,
            job_tag: short_tag(&uuid::Uuid::new_v4().to_string()),
            registry: FileRegistry::new(),
        }
    }

    /// Tag file names with the first 8 characters of `job_id` and record files in `registry`.
    pub fn for_job(mut self, job_id: &str, registry: FileRegistry) -> Self {
        self.job_tag = short_tag(job_id);
        self.registry = registry;
        self
    }

    /// Default format used when run through the pool.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn registry(&self) -> &FileRegistry {
        &self.registry
    }

    /// Final file path for a chunk.
    fn file_path_for(&self, spec: &ChunkSpec, format: OutputFormat) -> PathBuf {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        self.temp_dir.join(format!(
            "chunk_{}_{}_{}.{}",
            spec.id,
            timestamp,
            self.job_tag,
            format.extension()
        ))
    }

    /// Execute one chunk, retrying transient failures.
    pub async fn execute(&self, spec: &ChunkSpec, format: OutputFormat) -> ChunkResult {
        let start = Instant::now();

        if let Err(e) = tokio::fs::create_dir_all(&self.temp_dir).await {
            let mut result = ChunkResult::failed(
                spec.id,
                format!("cannot create temp dir {}: {}", self.temp_dir.display(), e),
            );
            result.attempts = 1;
            return result;
        }

        let final_path = self.file_path_for(spec, format);
        let partial_path = partial_path_for(&final_path);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            debug!(
                "Chunk {}: attempt {} (offset {}, {} rows)",
                spec.id, attempt, spec.start_offset, spec.row_limit
            );

            match self
                .attempt_once(spec, format, &partial_path, &final_path)
                .await
            {
                Ok(row_count) => {
                    let bytes = tokio::fs::metadata(&final_path)
                        .await
                        .map(|m| m.len())
                        .unwrap_or(0);
                    if row_count != spec.row_limit {
                        warn!(
                            "Chunk {}: expected {} rows, wrote {}",
                            spec.id, spec.row_limit, row_count
                        );
                    }
                    info!(
                        "Chunk {}: wrote {} rows to {}",
                        spec.id,
                        row_count,
                        final_path.display()
                    );
                    return ChunkResult {
                        id: spec.id,
                        file_path: Some(final_path),
                        row_count,
                        status: ChunkStatus::Success,
                        error: None,
                        attempts: attempt,
                        duration_ms: elapsed_ms(start),
                        bytes,
                    };
                }
                Err(e) => {
                    if e.is_transient() && self.retry.should_retry(attempt) {
                        let delay = self.retry.delay_for(attempt);
                        warn!(
                            "Chunk {}: transient error, retry {}/{} in {:?}: {}",
                            spec.id,
                            attempt,
                            self.retry.max_attempts.saturating_sub(1),
                            delay,
                            e
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    error!("Chunk {} failed after {} attempt(s): {}", spec.id, attempt, e);
                    return ChunkResult {
                        attempts: attempt,
                        duration_ms: elapsed_ms(start),
                        ..ChunkResult::failed(spec.id, e.to_string())
                    };
                }
            }
        }
    }

    async fn attempt_once(
        &self,
        spec: &ChunkSpec,
        format: OutputFormat,
        partial_path: &Path,
        final_path: &Path,
    ) -> Result<u64> {
        self.registry.register(partial_path);
        let rows = self.connection.execute(&spec.query_text).await?;

        let written = match self.serializer.write(rows, partial_path, format).await {
            Ok(n) => n,
            Err(e) => {
                discard(partial_path).await;
                return Err(e);
            }
        };

        self.registry.register(final_path);
        if let Err(e) = tokio::fs::rename(partial_path, final_path).await {
            discard(partial_path).await;
            return Err(TransferError::Io(e));
        }

        Ok(written)
    }
}

#[async_trait]
impl ChunkRunner for ChunkExecutor {
    async fn run(&self, spec: ChunkSpec) -> ChunkResult {
        self.execute(&spec, self.format).await
    }
}

/// First 8 non-dash characters of an id, used to keep file names unique per job.
fn short_tag(id: &str) -> String {
    id.chars().filter(|c| *c != '-').take(8).collect()
}

/// `.<name>.partial` in the same directory as `final_path`.
fn partial_path_for(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    final_path.with_file_name(format!(".{}.partial", name))
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove partial file {}: {}", path.display(), e);
        }
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Zero-delay policy for tests that exercise retries.
#[cfg(test)]
pub(crate) fn instant_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: std::time::Duration::ZERO,
        max_delay: std::time::Duration::ZERO,
    }
}
