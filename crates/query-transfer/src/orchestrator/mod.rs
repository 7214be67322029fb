//! Job orchestrator: Plan -> Execute -> Transfer -> Cleanup.
//!
//! Every local file a job creates is recorded in a [`FileRegistry`] owned by
//! a [`CleanupGuard`], so the files are removed on every exit path: normal
//! completion, phase errors, and panics unwinding out of a phase.

pub mod cleanup;
pub mod progress;

pub use cleanup::{CleanupGuard, CleanupReport, FileRegistry};
pub use progress::{NoopObserver, Phase, ProgressObserver, ProgressReporter};

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, TransferSettings};
use crate::core::{RowSerializer, SourceConnection, TransferMethod};
use crate::error::{Result, TransferError};
use crate::executor::{ChunkExecutor, ChunkResult};
use crate::planner::{self, LimitOffset, PlanSummary, RangeRewriter};
use crate::pool::{ExecutionPool, FailurePolicy};
use crate::serialize::{FileSerializer, OutputFormat};
use crate::transfer::{
    all_succeeded, panic_message, TargetDescriptor, TransferChain, TransferCoordinator,
    TransferOutcome,
};

/// Parameters of one submitted job.
#[derive(Clone)]
pub struct JobRequest {
    pub base_query: String,
    pub target: TargetDescriptor,
    pub chunk_size: u64,
    pub max_workers: usize,
    /// Ordered fallback chain. Must not be empty.
    pub methods: Vec<Arc<dyn TransferMethod>>,
    pub format: OutputFormat,
}

impl JobRequest {
    /// A request using chunk size, worker count and format from `settings`.
    pub fn new(
        base_query: impl Into<String>,
        target: TargetDescriptor,
        methods: Vec<Arc<dyn TransferMethod>>,
        settings: &TransferSettings,
    ) -> Self {
        Self {
            base_query: base_query.into(),
            target,
            chunk_size: settings.chunk_size,
            max_workers: settings.max_workers,
            methods,
            format: settings.output_format,
        }
    }
}

impl std::fmt::Debug for JobRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.methods.iter().map(|m| m.name()).collect();
        f.debug_struct("JobRequest")
            .field("base_query", &self.base_query)
            .field("target", &self.target)
            .field("chunk_size", &self.chunk_size)
            .field("max_workers", &self.max_workers)
            .field("methods", &names)
            .field("format", &self.format)
            .finish()
    }
}

/// Final status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Success,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Success => f.write_str("success"),
            JobStatus::Failed => f.write_str("failed"),
        }
    }
}

/// Result of a job. Returned once per `submit`.
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    /// Unique job identifier.
    pub job_id: String,

    pub overall_status: JobStatus,

    /// Job-level error (configuration, planning, cancellation, internal failure).
    /// Chunk and transfer errors are recorded in their own results.
    pub error: Option<String>,

    /// Process exit code matching the failure category (0 on success).
    pub exit_code: u8,

    /// One result per planned chunk, in id order.
    pub chunk_results: Vec<ChunkResult>,

    /// One outcome per transferred file, in submission order.
    pub transfer_outcomes: Vec<TransferOutcome>,

    /// Rows reported by the source for the base query.
    pub total_rows: u64,

    /// Rows written by successful chunks.
    pub rows_written: u64,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl JobResult {
    fn started(job_id: String, started_at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            overall_status: JobStatus::Failed,
            error: None,
            exit_code: 1,
            chunk_results: Vec::new(),
            transfer_outcomes: Vec::new(),
            total_rows: 0,
            rows_written: 0,
            started_at,
            completed_at: started_at,
            duration_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.overall_status == JobStatus::Success
    }

    /// Chunks that did not succeed, including skipped ones.
    pub fn failed_chunks(&self) -> Vec<&ChunkResult> {
        self.chunk_results
            .iter()
            .filter(|r| !r.is_success())
            .collect()
    }

    /// Files every transfer method failed on.
    pub fn failed_transfers(&self) -> Vec<&TransferOutcome> {
        self.transfer_outcomes
            .iter()
            .filter(|o| !o.is_success())
            .collect()
    }

    /// One-line human readable summary.
    pub fn summary(&self) -> String {
        let chunks_ok = self.chunk_results.iter().filter(|r| r.is_success()).count();
        let files_ok = self
            .transfer_outcomes
            .iter()
            .filter(|o| o.is_success())
            .count();
        let mut line = format!(
            "Job {} {}: {}/{} chunks, {} of {} rows written, {}/{} files transferred in {:.1}s",
            self.job_id,
            self.overall_status,
            chunks_ok,
            self.chunk_results.len(),
            self.rows_written,
            self.total_rows,
            files_ok,
            self.transfer_outcomes.len(),
            self.duration_ms as f64 / 1000.0
        );
        if let Some(error) = &self.error {
            line.push_str(&format!(" ({})", error));
        }
        line
    }

    /// Serialize the result to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Drives jobs against one source connection.
pub struct Orchestrator {
    connection: Arc<dyn SourceConnection>,
    serializer: Arc<dyn RowSerializer>,
    settings: TransferSettings,
    rewriter: Box<dyn RangeRewriter>,
    cancel: Option<CancellationToken>,
}

impl Orchestrator {
    pub fn new(
        connection: Arc<dyn SourceConnection>,
        serializer: Arc<dyn RowSerializer>,
        settings: TransferSettings,
    ) -> Self {
        Self {
            connection,
            serializer,
            settings,
            rewriter: Box::new(LimitOffset),
            cancel: None,
        }
    }

    /// Build an orchestrator for the configured source, dialect and file serializer.
    pub fn from_config(config: &Config) -> Result<Self> {
        let connection = crate::source::connect_source(&config.source)?;
        Ok(Self::new(connection, Arc::new(FileSerializer), config.settings())
            .with_rewriter(config.source.dialect.rewriter()))
    }

    /// Use `rewriter` to build chunk queries.
    pub fn with_rewriter(mut self, rewriter: Box<dyn RangeRewriter>) -> Self {
        self.rewriter = rewriter;
        self
    }

    /// Stop starting new chunks once `token` is cancelled.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    /// Run a job without progress reporting.
    pub async fn submit(&self, request: JobRequest) -> JobResult {
        self.submit_with_progress(request, &mut NoopObserver).await
    }

    /// Run a job, reporting progress to `observer` from the calling task.
    pub async fn submit_with_progress(
        &self,
        request: JobRequest,
        observer: &mut dyn ProgressObserver,
    ) -> JobResult {
        let start = Instant::now();
        let job_id = uuid::Uuid::new_v4().to_string();
        let mut result = JobResult::started(job_id.clone(), Utc::now());
        let mut progress = ProgressReporter::new(observer);
        let mut guard = CleanupGuard::new(FileRegistry::new());

        info!("Starting transfer job: {}", job_id);

        let outcome = AssertUnwindSafe(self.run_phases(
            &request,
            guard.registry().clone(),
            &mut result,
            &mut progress,
        ))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            Err(TransferError::Orchestration(format!(
                "phase panicked: {}",
                panic_message(panic.as_ref())
            )))
        });

        info!("Job {}: cleaning up local files", job_id);
        progress.enter(Phase::CleaningUp, "removing local chunk files");
        let report = guard.cleanup_async().await;
        if !report.failed.is_empty() {
            warn!(
                "Job {}: {} local files could not be removed",
                job_id,
                report.failed.len()
            );
        }
        debug!("Job {}: removed {} local files", job_id, report.removed);

        match outcome {
            Ok(()) => self.settle(&mut result),
            Err(e) => {
                error!("Job {} failed: {}", job_id, e);
                result.overall_status = JobStatus::Failed;
                result.exit_code = e.exit_code();
                result.error = Some(e.to_string());
            }
        }

        result.completed_at = Utc::now();
        result.duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        info!("{}", result.summary());
        progress.enter(Phase::Done, result.overall_status.to_string().as_str());
        result
    }

    /// Count rows and plan chunks without executing anything.
    pub async fn plan_only(&self, base_query: &str, chunk_size: u64) -> Result<PlanSummary> {
        if chunk_size == 0 {
            return Err(TransferError::Config(
                "chunk_size must be greater than 0".into(),
            ));
        }
        let total_rows = self.count_rows(base_query).await?;
        let specs = planner::plan(base_query, total_rows, chunk_size, self.rewriter.as_ref())?;
        Ok(PlanSummary::from_specs(total_rows, chunk_size, &specs))
    }

    /// Check that the source is reachable.
    pub async fn health_check(&self) -> Result<()> {
        self.connection.test_connection().await?;
        info!("Source connection '{}' is healthy", self.connection.name());
        Ok(())
    }

    async fn run_phases(
        &self,
        request: &JobRequest,
        registry: FileRegistry,
        result: &mut JobResult,
        progress: &mut ProgressReporter<'_>,
    ) -> Result<()> {
        let job_id = result.job_id.clone();

        // Planning
        info!("Job {}: planning", job_id);
        progress.enter(Phase::Planning, "validating request");
        if request.chunk_size == 0 {
            return Err(TransferError::Config(
                "chunk_size must be greater than 0".into(),
            ));
        }
        if request.max_workers == 0 {
            return Err(TransferError::Config(
                "max_workers must be greater than 0".into(),
            ));
        }
        let chain = TransferChain::new(request.methods.clone())?;
        self.check_cancelled()?;

        let total_rows = self.count_rows(&request.base_query).await?;
        result.total_rows = total_rows;
        for warning in planner::advise_chunk_size(total_rows, request.chunk_size) {
            warn!("Job {}: {}", job_id, warning);
        }
        let specs = planner::plan(
            &request.base_query,
            total_rows,
            request.chunk_size,
            self.rewriter.as_ref(),
        )?;
        info!(
            "Job {}: {} rows in {} chunks of up to {} rows",
            job_id,
            total_rows,
            specs.len(),
            request.chunk_size
        );
        progress.finish_phase(&format!("planned {} chunks", specs.len()));

        // Executing
        self.check_cancelled()?;
        info!("Job {}: executing chunks", job_id);
        progress.enter(Phase::Executing, "executing chunks");

        let executor = ChunkExecutor::new(
            self.connection.clone(),
            self.serializer.clone(),
            &self.settings,
        )
        .for_job(&job_id, registry)
        .with_format(request.format);

        let mut pool = ExecutionPool::new(request.max_workers, self.settings.failure_policy);
        if let Some(token) = &self.cancel {
            pool = pool.with_cancel(token.clone());
        }

        let total_chunks = specs.len();
        let mut finished = 0usize;
        let chunk_results = pool
            .run(specs, Arc::new(executor), |r| {
                finished += 1;
                progress.advance(
                    finished,
                    total_chunks,
                    &format!("chunk {} {:?}", r.id, r.status),
                );
            })
            .await;

        result.rows_written = chunk_results
            .iter()
            .filter(|r| r.is_success())
            .map(|r| r.row_count)
            .sum();
        result.chunk_results = chunk_results;
        progress.finish_phase("chunks finished");

        self.check_cancelled()?;

        let failed = result.failed_chunks().len();
        if failed > self.failure_tolerance() {
            warn!(
                "Job {}: {} chunks failed, skipping transfer",
                job_id, failed
            );
            return Ok(());
        }

        // Transferring
        let files: Vec<PathBuf> = result
            .chunk_results
            .iter()
            .filter(|r| r.is_success())
            .filter_map(|r| r.file_path.clone())
            .collect();

        info!("Job {}: transferring {} files", job_id, files.len());
        progress.enter(Phase::Transferring, "transferring files");

        let coordinator = TransferCoordinator::new(self.settings.max_parallel_transfers);
        let total_files = files.len();
        let mut transferred = 0usize;
        result.transfer_outcomes = coordinator
            .transfer_all(files, &request.target, &chain, |o| {
                transferred += 1;
                progress.advance(
                    transferred,
                    total_files,
                    &format!("{}", o.file_path.display()),
                );
            })
            .await;
        progress.finish_phase("transfers finished");

        Ok(())
    }

    /// Decide the final status once every phase ran without a job-level error.
    fn settle(&self, result: &mut JobResult) {
        let failed_chunks = result.failed_chunks().len();
        let tolerance = self.failure_tolerance();

        if failed_chunks > tolerance {
            result.overall_status = JobStatus::Failed;
            result.exit_code = 4;
            result.error = Some(format!(
                "{} of {} chunks failed (tolerance {})",
                failed_chunks,
                result.chunk_results.len(),
                tolerance
            ));
        } else if !all_succeeded(&result.transfer_outcomes) {
            result.overall_status = JobStatus::Failed;
            result.exit_code = 4;
            result.error = Some(format!(
                "{} of {} files could not be transferred",
                result.failed_transfers().len(),
                result.transfer_outcomes.len()
            ));
        } else {
            result.overall_status = JobStatus::Success;
            result.exit_code = 0;
        }
    }

    fn failure_tolerance(&self) -> usize {
        match self.settings.failure_policy {
            FailurePolicy::FailFast => 0,
            FailurePolicy::BestEffort => self.settings.max_failed_chunks,
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
            info!("Cancellation requested");
            return Err(TransferError::Cancelled);
        }
        Ok(())
    }

    /// Row count with the same transient retry budget as chunk execution.
    async fn count_rows(&self, base_query: &str) -> Result<u64> {
        let retry = self.settings.retry;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.connection.get_row_count(base_query).await {
                Ok(count) => return Ok(count),
                Err(e) if e.is_transient() && retry.should_retry(attempt) => {
                    let delay = retry.delay_for(attempt);
                    warn!(
                        "Row count failed (attempt {}), retrying in {:?}: {}",
                        attempt, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RowStream, SqlValue};
    use crate::executor::{instant_retry, ChunkStatus};
    use crate::transfer::{Behavior, ScriptedMethod};
    use crate::transfer::LocalCopyMethod;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    struct MockSource {
        total: u64,
        fail_offset: Option<u64>,
        transient_counts: AtomicUsize,
        count_calls: AtomicUsize,
        panic_on_count: bool,
        /// Delay for every chunk except the one at offset 0.
        trailing_delay: Duration,
    }

    impl MockSource {
        fn new(total: u64) -> Self {
            Self {
                total,
                fail_offset: None,
                transient_counts: AtomicUsize::new(0),
                count_calls: AtomicUsize::new(0),
                panic_on_count: false,
                trailing_delay: Duration::ZERO,
            }
        }
    }

    fn range_of(query: &str) -> (u64, u64) {
        let tokens: Vec<&str> = query.split_whitespace().collect();
        let value_after = |keyword: &str| {
            tokens
                .iter()
                .position(|t| *t == keyword)
                .and_then(|i| tokens.get(i + 1))
                .and_then(|v| v.parse().ok())
                .unwrap_or(0)
        };
        (value_after("LIMIT"), value_after("OFFSET"))
    }

    #[async_trait]
    impl SourceConnection for MockSource {
        async fn get_row_count(&self, _query: &str) -> Result<u64> {
            if self.panic_on_count {
                panic!("driver bug");
            }
            let calls = self.count_calls.fetch_add(1, Ordering::SeqCst);
            if calls < self.transient_counts.load(Ordering::SeqCst) {
                return Err(TransferError::transient("connection reset"));
            }
            Ok(self.total)
        }

        async fn execute(&self, query: &str) -> Result<RowStream> {
            let (limit, offset) = range_of(query);
            if self.fail_offset == Some(offset) {
                return Err(TransferError::QueryExecution("permission denied".into()));
            }
            if offset > 0 && !self.trailing_delay.is_zero() {
                tokio::time::sleep(self.trailing_delay).await;
            }
            let rows = (offset..offset + limit)
                .map(|i| vec![SqlValue::I64(i as i64)])
                .collect();
            Ok(RowStream::from_batches(vec!["id".into()], vec![Ok(rows)]))
        }

        fn name(&self) -> &str {
            "mock"
        }
    }

    struct Fixture {
        _dir: TempDir,
        chunks: PathBuf,
        landing: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let chunks = dir.path().join("chunks");
        let landing = dir.path().join("landing");
        Fixture {
            chunks,
            landing,
            _dir: dir,
        }
    }

    fn settings(fx: &Fixture, policy: FailurePolicy, tolerance: usize) -> TransferSettings {
        TransferSettings {
            temp_dir: fx.chunks.clone(),
            failure_policy: policy,
            max_failed_chunks: tolerance,
            retry: instant_retry(3),
            ..TransferSettings::default()
        }
    }

    fn request(fx: &Fixture, chunk_size: u64, workers: usize) -> JobRequest {
        JobRequest {
            base_query: "SELECT id FROM events".into(),
            target: TargetDescriptor::new(fx.landing.to_string_lossy()),
            chunk_size,
            max_workers: workers,
            methods: vec![Arc::new(LocalCopyMethod::default())],
            format: OutputFormat::Csv,
        }
    }

    fn local_files(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_successful_job() {
        let fx = fixture();
        let orchestrator = Orchestrator::new(
            Arc::new(MockSource::new(25)),
            Arc::new(FileSerializer),
            settings(&fx, FailurePolicy::FailFast, 0),
        );

        let result = orchestrator.submit(request(&fx, 10, 2)).await;

        assert_eq!(result.overall_status, JobStatus::Success, "{:?}", result.error);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.total_rows, 25);
        assert_eq!(result.rows_written, 25);
        assert_eq!(result.chunk_results.len(), 3);
        assert_eq!(result.transfer_outcomes.len(), 3);
        assert_eq!(local_files(&fx.landing), 3);
        assert_eq!(local_files(&fx.chunks), 0);
    }

    #[tokio::test]
    async fn test_zero_rows_succeeds_trivially() {
        let fx = fixture();
        let orchestrator = Orchestrator::new(
            Arc::new(MockSource::new(0)),
            Arc::new(FileSerializer),
            settings(&fx, FailurePolicy::FailFast, 0),
        );

        let result = orchestrator.submit(request(&fx, 10, 2)).await;

        assert!(result.is_success());
        assert!(result.chunk_results.is_empty());
        assert!(result.transfer_outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_empty_method_chain_fails_before_work() {
        let fx = fixture();
        let source = Arc::new(MockSource::new(25));
        let orchestrator = Orchestrator::new(
            source.clone(),
            Arc::new(FileSerializer),
            settings(&fx, FailurePolicy::FailFast, 0),
        );
        let mut req = request(&fx, 10, 2);
        req.methods.clear();

        let result = orchestrator.submit(req).await;

        assert_eq!(result.overall_status, JobStatus::Failed);
        assert_eq!(result.exit_code, 2);
        assert_eq!(source.count_calls.load(Ordering::SeqCst), 0);
        assert!(result.chunk_results.is_empty());
    }

    #[tokio::test]
    async fn test_zero_chunk_size_is_config_error() {
        let fx = fixture();
        let orchestrator = Orchestrator::new(
            Arc::new(MockSource::new(25)),
            Arc::new(FileSerializer),
            settings(&fx, FailurePolicy::FailFast, 0),
        );

        let result = orchestrator.submit(request(&fx, 0, 2)).await;

        assert_eq!(result.exit_code, 2);
        assert!(result.error.unwrap().contains("chunk_size"));
    }

    #[tokio::test]
    async fn test_fail_fast_skips_transfer_and_cleans_up() {
        let fx = fixture();
        let mut source = MockSource::new(50);
        source.fail_offset = Some(10);
        let orchestrator = Orchestrator::new(
            Arc::new(source),
            Arc::new(FileSerializer),
            settings(&fx, FailurePolicy::FailFast, 0),
        );

        let result = orchestrator.submit(request(&fx, 10, 1)).await;

        assert_eq!(result.overall_status, JobStatus::Failed);
        assert_eq!(result.exit_code, 4);
        let statuses: Vec<ChunkStatus> = result.chunk_results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                ChunkStatus::Success,
                ChunkStatus::Failed,
                ChunkStatus::Skipped,
                ChunkStatus::Skipped,
                ChunkStatus::Skipped
            ]
        );
        assert!(result.transfer_outcomes.is_empty());
        assert_eq!(local_files(&fx.chunks), 0);
        assert_eq!(local_files(&fx.landing), 0);
    }

    #[tokio::test]
    async fn test_best_effort_within_tolerance() {
        let fx = fixture();
        let mut source = MockSource::new(50);
        source.fail_offset = Some(10);
        let orchestrator = Orchestrator::new(
            Arc::new(source),
            Arc::new(FileSerializer),
            settings(&fx, FailurePolicy::BestEffort, 1),
        );

        let result = orchestrator.submit(request(&fx, 10, 2)).await;

        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.failed_chunks().len(), 1);
        assert_eq!(result.transfer_outcomes.len(), 4);
        assert_eq!(result.rows_written, 40);
        assert_eq!(local_files(&fx.landing), 4);
    }

    #[tokio::test]
    async fn test_best_effort_over_tolerance_fails() {
        let fx = fixture();
        let mut source = MockSource::new(50);
        source.fail_offset = Some(10);
        let orchestrator = Orchestrator::new(
            Arc::new(source),
            Arc::new(FileSerializer),
            settings(&fx, FailurePolicy::BestEffort, 0),
        );

        let result = orchestrator.submit(request(&fx, 10, 2)).await;

        assert_eq!(result.overall_status, JobStatus::Failed);
        assert_eq!(result.chunk_results.len(), 5);
        assert_eq!(result.failed_chunks().len(), 1);
        assert_eq!(local_files(&fx.chunks), 0);
    }

    #[tokio::test]
    async fn test_all_transfers_failing_still_cleans_up() {
        let fx = fixture();
        let orchestrator = Orchestrator::new(
            Arc::new(MockSource::new(30)),
            Arc::new(FileSerializer),
            settings(&fx, FailurePolicy::FailFast, 0),
        );
        let mut req = request(&fx, 10, 3);
        req.methods = vec![
            ScriptedMethod::new("distcp", Behavior::Fail) as Arc<dyn TransferMethod>,
            ScriptedMethod::new("scp", Behavior::Fail),
        ];

        let result = orchestrator.submit(req).await;

        assert_eq!(result.overall_status, JobStatus::Failed);
        assert_eq!(result.failed_transfers().len(), 3);
        assert!(result
            .transfer_outcomes
            .iter()
            .all(|o| o.attempts.len() == 2));
        assert_eq!(local_files(&fx.chunks), 0);
    }

    #[tokio::test]
    async fn test_transient_row_count_is_retried() {
        let fx = fixture();
        let source = MockSource::new(5);
        source.transient_counts.store(2, Ordering::SeqCst);
        let source = Arc::new(source);
        let orchestrator = Orchestrator::new(
            source.clone(),
            Arc::new(FileSerializer),
            settings(&fx, FailurePolicy::FailFast, 0),
        );

        let result = orchestrator.submit(request(&fx, 10, 1)).await;

        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(source.count_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_panic_in_phase_becomes_failed_result() {
        let fx = fixture();
        let mut source = MockSource::new(5);
        source.panic_on_count = true;
        let orchestrator = Orchestrator::new(
            Arc::new(source),
            Arc::new(FileSerializer),
            settings(&fx, FailurePolicy::FailFast, 0),
        );

        let result = orchestrator.submit(request(&fx, 10, 1)).await;

        assert_eq!(result.overall_status, JobStatus::Failed);
        assert!(result.error.unwrap().contains("driver bug"));
    }

    #[tokio::test]
    async fn test_cancelled_job() {
        let fx = fixture();
        let token = CancellationToken::new();
        token.cancel();
        let orchestrator = Orchestrator::new(
            Arc::new(MockSource::new(50)),
            Arc::new(FileSerializer),
            settings(&fx, FailurePolicy::FailFast, 0),
        )
        .with_cancel(token);

        let result = orchestrator.submit(request(&fx, 10, 2)).await;

        assert_eq!(result.overall_status, JobStatus::Failed);
        assert_eq!(result.exit_code, 130);
        assert!(result.error.unwrap().contains("cancelled"));
        assert!(result.chunk_results.is_empty());
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_ends_at_done() {
        let fx = fixture();
        let orchestrator = Orchestrator::new(
            Arc::new(MockSource::new(40)),
            Arc::new(FileSerializer),
            settings(&fx, FailurePolicy::FailFast, 0),
        );
        let mut seen: Vec<(Phase, f64)> = Vec::new();
        let mut observer = |phase: Phase, percent: f64, _msg: &str| seen.push((phase, percent));

        let result = orchestrator
            .submit_with_progress(request(&fx, 10, 2), &mut observer)
            .await;

        assert!(result.is_success());
        assert!(seen.windows(2).all(|w| w[0].1 <= w[1].1));
        assert_eq!(seen.last().copied(), Some((Phase::Done, 100.0)));
        assert!(seen.iter().any(|(p, _)| *p == Phase::Transferring));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_panicking_observer_leaves_no_files_behind() {
        let fx = fixture();
        let source = MockSource {
            trailing_delay: Duration::from_millis(300),
            ..MockSource::new(40)
        };
        let orchestrator = Orchestrator::new(
            Arc::new(source),
            Arc::new(FileSerializer),
            settings(&fx, FailurePolicy::FailFast, 0),
        );
        let mut observer = |_: Phase, _: f64, msg: &str| {
            if msg.starts_with("chunk 0 ") {
                panic!("observer bug");
            }
        };

        let result = orchestrator
            .submit_with_progress(request(&fx, 10, 4), &mut observer)
            .await;

        assert_eq!(result.overall_status, JobStatus::Success, "{:?}", result.error);
        assert_eq!(result.chunk_results.len(), 4);
        assert_eq!(local_files(&fx.chunks), 0);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(local_files(&fx.chunks), 0, "chunk files appeared after submit returned");
        assert_eq!(local_files(&fx.landing), 4);
    }

    #[tokio::test]
    async fn test_plan_only_creates_no_files() {
        let fx = fixture();
        let orchestrator = Orchestrator::new(
            Arc::new(MockSource::new(2_500_000)),
            Arc::new(FileSerializer),
            settings(&fx, FailurePolicy::FailFast, 0),
        );

        let summary = orchestrator
            .plan_only("SELECT * FROM events", 1_000_000)
            .await
            .unwrap();

        assert_eq!(summary.num_chunks, 3);
        assert_eq!(
            summary.estimated_chunk_sizes,
            vec![1_000_000, 1_000_000, 500_000]
        );
        assert!(!fx.chunks.exists());
    }

    #[tokio::test]
    async fn test_job_result_json() {
        let fx = fixture();
        let orchestrator = Orchestrator::new(
            Arc::new(MockSource::new(5)),
            Arc::new(FileSerializer),
            settings(&fx, FailurePolicy::FailFast, 0),
        );

        let result = orchestrator.submit(request(&fx, 10, 1)).await;
        let json: serde_json::Value = serde_json::from_str(&result.to_json().unwrap()).unwrap();

        assert_eq!(json["overall_status"], "success");
        assert_eq!(json["chunk_results"][0]["status"], "success");
        assert_eq!(json["transfer_outcomes"][0]["final_status"], "success");
        assert!(result.summary().contains("1/1 chunks"));
    }
}
