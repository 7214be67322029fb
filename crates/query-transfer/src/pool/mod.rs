//! Bounded-concurrency scheduler for chunk executions.
//!
//! Workers pull specs from a shared MPMC queue and push results to a single
//! collector running on the caller's task, which is the only place the
//! completion callback is invoked. Workers live in a `JoinSet`, so none of
//! them outlives `run`: they are joined before it returns and aborted if its
//! future is dropped.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::executor::{ChunkResult, ChunkStatus};
use crate::planner::ChunkSpec;
use crate::transfer::panic_message;

/// Executes one chunk. Implemented by [`crate::executor::ChunkExecutor`].
#[async_trait]
pub trait ChunkRunner: Send + Sync {
    async fn run(&self, spec: ChunkSpec) -> ChunkResult;
}

/// What the pool does after a chunk fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop dequeuing new chunks; in-flight chunks still finish.
    #[default]
    FailFast,
    /// Attempt every chunk regardless of earlier failures.
    BestEffort,
}

impl std::str::FromStr for FailurePolicy {
    type Err = crate::error::TransferError;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "fail_fast" => Ok(FailurePolicy::FailFast),
            "best_effort" => Ok(FailurePolicy::BestEffort),
            other => Err(crate::error::TransferError::Config(format!(
                "unknown failure policy '{}' (expected fail_fast or best_effort)",
                other
            ))),
        }
    }
}

/// Worker pool running chunk specs with at most `max_workers` in flight.
#[derive(Debug, Clone)]
pub struct ExecutionPool {
    max_workers: usize,
    policy: FailurePolicy,
    cancel: Option<CancellationToken>,
}

impl ExecutionPool {
    pub fn new(max_workers: usize, policy: FailurePolicy) -> Self {
        Self {
            max_workers: max_workers.max(1),
            policy,
            cancel: None,
        }
    }

    /// Stop dequeuing when `token` is cancelled, the same way fail-fast does.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Run every spec and return one result per spec, sorted by id.
    ///
    /// Specs that were never started are reported as [`ChunkStatus::Skipped`].
    /// `on_complete` is called once for each chunk that actually ran.
    ///
    /// If `on_complete` panics, no new chunks are started and the callback is
    /// not called again. The panic is resumed only after every in-flight chunk
    /// has finished.
    pub async fn run<F>(
        &self,
        specs: Vec<ChunkSpec>,
        runner: Arc<dyn ChunkRunner>,
        mut on_complete: F,
    ) -> Vec<ChunkResult>
    where
        F: FnMut(&ChunkResult),
    {
        if specs.is_empty() {
            return Vec::new();
        }

        let ids: Vec<usize> = specs.iter().map(|s| s.id).collect();
        let workers = self.max_workers.min(specs.len());
        info!(
            "Executing {} chunks with {} workers ({:?})",
            specs.len(),
            workers,
            self.policy
        );

        let (spec_tx, spec_rx) = async_channel::bounded::<ChunkSpec>(specs.len());
        for spec in specs {
            // Capacity equals the spec count and a receiver is held, so this cannot fail.
            let _ = spec_tx.try_send(spec);
        }
        drop(spec_tx);

        let stop = Arc::new(AtomicBool::new(false));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<ChunkResult>();

        let mut tasks = JoinSet::new();
        for worker_id in 0..workers {
            let spec_rx = spec_rx.clone();
            let result_tx = result_tx.clone();
            let runner = runner.clone();
            let stop = stop.clone();
            let cancel = self.cancel.clone();
            let policy = self.policy;

            tasks.spawn(async move {
                while let Ok(spec) = spec_rx.recv().await {
                    let cancelled = cancel.as_ref().is_some_and(|t| t.is_cancelled());
                    if stop.load(Ordering::SeqCst) || cancelled {
                        debug!("Worker {}: stopping, chunk {} not started", worker_id, spec.id);
                        break;
                    }

                    let id = spec.id;
                    let result = match AssertUnwindSafe(runner.run(spec)).catch_unwind().await {
                        Ok(result) => result,
                        Err(panic) => {
                            let message = panic_message(panic.as_ref());
                            error!("Chunk {}: task panicked - {}", id, message);
                            ChunkResult::failed(id, format!("Task panicked: {}", message))
                        }
                    };

                    if result.status == ChunkStatus::Failed && policy == FailurePolicy::FailFast {
                        stop.store(true, Ordering::SeqCst);
                    }
                    if result_tx.send(result).is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);
        drop(spec_rx);

        let mut collected: BTreeMap<usize, ChunkResult> = BTreeMap::new();
        let mut callback_panic = None;
        while let Some(result) = result_rx.recv().await {
            if callback_panic.is_none() {
                let call = std::panic::catch_unwind(AssertUnwindSafe(|| on_complete(&result)));
                if let Err(panic) = call {
                    error!(
                        "Completion callback panicked on chunk {}: {}",
                        result.id,
                        panic_message(panic.as_ref())
                    );
                    stop.store(true, Ordering::SeqCst);
                    callback_panic = Some(panic);
                }
            }
            collected.insert(result.id, result);
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Worker task panicked: {}", e);
            }
        }

        if let Some(panic) = callback_panic {
            std::panic::resume_unwind(panic);
        }

        let mut results: Vec<ChunkResult> = ids
            .into_iter()
            .map(|id| {
                collected
                    .remove(&id)
                    .unwrap_or_else(|| ChunkResult::skipped(id))
            })
            .collect();
        results.sort_by_key(|r| r.id);

        let skipped = results
            .iter()
            .filter(|r| r.status == ChunkStatus::Skipped)
            .count();
        if skipped > 0 {
            info!("{} chunks skipped after failure or cancellation", skipped);
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct MockRunner {
        fail_ids: HashSet<usize>,
        panic_ids: HashSet<usize>,
        delay: Duration,
        slow: HashMap<usize, Duration>,
        started: Mutex<Vec<usize>>,
        running: AtomicUsize,
        peak: AtomicUsize,
        finished: AtomicUsize,
    }

    #[async_trait]
    impl ChunkRunner for MockRunner {
        async fn run(&self, spec: ChunkSpec) -> ChunkResult {
            self.started.lock().unwrap().push(spec.id);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let delay = self.slow.get(&spec.id).copied().unwrap_or(self.delay);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.finished.fetch_add(1, Ordering::SeqCst);

            if self.panic_ids.contains(&spec.id) {
                panic!("boom in chunk {}", spec.id);
            }
            if self.fail_ids.contains(&spec.id) {
                return ChunkResult::failed(spec.id, "permission denied");
            }
            ChunkResult {
                id: spec.id,
                file_path: None,
                row_count: spec.row_limit,
                status: ChunkStatus::Success,
                error: None,
                attempts: 1,
                duration_ms: 0,
                bytes: 0,
            }
        }
    }

    fn specs(n: usize) -> Vec<ChunkSpec> {
        (0..n)
            .map(|id| ChunkSpec {
                id,
                start_offset: id as u64 * 10,
                row_limit: 10,
                query_text: format!("SELECT {}", id),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_single_worker_is_fifo() {
        let runner = Arc::new(MockRunner::default());
        let pool = ExecutionPool::new(1, FailurePolicy::BestEffort);

        let mut completed = Vec::new();
        let results = pool
            .run(specs(3), runner.clone(), |r| completed.push(r.id))
            .await;

        assert_eq!(completed, vec![0, 1, 2]);
        assert_eq!(*runner.started.lock().unwrap(), vec![0, 1, 2]);
        assert!(results.iter().all(|r| r.is_success()));
    }

    #[tokio::test]
    async fn test_fail_fast_skips_unscheduled() {
        let runner = Arc::new(MockRunner {
            fail_ids: [1].into_iter().collect(),
            ..Default::default()
        });
        let pool = ExecutionPool::new(1, FailurePolicy::FailFast);

        let results = pool.run(specs(5), runner, |_| {}).await;

        let statuses: Vec<ChunkStatus> = results.iter().map(|r| r.status).collect();
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
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fail_fast_lets_in_flight_chunks_finish() {
        let slow = Duration::from_millis(300);
        let runner = Arc::new(MockRunner {
            fail_ids: [1].into_iter().collect(),
            slow: [(0, slow), (1, Duration::from_millis(50)), (2, slow)]
                .into_iter()
                .collect(),
            ..Default::default()
        });
        let pool = ExecutionPool::new(3, FailurePolicy::FailFast);

        let results = pool.run(specs(6), runner.clone(), |_| {}).await;

        assert_eq!(results.len(), 6);
        assert_eq!(results[0].status, ChunkStatus::Success);
        assert_eq!(results[1].status, ChunkStatus::Failed);
        assert_eq!(results[2].status, ChunkStatus::Success);
        for r in &results[3..] {
            assert_eq!(r.status, ChunkStatus::Skipped, "chunk {}", r.id);
        }
        let mut started = runner.started.lock().unwrap().clone();
        started.sort_unstable();
        assert_eq!(started, vec![0, 1, 2]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_callback_panic_waits_for_in_flight_chunks() {
        let slow = Duration::from_millis(300);
        let runner = Arc::new(MockRunner {
            slow: [(1, slow), (2, slow), (3, slow)].into_iter().collect(),
            ..Default::default()
        });
        let pool = ExecutionPool::new(4, FailurePolicy::BestEffort);

        let mut calls = 0;
        let outcome = AssertUnwindSafe(pool.run(specs(4), runner.clone(), |r| {
            calls += 1;
            if r.id == 0 {
                panic!("callback bug");
            }
        }))
        .catch_unwind()
        .await;

        assert!(outcome.is_err());
        assert_eq!(calls, 1);
        assert_eq!(runner.finished.load(Ordering::SeqCst), 4);
        assert_eq!(runner.running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_best_effort_runs_everything() {
        let runner = Arc::new(MockRunner {
            fail_ids: [0, 3].into_iter().collect(),
            ..Default::default()
        });
        let pool = ExecutionPool::new(2, FailurePolicy::BestEffort);

        let results = pool.run(specs(6), runner.clone(), |_| {}).await;

        assert_eq!(results.len(), 6);
        assert_eq!(runner.started.lock().unwrap().len(), 6);
        let failed: Vec<usize> = results
            .iter()
            .filter(|r| r.status == ChunkStatus::Failed)
            .map(|r| r.id)
            .collect();
        assert_eq!(failed, vec![0, 3]);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded_and_results_sorted() {
        let runner = Arc::new(MockRunner {
            delay: Duration::from_millis(20),
            ..Default::default()
        });
        let pool = ExecutionPool::new(3, FailurePolicy::BestEffort);

        let results = pool.run(specs(10), runner.clone(), |_| {}).await;

        assert!(runner.peak.load(Ordering::SeqCst) <= 3);
        let ids: Vec<usize> = results.iter().map(|r| r.id).collect();
        assert_eq!(ids, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_panicking_chunk_is_failed() {
        let runner = Arc::new(MockRunner {
            panic_ids: [2].into_iter().collect(),
            ..Default::default()
        });
        let pool = ExecutionPool::new(2, FailurePolicy::BestEffort);

        let results = pool.run(specs(4), runner, |_| {}).await;

        assert_eq!(results.len(), 4);
        assert_eq!(results[2].status, ChunkStatus::Failed);
        assert!(results[2].error.as_deref().unwrap().contains("panicked"));
        assert!(results[3].is_success());
    }

    #[tokio::test]
    async fn test_cancelled_pool_skips_everything() {
        let token = CancellationToken::new();
        token.cancel();
        let pool = ExecutionPool::new(2, FailurePolicy::BestEffort).with_cancel(token);

        let results = pool
            .run(specs(3), Arc::new(MockRunner::default()), |_| {})
            .await;

        assert!(results.iter().all(|r| r.status == ChunkStatus::Skipped));
    }

    #[tokio::test]
    async fn test_empty_specs() {
        let pool = ExecutionPool::new(4, FailurePolicy::FailFast);
        let results = pool
            .run(Vec::new(), Arc::new(MockRunner::default()), |_| {})
            .await;
        assert!(results.is_empty());
    }

    #[test]
    fn test_failure_policy_parse() {
        assert_eq!(
            "best-effort".parse::<FailurePolicy>().unwrap(),
            FailurePolicy::BestEffort
        );
        assert!("sometimes".parse::<FailurePolicy>().is_err());
    }
}
