//! Runs the transfer chain for every produced file.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tracing::{error, info};

use super::{AttemptStatus, TargetDescriptor, TransferAttempt, TransferChain, TransferOutcome};

/// Parallel per-file transfer with at most `max_parallel` files in flight.
#[derive(Debug, Clone)]
pub struct TransferCoordinator {
    max_parallel: usize,
}

impl TransferCoordinator {
    pub fn new(max_parallel: usize) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
        }
    }

    /// Transfer every file and return outcomes in submission order.
    ///
    /// `on_complete` runs on the calling task once per finished file.
    pub async fn transfer_all<F>(
        &self,
        files: Vec<PathBuf>,
        target: &TargetDescriptor,
        chain: &TransferChain,
        mut on_complete: F,
    ) -> Vec<TransferOutcome>
    where
        F: FnMut(&TransferOutcome),
    {
        if files.is_empty() {
            return Vec::new();
        }
        info!(
            "Transferring {} files to {} ({} in parallel)",
            files.len(),
            target,
            self.max_parallel
        );

        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, TransferOutcome)>();
        let total = files.len();

        for (index, file) in files.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let chain = chain.clone();
            let target = target.clone();
            let tx = tx.clone();

            tokio::spawn(async move {
                // Closing is never done on this semaphore, so acquire only fails if it is dropped.
                let _permit = semaphore.acquire_owned().await.ok();
                let handle = {
                    let file = file.clone();
                    tokio::spawn(async move { chain.attempt(&file, &target).await })
                };
                let outcome = match handle.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!("{}: transfer task panicked - {}", file.display(), e);
                        panicked_outcome(file, e.to_string())
                    }
                };
                let _ = tx.send((index, outcome));
            });
        }
        drop(tx);

        let mut slots: Vec<Option<TransferOutcome>> = vec![None; total];
        while let Some((index, outcome)) = rx.recv().await {
            on_complete(&outcome);
            slots[index] = Some(outcome);
        }

        let outcomes: Vec<TransferOutcome> = slots.into_iter().flatten().collect();
        let delivered = outcomes.iter().filter(|o| o.is_success()).count();
        info!("Transferred {}/{} files", delivered, total);
        outcomes
    }
}

fn panicked_outcome(file: PathBuf, message: String) -> TransferOutcome {
    TransferOutcome {
        file_path: file,
        attempts: vec![TransferAttempt {
            method_name: "coordinator".to_string(),
            target: String::new(),
            status: AttemptStatus::Failed,
            error: Some(format!("Task panicked: {}", message)),
            duration_ms: 0,
        }],
        final_status: AttemptStatus::Failed,
    }
}

/// Logical AND over every file's final status.
pub fn all_succeeded(outcomes: &[TransferOutcome]) -> bool {
    outcomes.iter().all(|o| o.is_success())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TransferMethod;
    use crate::error::{Result, TransferError};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Fails for file names containing "bad", tracks peak concurrency.
    #[derive(Default)]
    struct PickyMethod {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl TransferMethod for PickyMethod {
        fn name(&self) -> &str {
            "picky"
        }

        async fn try_transfer(&self, local_path: &Path, _target: &TargetDescriptor) -> Result<()> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            if local_path.to_string_lossy().contains("bad") {
                Err(TransferError::transfer("picky", "rejected"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_outcomes_in_submission_order() {
        let method = Arc::new(PickyMethod::default());
        let chain = TransferChain::new(vec![method.clone() as Arc<dyn TransferMethod>]).unwrap();
        let files: Vec<PathBuf> = (0..8).map(|i| PathBuf::from(format!("f{}.csv", i))).collect();

        let mut completed = 0;
        let outcomes = TransferCoordinator::new(3)
            .transfer_all(files.clone(), &TargetDescriptor::new("/d"), &chain, |_| {
                completed += 1
            })
            .await;

        assert_eq!(completed, 8);
        let paths: Vec<PathBuf> = outcomes.iter().map(|o| o.file_path.clone()).collect();
        assert_eq!(paths, files);
        assert!(all_succeeded(&outcomes));
        assert!(method.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_one_failed_file_fails_the_whole() {
        let chain =
            TransferChain::new(vec![Arc::new(PickyMethod::default()) as Arc<dyn TransferMethod>])
                .unwrap();
        let files = vec![PathBuf::from("good.csv"), PathBuf::from("bad.csv")];

        let outcomes = TransferCoordinator::new(2)
            .transfer_all(files, &TargetDescriptor::new("/d"), &chain, |_| {})
            .await;

        assert!(outcomes[0].is_success());
        assert!(!outcomes[1].is_success());
        assert!(!all_succeeded(&outcomes));
    }

    #[tokio::test]
    async fn test_no_files() {
        let chain =
            TransferChain::new(vec![Arc::new(PickyMethod::default()) as Arc<dyn TransferMethod>])
                .unwrap();
        let outcomes = TransferCoordinator::new(2)
            .transfer_all(Vec::new(), &TargetDescriptor::new("/d"), &chain, |_| {})
            .await;
        assert!(outcomes.is_empty());
        assert!(all_succeeded(&outcomes));
    }
}
